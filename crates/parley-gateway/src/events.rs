//! Typed event bus: three independent event families, each served by
//! exactly one consumer task.
//!
//! API handlers emit message and group events after their database
//! writes commit; the push server is the sole producer of connection
//! events. Consumers run until their queue closes, so shutdown is a
//! matter of dropping the senders — connection first, then message,
//! then group — and awaiting the handles.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use parley_db::Database;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::codec;
use crate::registry::ConnectionRegistry;

const EVENT_QUEUE_CAPACITY: usize = 64;

/// Deadline for the best-effort last-available stamp on disconnect.
const LAST_AVAILABLE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageEventKind {
    NewMessage,
    EditMessage,
    DeleteMessage,
    MarkMessageReceived,
    MarkMessageRead,
    GroupMessageReceived,
    GroupMessageRead,
}

impl MessageEventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NewMessage => "NEW_MESSAGE",
            Self::EditMessage => "EDIT_MESSAGE",
            Self::DeleteMessage => "DELETE_MESSAGE",
            Self::MarkMessageReceived => "MARK_MESSAGE_RECEIVED",
            Self::MarkMessageRead => "MARK_MESSAGE_READ",
            Self::GroupMessageReceived => "GROUP_MESSAGE_RECEIVED",
            Self::GroupMessageRead => "GROUP_MESSAGE_READ",
        }
    }
}

/// Event-kind-appropriate message fields. Producers fill what the
/// kind's wire body needs; timestamps arrive preformatted (RFC 1123)
/// because they go straight onto the wire.
#[derive(Debug, Clone, Default)]
pub struct MessagePayload {
    pub id: Uuid,
    pub description: String,
    pub sender_id: Uuid,
    pub receiver_id: Option<Uuid>,
    pub group_id: Option<Uuid>,
    pub sender_username: Option<String>,
    pub group_member_id: Option<Uuid>,
    pub group_member_username: Option<String>,
    pub created_at: Option<String>,
    pub updated_at: Option<String>,
}

#[derive(Debug, Clone)]
pub struct MessageEvent {
    pub kind: MessageEventKind,
    pub phonenumbers: Vec<String>,
    pub message: MessagePayload,
    pub emitted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupEventKind {
    AddUserToGroup,
    RemoveUserFromGroup,
    MadeAdmin,
    RemoveAdmin,
}

impl GroupEventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AddUserToGroup => "ADD_USER_TO_GROUP",
            Self::RemoveUserFromGroup => "REMOVE_USER_FROM_GROUP",
            Self::MadeAdmin => "MADE_ADMIN",
            Self::RemoveAdmin => "REMOVE_ADMIN",
        }
    }
}

/// The group and affected user a group event describes.
#[derive(Debug, Clone)]
pub struct GroupAction {
    pub id: Uuid,
    pub username: String,
    pub phonenumber: String,
}

#[derive(Debug, Clone)]
pub struct GroupEvent {
    pub kind: GroupEventKind,
    pub group: GroupAction,
    pub phonenumbers: Vec<String>,
    pub emitted_at: DateTime<Utc>,
}

/// Connection lifecycle events. `Connected` carries the sender side of
/// the connection's outbound frame channel — binding it in the
/// registry is what makes the user reachable.
pub enum ConnectionEvent {
    Connected {
        phonenumber: String,
        sender: mpsc::Sender<Bytes>,
    },
    Disconnected {
        phonenumber: String,
    },
}

/// Producer handles for the three event families.
#[derive(Clone)]
pub struct EventBus {
    pub messages: mpsc::Sender<MessageEvent>,
    pub groups: mpsc::Sender<GroupEvent>,
    pub connections: mpsc::Sender<ConnectionEvent>,
}

/// Join handles for the consumer tasks, held by the supervisor.
pub struct EventBusHandles {
    connection: JoinHandle<()>,
    message: JoinHandle<()>,
    group: JoinHandle<()>,
}

impl EventBusHandles {
    /// Wait for all three consumers to drain and exit. Callers must
    /// have dropped every sender first or this never returns.
    pub async fn wait(self) {
        let _ = self.connection.await;
        let _ = self.message.await;
        let _ = self.group.await;
    }
}

/// Create the queues and spawn one consumer per family. Called before
/// either server starts accepting traffic.
pub fn start(registry: Arc<ConnectionRegistry>, db: Database) -> (EventBus, EventBusHandles) {
    let (message_tx, message_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
    let (group_tx, group_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
    let (connection_tx, connection_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);

    let handles = EventBusHandles {
        connection: tokio::spawn(connection_consumer(
            connection_rx,
            Arc::clone(&registry),
            db,
        )),
        message: tokio::spawn(message_consumer(message_rx, Arc::clone(&registry))),
        group: tokio::spawn(group_consumer(group_rx, registry)),
    };

    let bus = EventBus {
        messages: message_tx,
        groups: group_tx,
        connections: connection_tx,
    };

    (bus, handles)
}

async fn message_consumer(
    mut rx: mpsc::Receiver<MessageEvent>,
    registry: Arc<ConnectionRegistry>,
) {
    info!("message event consumer started");
    while let Some(event) = rx.recv().await {
        debug!(kind = event.kind.as_str(), "message event");
        match codec::encode_message_event(&event) {
            Ok(frame) => registry.push(&event.phonenumbers, frame),
            Err(e) => warn!(
                kind = event.kind.as_str(),
                error = %e,
                "failed to encode message event"
            ),
        }
    }
    info!("message event consumer stopped, queue closed");
}

async fn group_consumer(mut rx: mpsc::Receiver<GroupEvent>, registry: Arc<ConnectionRegistry>) {
    info!("group event consumer started");
    while let Some(event) = rx.recv().await {
        debug!(kind = event.kind.as_str(), "group event");
        match codec::encode_group_event(&event) {
            Ok(frame) => registry.push(&event.phonenumbers, frame),
            Err(e) => warn!(
                kind = event.kind.as_str(),
                error = %e,
                "failed to encode group event"
            ),
        }
    }
    info!("group event consumer stopped, queue closed");
}

async fn connection_consumer(
    mut rx: mpsc::Receiver<ConnectionEvent>,
    registry: Arc<ConnectionRegistry>,
    db: Database,
) {
    info!("connection event consumer started");
    while let Some(event) = rx.recv().await {
        match event {
            ConnectionEvent::Connected {
                phonenumber,
                sender,
            } => {
                registry.attach(&phonenumber, sender);
            }
            ConnectionEvent::Disconnected { phonenumber } => {
                registry.detach(&phonenumber);

                // best effort; a slow or down database must not wedge
                // the consumer
                match tokio::time::timeout(
                    LAST_AVAILABLE_TIMEOUT,
                    db.set_last_available(&phonenumber),
                )
                .await
                {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        warn!(phonenumber, error = %e, "failed to set last available")
                    }
                    Err(_) => {
                        warn!(phonenumber, "timed out setting last available")
                    }
                }
            }
        }
    }
    info!("connection event consumer stopped, queue closed");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn message_consumer_encodes_and_fans_out() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (conn_tx, mut conn_rx) = mpsc::channel::<Bytes>(4);
        registry.attach("111", conn_tx);

        let (tx, rx) = mpsc::channel(4);
        let consumer = tokio::spawn(message_consumer(rx, Arc::clone(&registry)));

        tx.send(MessageEvent {
            kind: MessageEventKind::NewMessage,
            phonenumbers: vec!["111".into(), "999".into()],
            message: MessagePayload {
                id: Uuid::new_v4(),
                description: "hey".into(),
                sender_id: Uuid::new_v4(),
                ..Default::default()
            },
            emitted_at: Utc::now(),
        })
        .await
        .unwrap();

        let frame = conn_rx.recv().await.unwrap();
        assert!(frame.starts_with(b"NEW_MESSAGE|"));

        // closing the queue stops the consumer
        drop(tx);
        consumer.await.unwrap();
    }

    #[tokio::test]
    async fn group_consumer_targets_every_member() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (tx_a, mut rx_a) = mpsc::channel::<Bytes>(4);
        let (tx_b, mut rx_b) = mpsc::channel::<Bytes>(4);
        registry.attach("111", tx_a);
        registry.attach("222", tx_b);

        let (tx, rx) = mpsc::channel(4);
        let consumer = tokio::spawn(group_consumer(rx, Arc::clone(&registry)));

        tx.send(GroupEvent {
            kind: GroupEventKind::MadeAdmin,
            group: GroupAction {
                id: Uuid::new_v4(),
                username: "bo".into(),
                phonenumber: "222".into(),
            },
            phonenumbers: vec!["111".into(), "222".into()],
            emitted_at: Utc::now(),
        })
        .await
        .unwrap();

        assert!(rx_a.recv().await.unwrap().starts_with(b"MADE_ADMIN|"));
        assert!(rx_b.recv().await.unwrap().starts_with(b"MADE_ADMIN|"));

        drop(tx);
        consumer.await.unwrap();
    }

    #[test]
    fn event_names_match_the_wire_protocol() {
        assert_eq!(MessageEventKind::NewMessage.as_str(), "NEW_MESSAGE");
        assert_eq!(
            MessageEventKind::MarkMessageReceived.as_str(),
            "MARK_MESSAGE_RECEIVED"
        );
        assert_eq!(
            MessageEventKind::GroupMessageRead.as_str(),
            "GROUP_MESSAGE_READ"
        );
        assert_eq!(GroupEventKind::AddUserToGroup.as_str(), "ADD_USER_TO_GROUP");
        assert_eq!(GroupEventKind::RemoveAdmin.as_str(), "REMOVE_ADMIN");
    }
}
