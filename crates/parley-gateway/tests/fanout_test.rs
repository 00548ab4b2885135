//! Fan-out through the public gateway surface: encode an event with
//! the codec and deliver it through the registry the way the event
//! consumers do.

use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;
use tokio::sync::mpsc;
use uuid::Uuid;

use parley_gateway::codec;
use parley_gateway::events::{MessageEvent, MessageEventKind, MessagePayload};
use parley_gateway::registry::ConnectionRegistry;

#[tokio::test]
async fn committed_message_reaches_every_attached_target_once() {
    let registry = Arc::new(ConnectionRegistry::new());

    let (tx_a, mut rx_a) = mpsc::channel::<Bytes>(10);
    let (tx_b, mut rx_b) = mpsc::channel::<Bytes>(10);
    registry.attach("1111111111", tx_a);
    registry.attach("2222222222", tx_b);
    assert_eq!(registry.connected_count(), 2);

    let event = MessageEvent {
        kind: MessageEventKind::NewMessage,
        phonenumbers: vec![
            "1111111111".into(),
            "2222222222".into(),
            "3333333333".into(), // no live socket: skipped silently
        ],
        message: MessagePayload {
            id: Uuid::new_v4(),
            description: "group hello".into(),
            sender_id: Uuid::new_v4(),
            sender_username: Some("ana".into()),
            group_id: Some(Uuid::new_v4()),
            created_at: Some(codec::rfc1123(Utc::now())),
            ..Default::default()
        },
        emitted_at: Utc::now(),
    };

    let frame = codec::encode_message_event(&event).unwrap();
    registry.push(&event.phonenumbers, frame.clone());

    let frame_a = rx_a.recv().await.unwrap();
    let frame_b = rx_b.recv().await.unwrap();
    assert_eq!(frame_a, frame);
    assert_eq!(frame_b, frame);

    // exactly one frame per target
    assert!(rx_a.try_recv().is_err());
    assert!(rx_b.try_recv().is_err());
}

#[tokio::test]
async fn detached_target_stops_receiving() {
    let registry = Arc::new(ConnectionRegistry::new());
    let (tx, mut rx) = mpsc::channel::<Bytes>(10);
    registry.attach("1111111111", tx);

    registry.detach("1111111111");
    assert_eq!(registry.connected_count(), 0);

    registry.push(
        &["1111111111".to_string()],
        Bytes::from_static(b"NEW_MESSAGE|{}"),
    );
    assert!(rx.try_recv().is_err());
}
