//! Push frame codec.
//!
//! Every frame written to a client socket is
//! `<EVENT_NAME_ASCII>|<UTF-8 JSON body>` with a single `|` separator
//! and no trailing newline. Optional JSON fields are omitted rather
//! than serialized as null, and timestamps use RFC 1123 in UTC.

use bytes::{BufMut, Bytes, BytesMut};
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::events::{GroupEvent, MessageEvent, MessageEventKind};

pub const FRAME_SEPARATOR: u8 = b'|';

/// RFC 1123 with an explicit GMT zone, e.g.
/// `Sun, 02 Aug 2026 10:04:05 GMT`.
pub fn rfc1123(at: DateTime<Utc>) -> String {
    at.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

#[derive(Serialize)]
struct NewOrEditBody<'a> {
    id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    group_id: Option<Uuid>,
    sender_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    sender_username: Option<&'a str>,
    description: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    created_at: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    updated_at: Option<&'a str>,
}

#[derive(Serialize)]
struct DeleteBody {
    id: Uuid,
    sender_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    group_id: Option<Uuid>,
}

#[derive(Serialize)]
struct ReceivedBody {
    id: Uuid,
    receiver_id: Uuid,
}

#[derive(Serialize)]
struct ReadBody {
    id: Uuid,
    sender_id: Uuid,
    receiver_id: Uuid,
}

#[derive(Serialize)]
struct GroupAggregateBody<'a> {
    id: Uuid,
    group_id: Uuid,
    group_member_id: Uuid,
    group_member_username: &'a str,
}

#[derive(Serialize)]
struct GroupActionBody<'a> {
    name: &'a str,
    group: GroupActionGroup<'a>,
    #[serde(rename = "emittedAt")]
    emitted_at: String,
}

#[derive(Serialize)]
struct GroupActionGroup<'a> {
    id: Uuid,
    username: &'a str,
    phonenumber: &'a str,
}

/// Encode a message-family event into a push frame.
pub fn encode_message_event(event: &MessageEvent) -> serde_json::Result<Bytes> {
    let message = &event.message;
    let body = match event.kind {
        MessageEventKind::NewMessage | MessageEventKind::EditMessage => {
            serde_json::to_vec(&NewOrEditBody {
                id: message.id,
                group_id: message.group_id,
                sender_id: message.sender_id,
                sender_username: message.sender_username.as_deref(),
                description: &message.description,
                created_at: message.created_at.as_deref(),
                updated_at: message.updated_at.as_deref(),
            })?
        }
        MessageEventKind::DeleteMessage => serde_json::to_vec(&DeleteBody {
            id: message.id,
            sender_id: message.sender_id,
            group_id: message.group_id,
        })?,
        MessageEventKind::MarkMessageReceived => serde_json::to_vec(&ReceivedBody {
            id: message.id,
            receiver_id: message.receiver_id.unwrap_or_default(),
        })?,
        MessageEventKind::MarkMessageRead => serde_json::to_vec(&ReadBody {
            id: message.id,
            sender_id: message.sender_id,
            receiver_id: message.receiver_id.unwrap_or_default(),
        })?,
        MessageEventKind::GroupMessageReceived | MessageEventKind::GroupMessageRead => {
            serde_json::to_vec(&GroupAggregateBody {
                id: message.id,
                group_id: message.group_id.unwrap_or_default(),
                group_member_id: message.group_member_id.unwrap_or_default(),
                group_member_username: message.group_member_username.as_deref().unwrap_or(""),
            })?
        }
    };

    Ok(frame(event.kind.as_str(), &body))
}

/// Encode a group-family event into a push frame.
pub fn encode_group_event(event: &GroupEvent) -> serde_json::Result<Bytes> {
    let body = serde_json::to_vec(&GroupActionBody {
        name: event.kind.as_str(),
        group: GroupActionGroup {
            id: event.group.id,
            username: &event.group.username,
            phonenumber: &event.group.phonenumber,
        },
        emitted_at: rfc1123(event.emitted_at),
    })?;

    Ok(frame(event.kind.as_str(), &body))
}

fn frame(name: &str, body: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(name.len() + 1 + body.len());
    buf.put_slice(name.as_bytes());
    buf.put_u8(FRAME_SEPARATOR);
    buf.put_slice(body);
    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{GroupAction, GroupEventKind, MessagePayload};
    use chrono::TimeZone;

    fn split_frame(frame: &Bytes) -> (String, serde_json::Value) {
        let sep = frame
            .iter()
            .position(|b| *b == FRAME_SEPARATOR)
            .expect("no separator in frame");
        let name = String::from_utf8(frame[..sep].to_vec()).unwrap();
        let body = serde_json::from_slice(&frame[sep + 1..]).unwrap();
        (name, body)
    }

    #[test]
    fn rfc1123_renders_gmt() {
        let at = Utc.with_ymd_and_hms(2025, 3, 9, 8, 5, 2).unwrap();
        assert_eq!(rfc1123(at), "Sun, 09 Mar 2025 08:05:02 GMT");
    }

    #[test]
    fn new_message_frame_omits_absent_fields() {
        let event = MessageEvent {
            kind: MessageEventKind::NewMessage,
            phonenumbers: vec!["111".into()],
            message: MessagePayload {
                id: Uuid::new_v4(),
                description: "hi".into(),
                sender_id: Uuid::new_v4(),
                sender_username: Some("ana".into()),
                created_at: Some("Sun, 09 Mar 2025 08:05:02 GMT".into()),
                ..Default::default()
            },
            emitted_at: Utc::now(),
        };

        let frame = encode_message_event(&event).unwrap();
        let (name, body) = split_frame(&frame);
        assert_eq!(name, "NEW_MESSAGE");
        assert_eq!(body["description"], "hi");
        assert_eq!(body["sender_username"], "ana");
        assert!(body.get("group_id").is_none(), "absent, not null");
        assert!(body.get("updated_at").is_none());
    }

    #[test]
    fn delete_frame_carries_minimal_body() {
        let id = Uuid::new_v4();
        let sender = Uuid::new_v4();
        let group = Uuid::new_v4();
        let event = MessageEvent {
            kind: MessageEventKind::DeleteMessage,
            phonenumbers: vec![],
            message: MessagePayload {
                id,
                sender_id: sender,
                group_id: Some(group),
                ..Default::default()
            },
            emitted_at: Utc::now(),
        };

        let (name, body) = split_frame(&encode_message_event(&event).unwrap());
        assert_eq!(name, "DELETE_MESSAGE");
        assert_eq!(body["id"], id.to_string());
        assert_eq!(body["sender_id"], sender.to_string());
        assert_eq!(body["group_id"], group.to_string());
        assert!(body.get("description").is_none());
    }

    #[test]
    fn mark_read_frame_names_both_parties() {
        let event = MessageEvent {
            kind: MessageEventKind::MarkMessageRead,
            phonenumbers: vec![],
            message: MessagePayload {
                id: Uuid::new_v4(),
                sender_id: Uuid::new_v4(),
                receiver_id: Some(Uuid::new_v4()),
                ..Default::default()
            },
            emitted_at: Utc::now(),
        };

        let (name, body) = split_frame(&encode_message_event(&event).unwrap());
        assert_eq!(name, "MARK_MESSAGE_READ");
        assert!(body.get("sender_id").is_some());
        assert!(body.get("receiver_id").is_some());
    }

    #[test]
    fn group_aggregate_frame_names_the_completing_member() {
        let member = Uuid::new_v4();
        let event = MessageEvent {
            kind: MessageEventKind::GroupMessageReceived,
            phonenumbers: vec![],
            message: MessagePayload {
                id: Uuid::new_v4(),
                group_id: Some(Uuid::new_v4()),
                group_member_id: Some(member),
                group_member_username: Some("bo".into()),
                ..Default::default()
            },
            emitted_at: Utc::now(),
        };

        let (name, body) = split_frame(&encode_message_event(&event).unwrap());
        assert_eq!(name, "GROUP_MESSAGE_RECEIVED");
        assert_eq!(body["group_member_id"], member.to_string());
        assert_eq!(body["group_member_username"], "bo");
    }

    #[test]
    fn group_event_frame_uses_emitted_at_camel_case() {
        let event = GroupEvent {
            kind: GroupEventKind::MadeAdmin,
            group: GroupAction {
                id: Uuid::new_v4(),
                username: "bo".into(),
                phonenumber: "222".into(),
            },
            phonenumbers: vec![],
            emitted_at: Utc.with_ymd_and_hms(2025, 3, 9, 8, 5, 2).unwrap(),
        };

        let (name, body) = split_frame(&encode_group_event(&event).unwrap());
        assert_eq!(name, "MADE_ADMIN");
        assert_eq!(body["name"], "MADE_ADMIN");
        assert_eq!(body["group"]["username"], "bo");
        assert_eq!(body["emittedAt"], "Sun, 09 Mar 2025 08:05:02 GMT");
    }
}
