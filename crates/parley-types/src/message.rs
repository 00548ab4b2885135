use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A chat message as stored in Postgres and cached in memory.
///
/// Exactly one of `receiver_id` / `group_id` is set. The `sent` /
/// `received` / `read` flags only ever move forward; for group
/// messages `received` and `read` are the aggregate over the
/// per-member status rows. Soft deletion flips the visibility flags
/// instead of removing the row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub description: String,
    pub sender_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub receiver_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_id: Option<Uuid>,
    pub sent: bool,
    pub received: bool,
    pub read: bool,
    pub sender_visible: bool,
    pub receiver_visible: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Message {
    /// True when the one-to-one soft-delete state has been reached.
    pub fn hidden_for_both(&self) -> bool {
        !self.sender_visible && !self.receiver_visible
    }

    /// Whether `viewer` may still see this one-to-one message.
    pub fn visible_to(&self, viewer: Uuid) -> bool {
        if viewer == self.sender_id {
            self.sender_visible
        } else {
            self.receiver_visible
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Message {
        Message {
            id: Uuid::new_v4(),
            description: "hello".into(),
            sender_id: Uuid::new_v4(),
            receiver_id: Some(Uuid::new_v4()),
            group_id: None,
            sent: true,
            received: false,
            read: false,
            sender_visible: true,
            receiver_visible: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn visibility_tracks_viewer_side() {
        let mut msg = sample();
        let receiver = msg.receiver_id.unwrap();

        assert!(msg.visible_to(msg.sender_id));
        assert!(msg.visible_to(receiver));

        msg.receiver_visible = false;
        assert!(msg.visible_to(msg.sender_id));
        assert!(!msg.visible_to(receiver));
        assert!(!msg.hidden_for_both());

        msg.sender_visible = false;
        assert!(msg.hidden_for_both());
    }

    #[test]
    fn optional_target_fields_are_omitted() {
        let msg = sample();
        let json = serde_json::to_value(&msg).unwrap();
        assert!(json.get("receiver_id").is_some());
        assert!(json.get("group_id").is_none());
    }
}
