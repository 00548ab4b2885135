//! Row types and row-mapping helpers. Kept separate from the
//! parley-types API models so the store layer owns its own shapes.

use anyhow::Result;
use chrono::{DateTime, Utc};
use parley_types::Message;
use sqlx::Row;
use sqlx::postgres::PgRow;
use uuid::Uuid;

/// Full user row, fetched for authentication.
#[derive(Debug, Clone)]
pub struct UserRow {
    pub id: Uuid,
    pub phonenumber: String,
    pub username: String,
    pub password: String,
    pub last_available: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Public user fields, fetched for profile lookups.
#[derive(Debug, Clone)]
pub struct UserProfile {
    pub phonenumber: String,
    pub username: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Row returned by user creation.
#[derive(Debug, Clone)]
pub struct NewUser {
    pub id: Uuid,
    pub phonenumber: String,
    pub username: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct GroupRow {
    pub id: Uuid,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct GroupMemberRow {
    pub id: Uuid,
    pub username: String,
    pub phonenumber: String,
}

#[derive(Debug, Clone)]
pub struct ConversationRow {
    pub peer_id: Uuid,
    pub peer_username: String,
    pub last_message: String,
    pub last_message_at: DateTime<Utc>,
}

/// Columns every message query selects, in one place so the mapper
/// below stays in sync.
pub(crate) const MESSAGE_COLUMNS: &str = "id, description, sender_id, receiver_id, group_id, \
     sent, received, read, sender_visible, receiver_visible, created_at, updated_at";

pub(crate) fn message_from_row(row: &PgRow) -> Result<Message> {
    Ok(Message {
        id: row.try_get("id")?,
        description: row.try_get("description")?,
        sender_id: row.try_get("sender_id")?,
        receiver_id: row.try_get("receiver_id")?,
        group_id: row.try_get("group_id")?,
        sent: row.try_get("sent")?,
        received: row.try_get("received")?,
        read: row.try_get("read")?,
        sender_visible: row.try_get("sender_visible")?,
        receiver_visible: row.try_get("receiver_visible")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

pub(crate) fn messages_from_rows(rows: Vec<PgRow>) -> Result<Vec<Message>> {
    rows.iter().map(message_from_row).collect()
}
