use anyhow::Result;
use chrono::{DateTime, Utc};
use parley_types::Message;
use sqlx::Row;
use uuid::Uuid;

use crate::Database;
use crate::models::{ConversationRow, MESSAGE_COLUMNS, message_from_row, messages_from_rows};

/// Conversation reads return a window of the most recent messages at
/// or before the requested point, ordered ascending — the same shape
/// the cache keeps.
const CONVERSATION_LIMIT: i64 = 10;

impl Database {
    pub async fn create_message(
        &self,
        description: &str,
        sender_id: Uuid,
        receiver_id: Option<Uuid>,
        group_id: Option<Uuid>,
    ) -> Result<Message> {
        let row = sqlx::query(&format!(
            "INSERT INTO messages
                 (id, description, sender_id, receiver_id, group_id,
                  sent, received, read, sender_visible, receiver_visible,
                  created_at, updated_at)
             VALUES (gen_random_uuid(), $1, $2, $3, $4,
                     TRUE, FALSE, FALSE, TRUE, TRUE, NOW(), NOW())
             RETURNING {MESSAGE_COLUMNS}"
        ))
        .bind(description)
        .bind(sender_id)
        .bind(receiver_id)
        .bind(group_id)
        .fetch_one(self.pool())
        .await?;

        message_from_row(&row)
    }

    /// Seed a status row for every group member except the sender.
    /// Aggregate received/read flips compare against these rows.
    pub async fn init_group_statuses(
        &self,
        message_id: Uuid,
        group_id: Uuid,
        sender_id: Uuid,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO group_message_statuses
                 (message_id, group_id, member_id,
                  received_by_member, read_by_member, visible_to_member)
             SELECT $1, $2, user_id, FALSE, FALSE, TRUE
             FROM group_members
             WHERE group_id = $2 AND user_id <> $3",
        )
        .bind(message_id)
        .bind(group_id)
        .bind(sender_id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Update the body of a message owned by `sender_id`. Returns the
    /// updated row, or None when no such message belongs to the
    /// sender.
    pub async fn update_message(
        &self,
        id: Uuid,
        sender_id: Uuid,
        description: &str,
    ) -> Result<Option<Message>> {
        let row = sqlx::query(&format!(
            "UPDATE messages SET description = $1, updated_at = NOW()
             WHERE id = $2 AND sender_id = $3
             RETURNING {MESSAGE_COLUMNS}"
        ))
        .bind(description)
        .bind(id)
        .bind(sender_id)
        .fetch_optional(self.pool())
        .await?;

        row.as_ref().map(message_from_row).transpose()
    }

    pub async fn get_message(&self, id: Uuid) -> Result<Option<Message>> {
        let row = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(self.pool())
        .await?;

        row.as_ref().map(message_from_row).transpose()
    }

    // -- Soft deletion --

    /// Sender deletes a one-to-one message: hidden on both sides.
    pub async fn hide_message_for_both(
        &self,
        id: Uuid,
        sender_id: Uuid,
    ) -> Result<Option<Message>> {
        let row = sqlx::query(&format!(
            "UPDATE messages
             SET sender_visible = FALSE, receiver_visible = FALSE, updated_at = NOW()
             WHERE id = $1 AND sender_id = $2 AND receiver_id IS NOT NULL
             RETURNING {MESSAGE_COLUMNS}"
        ))
        .bind(id)
        .bind(sender_id)
        .fetch_optional(self.pool())
        .await?;

        row.as_ref().map(message_from_row).transpose()
    }

    /// Receiver deletes a one-to-one message: hidden on their side
    /// only.
    pub async fn hide_message_for_receiver(
        &self,
        id: Uuid,
        receiver_id: Uuid,
    ) -> Result<Option<Message>> {
        let row = sqlx::query(&format!(
            "UPDATE messages
             SET receiver_visible = FALSE, updated_at = NOW()
             WHERE id = $1 AND receiver_id = $2
             RETURNING {MESSAGE_COLUMNS}"
        ))
        .bind(id)
        .bind(receiver_id)
        .fetch_optional(self.pool())
        .await?;

        row.as_ref().map(message_from_row).transpose()
    }

    /// Sender deletes a group message: sender side plus every
    /// member's status row.
    pub async fn hide_group_message_for_all(
        &self,
        id: Uuid,
        sender_id: Uuid,
    ) -> Result<Option<Message>> {
        let mut tx = self.pool().begin().await?;

        let row = sqlx::query(&format!(
            "UPDATE messages
             SET sender_visible = FALSE, updated_at = NOW()
             WHERE id = $1 AND sender_id = $2 AND group_id IS NOT NULL
             RETURNING {MESSAGE_COLUMNS}"
        ))
        .bind(id)
        .bind(sender_id)
        .fetch_optional(&mut *tx)
        .await?;

        let message = row.as_ref().map(message_from_row).transpose()?;
        if message.is_some() {
            sqlx::query(
                "UPDATE group_message_statuses SET visible_to_member = FALSE
                 WHERE message_id = $1",
            )
            .bind(id)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(message)
    }

    /// A recipient deletes a group message for themselves only.
    pub async fn hide_group_message_for_member(
        &self,
        message_id: Uuid,
        member_id: Uuid,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE group_message_statuses SET visible_to_member = FALSE
             WHERE message_id = $1 AND member_id = $2",
        )
        .bind(message_id)
        .bind(member_id)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn is_group_message_visible(
        &self,
        message_id: Uuid,
        member_id: Uuid,
    ) -> Result<bool> {
        let (visible,): (bool,) = sqlx::query_as(
            "SELECT EXISTS(
                 SELECT 1 FROM group_message_statuses
                 WHERE message_id = $1 AND member_id = $2 AND visible_to_member
             )",
        )
        .bind(message_id)
        .bind(member_id)
        .fetch_one(self.pool())
        .await?;
        Ok(visible)
    }

    // -- Conversation reads --

    /// The window of a one-to-one conversation as the viewer sees it:
    /// both directions, filtered by the viewer's visibility flag.
    pub async fn get_conversation(
        &self,
        viewer: Uuid,
        peer: Uuid,
        before: DateTime<Utc>,
    ) -> Result<Vec<Message>> {
        let rows = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM (
                 SELECT {MESSAGE_COLUMNS} FROM messages
                 WHERE created_at <= $3
                   AND ((sender_id = $1 AND receiver_id = $2 AND sender_visible)
                     OR (sender_id = $2 AND receiver_id = $1 AND receiver_visible))
                 ORDER BY created_at DESC
                 LIMIT $4
             ) recent ORDER BY created_at ASC"
        ))
        .bind(viewer)
        .bind(peer)
        .bind(before)
        .bind(CONVERSATION_LIMIT)
        .fetch_all(self.pool())
        .await?;

        messages_from_rows(rows)
    }

    /// The window of a group conversation as `viewer` sees it: their
    /// own messages gated by the sender flag, everyone else's by the
    /// per-member status row.
    pub async fn get_group_messages(
        &self,
        group_id: Uuid,
        viewer: Uuid,
        before: DateTime<Utc>,
    ) -> Result<Vec<Message>> {
        let rows = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM (
                 SELECT {MESSAGE_COLUMNS} FROM messages m
                 WHERE m.group_id = $1 AND m.created_at <= $3
                   AND ((m.sender_id = $2 AND m.sender_visible)
                     OR EXISTS(
                            SELECT 1 FROM group_message_statuses s
                            WHERE s.message_id = m.id
                              AND s.member_id = $2
                              AND s.visible_to_member))
                 ORDER BY created_at DESC
                 LIMIT $4
             ) recent ORDER BY created_at ASC"
        ))
        .bind(group_id)
        .bind(viewer)
        .bind(before)
        .bind(CONVERSATION_LIMIT)
        .fetch_all(self.pool())
        .await?;

        messages_from_rows(rows)
    }

    /// Distinct one-to-one peers with a still-visible exchange, each
    /// with the latest visible message.
    pub async fn list_conversations(&self, user_id: Uuid) -> Result<Vec<ConversationRow>> {
        let rows = sqlx::query(
            "SELECT DISTINCT ON (m.peer_id)
                 m.peer_id, u.username, m.description, m.created_at
             FROM (
                 SELECT CASE WHEN sender_id = $1 THEN receiver_id ELSE sender_id END
                            AS peer_id,
                        description, created_at
                 FROM messages
                 WHERE group_id IS NULL
                   AND ((sender_id = $1 AND sender_visible)
                     OR (receiver_id = $1 AND receiver_visible))
             ) m
             JOIN users u ON u.id = m.peer_id
             ORDER BY m.peer_id, m.created_at DESC",
        )
        .bind(user_id)
        .fetch_all(self.pool())
        .await?;

        rows.iter()
            .map(|row| {
                Ok(ConversationRow {
                    peer_id: row.try_get("peer_id")?,
                    peer_username: row.try_get("username")?,
                    last_message: row.try_get("description")?,
                    last_message_at: row.try_get("created_at")?,
                })
            })
            .collect()
    }

    /// Soft-delete a whole pair conversation for `user_id`: messages
    /// they sent disappear for both sides, messages they received
    /// disappear for them only.
    pub async fn delete_conversation(&self, user_id: Uuid, peer_id: Uuid) -> Result<()> {
        let mut tx = self.pool().begin().await?;

        sqlx::query(
            "UPDATE messages
             SET sender_visible = FALSE, receiver_visible = FALSE, updated_at = NOW()
             WHERE sender_id = $1 AND receiver_id = $2",
        )
        .bind(user_id)
        .bind(peer_id)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "UPDATE messages
             SET receiver_visible = FALSE, updated_at = NOW()
             WHERE sender_id = $2 AND receiver_id = $1",
        )
        .bind(user_id)
        .bind(peer_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    // -- Delivery state, one-to-one --

    /// Mark a one-to-one message received by its receiver. Returns the
    /// new updated_at, or None when the message does not match.
    pub async fn mark_message_received(
        &self,
        id: Uuid,
        receiver_id: Uuid,
        sender_id: Uuid,
    ) -> Result<Option<DateTime<Utc>>> {
        let row: Option<(DateTime<Utc>,)> = sqlx::query_as(
            "UPDATE messages SET received = TRUE, updated_at = NOW()
             WHERE id = $1 AND receiver_id = $2 AND sender_id = $3
             RETURNING updated_at",
        )
        .bind(id)
        .bind(receiver_id)
        .bind(sender_id)
        .fetch_optional(self.pool())
        .await?;
        Ok(row.map(|(updated_at,)| updated_at))
    }

    /// Mark a one-to-one message read. Read implies received, so both
    /// flags are raised together.
    pub async fn mark_message_read(
        &self,
        id: Uuid,
        receiver_id: Uuid,
        sender_id: Uuid,
    ) -> Result<Option<DateTime<Utc>>> {
        let row: Option<(DateTime<Utc>,)> = sqlx::query_as(
            "UPDATE messages SET received = TRUE, read = TRUE, updated_at = NOW()
             WHERE id = $1 AND receiver_id = $2 AND sender_id = $3
             RETURNING updated_at",
        )
        .bind(id)
        .bind(receiver_id)
        .bind(sender_id)
        .fetch_optional(self.pool())
        .await?;
        Ok(row.map(|(updated_at,)| updated_at))
    }

    // -- Delivery state, group --

    pub async fn mark_group_message_received(
        &self,
        message_id: Uuid,
        member_id: Uuid,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE group_message_statuses SET received_by_member = TRUE
             WHERE message_id = $1 AND member_id = $2",
        )
        .bind(message_id)
        .bind(member_id)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn mark_group_message_read(
        &self,
        message_id: Uuid,
        member_id: Uuid,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE group_message_statuses
             SET received_by_member = TRUE, read_by_member = TRUE
             WHERE message_id = $1 AND member_id = $2",
        )
        .bind(message_id)
        .bind(member_id)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// (members who reached the state, total recipients) for a group
    /// message. Recipients = status rows, i.e. members excluding the
    /// sender at send time.
    pub async fn group_received_counts(&self, message_id: Uuid) -> Result<(i64, i64)> {
        let (reached, total): (i64, i64) = sqlx::query_as(
            "SELECT COUNT(*) FILTER (WHERE received_by_member), COUNT(*)
             FROM group_message_statuses WHERE message_id = $1",
        )
        .bind(message_id)
        .fetch_one(self.pool())
        .await?;
        Ok((reached, total))
    }

    pub async fn group_read_counts(&self, message_id: Uuid) -> Result<(i64, i64)> {
        let (reached, total): (i64, i64) = sqlx::query_as(
            "SELECT COUNT(*) FILTER (WHERE read_by_member), COUNT(*)
             FROM group_message_statuses WHERE message_id = $1",
        )
        .bind(message_id)
        .fetch_one(self.pool())
        .await?;
        Ok((reached, total))
    }

    /// Flip the aggregate received flag once every recipient has it.
    pub async fn set_message_received(&self, id: Uuid) -> Result<Option<DateTime<Utc>>> {
        let row: Option<(DateTime<Utc>,)> = sqlx::query_as(
            "UPDATE messages SET received = TRUE, updated_at = NOW() WHERE id = $1
             RETURNING updated_at",
        )
        .bind(id)
        .fetch_optional(self.pool())
        .await?;
        Ok(row.map(|(updated_at,)| updated_at))
    }

    pub async fn set_message_read(&self, id: Uuid) -> Result<Option<DateTime<Utc>>> {
        let row: Option<(DateTime<Utc>,)> = sqlx::query_as(
            "UPDATE messages SET received = TRUE, read = TRUE, updated_at = NOW()
             WHERE id = $1
             RETURNING updated_at",
        )
        .bind(id)
        .fetch_optional(self.pool())
        .await?;
        Ok(row.map(|(updated_at,)| updated_at))
    }

    // -- Catch-up queries for login --

    /// One-to-one messages addressed to `receiver_id` newer than
    /// `since`, still visible to them.
    pub async fn latest_messages_for_receiver(
        &self,
        receiver_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<Vec<Message>> {
        let rows = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages
             WHERE receiver_id = $1 AND created_at > $2 AND receiver_visible
             ORDER BY created_at ASC"
        ))
        .bind(receiver_id)
        .bind(since)
        .fetch_all(self.pool())
        .await?;

        messages_from_rows(rows)
    }

    /// Group messages newer than `since` in any group `user_id`
    /// belongs to, sent by someone else and still visible to them.
    pub async fn latest_group_messages_for_member(
        &self,
        user_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<Vec<Message>> {
        let rows = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages m
             WHERE m.group_id IN (SELECT group_id FROM group_members WHERE user_id = $1)
               AND m.created_at > $2
               AND m.sender_id <> $1
               AND EXISTS(
                       SELECT 1 FROM group_message_statuses s
                       WHERE s.message_id = m.id
                         AND s.member_id = $1
                         AND s.visible_to_member)
             ORDER BY created_at ASC"
        ))
        .bind(user_id)
        .bind(since)
        .fetch_all(self.pool())
        .await?;

        messages_from_rows(rows)
    }
}
