use anyhow::Result;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::Database;

impl Database {
    /// Store a refresh token for `user_id`, replacing any previous
    /// one. A user only ever has one active refresh token.
    pub async fn upsert_refresh_token(
        &self,
        token: &str,
        user_id: Uuid,
        expires_at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO refresh_tokens (token, user_id, expires_at, created_at)
             VALUES ($1, $2, $3, NOW())
             ON CONFLICT (user_id)
             DO UPDATE SET token = $1, expires_at = $3, created_at = NOW()",
        )
        .bind(token)
        .bind(user_id)
        .bind(expires_at)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn refresh_token_expiry(&self, user_id: Uuid) -> Result<Option<DateTime<Utc>>> {
        let row: Option<(DateTime<Utc>,)> =
            sqlx::query_as("SELECT expires_at FROM refresh_tokens WHERE user_id = $1")
                .bind(user_id)
                .fetch_optional(self.pool())
                .await?;
        Ok(row.map(|(expires_at,)| expires_at))
    }

    pub async fn remove_refresh_token(&self, user_id: Uuid) -> Result<()> {
        sqlx::query("DELETE FROM refresh_tokens WHERE user_id = $1")
            .bind(user_id)
            .execute(self.pool())
            .await?;
        Ok(())
    }
}
