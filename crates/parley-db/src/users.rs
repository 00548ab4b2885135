use anyhow::Result;
use sqlx::Row;
use uuid::Uuid;

use crate::Database;
use crate::models::{NewUser, UserProfile, UserRow};

impl Database {
    pub async fn create_user(
        &self,
        phonenumber: &str,
        username: &str,
        password_hash: &str,
    ) -> Result<NewUser> {
        let row = sqlx::query(
            "INSERT INTO users (id, phonenumber, username, password, created_at, updated_at)
             VALUES (gen_random_uuid(), $1, $2, $3, NOW(), NOW())
             RETURNING id, phonenumber, username, created_at, updated_at",
        )
        .bind(phonenumber)
        .bind(username)
        .bind(password_hash)
        .fetch_one(self.pool())
        .await?;

        Ok(NewUser {
            id: row.try_get("id")?,
            phonenumber: row.try_get("phonenumber")?,
            username: row.try_get("username")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    pub async fn user_exists(&self, phonenumber: &str) -> Result<bool> {
        let (exists,): (bool,) =
            sqlx::query_as("SELECT EXISTS(SELECT 1 FROM users WHERE phonenumber = $1)")
                .bind(phonenumber)
                .fetch_one(self.pool())
                .await?;
        Ok(exists)
    }

    pub async fn get_user_by_phonenumber(&self, phonenumber: &str) -> Result<Option<UserRow>> {
        let row = sqlx::query(
            "SELECT id, phonenumber, username, password, last_available, created_at
             FROM users WHERE phonenumber = $1",
        )
        .bind(phonenumber)
        .fetch_optional(self.pool())
        .await?;

        row.map(|row| {
            Ok(UserRow {
                id: row.try_get("id")?,
                phonenumber: row.try_get("phonenumber")?,
                username: row.try_get("username")?,
                password: row.try_get("password")?,
                last_available: row.try_get("last_available")?,
                created_at: row.try_get("created_at")?,
            })
        })
        .transpose()
    }

    pub async fn get_user_by_id(&self, id: Uuid) -> Result<Option<UserProfile>> {
        let row = sqlx::query(
            "SELECT phonenumber, username, created_at, updated_at FROM users WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(self.pool())
        .await?;

        row.map(|row| {
            Ok(UserProfile {
                phonenumber: row.try_get("phonenumber")?,
                username: row.try_get("username")?,
                created_at: row.try_get("created_at")?,
                updated_at: row.try_get("updated_at")?,
            })
        })
        .transpose()
    }

    pub async fn get_phonenumber_by_id(&self, id: Uuid) -> Result<Option<String>> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT phonenumber FROM users WHERE id = $1")
                .bind(id)
                .fetch_optional(self.pool())
                .await?;
        Ok(row.map(|(phonenumber,)| phonenumber))
    }

    pub async fn update_username(&self, id: Uuid, username: &str) -> Result<Option<String>> {
        let row: Option<(String,)> = sqlx::query_as(
            "UPDATE users SET username = $1, updated_at = NOW() WHERE id = $2
             RETURNING username",
        )
        .bind(username)
        .bind(id)
        .fetch_optional(self.pool())
        .await?;
        Ok(row.map(|(username,)| username))
    }

    pub async fn update_phonenumber(&self, id: Uuid, phonenumber: &str) -> Result<()> {
        sqlx::query("UPDATE users SET phonenumber = $1, updated_at = NOW() WHERE id = $2")
            .bind(phonenumber)
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    pub async fn update_password(&self, id: Uuid, password_hash: &str) -> Result<()> {
        sqlx::query("UPDATE users SET password = $1, updated_at = NOW() WHERE id = $2")
            .bind(password_hash)
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    pub async fn remove_user(&self, id: Uuid) -> Result<()> {
        sqlx::query("DELETE FROM users WHERE id = $1")
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// Stamp the moment a user's push connection went away.
    pub async fn set_last_available(&self, phonenumber: &str) -> Result<()> {
        sqlx::query("UPDATE users SET last_available = NOW() WHERE phonenumber = $1")
            .bind(phonenumber)
            .execute(self.pool())
            .await?;
        Ok(())
    }
}
