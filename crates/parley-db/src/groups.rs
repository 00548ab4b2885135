use anyhow::Result;
use sqlx::Row;
use uuid::Uuid;

use crate::Database;
use crate::models::{GroupMemberRow, GroupRow};

impl Database {
    pub async fn create_group(&self, name: &str) -> Result<GroupRow> {
        let row = sqlx::query(
            "INSERT INTO groups (id, name, created_at, updated_at)
             VALUES (gen_random_uuid(), $1, NOW(), NOW())
             RETURNING id, name, created_at, updated_at",
        )
        .bind(name)
        .fetch_one(self.pool())
        .await?;

        Ok(GroupRow {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    pub async fn update_group(&self, id: Uuid, name: &str) -> Result<Option<GroupRow>> {
        let row = sqlx::query(
            "UPDATE groups SET name = $1, updated_at = NOW() WHERE id = $2
             RETURNING id, name, created_at, updated_at",
        )
        .bind(name)
        .bind(id)
        .fetch_optional(self.pool())
        .await?;

        row.map(|row| {
            Ok(GroupRow {
                id: row.try_get("id")?,
                name: row.try_get("name")?,
                created_at: row.try_get("created_at")?,
                updated_at: row.try_get("updated_at")?,
            })
        })
        .transpose()
    }

    /// Memberships, admin markers, messages, and status rows all go
    /// with the group via FK cascade.
    pub async fn delete_group(&self, id: Uuid) -> Result<()> {
        sqlx::query("DELETE FROM groups WHERE id = $1")
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    pub async fn add_group_member(&self, group_id: Uuid, user_id: Uuid) -> Result<()> {
        sqlx::query(
            "INSERT INTO group_members (group_id, user_id) VALUES ($1, $2)
             ON CONFLICT DO NOTHING",
        )
        .bind(group_id)
        .bind(user_id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Removing a member also removes any admin marker, keeping the
    /// admin set a subset of the member set.
    pub async fn remove_group_member(&self, group_id: Uuid, user_id: Uuid) -> Result<()> {
        let mut tx = self.pool().begin().await?;

        sqlx::query("DELETE FROM group_admins WHERE group_id = $1 AND user_id = $2")
            .bind(group_id)
            .bind(user_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM group_members WHERE group_id = $1 AND user_id = $2")
            .bind(group_id)
            .bind(user_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Grant admin. Only members can be promoted; returns false when
    /// the user is not in the group.
    pub async fn make_group_admin(&self, group_id: Uuid, user_id: Uuid) -> Result<bool> {
        let result = sqlx::query(
            "INSERT INTO group_admins (group_id, user_id)
             SELECT $1, $2
             WHERE EXISTS(
                 SELECT 1 FROM group_members
                 WHERE group_id = $1 AND user_id = $2
             )
             ON CONFLICT DO NOTHING",
        )
        .bind(group_id)
        .bind(user_id)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn remove_group_admin(&self, group_id: Uuid, user_id: Uuid) -> Result<()> {
        sqlx::query("DELETE FROM group_admins WHERE group_id = $1 AND user_id = $2")
            .bind(group_id)
            .bind(user_id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    pub async fn is_group_admin(&self, group_id: Uuid, user_id: Uuid) -> Result<bool> {
        let (is_admin,): (bool,) = sqlx::query_as(
            "SELECT EXISTS(
                 SELECT 1 FROM group_admins WHERE group_id = $1 AND user_id = $2
             )",
        )
        .bind(group_id)
        .bind(user_id)
        .fetch_one(self.pool())
        .await?;
        Ok(is_admin)
    }

    pub async fn is_group_member(&self, group_id: Uuid, user_id: Uuid) -> Result<bool> {
        let (is_member,): (bool,) = sqlx::query_as(
            "SELECT EXISTS(
                 SELECT 1 FROM group_members WHERE group_id = $1 AND user_id = $2
             )",
        )
        .bind(group_id)
        .bind(user_id)
        .fetch_one(self.pool())
        .await?;
        Ok(is_member)
    }

    /// Everyone in the group except the requesting user.
    pub async fn get_group_members(
        &self,
        group_id: Uuid,
        excluding: Uuid,
    ) -> Result<Vec<GroupMemberRow>> {
        let rows = sqlx::query(
            "SELECT u.id, u.username, u.phonenumber
             FROM group_members gm
             JOIN users u ON u.id = gm.user_id
             WHERE gm.group_id = $1 AND gm.user_id <> $2
             ORDER BY u.username",
        )
        .bind(group_id)
        .bind(excluding)
        .fetch_all(self.pool())
        .await?;

        rows.iter()
            .map(|row| {
                Ok(GroupMemberRow {
                    id: row.try_get("id")?,
                    username: row.try_get("username")?,
                    phonenumber: row.try_get("phonenumber")?,
                })
            })
            .collect()
    }

    /// Push-notification targets for a group.
    pub async fn group_member_phonenumbers(&self, group_id: Uuid) -> Result<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT u.phonenumber
             FROM group_members gm
             JOIN users u ON u.id = gm.user_id
             WHERE gm.group_id = $1",
        )
        .bind(group_id)
        .fetch_all(self.pool())
        .await?;
        Ok(rows.into_iter().map(|(phonenumber,)| phonenumber).collect())
    }

    /// A returning member sees the group's history again.
    pub async fn restore_member_visibility(&self, group_id: Uuid, member_id: Uuid) -> Result<()> {
        sqlx::query(
            "UPDATE group_message_statuses SET visible_to_member = TRUE
             WHERE group_id = $1 AND member_id = $2",
        )
        .bind(group_id)
        .bind(member_id)
        .execute(self.pool())
        .await?;
        Ok(())
    }
}
