use anyhow::{Result, anyhow};
use sqlx::PgPool;
use tracing::info;

/// Current schema version. Increment and append to `MIGRATIONS` when
/// the schema changes.
const CURRENT_VERSION: i32 = 1;

/// Ordered migration batches. Index 0 = version 1.
const MIGRATIONS: &[&str] = &[MIGRATE_V1];

const MIGRATE_V1: &str = r#"
    CREATE TABLE IF NOT EXISTS users (
        id              UUID PRIMARY KEY,
        phonenumber     TEXT NOT NULL UNIQUE,
        username        TEXT NOT NULL,
        password        TEXT NOT NULL,
        last_available  TIMESTAMPTZ,
        created_at      TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at      TIMESTAMPTZ NOT NULL DEFAULT NOW()
    );

    CREATE TABLE IF NOT EXISTS refresh_tokens (
        token       TEXT PRIMARY KEY,
        user_id     UUID NOT NULL UNIQUE REFERENCES users(id) ON DELETE CASCADE,
        expires_at  TIMESTAMPTZ NOT NULL,
        created_at  TIMESTAMPTZ NOT NULL DEFAULT NOW()
    );

    CREATE TABLE IF NOT EXISTS groups (
        id          UUID PRIMARY KEY,
        name        TEXT NOT NULL,
        created_at  TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at  TIMESTAMPTZ NOT NULL DEFAULT NOW()
    );

    CREATE TABLE IF NOT EXISTS group_members (
        group_id    UUID NOT NULL REFERENCES groups(id) ON DELETE CASCADE,
        user_id     UUID NOT NULL REFERENCES users(id) ON DELETE CASCADE,
        PRIMARY KEY (group_id, user_id)
    );

    CREATE TABLE IF NOT EXISTS group_admins (
        group_id    UUID NOT NULL REFERENCES groups(id) ON DELETE CASCADE,
        user_id     UUID NOT NULL REFERENCES users(id) ON DELETE CASCADE,
        PRIMARY KEY (group_id, user_id)
    );

    CREATE TABLE IF NOT EXISTS messages (
        id                UUID PRIMARY KEY,
        description       TEXT NOT NULL,
        sender_id         UUID NOT NULL REFERENCES users(id) ON DELETE CASCADE,
        receiver_id       UUID REFERENCES users(id) ON DELETE CASCADE,
        group_id          UUID REFERENCES groups(id) ON DELETE CASCADE,
        sent              BOOLEAN NOT NULL DEFAULT TRUE,
        received          BOOLEAN NOT NULL DEFAULT FALSE,
        read              BOOLEAN NOT NULL DEFAULT FALSE,
        sender_visible    BOOLEAN NOT NULL DEFAULT TRUE,
        receiver_visible  BOOLEAN NOT NULL DEFAULT TRUE,
        created_at        TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at        TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        CHECK ((receiver_id IS NULL) <> (group_id IS NULL))
    );

    CREATE INDEX IF NOT EXISTS idx_messages_pair
        ON messages(sender_id, receiver_id, created_at);
    CREATE INDEX IF NOT EXISTS idx_messages_group
        ON messages(group_id, created_at);

    CREATE TABLE IF NOT EXISTS group_message_statuses (
        message_id          UUID NOT NULL REFERENCES messages(id) ON DELETE CASCADE,
        group_id            UUID NOT NULL REFERENCES groups(id) ON DELETE CASCADE,
        member_id           UUID NOT NULL REFERENCES users(id) ON DELETE CASCADE,
        received_by_member  BOOLEAN NOT NULL DEFAULT FALSE,
        read_by_member      BOOLEAN NOT NULL DEFAULT FALSE,
        visible_to_member   BOOLEAN NOT NULL DEFAULT TRUE,
        PRIMARY KEY (message_id, member_id)
    );

    CREATE INDEX IF NOT EXISTS idx_statuses_member
        ON group_message_statuses(group_id, member_id);
"#;

pub(crate) async fn bootstrap(pool: &PgPool) -> Result<()> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version     INTEGER NOT NULL,
            applied_at  TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )",
    )
    .execute(pool)
    .await?;

    let current = current_version(pool).await?;
    info!(
        "database schema version: {} (latest: {})",
        current, CURRENT_VERSION
    );
    if current >= CURRENT_VERSION {
        return Ok(());
    }

    for version in (current + 1)..=CURRENT_VERSION {
        let batch = MIGRATIONS[(version - 1) as usize];
        info!("applying migration v{}", version);

        let mut tx = pool.begin().await?;
        sqlx::raw_sql(batch)
            .execute(&mut *tx)
            .await
            .map_err(|e| anyhow!("migration v{version} failed: {e}"))?;
        sqlx::query("INSERT INTO schema_version (version) VALUES ($1)")
            .bind(version)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        info!("migration v{} applied", version);
    }

    Ok(())
}

async fn current_version(pool: &PgPool) -> Result<i32> {
    let (version,): (i32,) =
        sqlx::query_as("SELECT COALESCE(MAX(version), 0) FROM schema_version")
            .fetch_one(pool)
            .await?;
    Ok(version)
}
