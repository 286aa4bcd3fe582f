//! The `Storage` trait: unencrypted secondary indices plus opaque sealed
//! blobs (§6.1). `SqliteStorage` is the reference implementation; callers
//! needing a different backend implement the trait directly — persistence
//! format is pluggable (§1 Non-goals).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool},
    Row,
};
use std::path::Path;
use uuid::Uuid;

use crate::error::StoreError;

#[async_trait]
pub trait Storage: Send + Sync {
    async fn put_contact(&self, id: Uuid, sealed: &[u8], username: &str) -> Result<(), StoreError>;
    async fn get_contact(&self, id: Uuid) -> Result<Option<Vec<u8>>, StoreError>;
    async fn find_contact_by_username(&self, username: &str) -> Result<Option<(Uuid, Vec<u8>)>, StoreError>;
    /// Every known contact, for broadcast operations like the `_/devices/announce` fan-out (§4.7, §8 scenario 2).
    async fn all_contacts(&self) -> Result<Vec<(Uuid, Vec<u8>)>, StoreError>;

    async fn put_conversation(&self, id: Uuid, sealed: &[u8]) -> Result<(), StoreError>;
    async fn get_conversation(&self, id: Uuid) -> Result<Option<Vec<u8>>, StoreError>;

    async fn put_device_identity(
        &self,
        id: Uuid,
        sealed: &[u8],
        username: &str,
        device_id: Uuid,
        sender_id: i64,
    ) -> Result<(), StoreError>;
    async fn get_device_identity(&self, id: Uuid) -> Result<Option<Vec<u8>>, StoreError>;
    async fn find_device_identity(
        &self,
        username: &str,
        device_id: Uuid,
    ) -> Result<Option<(Uuid, Vec<u8>)>, StoreError>;
    async fn device_identities_for_user(&self, username: &str) -> Result<Vec<(Uuid, Vec<u8>)>, StoreError>;
    async fn all_sender_ids(&self) -> Result<Vec<i64>, StoreError>;

    /// Fails with [`StoreError::DuplicateRemoteId`] if `remote_id` is
    /// already present (§3, §8 Idempotence).
    async fn put_chat_message(
        &self,
        id: Uuid,
        sealed: &[u8],
        conversation_id: Uuid,
        remote_id: &str,
        order: i64,
        sender_id: i64,
    ) -> Result<(), StoreError>;
    async fn get_chat_message_by_remote_id(&self, remote_id: &str) -> Result<Option<(Uuid, Vec<u8>)>, StoreError>;
    async fn update_chat_message(&self, id: Uuid, sealed: &[u8]) -> Result<(), StoreError>;
    async fn chat_messages_for_conversation(&self, conversation_id: Uuid) -> Result<Vec<(Uuid, Vec<u8>)>, StoreError>;

    async fn put_job(
        &self,
        id: Uuid,
        sealed: &[u8],
        scheduled_at: DateTime<Utc>,
        is_background: bool,
    ) -> Result<(), StoreError>;
    async fn update_job(&self, id: Uuid, sealed: &[u8], scheduled_at: DateTime<Utc>) -> Result<(), StoreError>;
    async fn delete_job(&self, id: Uuid) -> Result<(), StoreError>;
    /// Ordered by `scheduledAt` ascending (§4.6).
    async fn all_jobs_ordered(&self) -> Result<Vec<(Uuid, Vec<u8>, bool)>, StoreError>;
}

#[derive(Clone)]
pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    /// Open (or create) the SQLite database at `db_path`, in WAL mode.
    ///
    /// WAL is set at connection time, not inside a migration — SQLite
    /// forbids changing `journal_mode` inside a transaction, and a
    /// migration runner wraps every step in one.
    pub async fn open(db_path: &Path) -> Result<Self, StoreError> {
        let opts = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);
        let pool = SqlitePool::connect_with(opts).await?;
        Self::create_tables(&pool).await?;
        Ok(Self { pool })
    }

    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let opts = SqliteConnectOptions::new()
            .filename(":memory:")
            .journal_mode(SqliteJournalMode::Wal);
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(opts)
            .await?;
        Self::create_tables(&pool).await?;
        Ok(Self { pool })
    }

    async fn create_tables(pool: &SqlitePool) -> Result<(), StoreError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS contacts (
                id TEXT PRIMARY KEY,
                username TEXT NOT NULL UNIQUE,
                props BLOB NOT NULL
            )",
        )
        .execute(pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS conversations (
                id TEXT PRIMARY KEY,
                props BLOB NOT NULL
            )",
        )
        .execute(pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS device_identities (
                id TEXT PRIMARY KEY,
                username TEXT NOT NULL,
                device_id TEXT NOT NULL,
                sender_id INTEGER NOT NULL UNIQUE,
                props BLOB NOT NULL,
                UNIQUE(username, device_id)
            )",
        )
        .execute(pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS chat_messages (
                id TEXT PRIMARY KEY,
                conversation_id TEXT NOT NULL,
                remote_id TEXT NOT NULL UNIQUE,
                message_order INTEGER NOT NULL,
                sender_id INTEGER NOT NULL,
                props BLOB NOT NULL
            )",
        )
        .execute(pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS jobs (
                id TEXT PRIMARY KEY,
                scheduled_at TEXT NOT NULL,
                is_background INTEGER NOT NULL,
                props BLOB NOT NULL
            )",
        )
        .execute(pool)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl Storage for SqliteStorage {
    async fn put_contact(&self, id: Uuid, sealed: &[u8], username: &str) -> Result<(), StoreError> {
        sqlx::query("INSERT OR REPLACE INTO contacts (id, username, props) VALUES (?, ?, ?)")
            .bind(id.to_string())
            .bind(username)
            .bind(sealed)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_contact(&self, id: Uuid) -> Result<Option<Vec<u8>>, StoreError> {
        let row = sqlx::query("SELECT props FROM contacts WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get::<Vec<u8>, _>("props")))
    }

    async fn find_contact_by_username(&self, username: &str) -> Result<Option<(Uuid, Vec<u8>)>, StoreError> {
        let row = sqlx::query("SELECT id, props FROM contacts WHERE username = ?")
            .bind(username)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| (parse_uuid(&r, "id"), r.get::<Vec<u8>, _>("props"))))
    }

    async fn all_contacts(&self) -> Result<Vec<(Uuid, Vec<u8>)>, StoreError> {
        let rows = sqlx::query("SELECT id, props FROM contacts").fetch_all(&self.pool).await?;
        Ok(rows.iter().map(|r| (parse_uuid(r, "id"), r.get::<Vec<u8>, _>("props"))).collect())
    }

    async fn put_conversation(&self, id: Uuid, sealed: &[u8]) -> Result<(), StoreError> {
        sqlx::query("INSERT OR REPLACE INTO conversations (id, props) VALUES (?, ?)")
            .bind(id.to_string())
            .bind(sealed)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_conversation(&self, id: Uuid) -> Result<Option<Vec<u8>>, StoreError> {
        let row = sqlx::query("SELECT props FROM conversations WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get::<Vec<u8>, _>("props")))
    }

    async fn put_device_identity(
        &self,
        id: Uuid,
        sealed: &[u8],
        username: &str,
        device_id: Uuid,
        sender_id: i64,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT OR REPLACE INTO device_identities (id, username, device_id, sender_id, props)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(id.to_string())
        .bind(username)
        .bind(device_id.to_string())
        .bind(sender_id)
        .bind(sealed)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_device_identity(&self, id: Uuid) -> Result<Option<Vec<u8>>, StoreError> {
        let row = sqlx::query("SELECT props FROM device_identities WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get::<Vec<u8>, _>("props")))
    }

    async fn find_device_identity(
        &self,
        username: &str,
        device_id: Uuid,
    ) -> Result<Option<(Uuid, Vec<u8>)>, StoreError> {
        let row = sqlx::query("SELECT id, props FROM device_identities WHERE username = ? AND device_id = ?")
            .bind(username)
            .bind(device_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| (parse_uuid(&r, "id"), r.get::<Vec<u8>, _>("props"))))
    }

    async fn device_identities_for_user(&self, username: &str) -> Result<Vec<(Uuid, Vec<u8>)>, StoreError> {
        let rows = sqlx::query("SELECT id, props FROM device_identities WHERE username = ?")
            .bind(username)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .iter()
            .map(|r| (parse_uuid(r, "id"), r.get::<Vec<u8>, _>("props")))
            .collect())
    }

    async fn all_sender_ids(&self) -> Result<Vec<i64>, StoreError> {
        let rows = sqlx::query("SELECT sender_id FROM device_identities")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(|r| r.get::<i64, _>("sender_id")).collect())
    }

    async fn put_chat_message(
        &self,
        id: Uuid,
        sealed: &[u8],
        conversation_id: Uuid,
        remote_id: &str,
        order: i64,
        sender_id: i64,
    ) -> Result<(), StoreError> {
        let existing = self.get_chat_message_by_remote_id(remote_id).await?;
        if existing.is_some() {
            return Err(StoreError::DuplicateRemoteId(remote_id.to_string()));
        }
        sqlx::query(
            "INSERT INTO chat_messages (id, conversation_id, remote_id, message_order, sender_id, props)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(id.to_string())
        .bind(conversation_id.to_string())
        .bind(remote_id)
        .bind(order)
        .bind(sender_id)
        .bind(sealed)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_chat_message_by_remote_id(&self, remote_id: &str) -> Result<Option<(Uuid, Vec<u8>)>, StoreError> {
        let row = sqlx::query("SELECT id, props FROM chat_messages WHERE remote_id = ?")
            .bind(remote_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| (parse_uuid(&r, "id"), r.get::<Vec<u8>, _>("props"))))
    }

    async fn update_chat_message(&self, id: Uuid, sealed: &[u8]) -> Result<(), StoreError> {
        sqlx::query("UPDATE chat_messages SET props = ? WHERE id = ?")
            .bind(sealed)
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn chat_messages_for_conversation(&self, conversation_id: Uuid) -> Result<Vec<(Uuid, Vec<u8>)>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, props FROM chat_messages WHERE conversation_id = ? ORDER BY message_order ASC",
        )
        .bind(conversation_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(|r| (parse_uuid(r, "id"), r.get::<Vec<u8>, _>("props")))
            .collect())
    }

    async fn put_job(
        &self,
        id: Uuid,
        sealed: &[u8],
        scheduled_at: DateTime<Utc>,
        is_background: bool,
    ) -> Result<(), StoreError> {
        sqlx::query("INSERT OR REPLACE INTO jobs (id, scheduled_at, is_background, props) VALUES (?, ?, ?, ?)")
            .bind(id.to_string())
            .bind(scheduled_at.to_rfc3339())
            .bind(is_background)
            .bind(sealed)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn update_job(&self, id: Uuid, sealed: &[u8], scheduled_at: DateTime<Utc>) -> Result<(), StoreError> {
        sqlx::query("UPDATE jobs SET props = ?, scheduled_at = ? WHERE id = ?")
            .bind(sealed)
            .bind(scheduled_at.to_rfc3339())
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn delete_job(&self, id: Uuid) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM jobs WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn all_jobs_ordered(&self) -> Result<Vec<(Uuid, Vec<u8>, bool)>, StoreError> {
        let rows = sqlx::query("SELECT id, props, is_background FROM jobs ORDER BY scheduled_at ASC")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .iter()
            .map(|r| (parse_uuid(r, "id"), r.get::<Vec<u8>, _>("props"), r.get::<bool, _>("is_background")))
            .collect())
    }
}

fn parse_uuid(row: &sqlx::sqlite::SqliteRow, column: &str) -> Uuid {
    let raw: String = row.get(column);
    Uuid::parse_str(&raw).expect("stored uuid column is always well-formed")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn duplicate_remote_id_is_rejected() {
        let storage = SqliteStorage::open_in_memory().await.unwrap();
        let conv = Uuid::new_v4();
        storage
            .put_chat_message(Uuid::new_v4(), b"blob-1", conv, "remote-1", 0, 1)
            .await
            .unwrap();
        let err = storage
            .put_chat_message(Uuid::new_v4(), b"blob-2", conv, "remote-1", 1, 1)
            .await;
        assert!(matches!(err, Err(StoreError::DuplicateRemoteId(_))));
    }

    #[tokio::test]
    async fn jobs_are_returned_in_scheduled_order() {
        let storage = SqliteStorage::open_in_memory().await.unwrap();
        let now = Utc::now();
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();
        storage.put_job(second, b"job-2", now + chrono::Duration::seconds(5), false).await.unwrap();
        storage.put_job(first, b"job-1", now, false).await.unwrap();

        let jobs = storage.all_jobs_ordered().await.unwrap();
        assert_eq!(jobs[0].0, first);
        assert_eq!(jobs[1].0, second);
    }
}
