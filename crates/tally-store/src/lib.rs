//! tally-store — SQLite persistence for the attendance daemon.
//!
//! Two tables: `identities` (one embedding per registered person) and
//! `attendance` (append-only event log, the source of truth for
//! cooldown decisions across restarts). All calls hop to the driver
//! thread via `tokio-rusqlite` so rusqlite never blocks the async
//! runtime.

use std::collections::HashMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tally_core::{Embedding, EventType, Identity};
use thiserror::Error;
use tokio_rusqlite::Connection;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] tokio_rusqlite::Error),
    #[error("corrupt embedding blob: {0} bytes is not a whole number of f32s")]
    CorruptEmbedding(usize),
    #[error("corrupt timestamp: {0}")]
    CorruptTimestamp(String),
    #[error("corrupt event type: {0}")]
    CorruptEventType(String),
}

/// One accepted recognition decision. Append-only; never mutated.
#[derive(Debug, Clone, Serialize)]
pub struct AttendanceEvent {
    pub event_id: i64,
    pub identity_id: String,
    pub event_type: EventType,
    pub occurred_at: DateTime<Utc>,
    pub confidence: f32,
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS identities (
    id            TEXT PRIMARY KEY,
    name          TEXT NOT NULL,
    embedding     BLOB NOT NULL,
    registered_at TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS attendance (
    event_id    INTEGER PRIMARY KEY AUTOINCREMENT,
    identity_id TEXT NOT NULL,
    event_type  TEXT NOT NULL,
    occurred_at TEXT NOT NULL,
    confidence  REAL NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_attendance_key
    ON attendance (identity_id, event_type, occurred_at);
";

/// Clone-safe handle to the database.
#[derive(Clone)]
pub struct Store {
    conn: Connection,
}

impl Store {
    /// Open (or create) the database at `path` and apply the schema.
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            // Best effort; open() reports the real failure if this didn't help.
            let _ = std::fs::create_dir_all(parent);
        }
        let conn = Connection::open(path.to_path_buf()).await?;
        Self::init(conn).await
    }

    /// Open an in-memory database (tests).
    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().await?;
        Self::init(conn).await
    }

    async fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.call(|conn| {
            conn.execute_batch(SCHEMA)?;
            Ok(())
        })
        .await?;
        Ok(Self { conn })
    }

    /// Insert or replace an identity by its primary key.
    pub async fn upsert_identity(&self, identity: &Identity) -> Result<(), StoreError> {
        let id = identity.id.clone();
        let name = identity.name.clone();
        let blob = encode_embedding(&identity.embedding.values);
        let registered_at = identity.registered_at.to_rfc3339();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO identities (id, name, embedding, registered_at)
                     VALUES (?1, ?2, ?3, ?4)
                     ON CONFLICT(id) DO UPDATE SET
                         name = excluded.name,
                         embedding = excluded.embedding,
                         registered_at = excluded.registered_at",
                    rusqlite::params![id, name, blob, registered_at],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Delete an identity. Idempotent. Does NOT cascade into the
    /// attendance log — events are immutable history.
    pub async fn delete_identity(&self, id: &str) -> Result<bool, StoreError> {
        let id = id.to_string();
        let affected = self
            .conn
            .call(move |conn| {
                Ok(conn.execute("DELETE FROM identities WHERE id = ?1", rusqlite::params![id])?)
            })
            .await?;
        Ok(affected > 0)
    }

    pub async fn list_identities(&self) -> Result<Vec<Identity>, StoreError> {
        let rows: Vec<(String, String, Vec<u8>, String)> = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, name, embedding, registered_at FROM identities ORDER BY id",
                )?;
                let rows = stmt
                    .query_map([], |row| {
                        Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;

        rows.into_iter()
            .map(|(id, name, blob, registered_at)| {
                Ok(Identity {
                    id,
                    name,
                    embedding: Embedding::new(decode_embedding(&blob)?),
                    registered_at: parse_timestamp(&registered_at)?,
                })
            })
            .collect()
    }

    /// Append one accepted event; returns the assigned event id.
    pub async fn append_event(
        &self,
        identity_id: &str,
        event_type: EventType,
        occurred_at: DateTime<Utc>,
        confidence: f32,
    ) -> Result<i64, StoreError> {
        let identity_id = identity_id.to_string();
        let occurred_at = occurred_at.to_rfc3339();
        let event_id = self
            .conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO attendance (identity_id, event_type, occurred_at, confidence)
                     VALUES (?1, ?2, ?3, ?4)",
                    rusqlite::params![identity_id, event_type.as_str(), occurred_at, confidence],
                )?;
                Ok(conn.last_insert_rowid())
            })
            .await?;
        tracing::debug!(event_id, "attendance event appended");
        Ok(event_id)
    }

    /// All events, newest first.
    pub async fn list_events(&self) -> Result<Vec<AttendanceEvent>, StoreError> {
        let rows: Vec<(i64, String, String, String, f64)> = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT event_id, identity_id, event_type, occurred_at, confidence
                     FROM attendance ORDER BY event_id DESC",
                )?;
                let rows = stmt
                    .query_map([], |row| {
                        Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;

        rows.into_iter()
            .map(|(event_id, identity_id, event_type, occurred_at, confidence)| {
                Ok(AttendanceEvent {
                    event_id,
                    identity_id,
                    event_type: parse_event_type(&event_type)?,
                    occurred_at: parse_timestamp(&occurred_at)?,
                    confidence: confidence as f32,
                })
            })
            .collect()
    }

    /// Delete one event by id (administrative removal). Idempotent.
    pub async fn delete_event(&self, event_id: i64) -> Result<bool, StoreError> {
        let affected = self
            .conn
            .call(move |conn| {
                Ok(conn.execute(
                    "DELETE FROM attendance WHERE event_id = ?1",
                    rusqlite::params![event_id],
                )?)
            })
            .await?;
        Ok(affected > 0)
    }

    /// Timestamp of the most recent event per `(identity_id, event_type)`
    /// key. Seeds the deduplicator cache at process start.
    pub async fn last_accepted(
        &self,
    ) -> Result<HashMap<(String, EventType), DateTime<Utc>>, StoreError> {
        let rows: Vec<(String, String, String)> = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT identity_id, event_type, MAX(occurred_at)
                     FROM attendance GROUP BY identity_id, event_type",
                )?;
                let rows = stmt
                    .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;

        let mut map = HashMap::with_capacity(rows.len());
        for (identity_id, event_type, occurred_at) in rows {
            map.insert(
                (identity_id, parse_event_type(&event_type)?),
                parse_timestamp(&occurred_at)?,
            );
        }
        Ok(map)
    }
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| StoreError::CorruptTimestamp(raw.to_string()))
}

fn parse_event_type(raw: &str) -> Result<EventType, StoreError> {
    raw.parse()
        .map_err(|_| StoreError::CorruptEventType(raw.to_string()))
}

/// Encode an embedding as little-endian f32 bytes.
fn encode_embedding(values: &[f32]) -> Vec<u8> {
    let mut blob = Vec::with_capacity(values.len() * 4);
    for v in values {
        blob.extend_from_slice(&v.to_le_bytes());
    }
    blob
}

fn decode_embedding(blob: &[u8]) -> Result<Vec<f32>, StoreError> {
    if blob.len() % 4 != 0 {
        return Err(StoreError::CorruptEmbedding(blob.len()));
    }
    Ok(blob
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn alice() -> Identity {
        Identity {
            id: "u1".into(),
            name: "Alice".into(),
            embedding: Embedding::new(vec![1.0, -0.5, 0.25]),
            registered_at: Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap(),
        }
    }

    #[test]
    fn embedding_blob_round_trip() {
        let values = vec![1.0f32, -0.5, 0.0, 123.456];
        assert_eq!(decode_embedding(&encode_embedding(&values)).unwrap(), values);
    }

    #[test]
    fn truncated_blob_is_corrupt() {
        assert!(matches!(
            decode_embedding(&[0u8, 1, 2]),
            Err(StoreError::CorruptEmbedding(3))
        ));
    }

    #[tokio::test]
    async fn identity_round_trip() {
        let store = Store::open_in_memory().await.unwrap();
        store.upsert_identity(&alice()).await.unwrap();

        let listed = store.list_identities().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, "u1");
        assert_eq!(listed[0].name, "Alice");
        assert_eq!(listed[0].embedding.values, vec![1.0, -0.5, 0.25]);
        assert_eq!(listed[0].registered_at, alice().registered_at);
    }

    #[tokio::test]
    async fn upsert_replaces_existing_identity() {
        let store = Store::open_in_memory().await.unwrap();
        store.upsert_identity(&alice()).await.unwrap();

        let mut renamed = alice();
        renamed.name = "Alice B".into();
        renamed.embedding = Embedding::new(vec![0.0, 1.0, 0.0]);
        store.upsert_identity(&renamed).await.unwrap();

        let listed = store.list_identities().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].name, "Alice B");
        assert_eq!(listed[0].embedding.values, vec![0.0, 1.0, 0.0]);
    }

    #[tokio::test]
    async fn delete_identity_is_idempotent_and_keeps_events() {
        let store = Store::open_in_memory().await.unwrap();
        store.upsert_identity(&alice()).await.unwrap();
        store
            .append_event("u1", EventType::Entry, Utc::now(), 0.92)
            .await
            .unwrap();

        assert!(store.delete_identity("u1").await.unwrap());
        assert!(!store.delete_identity("u1").await.unwrap());

        // History survives identity deletion.
        let events = store.list_events().await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].identity_id, "u1");
    }

    #[tokio::test]
    async fn events_are_monotonic_and_listed_newest_first() {
        let store = Store::open_in_memory().await.unwrap();
        let first = store
            .append_event("u1", EventType::Entry, Utc::now(), 0.9)
            .await
            .unwrap();
        let second = store
            .append_event("u2", EventType::Exit, Utc::now(), 0.8)
            .await
            .unwrap();
        assert!(second > first);

        let events = store.list_events().await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_id, second);
        assert_eq!(events[1].event_id, first);
        assert_eq!(events[0].event_type, EventType::Exit);
    }

    #[tokio::test]
    async fn delete_event_is_idempotent() {
        let store = Store::open_in_memory().await.unwrap();
        let id = store
            .append_event("u1", EventType::Entry, Utc::now(), 0.9)
            .await
            .unwrap();
        assert!(store.delete_event(id).await.unwrap());
        assert!(!store.delete_event(id).await.unwrap());
    }

    #[tokio::test]
    async fn last_accepted_keeps_keys_independent() {
        let store = Store::open_in_memory().await.unwrap();
        let early = Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap();
        let late = Utc.with_ymd_and_hms(2024, 3, 1, 17, 0, 0).unwrap();

        store.append_event("u1", EventType::Entry, early, 0.9).await.unwrap();
        store.append_event("u1", EventType::Entry, late, 0.9).await.unwrap();
        store.append_event("u1", EventType::Exit, early, 0.9).await.unwrap();

        let map = store.last_accepted().await.unwrap();
        assert_eq!(map.len(), 2);
        assert_eq!(map[&("u1".to_string(), EventType::Entry)], late);
        assert_eq!(map[&("u1".to_string(), EventType::Exit)], early);
    }
}
