//! Durable voice session accounting.
//!
//! A session record is created in memory at join and persisted once at leave
//! with the computed duration. Persistence is keyed on the session id with
//! `ON CONFLICT DO NOTHING`, so a retry that races a slow earlier attempt can
//! never produce a duplicate row.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use uuid::Uuid;

/// A finished voice session, ready to persist.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoiceSessionRecord {
    /// Session id, assigned at join time.
    pub id: Uuid,
    pub user_id: Uuid,
    pub channel_id: Uuid,
    pub guild_id: Option<Uuid>,
    pub connected_at: DateTime<Utc>,
    pub disconnected_at: DateTime<Utc>,
    pub duration_secs: i64,
}

impl VoiceSessionRecord {
    /// Close out a session, computing its duration.
    #[must_use]
    pub fn close(
        id: Uuid,
        user_id: Uuid,
        channel_id: Uuid,
        guild_id: Option<Uuid>,
        connected_at: DateTime<Utc>,
        disconnected_at: DateTime<Utc>,
    ) -> Self {
        let duration_secs = (disconnected_at - connected_at).num_seconds().max(0);
        Self {
            id,
            user_id,
            channel_id,
            guild_id,
            connected_at,
            disconnected_at,
            duration_secs,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SessionStoreError {
    #[error("session storage failure: {0}")]
    Unavailable(String),
}

impl From<sqlx::Error> for SessionStoreError {
    fn from(err: sqlx::Error) -> Self {
        Self::Unavailable(err.to_string())
    }
}

/// Durable storage for finished voice sessions.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Persist a session record. Must be idempotent on the session id.
    async fn persist(&self, record: &VoiceSessionRecord) -> Result<(), SessionStoreError>;
}

/// PostgreSQL-backed session store.
pub struct PgSessionStore {
    pool: PgPool,
}

impl PgSessionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SessionStore for PgSessionStore {
    async fn persist(&self, record: &VoiceSessionRecord) -> Result<(), SessionStoreError> {
        sqlx::query(
            r#"
            INSERT INTO voice_sessions
                (id, user_id, channel_id, guild_id, connected_at, disconnected_at, duration_secs)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(record.id)
        .bind(record.user_id)
        .bind(record.channel_id)
        .bind(record.guild_id)
        .bind(record.connected_at)
        .bind(record.disconnected_at)
        .bind(record.duration_secs)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// In-memory session store for single-process deployments and tests.
#[derive(Default)]
pub struct MemorySessionStore {
    records: Mutex<Vec<VoiceSessionRecord>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all persisted records.
    pub fn records(&self) -> Vec<VoiceSessionRecord> {
        self.records.lock().clone()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn persist(&self, record: &VoiceSessionRecord) -> Result<(), SessionStoreError> {
        let mut records = self.records.lock();
        if !records.iter().any(|r| r.id == record.id) {
            records.push(record.clone());
        }
        Ok(())
    }
}
