//! Delivery audit trail
//!
//! Schema (created on [`SqliteAuditStore::migrate`]):
//! ```sql
//! CREATE TABLE IF NOT EXISTS delivery_records (
//!     id           INTEGER PRIMARY KEY AUTOINCREMENT,
//!     session_id   TEXT    NOT NULL,
//!     message_id   TEXT    NOT NULL,
//!     routed_to    TEXT    NOT NULL,
//!     status       TEXT    NOT NULL,
//!     record       TEXT    NOT NULL,  -- full DeliveryRecord as JSON
//!     delivered_at TEXT    NOT NULL
//! );
//! CREATE TABLE IF NOT EXISTS messages (
//!     id          INTEGER PRIMARY KEY AUTOINCREMENT,
//!     session_id  TEXT    NOT NULL,
//!     message_id  TEXT    NOT NULL,
//!     customer_id TEXT,
//!     direction   TEXT    NOT NULL,  -- inbound | outbound
//!     content     TEXT    NOT NULL,
//!     metadata    TEXT    NOT NULL,  -- JSON object
//!     created_at  TEXT    NOT NULL
//! );
//! CREATE TABLE IF NOT EXISTS conversations (
//!     session_id TEXT PRIMARY KEY,
//!     status     TEXT NOT NULL,
//!     issue_type TEXT,
//!     sentiment  TEXT,
//!     created_at TEXT NOT NULL,
//!     updated_at TEXT NOT NULL
//! );
//! ```

use crate::protocol::messages::{DeliveryRecord, Message};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::str::FromStr;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("Failed to encode delivery record: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("Audit store unavailable: {0}")]
    Unavailable(String),
    #[error("Corrupt transcript row: {0}")]
    CorruptRow(String),
}

/// Which way a transcript line travelled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Customer turn entering the mesh
    Inbound,
    /// Answer leaving the aggregator
    Outbound,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Inbound => "inbound",
            Direction::Outbound => "outbound",
        }
    }
}

impl FromStr for Direction {
    type Err = AuditError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "inbound" => Ok(Direction::Inbound),
            "outbound" => Ok(Direction::Outbound),
            other => Err(AuditError::CorruptRow(format!("unknown direction '{other}'"))),
        }
    }
}

/// One line of a session transcript
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptEntry {
    pub session_id: String,
    pub message_id: Uuid,
    pub customer_id: Option<String>,
    pub direction: Direction,
    pub content: String,
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
}

impl TranscriptEntry {
    /// Customer turn as submitted by the gateway
    pub fn inbound(message: &Message) -> Self {
        Self {
            session_id: message.session_id().to_string(),
            message_id: message.id,
            customer_id: message.payload.customer_id().map(str::to_string),
            direction: Direction::Inbound,
            content: message.payload.text().to_string(),
            metadata: json!({ "vip": message.payload.vip() }),
            created_at: message.metadata.created_at,
        }
    }

    /// Answer recorded by the aggregator
    pub fn outbound(record: &DeliveryRecord) -> Self {
        Self {
            session_id: record.session_id.clone(),
            message_id: record.message_id,
            customer_id: None,
            direction: Direction::Outbound,
            content: record.response_text.clone(),
            metadata: json!({
                "routed_to": record.routed_to.as_str(),
                "delivery_status": record.delivery_status.as_str(),
            }),
            created_at: record.delivered_at,
        }
    }
}

/// Append-only store for terminal delivery records and the session transcript
#[async_trait]
pub trait AuditStore: Send + Sync {
    /// Persist a terminal record; also appends its outbound transcript line
    async fn record_delivery(&self, record: &DeliveryRecord) -> Result<(), AuditError>;

    /// Append an inbound customer turn to the transcript
    async fn record_turn(&self, entry: &TranscriptEntry) -> Result<(), AuditError>;

    /// Transcript for one session, oldest first
    async fn transcript(&self, session_id: &str) -> Result<Vec<TranscriptEntry>, AuditError>;

    /// Records for one session, oldest first
    async fn records_for_session(&self, session_id: &str)
        -> Result<Vec<DeliveryRecord>, AuditError>;

    async fn health_check(&self) -> Result<(), AuditError>;
}

#[derive(Debug, Clone)]
pub struct SqliteAuditStore {
    pool: SqlitePool,
}

impl SqliteAuditStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open (creating when missing) the database and run migrations
    pub async fn connect(database_url: &str) -> Result<Self, AuditError> {
        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;
        let store = Self::new(pool);
        store.migrate().await?;
        Ok(store)
    }

    pub async fn migrate(&self) -> Result<(), AuditError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS delivery_records (
                id           INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id   TEXT    NOT NULL,
                message_id   TEXT    NOT NULL,
                routed_to    TEXT    NOT NULL,
                status       TEXT    NOT NULL,
                record       TEXT    NOT NULL,
                delivered_at TEXT    NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS delivery_records_session ON delivery_records (session_id)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS messages (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id  TEXT    NOT NULL,
                message_id  TEXT    NOT NULL,
                customer_id TEXT,
                direction   TEXT    NOT NULL,
                content     TEXT    NOT NULL,
                metadata    TEXT    NOT NULL,
                created_at  TEXT    NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS messages_session ON messages (session_id)")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS conversations (
                session_id TEXT PRIMARY KEY,
                status     TEXT NOT NULL,
                issue_type TEXT,
                sentiment  TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn insert_transcript(
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        entry: &TranscriptEntry,
    ) -> Result<(), AuditError> {
        sqlx::query(
            "INSERT INTO messages (session_id, message_id, customer_id, direction, content, metadata, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&entry.session_id)
        .bind(entry.message_id.to_string())
        .bind(entry.customer_id.as_deref())
        .bind(entry.direction.as_str())
        .bind(&entry.content)
        .bind(serde_json::to_string(&entry.metadata)?)
        .bind(entry.created_at.to_rfc3339())
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    /// Conversation summary as (status, issue_type, sentiment)
    pub async fn conversation_summary(
        &self,
        session_id: &str,
    ) -> Result<Option<(String, Option<String>, Option<String>)>, AuditError> {
        let row: Option<(String, Option<String>, Option<String>)> = sqlx::query_as(
            "SELECT status, issue_type, sentiment FROM conversations WHERE session_id = ?",
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }
}

#[async_trait]
impl AuditStore for SqliteAuditStore {
    async fn record_delivery(&self, record: &DeliveryRecord) -> Result<(), AuditError> {
        let body = serde_json::to_string(record)?;
        let delivered_at = record.delivered_at.to_rfc3339();

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO delivery_records (session_id, message_id, routed_to, status, record, delivered_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&record.session_id)
        .bind(record.message_id.to_string())
        .bind(record.routed_to.as_str())
        .bind(record.delivery_status.as_str())
        .bind(&body)
        .bind(&delivered_at)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "INSERT INTO conversations (session_id, status, issue_type, sentiment, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(session_id) DO UPDATE SET
                status = excluded.status,
                issue_type = COALESCE(excluded.issue_type, conversations.issue_type),
                sentiment = COALESCE(excluded.sentiment, conversations.sentiment),
                updated_at = excluded.updated_at",
        )
        .bind(&record.session_id)
        .bind(record.routed_to.as_str())
        .bind(record.intent.as_deref())
        .bind(record.sentiment.as_deref())
        .bind(record.metadata.created_at.to_rfc3339())
        .bind(&delivered_at)
        .execute(&mut *tx)
        .await?;

        Self::insert_transcript(&mut tx, &TranscriptEntry::outbound(record)).await?;

        tx.commit().await?;

        debug!(
            session_id = %record.session_id,
            message_id = %record.message_id,
            routed_to = record.routed_to.as_str(),
            "Delivery record persisted"
        );
        Ok(())
    }

    async fn records_for_session(
        &self,
        session_id: &str,
    ) -> Result<Vec<DeliveryRecord>, AuditError> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT record FROM delivery_records WHERE session_id = ? ORDER BY id ASC",
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(body,)| serde_json::from_str(&body).map_err(AuditError::from))
            .collect()
    }

    async fn record_turn(&self, entry: &TranscriptEntry) -> Result<(), AuditError> {
        let mut tx = self.pool.begin().await?;
        Self::insert_transcript(&mut tx, entry).await?;

        // A new session starts as open; an existing summary keeps its status
        sqlx::query(
            "INSERT INTO conversations (session_id, status, issue_type, sentiment, created_at, updated_at)
             VALUES (?, 'open', NULL, NULL, ?, ?)
             ON CONFLICT(session_id) DO UPDATE SET updated_at = excluded.updated_at",
        )
        .bind(&entry.session_id)
        .bind(entry.created_at.to_rfc3339())
        .bind(entry.created_at.to_rfc3339())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        debug!(session_id = %entry.session_id, message_id = %entry.message_id, "Inbound turn logged");
        Ok(())
    }

    async fn transcript(&self, session_id: &str) -> Result<Vec<TranscriptEntry>, AuditError> {
        let rows: Vec<TranscriptRow> = sqlx::query_as(
            "SELECT session_id, message_id, customer_id, direction, content, metadata, created_at
             FROM messages WHERE session_id = ? ORDER BY id ASC",
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(TranscriptEntry::try_from).collect()
    }

    async fn health_check(&self) -> Result<(), AuditError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

/// (session_id, message_id, customer_id, direction, content, metadata, created_at)
type TranscriptRow = (
    String,
    String,
    Option<String>,
    String,
    String,
    String,
    String,
);

impl TryFrom<TranscriptRow> for TranscriptEntry {
    type Error = AuditError;

    fn try_from(row: TranscriptRow) -> Result<Self, Self::Error> {
        let (session_id, message_id, customer_id, direction, content, metadata, created_at) = row;
        Ok(Self {
            session_id,
            message_id: Uuid::parse_str(&message_id)
                .map_err(|e| AuditError::CorruptRow(format!("message_id: {e}")))?,
            customer_id,
            direction: direction.parse()?,
            content,
            metadata: serde_json::from_str(&metadata)?,
            created_at: DateTime::parse_from_rfc3339(&created_at)
                .map_err(|e| AuditError::CorruptRow(format!("created_at: {e}")))?
                .with_timezone(&Utc),
        })
    }
}
