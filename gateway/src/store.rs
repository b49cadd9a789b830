//! Append-only message persistence.

use async_trait::async_trait;
use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod};
use hlchat_common::{Message, RoomId, SignatureScheme};
use tokio::sync::RwLock;
use tokio_postgres::error::SqlState;
use tokio_postgres::{NoTls, Row};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] tokio_postgres::Error),
    #[error("connection pool error: {0}")]
    Pool(#[from] deadpool_postgres::PoolError),
    #[error("pool setup failed: {0}")]
    Setup(String),
    #[error("message with this address and nonce already stored")]
    Duplicate,
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn insert(&self, message: &Message) -> Result<(), StoreError>;

    /// The most recent `limit` messages of `room` at or after `since`, oldest first.
    async fn history(
        &self,
        room: &RoomId,
        since: Option<u64>,
        limit: usize,
    ) -> Result<Vec<Message>, StoreError>;
}

// ─── In-memory ───────────────────────────────────────────────────────────────

/// Process-local store, used when no database is configured.
#[derive(Default)]
pub struct MemoryMessageStore {
    messages: RwLock<Vec<Message>>,
}

impl MemoryMessageStore {
    pub async fn len(&self) -> usize {
        self.messages.read().await.len()
    }
}

#[async_trait]
impl MessageStore for MemoryMessageStore {
    async fn insert(&self, message: &Message) -> Result<(), StoreError> {
        let mut messages = self.messages.write().await;
        if messages
            .iter()
            .any(|m| m.address == message.address && m.nonce == message.nonce)
        {
            return Err(StoreError::Duplicate);
        }
        messages.push(message.clone());
        Ok(())
    }

    async fn history(
        &self,
        room: &RoomId,
        since: Option<u64>,
        limit: usize,
    ) -> Result<Vec<Message>, StoreError> {
        let since = since.unwrap_or(0);
        let messages = self.messages.read().await;
        let mut matching: Vec<Message> = messages
            .iter()
            .filter(|m| &m.room == room && m.timestamp >= since)
            .cloned()
            .collect();
        matching.sort_by_key(|m| m.timestamp);
        let skip = matching.len().saturating_sub(limit);
        Ok(matching.split_off(skip))
    }
}

// ─── Postgres ────────────────────────────────────────────────────────────────

const MIGRATION: &str = r#"
CREATE TABLE IF NOT EXISTS messages (
    id            BIGSERIAL PRIMARY KEY,
    room          TEXT NOT NULL,
    address       TEXT NOT NULL,
    display_name  TEXT,
    content       TEXT NOT NULL,
    timestamp_ms  BIGINT NOT NULL,
    nonce         TEXT NOT NULL,
    signature     TEXT NOT NULL,
    scheme        TEXT NOT NULL,
    created_at    TIMESTAMPTZ NOT NULL DEFAULT now(),
    UNIQUE (address, nonce)
);
CREATE INDEX IF NOT EXISTS messages_room_timestamp ON messages (room, timestamp_ms);
"#;

pub struct PgMessageStore {
    pool: Pool,
}

impl PgMessageStore {
    /// Build a pool for `database_url` and apply the schema.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pg_config: tokio_postgres::Config = database_url.parse()?;
        let manager = Manager::from_config(
            pg_config,
            NoTls,
            ManagerConfig {
                recycling_method: RecyclingMethod::Fast,
            },
        );
        let pool = Pool::builder(manager)
            .max_size(16)
            .build()
            .map_err(|e| StoreError::Setup(e.to_string()))?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<(), StoreError> {
        let client = self.pool.get().await?;
        client.batch_execute(MIGRATION).await?;
        Ok(())
    }
}

fn scheme_label(scheme: SignatureScheme) -> &'static str {
    match scheme {
        SignatureScheme::Personal => "personal",
        SignatureScheme::Typed => "typed",
    }
}

fn corrupt(e: impl std::fmt::Display) -> StoreError {
    StoreError::Corrupt(e.to_string())
}

fn message_from_row(row: &Row) -> Result<Message, StoreError> {
    let address: String = row.try_get("address")?;
    let signature: String = row.try_get("signature")?;
    let scheme: String = row.try_get("scheme")?;
    let timestamp: i64 = row.try_get("timestamp_ms")?;
    Ok(Message {
        room: RoomId::from_raw(row.try_get::<_, String>("room")?),
        address: address.parse().map_err(corrupt)?,
        display_name: row.try_get("display_name")?,
        content: row.try_get("content")?,
        timestamp: u64::try_from(timestamp).map_err(corrupt)?,
        nonce: row.try_get("nonce")?,
        signature: signature.parse().map_err(corrupt)?,
        scheme: match scheme.as_str() {
            "typed" => SignatureScheme::Typed,
            _ => SignatureScheme::Personal,
        },
    })
}

#[async_trait]
impl MessageStore for PgMessageStore {
    async fn insert(&self, message: &Message) -> Result<(), StoreError> {
        let client = self.pool.get().await?;
        let result = client
            .execute(
                "INSERT INTO messages \
                 (room, address, display_name, content, timestamp_ms, nonce, signature, scheme) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
                &[
                    &message.room.as_str(),
                    &message.address.to_string(),
                    &message.display_name,
                    &message.content,
                    &(message.timestamp as i64),
                    &message.nonce,
                    &message.signature.to_string(),
                    &scheme_label(message.scheme),
                ],
            )
            .await;
        match result {
            Ok(_) => Ok(()),
            Err(e) if e.code() == Some(&SqlState::UNIQUE_VIOLATION) => Err(StoreError::Duplicate),
            Err(e) => Err(e.into()),
        }
    }

    async fn history(
        &self,
        room: &RoomId,
        since: Option<u64>,
        limit: usize,
    ) -> Result<Vec<Message>, StoreError> {
        let client = self.pool.get().await?;
        let rows = client
            .query(
                "SELECT * FROM ( \
                    SELECT room, address, display_name, content, timestamp_ms, nonce, signature, scheme \
                    FROM messages WHERE room = $1 AND timestamp_ms >= $2 \
                    ORDER BY timestamp_ms DESC LIMIT $3 \
                 ) recent ORDER BY timestamp_ms ASC",
                &[
                    &room.as_str(),
                    &(since.unwrap_or(0) as i64),
                    &(limit as i64),
                ],
            )
            .await?;
        rows.iter().map(message_from_row).collect()
    }
}
