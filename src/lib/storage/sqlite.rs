use std::path::Path;
use std::str::FromStr;

use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};

use crate::core::{Message, MessageId, RelayError, StoreError};
use crate::storage::MessageStore;

#[cfg(feature = "tracing")]
use tracing::{debug, info, instrument};

/// Durable log backed by a single SQLite table.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Opens (creating if needed) the database at `database_url`, e.g. `sqlite://chat.db`.
    pub async fn new(database_url: &str, max_connections: u32) -> Result<Self, RelayError> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;
        Self::from_pool(pool).await
    }

    pub async fn open(path: impl AsRef<Path>, max_connections: u32) -> Result<Self, RelayError> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;
        Self::from_pool(pool).await
    }

    /// Private in-memory database. A single connection that never idles out keeps it alive.
    pub async fn new_memory() -> Result<Self, RelayError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(SqliteConnectOptions::from_str("sqlite::memory:")?)
            .await?;
        Self::from_pool(pool).await
    }

    pub async fn from_pool(pool: SqlitePool) -> Result<Self, RelayError> {
        sqlx::migrate!().run(&pool).await?;
        #[cfg(feature = "tracing")]
        info!("Message store ready");
        Ok(Self { pool })
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl MessageStore for SqliteStore {
    #[cfg_attr(feature = "tracing", instrument(skip(self, content)))]
    async fn append(&self, content: &str, client_offset: &str, username: &str) -> Result<MessageId, StoreError> {
        let result = sqlx::query("INSERT INTO messages (content, client_offset, username) VALUES (?, ?, ?)")
            .bind(content)
            .bind(client_offset)
            .bind(username)
            .execute(&self.pool)
            .await
            .map_err(|error| {
                if is_unique_violation(&error) {
                    StoreError::DuplicateKey(client_offset.to_string())
                } else {
                    StoreError::Storage(error)
                }
            })?;
        let id = result.last_insert_rowid();
        #[cfg(feature = "tracing")]
        debug!(id, "Appended message");
        Ok(id)
    }

    async fn delete_by_id(&self, id: MessageId) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM messages WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn find_by_id(&self, id: MessageId) -> Result<Option<Message>, StoreError> {
        let row = sqlx::query_as::<_, MessageRow>(
            "SELECT id, client_offset, username, content FROM messages WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Message::from))
    }

    fn scan_from(&self, offset: MessageId) -> BoxStream<'_, Result<Message, StoreError>> {
        sqlx::query_as::<_, MessageRow>(
            "SELECT id, client_offset, username, content FROM messages WHERE id > ? ORDER BY id ASC",
        )
        .bind(offset)
        .fetch(&self.pool)
        .map(|row| row.map(Message::from).map_err(StoreError::from))
        .boxed()
    }
}

#[derive(Debug, sqlx::FromRow)]
struct MessageRow {
    id: i64,
    client_offset: Option<String>,
    username: Option<String>,
    content: Option<String>,
}

impl From<MessageRow> for Message {
    fn from(row: MessageRow) -> Self {
        Self {
            id: row.id,
            client_offset: row.client_offset.unwrap_or_default(),
            username: row.username.unwrap_or_default(),
            content: row.content.unwrap_or_default(),
        }
    }
}

fn is_unique_violation(error: &sqlx::Error) -> bool {
    matches!(error, sqlx::Error::Database(db_error) if db_error.is_unique_violation())
}
