pub mod memory;
pub mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::core::{Message, MessageId, StoreError};

/// Append-only chat log keyed by a client-supplied offset.
///
/// Ids are handed out in strictly increasing order and never reused, deletions included.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Fails with [`StoreError::DuplicateKey`] without writing anything if `client_offset` was seen before.
    async fn append(&self, content: &str, client_offset: &str, username: &str) -> Result<MessageId, StoreError>;
    /// Returns whether a row with that id existed.
    async fn delete_by_id(&self, id: MessageId) -> Result<bool, StoreError>;
    async fn find_by_id(&self, id: MessageId) -> Result<Option<Message>, StoreError>;
    /// Every message with `id > offset`, ascending. The stream is consumed once.
    fn scan_from(&self, offset: MessageId) -> BoxStream<'_, Result<Message, StoreError>>;
}
