use std::collections::{BTreeMap, HashSet};

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use tokio::sync::RwLock;

use crate::core::{Message, MessageId, StoreError};

use super::MessageStore;

/// Non-durable log with the same id and dedup rules as the SQLite store.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Log>,
}

#[derive(Default)]
struct Log {
    rows: BTreeMap<MessageId, Message>,
    offsets: HashSet<String>,
    last_id: MessageId,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.rows.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn append(&self, content: &str, client_offset: &str, username: &str) -> Result<MessageId, StoreError> {
        let mut log = self.inner.write().await;
        if !log.offsets.insert(client_offset.to_string()) {
            return Err(StoreError::DuplicateKey(client_offset.to_string()));
        }
        log.last_id += 1;
        let id = log.last_id;
        log.rows.insert(
            id,
            Message {
                id,
                client_offset: client_offset.to_string(),
                username: username.to_string(),
                content: content.to_string(),
            },
        );
        Ok(id)
    }

    async fn delete_by_id(&self, id: MessageId) -> Result<bool, StoreError> {
        let mut log = self.inner.write().await;
        match log.rows.remove(&id) {
            // The unique key goes away with the row, as it does in SQLite.
            Some(message) => {
                log.offsets.remove(&message.client_offset);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn find_by_id(&self, id: MessageId) -> Result<Option<Message>, StoreError> {
        Ok(self.inner.read().await.rows.get(&id).cloned())
    }

    fn scan_from(&self, offset: MessageId) -> BoxStream<'_, Result<Message, StoreError>> {
        stream::once(async move {
            let log = self.inner.read().await;
            let snapshot: Vec<_> = log
                .rows
                .range(offset.saturating_add(1)..)
                .map(|(_, m)| Ok(m.clone()))
                .collect();
            stream::iter(snapshot)
        })
        .flatten()
        .boxed()
    }
}
