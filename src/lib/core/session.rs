use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::mpsc;

use crate::core::{BroadcastRelay, MessageId, ServerFrame, StoreError};
use crate::storage::MessageStore;

#[cfg(feature = "tracing")]
use tracing::{debug, info, instrument, warn};

/// Settings every session shares.
#[derive(Debug, Clone)]
pub struct ChatConfig {
    /// The one code that authorizes deletes.
    pub delete_code: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostOutcome {
    Posted(MessageId),
    /// The client offset was already stored: an earlier attempt went through.
    Duplicate,
    /// Storage failed. The client is expected to retry with the same offset.
    Failed,
}

impl PostOutcome {
    /// Posted and duplicate both tell the sender to stop retrying.
    pub fn should_ack(&self) -> bool {
        matches!(self, PostOutcome::Posted(_) | PostOutcome::Duplicate)
    }
}

/// None of these are reported back to the sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    NotFound,
    Unauthorized,
    Failed,
}

/// Dispatches one connection's requests to the store and the relay.
///
/// The transport owns the socket; this type only sees a store, the relay and the
/// outbox of the session it is serving.
pub struct SessionHandler<S: MessageStore + 'static> {
    store: Arc<S>,
    relay: BroadcastRelay,
    config: Arc<ChatConfig>,
}

impl<S: MessageStore + 'static> Clone for SessionHandler<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            relay: self.relay.clone(),
            config: self.config.clone(),
        }
    }
}

impl<S: MessageStore + 'static> SessionHandler<S> {
    pub fn new(store: Arc<S>, relay: BroadcastRelay, config: ChatConfig) -> Self {
        Self {
            store,
            relay,
            config: Arc::new(config),
        }
    }

    pub fn relay(&self) -> &BroadcastRelay {
        &self.relay
    }

    /// Sends every stored message after `server_offset` to this session only, oldest first.
    ///
    /// A storage error ends the backfill early. Returns the id of the last message handed
    /// to the outbox, if any.
    pub async fn replay(&self, server_offset: MessageId, outbox: &mpsc::Sender<ServerFrame>) -> Option<MessageId> {
        self.replay_skipping(server_offset, outbox, |_| false).await
    }

    /// Like [`replay`](Self::replay), but rows for which `skip` holds are passed over without
    /// being sent. Returns the id of the last row covered, sent or skipped.
    #[cfg_attr(feature = "tracing", instrument(skip(self, outbox, skip)))]
    pub async fn replay_skipping(
        &self,
        server_offset: MessageId,
        outbox: &mpsc::Sender<ServerFrame>,
        skip: impl Fn(MessageId) -> bool,
    ) -> Option<MessageId> {
        let mut last = None;
        let mut rows = self.store.scan_from(server_offset);
        while let Some(row) = rows.next().await {
            match row {
                Ok(message) => {
                    let id = message.id;
                    if !skip(id) && outbox.send(ServerFrame::from(message)).await.is_err() {
                        break;
                    }
                    last = Some(id);
                }
                Err(_e) => {
                    #[cfg(feature = "tracing")]
                    warn!(error = %_e, "Recovery scan failed, backfill abandoned");
                    break;
                }
            }
        }
        #[cfg(feature = "tracing")]
        debug!(last_id = ?last, "Replay finished");
        last
    }

    /// Appends the message and, when it is new, broadcasts it to everyone.
    #[cfg_attr(feature = "tracing", instrument(skip(self, content)))]
    pub async fn post(&self, content: &str, client_offset: &str, username: &str) -> PostOutcome {
        match self.store.append(content, client_offset, username).await {
            Ok(id) => {
                if let Err(_e) = self.relay.message_posted(id, content, username).await {
                    #[cfg(feature = "tracing")]
                    warn!(id, error = %_e, "Failed to broadcast posted message");
                }
                PostOutcome::Posted(id)
            }
            Err(StoreError::DuplicateKey(_)) => {
                #[cfg(feature = "tracing")]
                debug!("Duplicate post, acknowledging without broadcast");
                PostOutcome::Duplicate
            }
            Err(_e) => {
                #[cfg(feature = "tracing")]
                warn!(error = %_e, "Failed to store message");
                PostOutcome::Failed
            }
        }
    }

    /// Deletes the message if it exists and `delete_code` matches, then broadcasts the id.
    #[cfg_attr(feature = "tracing", instrument(skip(self, delete_code)))]
    pub async fn delete(&self, id: MessageId, delete_code: &str) -> DeleteOutcome {
        match self.store.find_by_id(id).await {
            Ok(Some(_)) => {}
            Ok(None) => return DeleteOutcome::NotFound,
            Err(_e) => {
                #[cfg(feature = "tracing")]
                warn!(error = %_e, "Failed to look up message");
                return DeleteOutcome::Failed;
            }
        }

        if delete_code != self.config.delete_code {
            #[cfg(feature = "tracing")]
            info!("Wrong delete code");
            return DeleteOutcome::Unauthorized;
        }

        match self.store.delete_by_id(id).await {
            Ok(true) => {
                #[cfg(feature = "tracing")]
                info!("Message deleted");
                if let Err(_e) = self.relay.message_deleted(id).await {
                    #[cfg(feature = "tracing")]
                    warn!(error = %_e, "Failed to broadcast deletion");
                }
                DeleteOutcome::Deleted
            }
            // Someone else removed it between the lookup and now.
            Ok(false) => DeleteOutcome::NotFound,
            Err(_e) => {
                #[cfg(feature = "tracing")]
                warn!(error = %_e, "Failed to delete message");
                DeleteOutcome::Failed
            }
        }
    }
}
