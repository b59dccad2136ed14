use std::sync::Arc;

use tokio::sync::broadcast;

use crate::core::{ChatEvent, MessageId, RelayError};
use crate::transport::FanoutBus;

#[cfg(feature = "tracing")]
use tracing::debug;

/// Pushes posted and deleted messages to every live session through the bus.
///
/// Holds no per-session state. A session that is not subscribed when an event goes
/// out never sees it and has to catch up from the store.
#[derive(Clone)]
pub struct BroadcastRelay {
    bus: Arc<dyn FanoutBus>,
}

impl BroadcastRelay {
    pub fn new(bus: Arc<dyn FanoutBus>) -> Self {
        Self { bus }
    }

    pub async fn message_posted(&self, id: MessageId, content: &str, username: &str) -> Result<(), RelayError> {
        #[cfg(feature = "tracing")]
        debug!(id, "Broadcasting posted message");
        self.bus
            .publish(ChatEvent::MessagePosted {
                content: content.to_string(),
                id,
                username: username.to_string(),
            })
            .await
    }

    pub async fn message_deleted(&self, id: MessageId) -> Result<(), RelayError> {
        #[cfg(feature = "tracing")]
        debug!(id, "Broadcasting deleted message");
        self.bus.publish(ChatEvent::MessageDeleted { id }).await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChatEvent> {
        self.bus.subscribe()
    }
}
