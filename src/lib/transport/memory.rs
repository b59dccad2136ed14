use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::core::{ChatEvent, RelayError};

use super::FanoutBus;

#[cfg(feature = "tracing")]
use tracing::trace;

/// In-process bus over a tokio broadcast channel.
///
/// A subscriber that falls more than `capacity` events behind is told how many it
/// missed on its next receive.
pub struct MemoryBus {
    tx: broadcast::Sender<ChatEvent>,
}

impl MemoryBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl FanoutBus for MemoryBus {
    async fn publish(&self, event: ChatEvent) -> Result<(), RelayError> {
        match self.tx.send(event) {
            Ok(_receivers) => {
                #[cfg(feature = "tracing")]
                trace!(receivers = _receivers, "Published event");
            }
            Err(_) => {
                #[cfg(feature = "tracing")]
                trace!("Published event with no subscribers");
            }
        }
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<ChatEvent> {
        self.tx.subscribe()
    }
}
