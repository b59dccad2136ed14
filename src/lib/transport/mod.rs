//! Publish/subscribe plumbing shared by every session of a deployment.
//!
//! A single process uses [`MemoryBus`]. Running several workers means putting a
//! shared broker behind the same trait; nothing above this module changes.

pub mod memory;

pub use memory::MemoryBus;

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::core::{ChatEvent, RelayError};

#[async_trait]
pub trait FanoutBus: Send + Sync {
    /// Delivers `event` to every current subscriber. Having none is not an error.
    async fn publish(&self, event: ChatEvent) -> Result<(), RelayError>;
    /// Subscribers see events published after this call, in publish order.
    fn subscribe(&self) -> broadcast::Receiver<ChatEvent>;
}
