//! Realtime chat relay.
//!
//! Clients talk to a [`WsTransport`](adapters::WsTransport) over a WebSocket. Posts are
//! appended to a [`MessageStore`](storage::MessageStore) under a client-chosen offset, so
//! a retried post is stored once, and fanned out to every session through a
//! [`FanoutBus`](transport::FanoutBus). A reconnecting client either resumes its parked
//! session or gets every message after the last id it saw replayed from the store.

pub mod adapters;
pub mod client;
pub mod core;
pub mod settings;
pub mod storage;
pub mod transport;

#[cfg(test)]
mod tests;
