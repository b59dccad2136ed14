use std::collections::{BTreeSet, HashMap, VecDeque};
use std::time::{Duration, Instant};

use tokio::sync::{broadcast, Mutex};
use uuid::Uuid;

use crate::core::{ChatEvent, MessageId, ServerFrame};

#[cfg(feature = "tracing")]
use tracing::debug;

/// Everything a connection needs to pick up its live feed where it left off.
pub struct SessionState {
    pub live: broadcast::Receiver<ChatEvent>,
    /// Event frames pulled off the bus that never reached the socket, oldest first.
    pub pending: VecDeque<ServerFrame>,
    /// Every posted id up to here was handed over or covered by a store scan.
    pub seen_through: MessageId,
    /// Posted ids above `seen_through` handed over ahead of a smaller one.
    seen_above: BTreeSet<MessageId>,
    /// A store scan was cut short by the socket going away and must be rerun.
    pub needs_catch_up: bool,
}

impl SessionState {
    pub fn new(live: broadcast::Receiver<ChatEvent>, server_offset: MessageId) -> Self {
        Self {
            live,
            pending: VecDeque::new(),
            seen_through: server_offset,
            seen_above: BTreeSet::new(),
            needs_catch_up: false,
        }
    }

    /// Records a posted id handed to the outbox. Publish order is not id order.
    pub fn mark_delivered(&mut self, id: MessageId) {
        if id <= self.seen_through {
            return;
        }
        self.seen_above.insert(id);
        self.advance();
    }

    /// Records a store scan that started at `seen_through` and covered everything up to `last_id`.
    pub fn scanned_through(&mut self, last_id: MessageId) {
        if last_id > self.seen_through {
            self.seen_through = last_id;
            self.seen_above = self.seen_above.split_off(&(last_id + 1));
            self.advance();
        }
    }

    /// Ids above `seen_through` that a catch-up scan must not send again.
    pub fn delivered_above(&self) -> BTreeSet<MessageId> {
        self.seen_above.clone()
    }

    /// Whether a live event duplicates a message this session already got.
    pub fn already_delivered(&self, event: &ChatEvent) -> bool {
        matches!(event, ChatEvent::MessagePosted { id, .. }
            if *id <= self.seen_through || self.seen_above.contains(id))
    }

    /// Puts frames the socket never wrote ahead of `pending`. Acks and greetings belong to the
    /// dead connection and are dropped.
    pub fn stash_unsent(&mut self, unsent: VecDeque<ServerFrame>) {
        for frame in unsent.into_iter().rev() {
            if matches!(frame, ServerFrame::MessagePosted { .. } | ServerFrame::MessageDeleted { .. }) {
                self.pending.push_front(frame);
            }
        }
    }

    fn advance(&mut self) {
        while self.seen_above.remove(&(self.seen_through + 1)) {
            self.seen_through += 1;
        }
    }
}

struct Parked {
    state: SessionState,
    parked_at: Instant,
}

/// Disconnected sessions waiting to be resumed.
///
/// A parked subscription stays attached to the bus, so events published while the
/// client is away queue up in it until the window closes.
pub struct SessionRegistry {
    parked: Mutex<HashMap<Uuid, Parked>>,
    window: Duration,
}

impl SessionRegistry {
    pub fn new(window: Duration) -> Self {
        Self {
            parked: Mutex::new(HashMap::new()),
            window,
        }
    }

    pub async fn park(&self, session_id: Uuid, state: SessionState) {
        let mut parked = self.parked.lock().await;
        let window = self.window;
        parked.retain(|_, p| p.parked_at.elapsed() < window);
        if window.is_zero() {
            return;
        }
        parked.insert(
            session_id,
            Parked {
                state,
                parked_at: Instant::now(),
            },
        );
        #[cfg(feature = "tracing")]
        debug!(%session_id, parked = parked.len(), "Session parked");
    }

    /// Hands back the parked state if the session is known and still inside the window.
    pub async fn resume(&self, session_id: Uuid) -> Option<SessionState> {
        let parked = self.parked.lock().await.remove(&session_id)?;
        (parked.parked_at.elapsed() < self.window).then_some(parked.state)
    }

    pub async fn len(&self) -> usize {
        self.parked.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
