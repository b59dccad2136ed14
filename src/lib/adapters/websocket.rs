use axum::{
    extract::{
        ws::{Message as AxumMessage, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    response::{Html, Response},
    routing::get,
    Router,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{broadcast::error::RecvError, mpsc, oneshot};
use uuid::Uuid;

use crate::adapters::{SessionRegistry, SessionState};
use crate::core::{BroadcastRelay, ChatConfig, ChatEvent, ClientFrame, MessageId, RelayError, ServerFrame, SessionHandler};
use crate::storage::MessageStore;
use crate::transport::FanoutBus;

#[cfg(feature = "tracing")]
use tracing::{debug, info, instrument, warn};

#[derive(Clone, Debug)]
pub struct WsConfig {
    /// Outbound frames buffered per connection.
    pub channel_capacity: usize,
    /// How long a closed session can be resumed. Zero disables recovery.
    pub recovery_window: Duration,
}

impl Default for WsConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 100,
            recovery_window: Duration::from_secs(120),
        }
    }
}

/// Query string of the `/ws` upgrade request.
#[derive(Debug, Default, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Handshake {
    /// Last message id the client has seen.
    pub server_offset: Option<MessageId>,
    /// Session to resume.
    pub session_id: Option<Uuid>,
}

struct AppState<S: MessageStore + 'static> {
    handler: SessionHandler<S>,
    sessions: SessionRegistry,
    config: WsConfig,
}

pub struct WsTransport<S: MessageStore + 'static> {
    state: Arc<AppState<S>>,
}

impl<S: MessageStore + 'static> WsTransport<S> {
    pub fn new(store: Arc<S>, bus: Arc<dyn FanoutBus>, chat: ChatConfig, config: WsConfig) -> Self {
        let handler = SessionHandler::new(store, BroadcastRelay::new(bus), chat);
        Self {
            state: Arc::new(AppState {
                sessions: SessionRegistry::new(config.recovery_window),
                handler,
                config,
            }),
        }
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/", get(index))
            .route("/ws", get(Self::handle_ws))
            .with_state(self.state.clone())
    }

    pub async fn serve_with_shutdown(
        &self,
        listener: TcpListener,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> Result<(), RelayError> {
        #[cfg(feature = "tracing")]
        {
            if let Ok(addr) = listener.local_addr() {
                info!(addr = %addr, "WebSocket server started");
            }
        }
        axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown)
            .await?;
        Ok(())
    }

    async fn handle_ws(
        ws: WebSocketUpgrade,
        Query(handshake): Query<Handshake>,
        State(state): State<Arc<AppState<S>>>,
    ) -> Response {
        ws.on_upgrade(move |socket| Self::handle_connection(socket, state, handshake))
    }

    #[cfg_attr(feature = "tracing", instrument(skip(socket, state)))]
    async fn handle_connection(socket: WebSocket, state: Arc<AppState<S>>, handshake: Handshake) {
        let (mut sender, mut receiver) = socket.split();
        let (outbox, mut outbox_rx) = mpsc::channel::<ServerFrame>(state.config.channel_capacity);

        let resumed = match handshake.session_id {
            Some(id) => state.sessions.resume(id).await.map(|parked| (id, parked)),
            None => None,
        };
        let recovered = resumed.is_some();
        let (session_id, session, replay_from) = match resumed {
            Some((id, parked)) => (id, parked, None),
            None => {
                let offset = handshake.server_offset.unwrap_or(0);
                // Subscribe before scanning so nothing committed in between is missed.
                let live = state.handler.relay().subscribe();
                (Uuid::new_v4(), SessionState::new(live, offset), Some(offset))
            }
        };

        #[cfg(feature = "tracing")]
        info!(%session_id, recovered, "New WebSocket connection established");

        let (writer_stop_tx, mut writer_stop) = oneshot::channel::<()>();
        let writer = tokio::spawn(async move {
            let mut unsent = VecDeque::new();
            loop {
                let frame = tokio::select! {
                    biased;
                    _ = &mut writer_stop => break,
                    frame = outbox_rx.recv() => match frame {
                        Some(frame) => frame,
                        None => break,
                    },
                };
                let text = match serde_json::to_string(&frame) {
                    Ok(text) => text,
                    Err(_e) => {
                        #[cfg(feature = "tracing")]
                        warn!(error = %_e, "Failed to serialize frame");
                        continue;
                    }
                };
                let written = tokio::select! {
                    biased;
                    result = sender.send(AxumMessage::Text(text.into())) => result.is_ok(),
                    _ = &mut writer_stop => false,
                };
                if !written {
                    unsent.push_back(frame);
                    break;
                }
            }
            outbox_rx.close();
            while let Ok(frame) = outbox_rx.try_recv() {
                unsent.push_back(frame);
            }
            // The sink goes back too: dropping it ends the socket.
            (unsent, sender)
        });

        let _ = outbox.send(ServerFrame::Session { session_id, recovered }).await;

        let (stop_tx, stop_rx) = oneshot::channel();
        let delivery = tokio::spawn(Self::deliver(
            state.handler.clone(),
            session,
            replay_from,
            outbox.clone(),
            stop_rx,
        ));

        while let Some(msg) = receiver.next().await {
            match msg {
                Ok(AxumMessage::Text(text)) => {
                    #[cfg(feature = "tracing")]
                    debug!(frame = %text.as_str(), "Received WebSocket message");
                    match serde_json::from_str::<ClientFrame>(text.as_str()) {
                        Ok(frame) => Self::dispatch(&state.handler, frame, &outbox).await,
                        Err(_e) => {
                            #[cfg(feature = "tracing")]
                            warn!(error = %_e, "Failed to deserialize WebSocket message");
                        }
                    }
                }
                Ok(AxumMessage::Close(_)) => {
                    #[cfg(feature = "tracing")]
                    info!(%session_id, "WebSocket connection closed");
                    break;
                }
                Ok(_) => continue,
                Err(_e) => {
                    #[cfg(feature = "tracing")]
                    warn!(error = %_e, "WebSocket message error");
                    break;
                }
            }
        }

        // Writer first: anything it still holds goes back into the session, not onto a dying socket.
        let _ = writer_stop_tx.send(());
        let (unsent, sink) = match writer.await {
            Ok((unsent, sink)) => (unsent, Some(sink)),
            Err(_e) => {
                #[cfg(feature = "tracing")]
                warn!(error = %_e, "Writer task failed");
                (VecDeque::new(), None)
            }
        };
        let _ = stop_tx.send(());
        match delivery.await {
            Ok(mut session) => {
                #[cfg(feature = "tracing")]
                debug!(%session_id, unsent = unsent.len(), pending = session.pending.len(), "Parking session");
                session.stash_unsent(unsent);
                state.sessions.park(session_id, session).await;
            }
            Err(_e) => {
                #[cfg(feature = "tracing")]
                warn!(error = %_e, "Delivery task failed");
            }
        }
        drop(sink);
    }

    async fn dispatch(handler: &SessionHandler<S>, frame: ClientFrame, outbox: &mpsc::Sender<ServerFrame>) {
        match frame {
            ClientFrame::PostMessage {
                content,
                client_offset,
                username,
                ack_id,
            } => {
                let outcome = handler.post(&content, &client_offset, &username).await;
                if let (true, Some(ack_id)) = (outcome.should_ack(), ack_id) {
                    let _ = outbox.send(ServerFrame::Ack { ack_id }).await;
                }
            }
            ClientFrame::DeleteMessage { id, delete_code } => {
                let _outcome = handler.delete(id, &delete_code).await;
                #[cfg(feature = "tracing")]
                debug!(id, outcome = ?_outcome, "Handled delete request");
            }
        }
    }

    /// Feeds one connection: held-back frames first, then a store scan when the session is
    /// fresh or an earlier scan was cut short, then the live bus.
    ///
    /// Returns the session state once told to stop or once the outbox closes, so the
    /// connection can be parked.
    async fn deliver(
        handler: SessionHandler<S>,
        mut session: SessionState,
        replay_from: Option<MessageId>,
        outbox: mpsc::Sender<ServerFrame>,
        mut stop: oneshot::Receiver<()>,
    ) -> SessionState {
        while let Some(frame) = session.pending.pop_front() {
            if let Err(mpsc::error::SendError(frame)) = outbox.send(frame).await {
                session.pending.push_front(frame);
                return session;
            }
        }

        let scan_from = match replay_from {
            Some(offset) => Some(offset),
            None if session.needs_catch_up => Some(session.seen_through),
            None => None,
        };
        if let Some(offset) = scan_from {
            if !Self::catch_up(&handler, &mut session, offset, &outbox).await {
                return session;
            }
        }

        loop {
            tokio::select! {
                biased;
                _ = &mut stop => return session,
                event = session.live.recv() => match event {
                    Ok(event) => {
                        if session.already_delivered(&event) {
                            continue;
                        }
                        let posted_id = match &event {
                            ChatEvent::MessagePosted { id, .. } => Some(*id),
                            _ => None,
                        };
                        if let Err(mpsc::error::SendError(frame)) = outbox.send(ServerFrame::from(event)).await {
                            session.pending.push_back(frame);
                            return session;
                        }
                        if let Some(id) = posted_id {
                            session.mark_delivered(id);
                        }
                    }
                    Err(RecvError::Lagged(_skipped)) => {
                        #[cfg(feature = "tracing")]
                        warn!(skipped = _skipped, from = session.seen_through, "Subscriber lagged, catching up from store");
                        let from = session.seen_through;
                        if !Self::catch_up(&handler, &mut session, from, &outbox).await {
                            return session;
                        }
                    }
                    Err(RecvError::Closed) => return session,
                }
            }
        }
    }

    /// Scans the store from `offset`, passing over ids this session already got.
    ///
    /// Returns false when the outbox closed mid-scan; the session then rescans on resume.
    async fn catch_up(
        handler: &SessionHandler<S>,
        session: &mut SessionState,
        offset: MessageId,
        outbox: &mpsc::Sender<ServerFrame>,
    ) -> bool {
        let sent_ahead = session.delivered_above();
        let last = handler
            .replay_skipping(offset, outbox, move |id| sent_ahead.contains(&id))
            .await;
        if let Some(last) = last {
            session.scanned_through(last);
        }
        session.needs_catch_up = outbox.is_closed();
        !session.needs_catch_up
    }
}

async fn index() -> Html<&'static str> {
    Html(include_str!("../../../static/index.html"))
}
