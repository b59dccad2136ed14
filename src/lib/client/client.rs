use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message as WsMessage, WebSocketStream};
use uuid::Uuid;

use crate::core::{ClientFrame, MessageId, ServerFrame};

type WsConnection = WebSocketStream<tokio_tungstenite::MaybeTlsStream<TcpStream>>;

#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// Socket endpoint, e.g. `ws://127.0.0.1:3000/ws`.
    pub url: String,
    pub reconnect_interval: Duration,
    pub max_retries: u32,
}

/// Connection to a chat relay.
///
/// Remembers the last message id it saw and the session it was given, and presents
/// both on [`reconnect`](Self::reconnect) so the server can resume or backfill.
pub struct ChatClient {
    config: ClientConfig,
    connection: WsConnection,
    server_offset: Option<MessageId>,
    session_id: Option<Uuid>,
    next_ack_id: u64,
}

impl ChatClient {
    pub async fn connect(config: ClientConfig) -> Result<Self> {
        Self::connect_from(config, None, None).await
    }

    /// Connects as a fresh session that has already seen everything up to `server_offset`.
    pub async fn connect_from(
        config: ClientConfig,
        server_offset: Option<MessageId>,
        session_id: Option<Uuid>,
    ) -> Result<Self> {
        let url = handshake_url(&config.url, server_offset, session_id);
        let (connection, _) = connect_async(url.as_str())
            .await
            .context("Failed to connect to WebSocket server")?;
        Ok(Self {
            config,
            connection,
            server_offset,
            session_id,
            next_ack_id: 0,
        })
    }

    pub async fn connect_with_retry(config: ClientConfig) -> Result<Self> {
        let mut retries = config.max_retries;
        loop {
            match Self::connect(config.clone()).await {
                Ok(client) => return Ok(client),
                Err(e) if retries == 0 => return Err(e),
                Err(_) => {
                    tokio::time::sleep(config.reconnect_interval).await;
                    retries -= 1;
                }
            }
        }
    }

    /// Drops the current socket and connects again with the remembered offset and session.
    pub async fn reconnect(&mut self) -> Result<()> {
        let _ = self.connection.close(None).await;
        let fresh = Self::connect_from(self.config.clone(), self.server_offset, self.session_id).await?;
        self.connection = fresh.connection;
        Ok(())
    }

    /// Posts with a newly generated client offset, which is returned for retries.
    pub async fn post(&mut self, content: &str, username: &str) -> Result<(String, u64)> {
        let client_offset = Uuid::new_v4().to_string();
        let ack_id = self.post_with_offset(content, &client_offset, username).await?;
        Ok((client_offset, ack_id))
    }

    /// Posts under a caller-chosen client offset. Returns the ack id to wait for.
    pub async fn post_with_offset(&mut self, content: &str, client_offset: &str, username: &str) -> Result<u64> {
        self.next_ack_id += 1;
        let ack_id = self.next_ack_id;
        self.send(&ClientFrame::PostMessage {
            content: content.to_string(),
            client_offset: client_offset.to_string(),
            username: username.to_string(),
            ack_id: Some(ack_id),
        })
        .await
        .context("Failed to send post-message")?;
        Ok(ack_id)
    }

    pub async fn delete(&mut self, id: MessageId, delete_code: &str) -> Result<()> {
        self.send(&ClientFrame::DeleteMessage {
            id,
            delete_code: delete_code.to_string(),
        })
        .await
        .context("Failed to send delete-message")
    }

    /// Next frame from the server. `None` once the connection is closed.
    pub async fn next_event(&mut self) -> Option<Result<ServerFrame>> {
        loop {
            match self.connection.next().await {
                Some(Ok(WsMessage::Text(text))) => {
                    return Some(match serde_json::from_str::<ServerFrame>(&text) {
                        Ok(frame) => {
                            self.observe(&frame);
                            Ok(frame)
                        }
                        Err(e) => Err(anyhow::anyhow!("Failed to parse frame: {}", e)),
                    });
                }
                Some(Ok(WsMessage::Close(_))) | None => return None,
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Some(Err(e.into())),
            }
        }
    }

    pub fn server_offset(&self) -> Option<MessageId> {
        self.server_offset
    }

    pub fn session_id(&self) -> Option<Uuid> {
        self.session_id
    }

    pub async fn disconnect(mut self) -> Result<()> {
        self.connection.close(None).await.context("Failed to close connection")
    }

    async fn send(&mut self, frame: &ClientFrame) -> Result<()> {
        let text = serde_json::to_string(frame)?;
        self.connection.send(WsMessage::Text(text)).await?;
        Ok(())
    }

    fn observe(&mut self, frame: &ServerFrame) {
        match frame {
            ServerFrame::Session { session_id, .. } => self.session_id = Some(*session_id),
            ServerFrame::MessagePosted { id, .. } => {
                self.server_offset = Some(self.server_offset.map_or(*id, |seen| seen.max(*id)));
            }
            _ => {}
        }
    }
}

fn handshake_url(base: &str, server_offset: Option<MessageId>, session_id: Option<Uuid>) -> String {
    let mut params = Vec::new();
    if let Some(offset) = server_offset {
        params.push(format!("serverOffset={offset}"));
    }
    if let Some(id) = session_id {
        params.push(format!("sessionId={id}"));
    }
    if params.is_empty() {
        return base.to_string();
    }
    let separator = if base.contains('?') { '&' } else { '?' };
    format!("{base}{separator}{}", params.join("&"))
}
