use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Store-assigned id. Doubles as the offset clients hand back on reconnect.
pub type MessageId = i64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub client_offset: String,
    pub username: String,
    pub content: String,
}

/// What the relay fans out to every live session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ChatEvent {
    MessagePosted {
        content: String,
        id: MessageId,
        username: String,
    },
    MessageDeleted { id: MessageId },
}

/// Frames a client sends over the socket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientFrame {
    PostMessage {
        content: String,
        client_offset: String,
        username: String,
        /// Correlates the `ack` frame. Omit it and no ack is sent.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ack_id: Option<u64>,
    },
    DeleteMessage { id: MessageId, delete_code: String },
}

/// Frames the server sends to a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerFrame {
    Session { session_id: Uuid, recovered: bool },
    MessagePosted {
        content: String,
        id: MessageId,
        username: String,
    },
    MessageDeleted { id: MessageId },
    Ack { ack_id: u64 },
}

impl From<ChatEvent> for ServerFrame {
    fn from(event: ChatEvent) -> Self {
        match event {
            ChatEvent::MessagePosted { content, id, username } => {
                ServerFrame::MessagePosted { content, id, username }
            }
            ChatEvent::MessageDeleted { id } => ServerFrame::MessageDeleted { id },
        }
    }
}

impl From<Message> for ServerFrame {
    fn from(message: Message) -> Self {
        ServerFrame::MessagePosted {
            content: message.content,
            id: message.id,
            username: message.username,
        }
    }
}
