pub mod bridge;
pub mod telegram;

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::Engine;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Opaque message id assigned by the source platform
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub String);

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Content kind of an inbound message. Anything the relay has no dedicated
/// strategy for is `Standard` and keeps its wire name for logging.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum MessageKind {
    Standard(String),
    Location,
    PollCreation,
    ContactCard,
}

impl From<String> for MessageKind {
    fn from(kind: String) -> Self {
        match kind.as_str() {
            "location" => MessageKind::Location,
            "poll_creation" => MessageKind::PollCreation,
            "vcard" => MessageKind::ContactCard,
            _ => MessageKind::Standard(kind),
        }
    }
}

impl From<MessageKind> for String {
    fn from(kind: MessageKind) -> Self {
        match kind {
            MessageKind::Standard(kind) => kind,
            MessageKind::Location => "location".to_string(),
            MessageKind::PollCreation => "poll_creation".to_string(),
            MessageKind::ContactCard => "vcard".to_string(),
        }
    }
}

impl Default for MessageKind {
    fn default() -> Self {
        MessageKind::Standard("chat".to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PollSpec {
    pub name: String,
    pub options: Vec<String>,
    #[serde(default)]
    pub allow_multiple_answers: Option<bool>,
}

/// Reference to the message an inbound message replies to
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuotedRef {
    pub id: MessageId,
    pub timestamp: i64,
}

/// Snapshot of a message as the source platform reported it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct InboundMessage {
    pub id: MessageId,
    pub timestamp: i64,
    #[serde(rename = "type", default)]
    pub kind: MessageKind,
    #[serde(default)]
    pub from_me: bool,
    #[serde(default)]
    pub to: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub has_media: bool,
    #[serde(default)]
    pub location: Option<Location>,
    #[serde(default)]
    pub poll: Option<PollSpec>,
    #[serde(default)]
    pub quoted: Option<QuotedRef>,
}

/// Downloaded media, base64 encoded as the bridge delivers it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Media {
    pub mimetype: String,
    pub data: String,
    #[serde(default)]
    pub filename: Option<String>,
}

impl Media {
    pub fn bytes(&self) -> Result<Vec<u8>> {
        base64::engine::general_purpose::STANDARD
            .decode(&self.data)
            .context("Media payload is not valid base64")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contact {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatSummary {
    pub id: String,
    pub name: String,
}

/// Handle of a message this relay sent on the source platform
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SentMessage {
    pub id: MessageId,
    pub chat: String,
}

/// Content sent to a source-platform chat
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Outgoing {
    Text { body: String, link_preview: bool },
    Media { media: Media, caption: String },
    Poll {
        name: String,
        options: Vec<String>,
        allow_multiple_answers: bool,
    },
    Contact { contact: Contact },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SendOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quoted_message_id: Option<MessageId>,
}

/// Events a source-platform connection emits
#[derive(Debug, Clone, PartialEq)]
pub enum SourceEvent {
    Qr(String),
    Ready,
    Disconnected(String),
    MessageCreate(InboundMessage),
    MessageRevoked { before: Option<InboundMessage> },
}

/// A live connection to the source platform for one user
#[async_trait]
pub trait SourceConnection: Send + Sync {
    /// Start the underlying client; resolves once it is running
    async fn initialize(&self) -> Result<()>;

    async fn send_message(
        &self,
        chat: &str,
        content: Outgoing,
        options: SendOptions,
    ) -> Result<SentMessage>;

    /// Delete a message this connection sent, for everyone when `everyone`
    async fn delete_message(&self, message: &SentMessage, everyone: bool) -> Result<()>;

    async fn download_media(&self, message: &InboundMessage) -> Result<Media>;

    async fn get_chats(&self) -> Result<Vec<ChatSummary>>;

    async fn get_contact_by_id(&self, id: &str) -> Result<Contact>;

    /// OS process backing this connection, if known
    fn process_id(&self) -> Option<u32>;

    /// Close the client. Already-closed connections are not an error.
    async fn destroy(&self) -> Result<()>;
}

/// Creates a fresh connection together with its event stream
#[async_trait]
pub trait SourceConnector: Send + Sync {
    async fn connect(
        &self,
        user_id: &str,
    ) -> Result<(Arc<dyn SourceConnection>, mpsc::UnboundedReceiver<SourceEvent>)>;
}

/// One message sent through the secondary-platform bot
#[derive(Debug, Clone, PartialEq)]
pub enum SecondaryPayload {
    Text { text: String },
    Photo { data: Vec<u8>, caption: String },
    Video { data: Vec<u8>, caption: String },
    Poll {
        question: String,
        options: Vec<String>,
        allow_multiple_answers: bool,
    },
}

#[async_trait]
pub trait SecondaryBot: Send + Sync {
    /// Send to a chat and return the platform message id
    async fn send(&self, chat_id: i64, payload: &SecondaryPayload) -> Result<i32>;

    async fn delete_message(&self, chat_id: i64, message_id: i32) -> Result<()>;

    /// Stop any background update processing
    async fn shutdown(&self);
}

/// Bot credentials handed to a user from the configured pool
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BotAssignment {
    pub bot_name: String,
    pub bot_token: String,
}

#[async_trait]
pub trait BotLauncher: Send + Sync {
    async fn launch(&self, user_id: &str, assignment: &BotAssignment)
        -> Result<Arc<dyn SecondaryBot>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inbound_message_from_bridge_json() {
        let msg: InboundMessage = serde_json::from_value(serde_json::json!({
            "id": "true_123@c.us_ABC",
            "timestamp": 1700000000,
            "type": "poll_creation",
            "fromMe": true,
            "to": "main@g.us",
            "body": "",
            "poll": { "name": "Lunch?", "options": ["Pizza", "Sushi"] },
            "quoted": { "id": "true_123@c.us_XYZ", "timestamp": 1690000000 }
        }))
        .unwrap();
        assert_eq!(msg.kind, MessageKind::PollCreation);
        assert!(msg.from_me);
        assert!(!msg.has_media);
        let poll = msg.poll.unwrap();
        assert_eq!(poll.options, vec!["Pizza", "Sushi"]);
        assert_eq!(poll.allow_multiple_answers, None);
        assert_eq!(msg.quoted.unwrap().id, MessageId("true_123@c.us_XYZ".into()));
    }

    #[test]
    fn test_unknown_kind_is_standard() {
        let kind: MessageKind = serde_json::from_value(serde_json::json!("sticker")).unwrap();
        assert_eq!(kind, MessageKind::Standard("sticker".into()));
        assert_eq!(serde_json::to_value(&kind).unwrap(), "sticker");
        assert_eq!(
            serde_json::to_value(MessageKind::ContactCard).unwrap(),
            "vcard"
        );
    }

    #[test]
    fn test_media_bytes_decode() {
        let media = Media {
            mimetype: "image/jpeg".into(),
            data: "aGVsbG8=".into(),
            filename: None,
        };
        assert_eq!(media.bytes().unwrap(), b"hello");

        let broken = Media {
            data: "not base64!".into(),
            ..media
        };
        assert!(broken.bytes().is_err());
    }

    #[test]
    fn test_outgoing_wire_shape() {
        let value = serde_json::to_value(Outgoing::Text {
            body: "hi".into(),
            link_preview: false,
        })
        .unwrap();
        assert_eq!(
            value,
            serde_json::json!({ "kind": "text", "body": "hi", "link_preview": false })
        );
    }
}
