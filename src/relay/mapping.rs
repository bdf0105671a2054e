use std::collections::HashMap;

use serde::Serialize;
use tracing::{debug, warn};

use crate::platform::{InboundMessage, MessageId, SendOptions, SentMessage};

/// A copy forwarded to the secondary platform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SecondaryRecord {
    pub chat_id: i64,
    pub message_id: i32,
}

/// Forwarded copies of each source message, per destination platform.
///
/// Keyed by the source message id. A key is present only while at least one
/// copy is still outstanding.
#[derive(Debug, Default)]
pub struct MappingStore {
    source: HashMap<MessageId, Vec<SentMessage>>,
    secondary: HashMap<MessageId, Vec<SecondaryRecord>>,
}

impl MappingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_source(&mut self, key: &MessageId, sent: Vec<SentMessage>) {
        if sent.is_empty() {
            return;
        }
        self.source.entry(key.clone()).or_default().extend(sent);
    }

    pub fn record_secondary(&mut self, key: &MessageId, sent: Vec<SecondaryRecord>) {
        if sent.is_empty() {
            return;
        }
        self.secondary.entry(key.clone()).or_default().extend(sent);
    }

    #[cfg(test)]
    pub fn source_copies(&self, key: &MessageId) -> Option<&[SentMessage]> {
        self.source.get(key).map(Vec::as_slice)
    }

    #[cfg(test)]
    pub fn secondary_copies(&self, key: &MessageId) -> Option<&[SecondaryRecord]> {
        self.secondary.get(key).map(Vec::as_slice)
    }

    /// Remove and return every source copy of `key`
    pub fn take_source(&mut self, key: &MessageId) -> Vec<SentMessage> {
        self.source.remove(key).unwrap_or_default()
    }

    pub fn take_secondary(&mut self, key: &MessageId) -> Vec<SecondaryRecord> {
        self.secondary.remove(key).unwrap_or_default()
    }

    /// Put back copies that are still outstanding after a partial deletion
    pub fn restore_source(&mut self, key: &MessageId, remaining: Vec<SentMessage>) {
        self.record_source(key, remaining);
    }

    pub fn restore_secondary(&mut self, key: &MessageId, remaining: Vec<SecondaryRecord>) {
        self.record_secondary(key, remaining);
    }

    pub fn source_len(&self) -> usize {
        self.source.len()
    }

    pub fn secondary_len(&self) -> usize {
        self.secondary.len()
    }

    /// Reply options for sending a copy of `message` into `target_chat`.
    ///
    /// When `message` quotes an earlier message that was forwarded into the
    /// same chat, the reply points at that copy. Otherwise no reference.
    pub fn resolve_quote(&self, message: &InboundMessage, target_chat: &str) -> SendOptions {
        let Some(quoted) = &message.quoted else {
            return SendOptions::default();
        };

        let Some(copies) = self.source.get(&quoted.id) else {
            warn!(
                "No forwarded copies of quoted message {} (timestamp {})",
                quoted.id, quoted.timestamp
            );
            return SendOptions::default();
        };

        match copies.iter().find(|copy| copy.chat == target_chat) {
            Some(copy) => {
                debug!("Quoted message {} resolved in {}", quoted.id, target_chat);
                SendOptions {
                    quoted_message_id: Some(copy.id.clone()),
                }
            }
            None => {
                warn!(
                    "Quoted message {} was forwarded, but not to {}",
                    quoted.id, target_chat
                );
                SendOptions::default()
            }
        }
    }
}
