//! Chat message model and realtime frame codec
//!
//! Frames on the realtime channel and rows from the history endpoint share one
//! JSON shape; the text body travels under the `message` field.

use crate::error::{Error, Result};
use chrono::{SecondsFormat, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A chat message between the signed-in user and a peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub sender_id: String,
    pub receiver_id: String,
    #[serde(rename = "message")]
    pub content: String,
    pub timestamp: String, // Assigned by whoever created the message, never rewritten
    #[serde(default)]
    pub read: bool,
}

/// Identity used for deduplication: (sender, content, timestamp)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MessageKey {
    pub sender_id: String,
    pub content: String,
    pub timestamp: String,
}

impl Message {
    /// Build an outgoing message stamped with the current time
    pub fn outgoing(sender_id: &str, receiver_id: &str, content: &str) -> Self {
        Self {
            sender_id: sender_id.to_string(),
            receiver_id: receiver_id.to_string(),
            content: content.to_string(),
            timestamp: now_timestamp(),
            read: false,
        }
    }

    pub fn key(&self) -> MessageKey {
        MessageKey {
            sender_id: self.sender_id.clone(),
            content: self.content.clone(),
            timestamp: self.timestamp.clone(),
        }
    }
}

/// Current UTC time in the same shape a browser's `Date.toJSON()` produces
pub fn now_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Decode one inbound realtime frame
pub fn parse_frame(raw: &str) -> Result<Message> {
    serde_json::from_str(raw).map_err(|e| Error::Parse(format!("chat frame: {}", e)))
}

/// Encode a message for the realtime channel
pub fn encode_frame(message: &Message) -> Result<String> {
    Ok(serde_json::to_string(message)?)
}

/// Peer identities are embedded as a URL path segment
static CONVERSATION_KEY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9._@+-]{1,64}$").expect("Invalid conversation key regex"));

/// The peer identity of the selected conversation
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConversationKey(String);

impl ConversationKey {
    pub fn parse(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        if !CONVERSATION_KEY.is_match(trimmed) {
            return Err(Error::InvalidConversationKey(raw.to_string()));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
