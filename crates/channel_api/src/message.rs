use std::collections::HashMap;
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// An inbound message as delivered by a real-time channel.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
pub struct ChannelMessage {
    pub id: String,                       // Unique ID (UUID or channel-provided)
    pub channel: String,                  // Slack, Telegram, a websocket room, ...
    #[serde(rename = "type")]
    pub message_type: String,             // Type tag listeners subscribe to
    #[serde(default)]
    pub from: Option<Participant>,        // Sender info
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub thread_id: Option<String>,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub metadata: HashMap<String, Value>, // Channel-specific or custom data
}

impl ChannelMessage {
    pub fn new(channel: impl Into<String>, message_type: impl Into<String>, payload: Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            channel: channel.into(),
            message_type: message_type.into(),
            from: None,
            timestamp: Utc::now(),
            thread_id: None,
            payload,
            metadata: HashMap::new(),
        }
    }

    pub fn with_sender(mut self, from: Participant) -> Self {
        self.from = Some(from);
        self
    }

    /// Build a reply that lands in the same channel and thread.
    pub fn reply(&self, payload: Value) -> OutboundMessage {
        OutboundMessage {
            channel: self.channel.clone(),
            in_reply_to: Some(self.id.clone()),
            thread_id: self.thread_id.clone().or_else(|| Some(self.id.clone())),
            payload,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
pub struct Participant {
    pub id: String,                    // Internal or platform-specific ID
    pub display_name: Option<String>,
}

impl Participant {
    pub fn new(id: impl Into<String>, display_name: Option<String>) -> Self {
        Self { id: id.into(), display_name }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct OutboundMessage {
    pub channel: String,
    pub in_reply_to: Option<String>,
    pub thread_id: Option<String>,
    pub payload: Value,
}

/// One newline-delimited JSON frame exchanged with an out-of-process transport.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransportFrame {
    /// transport → host
    Message { message: ChannelMessage },
    /// transport → host
    Log { level: String, text: String },
    /// host → transport
    Ack { id: String },
    /// host → transport
    Send { message: OutboundMessage },
    /// host → transport
    Stop,
}
