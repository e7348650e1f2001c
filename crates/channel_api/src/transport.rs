use async_trait::async_trait;
use thiserror::Error;

use crate::message::{ChannelMessage, OutboundMessage};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport `{0}` has not been started")]
    NotStarted(String),
    #[error("transport `{0}` is closed")]
    Closed(String),
    #[error("failed to spawn transport: {0}")]
    Spawn(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Encode(#[from] serde_json::Error),
}

/// The narrow interface the host consumes from a real-time message channel.
///
/// Implementations own the wire protocol. The host only pulls inbound messages,
/// acknowledges them, and pushes replies.
#[async_trait]
pub trait ChannelTransport: Send + Sync {
    fn name(&self) -> &str;

    async fn start(&self) -> Result<(), TransportError>;

    /// Next inbound message, or `None` once the transport has closed.
    async fn next_inbound(&self) -> Option<ChannelMessage>;

    async fn acknowledge(&self, message_id: &str) -> Result<(), TransportError>;

    async fn send(&self, message: OutboundMessage) -> Result<(), TransportError>;

    async fn stop(&self);
}
