pub mod message;
pub mod transport;
pub mod process;

#[cfg(feature = "test-utils")]
pub mod mock;

pub use message::{ChannelMessage, OutboundMessage, Participant, TransportFrame};
pub use transport::{ChannelTransport, TransportError};
