// src/adapter/mod.rs
//! Trigger adapters: turn network requests and channel traffic into envelopes.
//!
//! The schedule adapter lives with the schedule façade, which owns the job callback.
pub mod channel;
pub mod http;

pub use channel::{ChannelPump, TransportAck};
pub use http::{HttpState, router, serve};
