// src/facade/message.rs
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::dispatcher::{Dispatcher, Handler, Listener, Predicate, RegistrationId};
use crate::envelope::{ContextField, Envelope, EventKind};
use crate::error::HostResult;

use super::{Capability, CapabilityProvider, ExtensionScope, check_requires};

#[derive(Clone)]
pub struct MessageCapability {
    dispatcher: Arc<Dispatcher>,
}

impl MessageCapability {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self { dispatcher }
    }
}

impl CapabilityProvider for MessageCapability {
    fn provide(&self, scope: &ExtensionScope) -> Capability {
        Capability::Message(MessageFacade { dispatcher: self.dispatcher.clone(), scope: scope.clone() })
    }
}

/// Listens for channel messages by type tag.
#[derive(Clone)]
pub struct MessageFacade {
    dispatcher: Arc<Dispatcher>,
    scope: ExtensionScope,
}

impl MessageFacade {
    pub fn on(&self, tag: &str, handler: Arc<dyn Handler>) -> HostResult<RegistrationId> {
        self.on_with(tag, &[], handler)
    }

    pub fn on_with(
        &self,
        tag: &str,
        requires: &[ContextField],
        handler: Arc<dyn Handler>,
    ) -> HostResult<RegistrationId> {
        check_requires(EventKind::Message, requires)?;
        let id = self.dispatcher.register(Listener {
            kind: EventKind::Message,
            predicate: Arc::new(MessageTypeMatcher { tag: tag.to_string() }),
            handler,
            provenance: self.scope.provenance(),
            gate: self.scope.gate.clone(),
            label: format!("message {tag}"),
        });
        debug!(extension = %self.scope.unique_name, tag, "message listener registered");
        Ok(id)
    }
}

struct MessageTypeMatcher {
    tag: String,
}

#[async_trait]
impl Predicate for MessageTypeMatcher {
    async fn matches(&self, envelope: &Envelope) -> bool {
        envelope.payload.as_message().is_some_and(|m| m.message_type == self.tag)
    }
}
