// src/facade/mod.rs
//! Capability façades: the only API extension code registers behavior through.
//!
//! Every façade instance is bound to one [`ExtensionScope`], built by the
//! lifecycle manager while that extension registers. Provenance therefore
//! travels with the façade instead of being looked up from the caller.
pub mod http;
pub mod message;
pub mod schedule;

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::dispatcher::DispatchGate;
use crate::envelope::{ContextField, EventKind};
use crate::error::{HostError, HostResult};
use crate::extension::CapabilityRequest;
use crate::provenance::{Provenance, SourceRoot};

pub use http::{HttpCapability, HttpFacade, RouteOptions};
pub use message::{MessageCapability, MessageFacade};
pub use schedule::{JobIndex, JobOptions, ScheduleCapability, ScheduleFacade};

/// The extension on whose behalf façade calls run.
#[derive(Debug, Clone)]
pub struct ExtensionScope {
    pub unique_name: String,
    pub display_name: String,
    pub description: String,
    pub root: SourceRoot,
    pub gate: DispatchGate,
}

impl ExtensionScope {
    pub fn provenance(&self) -> Provenance {
        self.root.provenance()
    }
}

#[derive(Clone)]
pub enum Capability {
    Http(HttpFacade),
    Schedule(ScheduleFacade),
    Message(MessageFacade),
}

/// Builds an extension-scoped capability from a process-wide one.
pub trait CapabilityProvider: Send + Sync {
    fn provide(&self, scope: &ExtensionScope) -> Capability;
}

/// Name → provider. Extensions receive only the names their `register` declares.
#[derive(Clone, Default)]
pub struct CapabilityTable {
    providers: BTreeMap<String, Arc<dyn CapabilityProvider>>,
}

impl CapabilityTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, provider: Arc<dyn CapabilityProvider>) {
        self.providers.insert(name.into(), provider);
    }

    pub fn names(&self) -> Vec<String> {
        self.providers.keys().cloned().collect()
    }

    /// Validate `requests` and build the scoped capability set.
    pub fn select(&self, scope: &ExtensionScope, requests: &[CapabilityRequest]) -> HostResult<Capabilities> {
        let mut entries = BTreeMap::new();
        for request in requests {
            match self.providers.get(&request.name) {
                Some(provider) => {
                    entries.insert(request.name.clone(), provider.provide(scope));
                }
                None if request.required => {
                    return Err(HostError::Validation {
                        path: scope.root.path().to_path_buf(),
                        reason: format!(
                            "register requires unknown capability `{}` (available: {})",
                            request.name,
                            self.names().join(", ")
                        ),
                    });
                }
                None => {}
            }
        }
        Ok(Capabilities { entries })
    }
}

/// The capability set handed to one extension's `register`.
#[derive(Clone, Default)]
pub struct Capabilities {
    entries: BTreeMap<String, Capability>,
}

impl Capabilities {
    pub fn get(&self, name: &str) -> Option<&Capability> {
        self.entries.get(name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.entries.keys().map(String::as_str).collect()
    }

    pub fn http_named(&self, name: &str) -> HostResult<&HttpFacade> {
        match self.entries.get(name) {
            Some(Capability::Http(h)) => Ok(h),
            _ => Err(HostError::CapabilityUnavailable(name.to_string())),
        }
    }

    pub fn http(&self) -> HostResult<&HttpFacade> {
        self.http_named("http")
    }

    pub fn api(&self) -> HostResult<&HttpFacade> {
        self.http_named("api")
    }

    pub fn web(&self) -> HostResult<&HttpFacade> {
        self.http_named("web")
    }

    pub fn schedule(&self) -> HostResult<&ScheduleFacade> {
        match self.entries.get("schedule") {
            Some(Capability::Schedule(s)) => Ok(s),
            _ => Err(HostError::CapabilityUnavailable("schedule".into())),
        }
    }

    pub fn message(&self) -> HostResult<&MessageFacade> {
        match self.entries.get("message") {
            Some(Capability::Message(m)) => Ok(m),
            _ => Err(HostError::CapabilityUnavailable("message".into())),
        }
    }
}

/// Reject context fields `kind` never supplies.
pub(crate) fn check_requires(kind: EventKind, requires: &[ContextField]) -> HostResult<()> {
    match requires.iter().find(|f| !f.supported_by(kind)) {
        Some(field) => Err(HostError::UnsupportedContextField { field: *field, kind }),
        None => Ok(()),
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::Dispatcher;
    use crate::router::InMemoryRouter;

    #[test]
    fn select_filters_to_requested_names() {
        let dispatcher = Arc::new(Dispatcher::new());
        let mut table = CapabilityTable::new();
        table.insert("http", Arc::new(HttpCapability::new(dispatcher.clone(), Arc::new(InMemoryRouter::new()))));
        table.insert("message", Arc::new(MessageCapability::new(dispatcher)));

        let scope = test_support::scope("status", "/plugins/core/status");
        let caps = table
            .select(&scope, &[CapabilityRequest::required("http"), CapabilityRequest::optional("database")])
            .unwrap();
        assert_eq!(caps.names(), vec!["http"]);
        assert!(caps.http().is_ok());
        assert!(matches!(caps.message(), Err(HostError::CapabilityUnavailable(_))));

        let missing = table.select(&scope, &[CapabilityRequest::required("database")]);
        assert!(matches!(missing, Err(HostError::Validation { .. })));
    }

    #[test]
    fn requires_is_checked_against_kind() {
        assert!(check_requires(EventKind::Message, &[ContextField::Acknowledge, ContextField::Respond]).is_ok());
        let err = check_requires(EventKind::Scheduled, &[ContextField::Respond]).unwrap_err();
        assert!(matches!(err, HostError::UnsupportedContextField { field: ContextField::Respond, .. }));
    }
}
