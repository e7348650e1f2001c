// src/extension/teardown.rs
//! Provenance-based teardown: one adapter per capability kind.
//!
//! Each adapter removes exactly the registrations whose provenance lies under
//! a source root and nothing else. Running one twice removes nothing the
//! second time.
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, warn};

use crate::dispatcher::Dispatcher;
use crate::docs::ApiDocs;
use crate::envelope::EventKind;
use crate::facade::JobIndex;
use crate::provenance::SourceRoot;
use crate::router::WebRouter;
use crate::scheduler::JobScheduler;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TeardownReport {
    pub adapter: &'static str,
    pub removed: usize,
    /// Collaborator errors. In-memory removal still happened.
    pub errors: Vec<String>,
}

#[async_trait]
pub trait TeardownAdapter: Send + Sync {
    fn name(&self) -> &'static str;
    async fn teardown(&self, root: &SourceRoot) -> TeardownReport;
}

fn remove_records(dispatcher: &Dispatcher, kind: EventKind, root: &SourceRoot) -> usize {
    dispatcher
        .remove_where(|info| info.kind == kind && root.contains(&info.provenance))
        .len()
}

/// REQUEST records, router routes and namespaces, and doc tags.
pub struct RouteTeardown {
    dispatcher: Arc<Dispatcher>,
    router: Arc<dyn WebRouter>,
    docs: Arc<dyn ApiDocs>,
}

impl RouteTeardown {
    pub fn new(dispatcher: Arc<Dispatcher>, router: Arc<dyn WebRouter>, docs: Arc<dyn ApiDocs>) -> Self {
        Self { dispatcher, router, docs }
    }
}

#[async_trait]
impl TeardownAdapter for RouteTeardown {
    fn name(&self) -> &'static str {
        "routes"
    }

    async fn teardown(&self, root: &SourceRoot) -> TeardownReport {
        let mut report = TeardownReport { adapter: self.name(), ..Default::default() };
        report.removed += remove_records(&self.dispatcher, EventKind::Request, root);

        for route in self.router.routes().into_iter().filter(|r| root.contains(&r.spec.provenance)) {
            match self.router.remove_route(route.id) {
                Ok(()) => report.removed += 1,
                Err(e) => {
                    warn!(route = %route.spec.path, error = %e, "router refused to remove route");
                    report.errors.push(e.to_string());
                }
            }
        }
        for namespace in self.router.namespaces().into_iter().filter(|n| root.contains(&n.provenance)) {
            self.router.remove_namespace(&namespace.name);
        }
        let tags = self.docs.retract_within(root);
        debug!(root = %root.path().display(), removed = report.removed, tags, "routes torn down");
        report
    }
}

/// Scheduled jobs: the job index, the scheduler and the SCHEDULED records.
pub struct JobTeardown {
    dispatcher: Arc<Dispatcher>,
    scheduler: Arc<dyn JobScheduler>,
    index: Arc<JobIndex>,
}

impl JobTeardown {
    pub fn new(dispatcher: Arc<Dispatcher>, scheduler: Arc<dyn JobScheduler>, index: Arc<JobIndex>) -> Self {
        Self { dispatcher, scheduler, index }
    }
}

#[async_trait]
impl TeardownAdapter for JobTeardown {
    fn name(&self) -> &'static str {
        "jobs"
    }

    async fn teardown(&self, root: &SourceRoot) -> TeardownReport {
        let mut report = TeardownReport { adapter: self.name(), ..Default::default() };
        for id in self.index.remove_within(root) {
            match self.scheduler.remove_job(&id) {
                Ok(()) => report.removed += 1,
                Err(e) => {
                    warn!(job = %id, error = %e, "scheduler could not cancel job");
                    report.errors.push(e.to_string());
                }
            }
        }
        report.removed += remove_records(&self.dispatcher, EventKind::Scheduled, root);
        report
    }
}

/// MESSAGE records.
pub struct ListenerTeardown {
    dispatcher: Arc<Dispatcher>,
}

impl ListenerTeardown {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self { dispatcher }
    }
}

#[async_trait]
impl TeardownAdapter for ListenerTeardown {
    fn name(&self) -> &'static str {
        "listeners"
    }

    async fn teardown(&self, root: &SourceRoot) -> TeardownReport {
        TeardownReport {
            adapter: self.name(),
            removed: remove_records(&self.dispatcher, EventKind::Message, root),
            errors: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::handler_fn;
    use crate::docs::TagRegistry;
    use crate::facade::test_support::scope;
    use crate::facade::{Capability, CapabilityProvider, HttpCapability, MessageCapability, ScheduleCapability};
    use crate::router::InMemoryRouter;
    use crate::scheduler::TokioScheduler;
    use crate::signature::Signer;
    use serde_json::Value;

    #[tokio::test]
    async fn teardown_is_exclusive_and_idempotent() {
        let dispatcher = Arc::new(Dispatcher::new());
        let router = Arc::new(InMemoryRouter::new());
        let scheduler = Arc::new(TokioScheduler::new());
        let index = Arc::new(JobIndex::new());
        let docs = Arc::new(TagRegistry::new());

        let http = HttpCapability::new(dispatcher.clone(), router.clone());
        let schedule = ScheduleCapability::new(dispatcher.clone(), scheduler.clone(), index.clone(), Signer::new("k"));
        let message = MessageCapability::new(dispatcher.clone());

        for name in ["foo", "foobar"] {
            let ext = scope(name, &format!("/plugins/x/{name}"));
            let Capability::Http(h) = http.provide(&ext) else { unreachable!() };
            let Capability::Schedule(s) = schedule.provide(&ext) else { unreachable!() };
            let Capability::Message(m) = message.provide(&ext) else { unreachable!() };
            h.get(&format!("/{name}"), handler_fn(|_| async { Ok(Value::Null) })).unwrap();
            s.every(3600, "tick", handler_fn(|_| async { Ok(Value::Null) })).unwrap();
            m.on("ping", handler_fn(|_| async { Ok(Value::Null) })).unwrap();
        }
        assert_eq!(dispatcher.len(), 6);

        let adapters: Vec<Box<dyn TeardownAdapter>> = vec![
            Box::new(RouteTeardown::new(dispatcher.clone(), router.clone(), docs)),
            Box::new(JobTeardown::new(dispatcher.clone(), scheduler.clone(), index.clone())),
            Box::new(ListenerTeardown::new(dispatcher.clone())),
        ];
        let foo = SourceRoot::new("/plugins/x/foo", true);

        let mut removed = Vec::new();
        for adapter in &adapters {
            let report = adapter.teardown(&foo).await;
            assert!(report.errors.is_empty());
            removed.push(report.removed);
        }
        // record + route, record + cancelled job, record
        assert_eq!(removed, vec![2, 2, 1]);
        assert_eq!(dispatcher.len(), 3);
        assert!(dispatcher.registrations().iter().all(|r| r.provenance.to_string() == "/plugins/x/foobar"));
        assert_eq!(router.routes().len(), 1);
        assert_eq!(scheduler.jobs().len(), 1);
        assert_eq!(index.ids(), vec!["foobar.tick".to_string()]);

        for adapter in &adapters {
            assert_eq!(adapter.teardown(&foo).await.removed, 0);
        }
        scheduler.shutdown();
    }

    #[tokio::test]
    async fn scheduler_errors_are_reported_but_index_is_cleared() {
        let dispatcher = Arc::new(Dispatcher::new());
        let scheduler = Arc::new(TokioScheduler::new());
        let index = Arc::new(JobIndex::new());
        let schedule = ScheduleCapability::new(dispatcher.clone(), scheduler.clone(), index.clone(), Signer::new("k"));
        let Capability::Schedule(s) = schedule.provide(&scope("foo", "/plugins/x/foo")) else { unreachable!() };
        s.every(3600, "tick", handler_fn(|_| async { Ok(Value::Null) })).unwrap();

        // The scheduler forgets the job behind the index's back.
        scheduler.remove_job("foo.tick").unwrap();

        let report = JobTeardown::new(dispatcher.clone(), scheduler, index.clone())
            .teardown(&SourceRoot::new("/plugins/x/foo", true))
            .await;
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.removed, 1);
        assert!(index.ids().is_empty());
        assert!(dispatcher.is_empty());
    }
}
