// src/facade/schedule.rs
use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use regex::Regex;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::dispatcher::{DispatchOutcome, Dispatcher, Handler, Listener, Predicate};
use crate::envelope::{ContextField, Envelope, EventKind};
use crate::error::{HostError, HostResult};
use crate::provenance::{Provenance, SourceRoot};
use crate::scheduler::{JobCallback, JobDefinition, JobScheduler, TriggerSpec};
use crate::signature::Signer;

use super::{Capability, CapabilityProvider, ExtensionScope, check_requires};

static NON_SLUG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[^a-z0-9]+").expect("slug pattern compiles"));

/// `"Heartbeat Ping!"` → `"heartbeat_ping"`.
pub fn slug(name: &str) -> String {
    NON_SLUG
        .replace_all(&name.to_lowercase(), "_")
        .trim_matches('_')
        .to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobOwner {
    pub extension: String,
    pub provenance: Provenance,
}

/// Job id → owning extension. The scheduler itself knows nothing about provenance.
#[derive(Default)]
pub struct JobIndex {
    jobs: DashMap<String, JobOwner>,
}

impl JobIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn owner(&self, id: &str) -> Option<JobOwner> {
        self.jobs.get(id).map(|o| o.value().clone())
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.jobs.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Claim `id`, failing if another registration already holds it.
    fn claim(&self, id: &str, owner: JobOwner) -> HostResult<()> {
        match self.jobs.entry(id.to_string()) {
            Entry::Occupied(existing) => Err(HostError::JobConflict {
                id: id.to_string(),
                owner: existing.get().extension.clone(),
            }),
            Entry::Vacant(slot) => {
                slot.insert(owner);
                Ok(())
            }
        }
    }

    fn release(&self, id: &str) {
        self.jobs.remove(id);
    }

    /// Drop and return every job id owned by an extension under `root`.
    pub fn remove_within(&self, root: &SourceRoot) -> Vec<String> {
        let ids: Vec<String> = self
            .jobs
            .iter()
            .filter(|e| root.contains(&e.value().provenance))
            .map(|e| e.key().clone())
            .collect();
        for id in &ids {
            self.jobs.remove(id);
        }
        ids
    }
}

#[derive(Debug, Clone, Default)]
pub struct JobOptions {
    pub id: Option<String>,
    pub name: Option<String>,
    pub requires: Vec<ContextField>,
}

impl JobOptions {
    pub fn named(name: impl Into<String>) -> Self {
        Self { name: Some(name.into()), ..Default::default() }
    }

    pub fn with_id(id: impl Into<String>) -> Self {
        Self { id: Some(id.into()), ..Default::default() }
    }
}

#[derive(Clone)]
pub struct ScheduleCapability {
    dispatcher: Arc<Dispatcher>,
    scheduler: Arc<dyn JobScheduler>,
    index: Arc<JobIndex>,
    signer: Signer,
}

impl ScheduleCapability {
    pub fn new(
        dispatcher: Arc<Dispatcher>,
        scheduler: Arc<dyn JobScheduler>,
        index: Arc<JobIndex>,
        signer: Signer,
    ) -> Self {
        Self { dispatcher, scheduler, index, signer }
    }

    /// What the scheduler runs when a job fires: build a SCHEDULED envelope and fan it out.
    fn callback(&self) -> JobCallback {
        let dispatcher = self.dispatcher.clone();
        let signer = self.signer.clone();
        Arc::new(move |info| {
            let dispatcher = dispatcher.clone();
            let signer = signer.clone();
            Box::pin(async move {
                let envelope = Envelope::from_job(info.to_event(), &signer);
                match dispatcher.dispatch(envelope).await {
                    DispatchOutcome::FanOut(report) if report.failures.is_empty() => {
                        debug!(job = %info.id, handlers = report.matched, "job completed");
                    }
                    DispatchOutcome::FanOut(report) => {
                        warn!(job = %info.id, handlers = report.matched, failed = report.failures.len(), "job completed with failures");
                    }
                    other => warn!(job = %info.id, outcome = ?other, "unexpected job outcome"),
                }
            })
        })
    }
}

impl CapabilityProvider for ScheduleCapability {
    fn provide(&self, scope: &ExtensionScope) -> Capability {
        Capability::Schedule(ScheduleFacade { capability: self.clone(), scope: scope.clone() })
    }
}

#[derive(Clone)]
pub struct ScheduleFacade {
    capability: ScheduleCapability,
    scope: ExtensionScope,
}

impl ScheduleFacade {
    pub fn every(&self, seconds: u64, name: &str, handler: Arc<dyn Handler>) -> HostResult<String> {
        self.job(TriggerSpec::every(seconds), JobOptions::named(name), handler)
    }

    pub fn cron(&self, expression: &str, name: &str, handler: Arc<dyn Handler>) -> HostResult<String> {
        self.job(TriggerSpec::cron(expression), JobOptions::named(name), handler)
    }

    pub fn at(&self, at: DateTime<Utc>, name: &str, handler: Arc<dyn Handler>) -> HostResult<String> {
        self.job(TriggerSpec::at(at), JobOptions::named(name), handler)
    }

    /// Schedule `handler` and return the job id.
    pub fn job(&self, trigger: TriggerSpec, options: JobOptions, handler: Arc<dyn Handler>) -> HostResult<String> {
        check_requires(EventKind::Scheduled, &options.requires)?;
        trigger.validate()?;

        let id = self.job_id(&options)?;
        let name = options.name.filter(|n| !n.is_empty()).unwrap_or_else(|| id.clone());
        let provenance = self.scope.provenance();
        let cap = &self.capability;

        cap.index.claim(
            &id,
            JobOwner { extension: self.scope.unique_name.clone(), provenance: provenance.clone() },
        )?;

        let registration = cap.dispatcher.register(Listener {
            kind: EventKind::Scheduled,
            predicate: Arc::new(JobMatcher { id: id.clone() }),
            handler,
            provenance,
            gate: self.scope.gate.clone(),
            label: format!("job {id}"),
        });

        let definition = JobDefinition { id: id.clone(), name, trigger };
        let trigger_text = definition.trigger.to_string();
        if let Err(e) = cap.scheduler.add_job(definition, cap.callback()) {
            cap.dispatcher.remove_where(|info| info.id == registration);
            cap.index.release(&id);
            return Err(e);
        }
        info!(extension = %self.scope.unique_name, job = %id, trigger = %trigger_text, "job scheduled");
        Ok(id)
    }

    fn job_id(&self, options: &JobOptions) -> HostResult<String> {
        if let Some(id) = options.id.as_deref().filter(|id| !id.is_empty()) {
            return Ok(id.to_string());
        }
        match options.name.as_deref().map(slug).filter(|s| !s.is_empty()) {
            Some(name) => Ok(format!("{}.{name}", self.scope.unique_name)),
            None => Err(HostError::MissingJobId),
        }
    }
}

struct JobMatcher {
    id: String,
}

#[async_trait]
impl Predicate for JobMatcher {
    async fn matches(&self, envelope: &Envelope) -> bool {
        envelope.payload.as_job().is_some_and(|job| job.id == self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::handler_fn;
    use crate::facade::test_support::scope;
    use crate::scheduler::TokioScheduler;
    use serde_json::Value;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Fixture {
        dispatcher: Arc<Dispatcher>,
        scheduler: Arc<TokioScheduler>,
        index: Arc<JobIndex>,
        capability: ScheduleCapability,
    }

    fn fixture() -> Fixture {
        let dispatcher = Arc::new(Dispatcher::new());
        let scheduler = Arc::new(TokioScheduler::new());
        let index = Arc::new(JobIndex::new());
        let capability =
            ScheduleCapability::new(dispatcher.clone(), scheduler.clone(), index.clone(), Signer::new("k"));
        Fixture { dispatcher, scheduler, index, capability }
    }

    fn facade(capability: &ScheduleCapability, name: &str) -> ScheduleFacade {
        match capability.provide(&scope(name, &format!("/plugins/x/{name}"))) {
            Capability::Schedule(s) => s,
            _ => unreachable!(),
        }
    }

    fn noop() -> Arc<dyn Handler> {
        handler_fn(|_| async { Ok(Value::Null) })
    }

    #[test]
    fn slugs_names() {
        assert_eq!(slug("Heartbeat Ping!"), "heartbeat_ping");
        assert_eq!(slug("  "), "");
    }

    #[tokio::test]
    async fn job_id_is_derived_from_name() {
        let f = fixture();
        let schedule = facade(&f.capability, "status");
        assert_eq!(schedule.every(60, "Heartbeat Ping", noop()).unwrap(), "status.heartbeat_ping");
        assert_eq!(
            schedule.job(TriggerSpec::every(60), JobOptions::with_id("custom"), noop()).unwrap(),
            "custom"
        );
        assert!(matches!(
            schedule.job(TriggerSpec::every(60), JobOptions::default(), noop()),
            Err(HostError::MissingJobId)
        ));
        assert_eq!(f.index.ids(), vec!["custom".to_string(), "status.heartbeat_ping".to_string()]);
        assert_eq!(f.scheduler.jobs().len(), 2);
        assert_eq!(f.dispatcher.len(), 2);
    }

    #[tokio::test]
    async fn conflicting_id_leaves_no_trace() {
        let f = fixture();
        facade(&f.capability, "a").job(TriggerSpec::every(60), JobOptions::with_id("shared"), noop()).unwrap();
        let err = facade(&f.capability, "b")
            .job(TriggerSpec::every(60), JobOptions::with_id("shared"), noop())
            .unwrap_err();
        assert!(matches!(err, HostError::JobConflict { ref owner, .. } if owner == "a"));
        assert_eq!(f.dispatcher.len(), 1);
        assert_eq!(f.index.owner("shared").map(|o| o.extension), Some("a".to_string()));
    }

    #[tokio::test]
    async fn invalid_cron_and_requirements_are_rejected() {
        let f = fixture();
        let schedule = facade(&f.capability, "x");
        assert!(matches!(schedule.cron("not a cron", "bad", noop()), Err(HostError::InvalidTrigger(_))));
        let wants_ack = JobOptions { requires: vec![ContextField::Acknowledge], ..JobOptions::named("n") };
        assert!(matches!(
            schedule.job(TriggerSpec::every(5), wants_ack, noop()),
            Err(HostError::UnsupportedContextField { .. })
        ));
        assert!(f.dispatcher.is_empty());
        assert!(f.index.ids().is_empty());
    }

    #[tokio::test]
    async fn firing_job_reaches_only_its_handler() {
        let f = fixture();
        let schedule = facade(&f.capability, "ticker");
        let hits = Arc::new(AtomicUsize::new(0));
        let seen = hits.clone();
        schedule
            .job(
                TriggerSpec::every(1),
                JobOptions { requires: vec![ContextField::Job], ..JobOptions::named("tick") },
                handler_fn(move |env: Envelope| {
                    let seen = seen.clone();
                    async move {
                        assert_eq!(env.context.job().map(|j| j.id.as_str()), Some("ticker.tick"));
                        seen.fetch_add(1, Ordering::SeqCst);
                        Ok(Value::Null)
                    }
                }),
            )
            .unwrap();
        schedule.every(3600, "slow", noop()).unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(1_300)).await;
        assert!(hits.load(Ordering::SeqCst) >= 1);
        f.scheduler.shutdown();
    }

    #[test]
    fn remove_within_respects_containment() {
        let index = JobIndex::new();
        let owner = |p: &str| JobOwner { extension: p.into(), provenance: Provenance::Extension(p.into()) };
        index.claim("foo.job", owner("/p/x/foo")).unwrap();
        index.claim("foobar.job", owner("/p/x/foobar")).unwrap();
        assert_eq!(index.remove_within(&SourceRoot::new("/p/x/foo", true)), vec!["foo.job".to_string()]);
        assert_eq!(index.ids(), vec!["foobar.job".to_string()]);
    }
}
