// src/dispatcher.rs
//! The listener registry and dispatcher.
//!
//! Registrations are kept in insertion order. `dispatch` snapshots the list
//! before evaluating anything so teardown running in parallel never changes
//! what an in-flight dispatch iterates over. Records removed after the
//! snapshot are skipped through their `live` flag.
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Instant;

use async_trait::async_trait;
use futures::FutureExt;
use opentelemetry::metrics::{Counter, Histogram};
use opentelemetry::{KeyValue, global};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, error, warn};

use crate::envelope::{Envelope, EventKind};
use crate::provenance::Provenance;

pub type HandlerResult = anyhow::Result<Value>;

#[async_trait]
pub trait Handler: Send + Sync {
    async fn call(&self, envelope: Envelope) -> HandlerResult;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> Handler for FnHandler<F>
where
    F: Fn(Envelope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    async fn call(&self, envelope: Envelope) -> HandlerResult {
        (self.0)(envelope).await
    }
}

/// Wrap an async closure as a [`Handler`].
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn Handler>
where
    F: Fn(Envelope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

#[async_trait]
pub trait Predicate: Send + Sync {
    async fn matches(&self, envelope: &Envelope) -> bool;
}

struct FnPredicate<F>(F);

#[async_trait]
impl<F> Predicate for FnPredicate<F>
where
    F: Fn(&Envelope) -> bool + Send + Sync + 'static,
{
    async fn matches(&self, envelope: &Envelope) -> bool {
        (self.0)(envelope)
    }
}

pub fn predicate_fn<F>(f: F) -> Arc<dyn Predicate>
where
    F: Fn(&Envelope) -> bool + Send + Sync + 'static,
{
    Arc::new(FnPredicate(f))
}

/// Held for reading while a record is selected, for writing while its
/// extension is torn down or reloaded.
pub type DispatchGate = Arc<tokio::sync::RwLock<()>>;

pub fn new_gate() -> DispatchGate {
    Arc::new(tokio::sync::RwLock::new(()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct RegistrationId(pub u64);

impl fmt::Display for RegistrationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Everything needed to add one record.
pub struct Listener {
    pub kind: EventKind,
    pub predicate: Arc<dyn Predicate>,
    pub handler: Arc<dyn Handler>,
    pub provenance: Provenance,
    pub gate: DispatchGate,
    pub label: String,
}

/// Content view of a registration record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RegistrationInfo {
    pub id: RegistrationId,
    pub kind: EventKind,
    pub provenance: Provenance,
    pub label: String,
}

struct Registration {
    info: RegistrationInfo,
    predicate: Arc<dyn Predicate>,
    handler: Arc<dyn Handler>,
    gate: DispatchGate,
    live: AtomicBool,
}

enum Selection {
    Matched(Arc<dyn Handler>),
    NoMatch,
    Stale,
}

impl Registration {
    fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }

    /// The predicate runs without the gate, so a reload of one extension never
    /// holds up envelopes meant for another. Only a match waits on the gate.
    async fn select(&self, envelope: &Envelope) -> Selection {
        let matched = self.predicate.matches(envelope).await;
        if !self.is_live() {
            return Selection::Stale;
        }
        if !matched {
            return Selection::NoMatch;
        }
        // Released before the handler runs, so a handler may reload its own extension.
        let _guard = self.gate.read().await;
        if self.is_live() {
            Selection::Matched(self.handler.clone())
        } else {
            Selection::Stale
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HandlerFailure {
    pub registration: RegistrationId,
    pub label: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FanOutReport {
    pub matched: usize,
    pub failures: Vec<HandlerFailure>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    /// A REQUEST handler produced the canonical response.
    Handled { registration: RegistrationId, response: Value },
    /// No REQUEST handler matched. Not an error.
    NoHandler,
    /// The matching REQUEST handler failed.
    HandlerFailed { registration: RegistrationId, error: String },
    /// SCHEDULED and MESSAGE envelopes reach every matching handler.
    FanOut(FanOutReport),
}

impl DispatchOutcome {
    pub fn is_no_handler(&self) -> bool {
        matches!(self, DispatchOutcome::NoHandler)
    }

    pub fn response(&self) -> Option<&Value> {
        match self {
            DispatchOutcome::Handled { response, .. } => Some(response),
            _ => None,
        }
    }

    fn label(&self) -> &'static str {
        match self {
            DispatchOutcome::Handled { .. } => "handled",
            DispatchOutcome::NoHandler => "no_handler",
            DispatchOutcome::HandlerFailed { .. } => "failed",
            DispatchOutcome::FanOut(r) if !r.failures.is_empty() => "partial",
            DispatchOutcome::FanOut(_) => "delivered",
        }
    }
}

struct DispatchMetrics {
    total: Counter<u64>,
    failures: Counter<u64>,
    latency_ms: Histogram<f64>,
}

impl DispatchMetrics {
    fn new() -> Self {
        let meter = global::meter("switchboard");
        Self {
            total: meter
                .u64_counter("dispatch_total")
                .with_description("Envelopes dispatched")
                .build(),
            failures: meter.u64_counter("dispatch_failures").build(),
            latency_ms: meter
                .f64_histogram("dispatch_latency_ms")
                .with_description("Latency per dispatch in ms")
                .with_unit("ms")
                .build(),
        }
    }
}

pub struct Dispatcher {
    records: RwLock<Vec<Arc<Registration>>>,
    next_id: AtomicU64,
    metrics: DispatchMetrics,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self {
            records: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
            metrics: DispatchMetrics::new(),
        }
    }

    pub fn register(&self, listener: Listener) -> RegistrationId {
        let id = RegistrationId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let record = Arc::new(Registration {
            info: RegistrationInfo {
                id,
                kind: listener.kind,
                provenance: listener.provenance,
                label: listener.label,
            },
            predicate: listener.predicate,
            handler: listener.handler,
            gate: listener.gate,
            live: AtomicBool::new(true),
        });
        debug!(registration = %id, kind = %record.info.kind, provenance = %record.info.provenance, label = %record.info.label, "listener registered");
        self.records
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record);
        id
    }

    /// Remove every record `filter` selects and return what was removed.
    pub fn remove_where(&self, mut filter: impl FnMut(&RegistrationInfo) -> bool) -> Vec<RegistrationInfo> {
        let mut removed = Vec::new();
        let mut records = self.records.write().unwrap_or_else(PoisonError::into_inner);
        records.retain(|record| {
            if filter(&record.info) {
                record.live.store(false, Ordering::Release);
                removed.push(record.info.clone());
                false
            } else {
                true
            }
        });
        removed
    }

    pub fn registrations(&self) -> Vec<RegistrationInfo> {
        self.records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|r| r.info.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn snapshot(&self, kind: EventKind) -> Vec<Arc<Registration>> {
        self.records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|r| r.info.kind == kind)
            .cloned()
            .collect()
    }

    pub async fn dispatch(&self, envelope: Envelope) -> DispatchOutcome {
        let start = Instant::now();
        let kind = envelope.kind;

        let outcome = match kind {
            EventKind::Request => self.dispatch_request(envelope).await,
            EventKind::Scheduled | EventKind::Message => self.fan_out(envelope).await,
        };

        let elapsed = start.elapsed().as_secs_f64() * 1_000.0;
        let attrs = [
            KeyValue::new("kind", kind.to_string()),
            KeyValue::new("outcome", outcome.label()),
        ];
        self.metrics.total.add(1, &attrs);
        self.metrics.latency_ms.record(elapsed, &attrs);
        if matches!(outcome, DispatchOutcome::HandlerFailed { .. }) {
            self.metrics.failures.add(1, &attrs);
        }
        if let DispatchOutcome::FanOut(report) = &outcome {
            if !report.failures.is_empty() {
                self.metrics.failures.add(report.failures.len() as u64, &attrs);
            }
        }

        // Picked up by the JSON event log.
        tracing::event!(
            target: "dispatch",
            tracing::Level::INFO,
            kind = %kind,
            outcome = outcome.label(),
            latency_ms = elapsed,
        );
        outcome
    }

    async fn dispatch_request(&self, envelope: Envelope) -> DispatchOutcome {
        // A second pass only happens when nothing matched and some record was
        // torn down between the snapshot and its evaluation, i.e. during a reload.
        for _attempt in 0..2 {
            let mut stale_gates = Vec::new();
            for record in self.snapshot(EventKind::Request) {
                match record.select(&envelope).await {
                    Selection::Matched(handler) => {
                        let id = record.info.id;
                        return match invoke(handler, envelope).await {
                            Ok(response) => DispatchOutcome::Handled { registration: id, response },
                            Err(e) => {
                                error!(registration = %id, label = %record.info.label, error = %e, "request handler failed");
                                DispatchOutcome::HandlerFailed { registration: id, error: e.to_string() }
                            }
                        };
                    }
                    Selection::Stale => stale_gates.push(record.gate.clone()),
                    Selection::NoMatch => {}
                }
            }
            if stale_gates.is_empty() {
                break;
            }
            // Let the reloads finish before looking again.
            for gate in stale_gates {
                drop(gate.read().await);
            }
            debug!("request raced a teardown; retrying with fresh registrations");
        }
        DispatchOutcome::NoHandler
    }

    async fn fan_out(&self, envelope: Envelope) -> DispatchOutcome {
        let mut report = FanOutReport::default();
        for record in self.snapshot(envelope.kind) {
            let Selection::Matched(handler) = record.select(&envelope).await else {
                continue;
            };
            report.matched += 1;
            if let Err(e) = invoke(handler, envelope.clone()).await {
                warn!(registration = %record.info.id, label = %record.info.label, error = %e, "handler failed");
                report.failures.push(HandlerFailure {
                    registration: record.info.id,
                    label: record.info.label.clone(),
                    error: e.to_string(),
                });
            }
        }
        if report.matched == 0 {
            debug!(kind = %envelope.kind, tag = envelope.payload.type_tag(), "no listeners matched");
        }
        DispatchOutcome::FanOut(report)
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

/// Run a handler, turning a panic into an error.
async fn invoke(handler: Arc<dyn Handler>, envelope: Envelope) -> HandlerResult {
    match AssertUnwindSafe(handler.call(envelope)).catch_unwind().await {
        Ok(result) => result,
        Err(_) => Err(anyhow::anyhow!("handler panicked")),
    }
}
