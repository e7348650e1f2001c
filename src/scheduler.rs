// src/scheduler.rs
//! The timer collaborator: interval, cron and one-shot date jobs.
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use futures::future::BoxFuture;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tokio::task::AbortHandle;
use tracing::{debug, warn};

use crate::envelope::JobEvent;
use crate::error::{HostError, HostResult};

/// When a job fires. Forwarded untouched from the schedule façade.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TriggerSpec {
    Interval { seconds: u64 },
    /// Six-field (`sec min hour dom mon dow`) or five-field crontab syntax.
    Cron { expression: String },
    Date { at: DateTime<Utc> },
}

impl TriggerSpec {
    pub fn every(seconds: u64) -> Self {
        TriggerSpec::Interval { seconds }
    }

    pub fn cron(expression: impl Into<String>) -> Self {
        TriggerSpec::Cron { expression: expression.into() }
    }

    pub fn at(at: DateTime<Utc>) -> Self {
        TriggerSpec::Date { at }
    }

    pub fn validate(&self) -> HostResult<()> {
        match self {
            TriggerSpec::Interval { seconds: 0 } => {
                Err(HostError::InvalidTrigger("interval must be at least one second".into()))
            }
            TriggerSpec::Cron { expression } => parse_cron(expression).map(|_| ()),
            _ => Ok(()),
        }
    }

    /// The first fire time strictly after `now`, given the previous fire time.
    pub fn next_after(&self, now: DateTime<Utc>, last: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
        match self {
            TriggerSpec::Interval { seconds } => {
                let step = Duration::seconds(i64::try_from(*seconds).ok()?);
                let mut next = last.unwrap_or(now) + step;
                while next <= now {
                    next += step;
                }
                Some(next)
            }
            TriggerSpec::Cron { expression } => parse_cron(expression).ok()?.after(&now).next(),
            TriggerSpec::Date { at } => (last.is_none() && *at > now).then_some(*at),
        }
    }
}

impl fmt::Display for TriggerSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TriggerSpec::Interval { seconds } => write!(
                f,
                "interval[{}:{:02}:{:02}]",
                seconds / 3600,
                (seconds % 3600) / 60,
                seconds % 60
            ),
            TriggerSpec::Cron { expression } => write!(f, "cron[{expression}]"),
            TriggerSpec::Date { at } => write!(f, "date[{}]", at.to_rfc3339()),
        }
    }
}

fn parse_cron(expression: &str) -> HostResult<cron::Schedule> {
    let fields = expression.split_whitespace().count();
    let normalized = if fields == 5 {
        format!("0 {expression}")
    } else {
        expression.to_string()
    };
    cron::Schedule::from_str(&normalized)
        .map_err(|e| HostError::InvalidTrigger(format!("`{expression}`: {e}")))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobDefinition {
    pub id: String,
    pub name: String,
    pub trigger: TriggerSpec,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobInfo {
    pub id: String,
    pub name: String,
    pub trigger: TriggerSpec,
    pub next_run_time: Option<DateTime<Utc>>,
}

impl JobInfo {
    pub fn to_event(&self) -> JobEvent {
        JobEvent {
            id: self.id.clone(),
            name: self.name.clone(),
            next_run_time: self.next_run_time,
            trigger: self.trigger.to_string(),
        }
    }
}

pub type JobCallback = Arc<dyn Fn(JobInfo) -> BoxFuture<'static, ()> + Send + Sync>;

pub trait JobScheduler: Send + Sync {
    fn add_job(&self, job: JobDefinition, callback: JobCallback) -> HostResult<()>;
    /// Cancel a job so it never fires again.
    fn remove_job(&self, id: &str) -> HostResult<()>;
    fn get_job(&self, id: &str) -> Option<JobInfo>;
    fn jobs(&self) -> Vec<JobInfo>;
}

struct ScheduledJob {
    definition: JobDefinition,
    next_run: Arc<RwLock<Option<DateTime<Utc>>>>,
    abort: AbortHandle,
}

impl ScheduledJob {
    fn info(&self) -> JobInfo {
        JobInfo {
            id: self.definition.id.clone(),
            name: self.definition.name.clone(),
            trigger: self.definition.trigger.clone(),
            next_run_time: *self.next_run.read().unwrap_or_else(PoisonError::into_inner),
        }
    }
}

/// One tokio task per job.
#[derive(Default)]
pub struct TokioScheduler {
    jobs: DashMap<String, ScheduledJob>,
}

impl TokioScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel everything.
    pub fn shutdown(&self) {
        for entry in self.jobs.iter() {
            entry.value().abort.abort();
        }
        self.jobs.clear();
    }
}

impl JobScheduler for TokioScheduler {
    fn add_job(&self, job: JobDefinition, callback: JobCallback) -> HostResult<()> {
        job.trigger.validate()?;
        if self.jobs.contains_key(&job.id) {
            return Err(HostError::Scheduler(format!("job `{}` already exists", job.id)));
        }
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| HostError::Scheduler(format!("no runtime to schedule `{}` on: {e}", job.id)))?;

        let first = job.trigger.next_after(Utc::now(), None);
        if first.is_none() {
            warn!(job = %job.id, trigger = %job.trigger, "job will never fire");
        }
        let next_run = Arc::new(RwLock::new(first));

        let task_next = next_run.clone();
        let definition = job.clone();
        let task = runtime.spawn(async move {
            let mut upcoming = first;
            while let Some(at) = upcoming {
                let wait = (at - Utc::now()).to_std().unwrap_or_default();
                tokio::time::sleep(wait).await;

                let info = JobInfo {
                    id: definition.id.clone(),
                    name: definition.name.clone(),
                    trigger: definition.trigger.clone(),
                    next_run_time: Some(at),
                };
                debug!(job = %definition.id, "job firing");
                callback(info).await;

                upcoming = definition.trigger.next_after(Utc::now(), Some(at));
                *task_next.write().unwrap_or_else(PoisonError::into_inner) = upcoming;
            }
        });

        self.jobs.insert(
            job.id.clone(),
            ScheduledJob { definition: job, next_run, abort: task.abort_handle() },
        );
        Ok(())
    }

    fn remove_job(&self, id: &str) -> HostResult<()> {
        match self.jobs.remove(id) {
            Some((_, job)) => {
                job.abort.abort();
                Ok(())
            }
            None => Err(HostError::Scheduler(format!("job `{id}` is not scheduled"))),
        }
    }

    fn get_job(&self, id: &str) -> Option<JobInfo> {
        self.jobs.get(id).map(|j| j.info())
    }

    fn jobs(&self) -> Vec<JobInfo> {
        let mut all: Vec<JobInfo> = self.jobs.iter().map(|j| j.info()).collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn cron_is_validated() {
        assert!(TriggerSpec::cron("0 */5 * * * *").validate().is_ok());
        assert!(TriggerSpec::cron("*/5 * * * *").validate().is_ok());
        assert!(TriggerSpec::cron("every tuesday").validate().is_err());
        assert!(TriggerSpec::every(0).validate().is_err());
    }

    #[test]
    fn interval_steps_from_last_run() {
        let now = Utc::now();
        let t = TriggerSpec::every(30);
        assert_eq!(t.next_after(now, None), Some(now + Duration::seconds(30)));
        let last = now - Duration::seconds(10);
        assert_eq!(t.next_after(now, Some(last)), Some(last + Duration::seconds(30)));
    }

    #[test]
    fn date_fires_once() {
        let now = Utc::now();
        let at = now + Duration::seconds(5);
        let t = TriggerSpec::at(at);
        assert_eq!(t.next_after(now, None), Some(at));
        assert_eq!(t.next_after(now, Some(at)), None);
        assert_eq!(TriggerSpec::at(now - Duration::seconds(5)).next_after(now, None), None);
    }

    #[test]
    fn describes_triggers() {
        assert_eq!(TriggerSpec::every(90).to_string(), "interval[0:01:30]");
        assert_eq!(TriggerSpec::cron("0 0 * * * *").to_string(), "cron[0 0 * * * *]");
    }

    #[tokio::test]
    async fn interval_job_fires_until_removed() {
        let scheduler = TokioScheduler::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        let callback: JobCallback = Arc::new(move |_info| {
            let counter = counter.clone();
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
            })
        });
        scheduler
            .add_job(
                JobDefinition { id: "tick".into(), name: "tick".into(), trigger: TriggerSpec::every(1) },
                callback,
            )
            .unwrap();
        assert!(scheduler.get_job("tick").unwrap().next_run_time.is_some());

        tokio::time::sleep(std::time::Duration::from_millis(1_300)).await;
        assert!(fired.load(Ordering::SeqCst) >= 1);

        scheduler.remove_job("tick").unwrap();
        let after_removal = fired.load(Ordering::SeqCst);
        tokio::time::sleep(std::time::Duration::from_millis(1_200)).await;
        assert_eq!(fired.load(Ordering::SeqCst), after_removal);
        assert!(scheduler.remove_job("tick").is_err());
        assert!(scheduler.jobs().is_empty());
    }
}
