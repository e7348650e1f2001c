use std::path::PathBuf;

use thiserror::Error;

use crate::envelope::{ContextField, EventKind, HttpMethod};

#[derive(Debug, Error)]
pub enum HostError {
    #[error("failed to load extension at {path}: {reason}")]
    Load { path: PathBuf, reason: String },

    #[error("extension at {path} is invalid: {reason}")]
    Validation { path: PathBuf, reason: String },

    #[error("extension `{extension}` failed to register: {reason}")]
    Registration { extension: String, reason: String },

    #[error("route {method} {path} is already registered by `{owner}`")]
    RouteConflict {
        method: HttpMethod,
        path: String,
        owner: String,
    },

    #[error("invalid route template `{0}`")]
    InvalidRoute(String),

    #[error("job `{id}` is already scheduled by `{owner}`")]
    JobConflict { id: String, owner: String },

    #[error("a scheduled job needs an explicit id or a name")]
    MissingJobId,

    #[error("invalid trigger: {0}")]
    InvalidTrigger(String),

    #[error("context field `{field}` is never provided for {kind} events")]
    UnsupportedContextField { field: ContextField, kind: EventKind },

    #[error("capability `{0}` was not requested by this extension")]
    CapabilityUnavailable(String),

    #[error("unknown extension `{0}`")]
    UnknownExtension(String),

    #[error("scheduler error: {0}")]
    Scheduler(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl HostError {
    /// Short machine-readable code, used as a structured log field.
    pub fn code(&self) -> &'static str {
        match self {
            HostError::Load { .. } => "load_failed",
            HostError::Validation { .. } => "validation_failed",
            HostError::Registration { .. } => "registration_failed",
            HostError::RouteConflict { .. } => "route_conflict",
            HostError::InvalidRoute(_) => "invalid_route",
            HostError::JobConflict { .. } => "job_conflict",
            HostError::MissingJobId => "missing_job_id",
            HostError::InvalidTrigger(_) => "invalid_trigger",
            HostError::UnsupportedContextField { .. } => "unsupported_context_field",
            HostError::CapabilityUnavailable(_) => "capability_unavailable",
            HostError::UnknownExtension(_) => "unknown_extension",
            HostError::Scheduler(_) => "scheduler",
            HostError::Io(_) => "io",
        }
    }
}

pub type HostResult<T> = Result<T, HostError>;
