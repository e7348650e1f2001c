// src/extension/mod.rs
//! Extensions: discovery, loading and the lifecycle that registers them.
pub mod hooks;
pub mod lifecycle;
pub mod loader;
pub mod native;
pub mod reload;
pub mod script;
pub mod teardown;

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;

use crate::dispatcher::DispatchGate;
use crate::facade::Capabilities;
use crate::provenance::SourceRoot;

pub use lifecycle::{LifecycleBuilder, LifecycleManager};
pub use loader::{CompositeLoader, ExtensionLoader, LoadedUnit, discover};
pub use native::{NativeLoader, NativeModule};
pub use script::ScriptLoader;
pub use teardown::{JobTeardown, ListenerTeardown, RouteTeardown, TeardownAdapter, TeardownReport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExtensionState {
    Discovered,
    Validated,
    PreRegistered,
    Registered,
    PostRegistered,
    Unregistered,
}

impl fmt::Display for ExtensionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ExtensionState::Discovered => "DISCOVERED",
            ExtensionState::Validated => "VALIDATED",
            ExtensionState::PreRegistered => "PRE_REGISTERED",
            ExtensionState::Registered => "REGISTERED",
            ExtensionState::PostRegistered => "POST_REGISTERED",
            ExtensionState::Unregistered => "UNREGISTERED",
        })
    }
}

/// Declared by the module. `display_name: None` falls back to the unit's stem.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExtensionMetadata {
    pub display_name: Option<String>,
    pub description: String,
    pub author: Option<String>,
}

/// One capability name an extension's `register` asks for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CapabilityRequest {
    pub name: String,
    pub required: bool,
}

impl CapabilityRequest {
    pub fn required(name: impl Into<String>) -> Self {
        Self { name: name.into(), required: true }
    }

    pub fn optional(name: impl Into<String>) -> Self {
        Self { name: name.into(), required: false }
    }
}

/// A loaded unit of extension code.
pub trait ExtensionModule: Send + Sync {
    fn metadata(&self) -> ExtensionMetadata;
    fn requested_capabilities(&self) -> Vec<CapabilityRequest>;
    /// Register everything through the façades in `capabilities`.
    fn register(&self, capabilities: &Capabilities) -> anyhow::Result<()>;
    /// `"rhai"`, `"native"`, ...
    fn kind(&self) -> &'static str;
}

pub type ModuleHandle = Arc<dyn ExtensionModule>;

#[derive(Clone)]
pub struct Extension {
    pub unique_name: String,
    pub name: String,
    pub display_name: String,
    pub description: String,
    pub author: Option<String>,
    pub root: SourceRoot,
    pub module: ModuleHandle,
    pub state: ExtensionState,
    pub gate: DispatchGate,
}

impl Extension {
    pub fn summary(&self) -> ExtensionSummary {
        ExtensionSummary {
            unique_name: self.unique_name.clone(),
            name: self.name.clone(),
            display_name: self.display_name.clone(),
            description: self.description.clone(),
            author: self.author.clone(),
            path: self.root.path().to_path_buf(),
            kind: self.module.kind(),
            state: self.state,
        }
    }
}

impl fmt::Debug for Extension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Extension")
            .field("unique_name", &self.unique_name)
            .field("root", &self.root)
            .field("kind", &self.module.kind())
            .field("state", &self.state)
            .finish()
    }
}

/// Serializable view of a loaded extension.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExtensionSummary {
    pub unique_name: String,
    pub name: String,
    pub display_name: String,
    pub description: String,
    pub author: Option<String>,
    pub path: PathBuf,
    pub kind: &'static str,
    pub state: ExtensionState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureStage {
    Load,
    Validate,
    PreRegister,
    Register,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedExtension {
    pub path: PathBuf,
    pub name: String,
    pub stage: FailureStage,
    pub error: String,
}
