// src/extension/native.rs
//! Rust extensions compiled into the host, keyed by the source path they claim.
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;

use crate::error::HostResult;
use crate::facade::Capabilities;
use crate::provenance::SourceRoot;

use super::lifecycle::normalize;
use super::loader::{ExtensionLoader, LoadedUnit};
use super::{CapabilityRequest, ExtensionMetadata, ExtensionModule, ModuleHandle};

/// Builds a fresh module, so a reload re-runs registration from scratch.
pub type NativeFactory = Arc<dyn Fn() -> ModuleHandle + Send + Sync>;

#[derive(Default)]
pub struct NativeLoader {
    catalog: DashMap<PathBuf, NativeFactory>,
}

impl NativeLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, path: impl AsRef<Path>, factory: NativeFactory) {
        self.catalog.insert(normalize(path.as_ref()), factory);
    }

    pub fn remove(&self, path: &Path) -> bool {
        self.catalog.remove(&normalize(path)).is_some()
    }

    pub fn paths(&self) -> Vec<PathBuf> {
        let mut paths: Vec<PathBuf> = self.catalog.iter().map(|e| e.key().clone()).collect();
        paths.sort();
        paths
    }
}

impl ExtensionLoader for NativeLoader {
    fn name(&self) -> &'static str {
        "native"
    }

    fn can_load(&self, path: &Path) -> bool {
        self.catalog.contains_key(&normalize(path))
    }

    fn load(&self, path: &Path) -> HostResult<Option<LoadedUnit>> {
        let key = normalize(path);
        let Some(factory) = self.catalog.get(&key).map(|f| f.value().clone()) else {
            return Ok(None);
        };
        // Catalog paths need not exist on disk.
        let root = SourceRoot::resolve(&key)
            .unwrap_or_else(|_| SourceRoot::new(key.clone(), key.extension().is_none()));
        let name = key
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(Some(LoadedUnit { name, root, module: factory() }))
    }
}

type RegisterFn = dyn Fn(&Capabilities) -> anyhow::Result<()> + Send + Sync;

/// A closure-backed [`ExtensionModule`].
pub struct NativeModule {
    metadata: ExtensionMetadata,
    requests: Vec<CapabilityRequest>,
    register: Box<RegisterFn>,
}

impl NativeModule {
    pub fn new<F>(capabilities: &[&str], register: F) -> Self
    where
        F: Fn(&Capabilities) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Self {
            metadata: ExtensionMetadata::default(),
            requests: capabilities.iter().map(|c| CapabilityRequest::required(*c)).collect(),
            register: Box::new(register),
        }
    }

    pub fn display_name(mut self, name: impl Into<String>) -> Self {
        self.metadata.display_name = Some(name.into());
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.metadata.description = description.into();
        self
    }

    pub fn author(mut self, author: impl Into<String>) -> Self {
        self.metadata.author = Some(author.into());
        self
    }

    pub fn into_handle(self) -> ModuleHandle {
        Arc::new(self)
    }
}

impl ExtensionModule for NativeModule {
    fn metadata(&self) -> ExtensionMetadata {
        self.metadata.clone()
    }

    fn requested_capabilities(&self) -> Vec<CapabilityRequest> {
        self.requests.clone()
    }

    fn register(&self, capabilities: &Capabilities) -> anyhow::Result<()> {
        (self.register)(capabilities)
    }

    fn kind(&self) -> &'static str {
        "native"
    }
}
