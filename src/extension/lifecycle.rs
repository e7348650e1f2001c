// src/extension/lifecycle.rs
//! The extension lifecycle manager.
//!
//! `discover → validate → pre-register → register → post-register`, and back
//! out again through the teardown adapters on unregister or reload. All
//! mutating operations are serialized by one async mutex; reload and
//! unregister additionally hold the extension's dispatch gate for writing so
//! no request observes a half torn down extension.
use std::fmt::Display;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use anyhow::anyhow;
use dashmap::DashMap;
use tracing::{debug, info, warn};

use crate::dispatcher::{DispatchGate, new_gate};
use crate::error::{HostError, HostResult};
use crate::facade::{CapabilityProvider, CapabilityTable, ExtensionScope};
use crate::provenance::SourceRoot;

use super::hooks::LifecycleHook;
use super::loader::{CompositeLoader, ExtensionLoader, LoadedUnit, discover, is_candidate, unit_stem};
use super::native::{NativeFactory, NativeLoader};
use super::teardown::{TeardownAdapter, TeardownReport};
use super::{Extension, ExtensionState, ExtensionSummary, FailedExtension, FailureStage, ModuleHandle};

pub struct LifecycleBuilder {
    root: PathBuf,
    exclusions: Vec<String>,
    loaders: Vec<Arc<dyn ExtensionLoader>>,
    native: Option<Arc<NativeLoader>>,
    capabilities: CapabilityTable,
    pre_hooks: Vec<Arc<dyn LifecycleHook>>,
    post_hooks: Vec<Arc<dyn LifecycleHook>>,
    teardown: Vec<Arc<dyn TeardownAdapter>>,
}

impl LifecycleBuilder {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            exclusions: Vec::new(),
            loaders: Vec::new(),
            native: None,
            capabilities: CapabilityTable::new(),
            pre_hooks: Vec::new(),
            post_hooks: Vec::new(),
            teardown: Vec::new(),
        }
    }

    /// Entry names skipped by discovery, in addition to `_`/`.` prefixes.
    pub fn exclusions(mut self, names: Vec<String>) -> Self {
        self.exclusions = names;
        self
    }

    pub fn loader(mut self, loader: Arc<dyn ExtensionLoader>) -> Self {
        self.loaders.push(loader);
        self
    }

    pub fn native(mut self, native: Arc<NativeLoader>) -> Self {
        self.native = Some(native);
        self
    }

    pub fn capability(mut self, name: &str, provider: Arc<dyn CapabilityProvider>) -> Self {
        self.capabilities.insert(name, provider);
        self
    }

    pub fn pre_hook(mut self, hook: Arc<dyn LifecycleHook>) -> Self {
        self.pre_hooks.push(hook);
        self
    }

    pub fn post_hook(mut self, hook: Arc<dyn LifecycleHook>) -> Self {
        self.post_hooks.push(hook);
        self
    }

    pub fn teardown(mut self, adapter: Arc<dyn TeardownAdapter>) -> Self {
        self.teardown.push(adapter);
        self
    }

    pub fn build(self) -> LifecycleManager {
        let native = self.native.unwrap_or_default();
        let mut loader = CompositeLoader::new().with(native.clone());
        for l in self.loaders {
            loader.push(l);
        }
        LifecycleManager {
            root: normalize(&self.root),
            exclusions: self.exclusions,
            loader,
            native,
            capabilities: self.capabilities,
            pre_hooks: self.pre_hooks,
            post_hooks: self.post_hooks,
            teardown: self.teardown,
            extensions: RwLock::new(Vec::new()),
            failed: RwLock::new(Vec::new()),
            gates: DashMap::new(),
            ops: tokio::sync::Mutex::new(()),
        }
    }
}

pub struct LifecycleManager {
    root: PathBuf,
    exclusions: Vec<String>,
    loader: CompositeLoader,
    native: Arc<NativeLoader>,
    capabilities: CapabilityTable,
    pre_hooks: Vec<Arc<dyn LifecycleHook>>,
    post_hooks: Vec<Arc<dyn LifecycleHook>>,
    teardown: Vec<Arc<dyn TeardownAdapter>>,
    extensions: RwLock<Vec<Extension>>,
    failed: RwLock<Vec<FailedExtension>>,
    gates: DashMap<PathBuf, DispatchGate>,
    ops: tokio::sync::Mutex<()>,
}

impl LifecycleManager {
    pub fn builder(root: impl Into<PathBuf>) -> LifecycleBuilder {
        LifecycleBuilder::new(root)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn native(&self) -> &Arc<NativeLoader> {
        &self.native
    }

    pub fn capability_names(&self) -> Vec<String> {
        self.capabilities.names()
    }

    /// Whether a `root/<category>/<entry>` path would be picked up by discovery.
    pub fn accepts(&self, unit: &Path) -> bool {
        let Ok(relative) = unit.strip_prefix(&self.root) else {
            return false;
        };
        relative
            .components()
            .all(|c| is_candidate(&c.as_os_str().to_string_lossy(), &self.exclusions))
    }

    /// Discover and load everything under the root. Returns how many loaded.
    pub async fn load_all(&self) -> usize {
        let _ops = self.ops.lock().await;
        let mut loaded = 0;
        for path in discover(&self.root, &self.exclusions) {
            match self.load_locked(&path).await {
                Ok(Some(_)) => loaded += 1,
                Ok(None) => {}
                Err(e) => warn!(path = %path.display(), code = e.code(), error = %e, "extension not loaded"),
            }
        }
        info!(root = %self.root.display(), loaded, failed = self.failed().len(), "extensions loaded");
        loaded
    }

    /// Load one unit. `Ok(None)` when it is skipped or already loaded.
    pub async fn load_path(&self, path: &Path) -> HostResult<Option<ExtensionSummary>> {
        let _ops = self.ops.lock().await;
        self.load_locked(path).await
    }

    /// Add a Rust extension to the native catalog and load it.
    pub async fn load_native(
        &self,
        path: impl AsRef<Path>,
        factory: NativeFactory,
    ) -> HostResult<Option<ExtensionSummary>> {
        self.native.insert(path.as_ref(), factory);
        self.load_path(path.as_ref()).await
    }

    /// Tear down everything the extension registered. Returns whether it was loaded.
    pub async fn unregister(&self, unique_name: &str) -> bool {
        let _ops = self.ops.lock().await;
        let Some(extension) = self.take_extension(unique_name) else {
            debug!(extension = unique_name, "not loaded; nothing to unregister");
            return false;
        };
        let _write = extension.gate.write().await;
        let reports = self.teardown_root(&extension.root).await;
        info!(
            extension = unique_name,
            removed = reports.iter().map(|r| r.removed).sum::<usize>(),
            "extension unregistered"
        );
        true
    }

    pub async fn reload(&self, unique_name: &str) -> HostResult<ExtensionSummary> {
        let _ops = self.ops.lock().await;
        let current = self
            .read_extensions()
            .iter()
            .find(|e| e.unique_name == unique_name)
            .cloned()
            .ok_or_else(|| HostError::UnknownExtension(unique_name.to_string()))?;
        self.reload_locked(current).await
    }

    /// Reload whichever extension contains `path`. `Ok(None)` if none does.
    pub async fn reload_path(&self, path: &Path) -> HostResult<Option<ExtensionSummary>> {
        let _ops = self.ops.lock().await;
        match self.containing(path) {
            Some(current) => self.reload_locked(current).await.map(Some),
            None => Ok(None),
        }
    }

    /// Unregister everything, last loaded first.
    pub async fn shutdown(&self) {
        let _ops = self.ops.lock().await;
        let drained: Vec<Extension> = std::mem::take(&mut *self.write_extensions());
        for extension in drained.into_iter().rev() {
            let _write = extension.gate.write().await;
            self.teardown_root(&extension.root).await;
            debug!(extension = %extension.unique_name, "extension shut down");
        }
    }

    pub fn extensions(&self) -> Vec<ExtensionSummary> {
        self.read_extensions().iter().map(Extension::summary).collect()
    }

    pub fn failed(&self) -> Vec<FailedExtension> {
        self.failed.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn get(&self, unique_name: &str) -> Option<ExtensionSummary> {
        self.read_extensions()
            .iter()
            .find(|e| e.unique_name == unique_name)
            .map(Extension::summary)
    }

    pub fn get_by_name(&self, name: &str) -> Option<ExtensionSummary> {
        self.read_extensions().iter().find(|e| e.name == name).map(Extension::summary)
    }

    pub fn get_by_path(&self, path: &Path) -> Option<ExtensionSummary> {
        let path = normalize(path);
        self.read_extensions()
            .iter()
            .find(|e| e.root.path() == path)
            .map(Extension::summary)
    }

    /// The extension whose source root most specifically contains `path`.
    pub fn find_by_path(&self, path: &Path) -> Option<ExtensionSummary> {
        self.containing(path).map(|e| e.summary())
    }

    pub fn module(&self, unique_name: &str) -> Option<ModuleHandle> {
        self.read_extensions()
            .iter()
            .find(|e| e.unique_name == unique_name)
            .map(|e| e.module.clone())
    }

    fn containing(&self, path: &Path) -> Option<Extension> {
        let path = normalize(path);
        self.read_extensions()
            .iter()
            .filter(|e| e.root.contains_path(&path))
            .max_by_key(|e| e.root.path().components().count())
            .cloned()
    }

    async fn load_locked(&self, path: &Path) -> HostResult<Option<ExtensionSummary>> {
        let canonical = normalize(path);
        if let Some(existing) = self.read_extensions().iter().find(|e| e.root.path() == canonical) {
            info!(path = %canonical.display(), extension = %existing.unique_name, "already loaded; skipping");
            return Ok(None);
        }
        let Some(extension) = self.instantiate(path, None).await? else {
            return Ok(None);
        };
        let summary = extension.summary();
        self.write_extensions().push(extension);
        Ok(Some(summary))
    }

    async fn reload_locked(&self, current: Extension) -> HostResult<ExtensionSummary> {
        let _write = current.gate.write().await;
        let position = {
            let mut extensions = self.write_extensions();
            let position = extensions.iter().position(|e| e.unique_name == current.unique_name);
            if let Some(i) = position {
                extensions.remove(i);
            }
            position
        };
        self.teardown_root(&current.root).await;

        let path = current.root.path();
        match self.instantiate(path, Some(current.unique_name.clone())).await? {
            Some(extension) => {
                let summary = extension.summary();
                let mut extensions = self.write_extensions();
                match position {
                    Some(i) if i <= extensions.len() => extensions.insert(i, extension),
                    _ => extensions.push(extension),
                }
                info!(extension = %summary.unique_name, "extension reloaded");
                Ok(summary)
            }
            None => {
                warn!(extension = %current.unique_name, path = %path.display(), "no longer loadable; left unloaded");
                Err(HostError::Load { path: path.to_path_buf(), reason: "unit is no longer loadable".into() })
            }
        }
    }

    async fn instantiate(&self, path: &Path, unique_name: Option<String>) -> HostResult<Option<Extension>> {
        if !self.loader.can_load(path) {
            debug!(path = %path.display(), "no loader claims this path");
            return Ok(None);
        }
        let unit = match self.loader.load(path) {
            Ok(Some(unit)) => unit,
            Ok(None) => return Ok(None),
            Err(e) => {
                self.record_failure(path, &unit_stem(path), FailureStage::Load, &e);
                return Err(e);
            }
        };
        self.activate(unit, unique_name).await
    }

    async fn activate(&self, unit: LoadedUnit, unique_name: Option<String>) -> HostResult<Option<Extension>> {
        let LoadedUnit { name, root, module } = unit;
        let metadata = module.metadata();
        let display_name = match metadata.display_name {
            Some(d) if d.trim().is_empty() => {
                info!(extension = %name, path = %root.path().display(), "empty display name; skipping");
                return Ok(None);
            }
            Some(d) => d,
            None => name.clone(),
        };
        let unique_name = unique_name.unwrap_or_else(|| self.unique_name_for(&name));
        let gate = self.gate_for(root.path());
        let scope = ExtensionScope {
            unique_name: unique_name.clone(),
            display_name: display_name.clone(),
            description: metadata.description.clone(),
            root: root.clone(),
            gate: gate.clone(),
        };
        let mut state = ExtensionState::Discovered;

        let capabilities = match self.capabilities.select(&scope, &module.requested_capabilities()) {
            Ok(c) => c,
            Err(e) => {
                self.record_failure(root.path(), &name, FailureStage::Validate, &e);
                return Err(e);
            }
        };
        advance(&unique_name, &mut state, ExtensionState::Validated);

        for hook in &self.pre_hooks {
            if let Err(e) = hook.run(&scope).await {
                let err = HostError::Registration {
                    extension: unique_name.clone(),
                    reason: format!("{} hook: {e:#}", hook.name()),
                };
                warn!(extension = %unique_name, hook = hook.name(), error = %err, "pre-register hook failed; rolling back");
                self.teardown_root(&root).await;
                advance(&unique_name, &mut state, ExtensionState::Unregistered);
                self.record_failure(root.path(), &name, FailureStage::PreRegister, &err);
                return Err(err);
            }
        }
        advance(&unique_name, &mut state, ExtensionState::PreRegistered);

        let registered = std::panic::catch_unwind(AssertUnwindSafe(|| module.register(&capabilities)))
            .unwrap_or_else(|_| Err(anyhow!("register panicked")));
        if let Err(e) = registered {
            let err = HostError::Registration { extension: unique_name.clone(), reason: format!("{e:#}") };
            warn!(extension = %unique_name, error = %err, "registration failed; rolling back");
            self.teardown_root(&root).await;
            advance(&unique_name, &mut state, ExtensionState::Unregistered);
            self.record_failure(root.path(), &name, FailureStage::Register, &err);
            return Err(err);
        }
        advance(&unique_name, &mut state, ExtensionState::Registered);

        for hook in &self.post_hooks {
            if let Err(e) = hook.run(&scope).await {
                warn!(extension = %unique_name, hook = hook.name(), error = %e, "post-register hook failed");
            }
        }
        advance(&unique_name, &mut state, ExtensionState::PostRegistered);

        self.clear_failure(root.path());
        info!(
            extension = %unique_name,
            display_name = %display_name,
            kind = module.kind(),
            path = %root.path().display(),
            "extension registered"
        );
        Ok(Some(Extension {
            unique_name,
            name,
            display_name,
            description: metadata.description,
            author: metadata.author,
            root,
            module,
            state,
            gate,
        }))
    }

    async fn teardown_root(&self, root: &SourceRoot) -> Vec<TeardownReport> {
        let mut reports = Vec::with_capacity(self.teardown.len());
        for adapter in &self.teardown {
            let report = adapter.teardown(root).await;
            if !report.errors.is_empty() {
                warn!(adapter = report.adapter, errors = ?report.errors, "teardown completed with errors");
            }
            reports.push(report);
        }
        reports
    }

    fn unique_name_for(&self, name: &str) -> String {
        let extensions = self.read_extensions();
        let taken = |candidate: &str| extensions.iter().any(|e| e.unique_name == candidate);
        if !taken(name) {
            return name.to_string();
        }
        (2..)
            .map(|n| format!("{name}_{n}"))
            .find(|candidate| !taken(candidate))
            .unwrap_or_else(|| format!("{name}_{}", extensions.len() + 1))
    }

    fn gate_for(&self, path: &Path) -> DispatchGate {
        self.gates.entry(path.to_path_buf()).or_insert_with(new_gate).clone()
    }

    fn take_extension(&self, unique_name: &str) -> Option<Extension> {
        let mut extensions = self.write_extensions();
        let i = extensions.iter().position(|e| e.unique_name == unique_name)?;
        Some(extensions.remove(i))
    }

    fn record_failure(&self, path: &Path, name: &str, stage: FailureStage, error: &dyn Display) {
        warn!(extension = name, path = %path.display(), ?stage, error = %error, "extension failed");
        let mut failed = self.failed.write().unwrap_or_else(PoisonError::into_inner);
        failed.retain(|f| f.path != path);
        failed.push(FailedExtension {
            path: path.to_path_buf(),
            name: name.to_string(),
            stage,
            error: error.to_string(),
        });
    }

    fn clear_failure(&self, path: &Path) {
        self.failed
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|f| f.path != path);
    }

    fn read_extensions(&self) -> RwLockReadGuard<'_, Vec<Extension>> {
        self.extensions.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_extensions(&self) -> RwLockWriteGuard<'_, Vec<Extension>> {
        self.extensions.write().unwrap_or_else(PoisonError::into_inner)
    }
}

fn advance(extension: &str, state: &mut ExtensionState, next: ExtensionState) {
    debug!(extension, from = %state, to = %next, "state change");
    *state = next;
}

/// Canonical form of a path that may no longer exist.
pub(crate) fn normalize(path: &Path) -> PathBuf {
    if let Ok(p) = path.canonicalize() {
        return p;
    }
    match (path.parent().and_then(|p| p.canonicalize().ok()), path.file_name()) {
        (Some(parent), Some(name)) => parent.join(name),
        _ => path.to_path_buf(),
    }
}
