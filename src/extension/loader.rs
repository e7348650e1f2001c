// src/extension/loader.rs
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::HostResult;
use crate::provenance::SourceRoot;

use super::ModuleHandle;

/// A unit a loader accepted.
pub struct LoadedUnit {
    /// The stem of the source path.
    pub name: String,
    pub root: SourceRoot,
    pub module: ModuleHandle,
}

pub trait ExtensionLoader: Send + Sync {
    fn name(&self) -> &'static str;
    fn can_load(&self, path: &Path) -> bool;
    /// `Ok(None)` means the unit is deliberately skipped; the loader logs why.
    fn load(&self, path: &Path) -> HostResult<Option<LoadedUnit>>;
}

/// Tries each loader in order; the first that claims a path loads it.
#[derive(Default, Clone)]
pub struct CompositeLoader {
    loaders: Vec<Arc<dyn ExtensionLoader>>,
}

impl CompositeLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, loader: Arc<dyn ExtensionLoader>) -> Self {
        self.loaders.push(loader);
        self
    }

    pub fn push(&mut self, loader: Arc<dyn ExtensionLoader>) {
        self.loaders.push(loader);
    }
}

impl ExtensionLoader for CompositeLoader {
    fn name(&self) -> &'static str {
        "composite"
    }

    fn can_load(&self, path: &Path) -> bool {
        self.loaders.iter().any(|l| l.can_load(path))
    }

    fn load(&self, path: &Path) -> HostResult<Option<LoadedUnit>> {
        match self.loaders.iter().find(|l| l.can_load(path)) {
            Some(loader) => {
                debug!(loader = loader.name(), path = %path.display(), "loading unit");
                loader.load(path)
            }
            None => Ok(None),
        }
    }
}

/// `foo.rhai` → `foo`, `foo/` → `foo`.
pub fn unit_stem(path: &Path) -> String {
    let stem = if path.is_dir() { path.file_name() } else { path.file_stem() };
    stem.map(|s| s.to_string_lossy().into_owned()).unwrap_or_default()
}

/// Whether an entry name takes part in discovery at all.
pub fn is_candidate(name: &str, exclusions: &[String]) -> bool {
    if name.starts_with('_') || name.starts_with('.') {
        return false;
    }
    let stem = name.split('.').next().unwrap_or(name);
    !exclusions.iter().any(|e| e == name || e == stem)
}

/// Every `root/<category>/<entry>` candidate, sorted.
pub fn discover(root: &Path, exclusions: &[String]) -> Vec<PathBuf> {
    let mut found = Vec::new();
    let categories = match std::fs::read_dir(root) {
        Ok(entries) => entries,
        Err(e) => {
            warn!(root = %root.display(), error = %e, "extension root is not readable");
            return found;
        }
    };

    for category in categories.flatten() {
        let path = category.path();
        let name = category.file_name().to_string_lossy().into_owned();
        if !path.is_dir() || !is_candidate(&name, exclusions) {
            continue;
        }
        let Ok(entries) = std::fs::read_dir(&path) else {
            continue;
        };
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            if is_candidate(&name, exclusions) {
                found.push(entry.path());
            } else {
                debug!(entry = %entry.path().display(), "excluded from discovery");
            }
        }
    }
    found.sort();
    found
}

/// Map a path anywhere under `root` onto its `root/<category>/<entry>` unit.
pub fn unit_path(root: &Path, changed: &Path) -> Option<PathBuf> {
    let relative = changed.strip_prefix(root).ok()?;
    let mut parts = relative.components().filter_map(|c| match c {
        Component::Normal(p) => Some(p),
        _ => None,
    });
    let category = parts.next()?;
    let entry = parts.next()?;
    Some(root.join(category).join(entry))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn touch(path: &Path) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, "").unwrap();
    }

    #[test]
    fn discovery_walks_two_levels_and_honours_exclusions() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        touch(&root.join("core/status.rhai"));
        touch(&root.join("core/space/main.rhai"));
        touch(&root.join("core/_draft.rhai"));
        touch(&root.join("core/.hidden.rhai"));
        touch(&root.join("core/legacy.rhai"));
        touch(&root.join("_disabled/thing.rhai"));
        touch(&root.join("extra/deep/nested/inner.rhai"));
        touch(&root.join("top_level.rhai"));

        let found = discover(root, &["legacy".to_string()]);
        let names: Vec<String> = found
            .iter()
            .map(|p| p.strip_prefix(root).unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["core/space", "core/status.rhai", "extra/deep"]);
    }

    #[test]
    fn missing_root_discovers_nothing() {
        assert!(discover(Path::new("/definitely/not/here"), &[]).is_empty());
    }

    #[test]
    fn changed_paths_map_to_units() {
        let root = Path::new("/plugins");
        assert_eq!(
            unit_path(root, Path::new("/plugins/core/space/lib/util.rhai")),
            Some(PathBuf::from("/plugins/core/space"))
        );
        assert_eq!(
            unit_path(root, Path::new("/plugins/core/status.rhai")),
            Some(PathBuf::from("/plugins/core/status.rhai"))
        );
        assert_eq!(unit_path(root, Path::new("/plugins/core")), None);
        assert_eq!(unit_path(root, Path::new("/elsewhere/core/x.rhai")), None);
    }
}
