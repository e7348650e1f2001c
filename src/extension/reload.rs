// src/extension/reload.rs
//! Hot reload: maps filesystem changes under the extension root onto lifecycle operations.
use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tracing::{debug, info};

use crate::watcher::WatchedType;

use super::LifecycleManager;
use super::loader::unit_path;
use super::script::SCRIPT_EXTENSION;

pub struct ExtensionWatch {
    lifecycle: Arc<LifecycleManager>,
}

impl ExtensionWatch {
    pub fn new(lifecycle: Arc<LifecycleManager>) -> Self {
        Self { lifecycle }
    }
}

#[async_trait]
impl WatchedType for ExtensionWatch {
    fn is_relevant(&self, path: &Path) -> bool {
        path.extension().and_then(|e| e.to_str()) == Some(SCRIPT_EXTENSION)
            && unit_path(self.lifecycle.root(), path).is_some_and(|unit| self.lifecycle.accepts(&unit))
    }

    async fn on_create_or_modify(&self, path: &Path) -> Result<()> {
        let Some(unit) = unit_path(self.lifecycle.root(), path) else {
            return Ok(());
        };
        if self.lifecycle.find_by_path(&unit).is_some() {
            debug!(path = %path.display(), "source changed; reloading");
            self.lifecycle.reload_path(&unit).await?;
        } else if let Some(summary) = self.lifecycle.load_path(&unit).await? {
            info!(extension = %summary.unique_name, "new extension picked up");
        }
        Ok(())
    }

    async fn on_remove(&self, path: &Path) -> Result<()> {
        let Some(unit) = unit_path(self.lifecycle.root(), path) else {
            return Ok(());
        };
        let Some(current) = self.lifecycle.find_by_path(&unit) else {
            return Ok(());
        };
        if unit.exists() {
            // A file inside a package went away; the package itself is still there.
            self.lifecycle.reload_path(&unit).await?;
        } else {
            self.lifecycle.unregister(&current.unique_name).await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::Dispatcher;
    use crate::docs::TagRegistry;
    use crate::envelope::{Envelope, HttpMethod, HttpRequest};
    use crate::extension::{RouteTeardown, ScriptLoader};
    use crate::facade::HttpCapability;
    use crate::router::InMemoryRouter;
    use crate::signature::Signer;
    use serde_json::{Value, json};
    use std::fs;
    use tempfile::TempDir;

    fn setup(dir: &TempDir) -> (Arc<Dispatcher>, Arc<LifecycleManager>) {
        let dispatcher = Arc::new(Dispatcher::new());
        let router = Arc::new(InMemoryRouter::new());
        let lifecycle = LifecycleManager::builder(dir.path())
            .loader(Arc::new(ScriptLoader::new()))
            .capability("http", Arc::new(HttpCapability::new(dispatcher.clone(), router.clone())))
            .teardown(Arc::new(RouteTeardown::new(dispatcher.clone(), router, Arc::new(TagRegistry::new()))))
            .build();
        (dispatcher, Arc::new(lifecycle))
    }

    async fn get(dispatcher: &Dispatcher, path: &str) -> Option<Value> {
        let envelope = Envelope::from_request(HttpRequest::new(HttpMethod::Get, path), &Signer::new("k"));
        dispatcher.dispatch(envelope).await.response().cloned()
    }

    fn script(body: &str) -> String {
        format!("fn register(http) {{ http.get(\"/hello\", |event| {body}); }}")
    }

    #[tokio::test]
    async fn create_modify_remove_cycle() {
        let dir = TempDir::new().unwrap();
        let (dispatcher, lifecycle) = setup(&dir);
        let watch = ExtensionWatch::new(lifecycle.clone());
        fs::create_dir_all(dir.path().join("core")).unwrap();
        let file = lifecycle.root().join("core/hello.rhai");

        fs::write(&file, script("\"v1\"")).unwrap();
        assert!(watch.is_relevant(&file));
        watch.on_create_or_modify(&file).await.unwrap();
        assert_eq!(get(&dispatcher, "/hello").await, Some(json!("v1")));

        fs::write(&file, script("\"v2\"")).unwrap();
        watch.on_create_or_modify(&file).await.unwrap();
        assert_eq!(get(&dispatcher, "/hello").await, Some(json!("v2")));
        assert_eq!(dispatcher.len(), 1);
        assert_eq!(lifecycle.extensions().len(), 1);

        fs::remove_file(&file).unwrap();
        watch.on_remove(&file).await.unwrap();
        assert!(get(&dispatcher, "/hello").await.is_none());
        assert!(lifecycle.extensions().is_empty());
    }

    #[tokio::test]
    async fn broken_edit_leaves_extension_unloaded_until_fixed() {
        let dir = TempDir::new().unwrap();
        let (dispatcher, lifecycle) = setup(&dir);
        let watch = ExtensionWatch::new(lifecycle.clone());
        fs::create_dir_all(dir.path().join("core")).unwrap();
        let file = lifecycle.root().join("core/hello.rhai");

        fs::write(&file, script("\"v1\"")).unwrap();
        watch.on_create_or_modify(&file).await.unwrap();

        fs::write(&file, "fn register(http) {").unwrap();
        assert!(watch.on_create_or_modify(&file).await.is_err());
        assert!(get(&dispatcher, "/hello").await.is_none());
        assert_eq!(lifecycle.failed().len(), 1);

        fs::write(&file, script("\"fixed\"")).unwrap();
        watch.on_create_or_modify(&file).await.unwrap();
        assert_eq!(get(&dispatcher, "/hello").await, Some(json!("fixed")));
        assert!(lifecycle.failed().is_empty());
    }

    #[tokio::test]
    async fn excluded_and_foreign_paths_are_ignored() {
        let dir = TempDir::new().unwrap();
        let (_, lifecycle) = setup(&dir);
        let watch = ExtensionWatch::new(lifecycle.clone());
        let root = lifecycle.root();
        assert!(!watch.is_relevant(&root.join("core/_draft.rhai")));
        assert!(!watch.is_relevant(&root.join("core/notes.txt")));
        assert!(!watch.is_relevant(&root.join("top.rhai")));
        assert!(watch.is_relevant(&root.join("core/pkg/lib/util.rhai")));
    }
}
