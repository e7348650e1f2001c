// src/extension/hooks.rs
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::docs::{ApiDocs, DocTag};
use crate::facade::ExtensionScope;
use crate::router::{Namespace, WebRouter};

/// Runs before or after an extension's `register`.
#[async_trait]
pub trait LifecycleHook: Send + Sync {
    fn name(&self) -> &'static str;
    async fn run(&self, scope: &ExtensionScope) -> anyhow::Result<()>;
}

/// Pre-register: give the extension its own router namespace, tagged with its display name.
pub struct RouterNamespaceHook {
    router: Arc<dyn WebRouter>,
}

impl RouterNamespaceHook {
    pub fn new(router: Arc<dyn WebRouter>) -> Self {
        Self { router }
    }
}

#[async_trait]
impl LifecycleHook for RouterNamespaceHook {
    fn name(&self) -> &'static str {
        "router_namespace"
    }

    async fn run(&self, scope: &ExtensionScope) -> anyhow::Result<()> {
        self.router.create_namespace(Namespace {
            name: scope.unique_name.clone(),
            tags: vec![scope.display_name.clone()],
            provenance: scope.provenance(),
        });
        Ok(())
    }
}

/// Post-register: publish a doc tag when the extension exposes documented routes.
pub struct DocsHook {
    router: Arc<dyn WebRouter>,
    docs: Arc<dyn ApiDocs>,
}

impl DocsHook {
    pub fn new(router: Arc<dyn WebRouter>, docs: Arc<dyn ApiDocs>) -> Self {
        Self { router, docs }
    }
}

#[async_trait]
impl LifecycleHook for DocsHook {
    fn name(&self) -> &'static str {
        "docs"
    }

    async fn run(&self, scope: &ExtensionScope) -> anyhow::Result<()> {
        let documented = self
            .router
            .routes()
            .iter()
            .any(|r| r.spec.include_in_docs && scope.root.contains(&r.spec.provenance));
        if !documented {
            debug!(extension = %scope.unique_name, "no documented routes");
            return Ok(());
        }
        self.docs.publish(DocTag {
            name: scope.display_name.clone(),
            description: scope.description.clone(),
            extension: scope.unique_name.clone(),
            provenance: scope.provenance(),
        });
        Ok(())
    }
}
