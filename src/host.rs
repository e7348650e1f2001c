// src/host.rs
//! Wires the collaborators, façades, lifecycle and adapters into one running host.
use std::sync::{Arc, Mutex, PoisonError, Weak};

use anyhow::Result;
use channel_api::ChannelTransport;
use channel_api::process::ProcessTransport;
use serde_json::json;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::adapter::{ChannelPump, HttpState};
use crate::config::HostConfig;
use crate::dispatcher::{DispatchOutcome, Dispatcher, handler_fn};
use crate::docs::{ApiDocs, TagRegistry};
use crate::envelope::{Envelope, HttpMethod, HttpRequest};
use crate::extension::hooks::{DocsHook, RouterNamespaceHook};
use crate::extension::reload::ExtensionWatch;
use crate::extension::{
    JobTeardown, LifecycleManager, ListenerTeardown, NativeLoader, RouteTeardown, ScriptLoader,
};
use crate::facade::{HttpCapability, JobIndex, MessageCapability, ScheduleCapability};
use crate::router::{InMemoryRouter, WebRouter};
use crate::scheduler::TokioScheduler;
use crate::signature::Signer;
use crate::watcher::DirectoryWatcher;

pub const EXTENSIONS_PATH: &str = "/_switchboard/extensions";
pub const DOCS_PATH: &str = "/_switchboard/docs";

pub struct Host {
    config: HostConfig,
    signer: Signer,
    dispatcher: Arc<Dispatcher>,
    router: Arc<InMemoryRouter>,
    scheduler: Arc<TokioScheduler>,
    docs: Arc<TagRegistry>,
    jobs: Arc<JobIndex>,
    native: Arc<NativeLoader>,
    lifecycle: Arc<LifecycleManager>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    watcher: Mutex<Option<DirectoryWatcher>>,
}

impl Host {
    /// Build every component and the host's own routes. Nothing is loaded yet.
    pub fn new(config: HostConfig) -> Result<Self> {
        let signer = config.signer();
        let dispatcher = Arc::new(Dispatcher::new());
        let router = Arc::new(InMemoryRouter::new());
        let scheduler = Arc::new(TokioScheduler::new());
        let docs = Arc::new(TagRegistry::new());
        let jobs = Arc::new(JobIndex::new());
        let native = Arc::new(NativeLoader::new());

        let http = HttpCapability::new(dispatcher.clone(), router.clone());
        let lifecycle = LifecycleManager::builder(&config.plugins_dir)
            .exclusions(config.disabled_extensions.clone())
            .native(native.clone())
            .loader(Arc::new(ScriptLoader::new().with_max_operations(config.script_max_operations)))
            .capability("http", Arc::new(http.clone()))
            .capability("api", Arc::new(http.clone().with_prefix("/api")))
            .capability("web", Arc::new(http.clone().undocumented()))
            .capability(
                "schedule",
                Arc::new(ScheduleCapability::new(
                    dispatcher.clone(),
                    scheduler.clone(),
                    jobs.clone(),
                    signer.clone(),
                )),
            )
            .capability("message", Arc::new(MessageCapability::new(dispatcher.clone())))
            .pre_hook(Arc::new(RouterNamespaceHook::new(router.clone())))
            .post_hook(Arc::new(DocsHook::new(router.clone(), docs.clone())))
            .teardown(Arc::new(RouteTeardown::new(dispatcher.clone(), router.clone(), docs.clone())))
            .teardown(Arc::new(JobTeardown::new(dispatcher.clone(), scheduler.clone(), jobs.clone())))
            .teardown(Arc::new(ListenerTeardown::new(dispatcher.clone())))
            .build();
        let lifecycle = Arc::new(lifecycle);

        register_core_routes(&http, Arc::downgrade(&lifecycle), router.clone(), docs.clone())?;

        Ok(Self {
            config,
            signer,
            dispatcher,
            router,
            scheduler,
            docs,
            jobs,
            native,
            lifecycle,
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
            watcher: Mutex::new(None),
        })
    }

    /// Build the host and load every extension under the plugins dir.
    pub async fn bootstrap(config: HostConfig) -> Result<Arc<Self>> {
        let host = Self::new(config)?;
        if !host.config.plugins_dir.exists() {
            warn!(dir = %host.config.plugins_dir.display(), "plugins dir does not exist; no extensions loaded");
        }
        host.lifecycle.load_all().await;
        Ok(Arc::new(host))
    }

    /// Start serving: HTTP, the optional channel transport and hot reload.
    pub async fn start(&self) -> Result<()> {
        let state = HttpState { dispatcher: self.dispatcher.clone(), signer: self.signer.clone() };
        let addr = self.config.http_addr;
        let cancel = self.cancel.child_token();
        self.spawn(async move {
            if let Err(e) = crate::adapter::serve(addr, state, cancel).await {
                error!(error = %format!("{e:#}"), "HTTP server failed");
            }
        });

        if let Some(command) = &self.config.channel_command {
            let transport = ProcessTransport::new(command.clone(), self.config.channel_args.clone());
            self.start_channel(Arc::new(transport));
        }

        if self.config.hot_reload && self.lifecycle.root().is_dir() {
            let watcher = DirectoryWatcher::with_interval(
                self.lifecycle.root().to_path_buf(),
                Arc::new(ExtensionWatch::new(self.lifecycle.clone())),
                &[],
                false,
                false,
                self.config.poll_interval(),
            )
            .await?;
            *self.watcher.lock().unwrap_or_else(PoisonError::into_inner) = Some(watcher);
        }
        info!(addr = %addr, extensions = self.lifecycle.extensions().len(), "switchboard started");
        Ok(())
    }

    /// Pump `transport` into MESSAGE envelopes until shutdown.
    pub fn start_channel(&self, transport: Arc<dyn ChannelTransport>) {
        let name = transport.name().to_string();
        let pump = ChannelPump::new(transport, self.dispatcher.clone(), self.signer.clone());
        let cancel = self.cancel.child_token();
        self.spawn(async move {
            if let Err(e) = pump.run(cancel).await {
                error!(channel = %name, error = %format!("{e:#}"), "channel pump failed");
            }
        });
    }

    fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner).push(tokio::spawn(task));
    }

    /// Dispatch an HTTP request without going through the network adapter.
    pub async fn handle(&self, request: HttpRequest) -> DispatchOutcome {
        self.dispatcher.dispatch(Envelope::from_request(request, &self.signer)).await
    }

    pub async fn shutdown(&self) {
        info!("switchboard shutting down");
        if let Some(watcher) = self.watcher.lock().unwrap_or_else(PoisonError::into_inner).take() {
            watcher.shutdown();
        }
        self.cancel.cancel();
        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        for task in tasks {
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    warn!(error = %e, "background task ended abnormally");
                }
            }
        }
        self.lifecycle.shutdown().await;
        self.scheduler.shutdown();
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    pub fn signer(&self) -> &Signer {
        &self.signer
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn router(&self) -> &Arc<InMemoryRouter> {
        &self.router
    }

    pub fn scheduler(&self) -> &Arc<TokioScheduler> {
        &self.scheduler
    }

    pub fn docs(&self) -> &Arc<TagRegistry> {
        &self.docs
    }

    pub fn jobs(&self) -> &Arc<JobIndex> {
        &self.jobs
    }

    pub fn native(&self) -> &Arc<NativeLoader> {
        &self.native
    }

    pub fn lifecycle(&self) -> &Arc<LifecycleManager> {
        &self.lifecycle
    }
}

fn register_core_routes(
    http: &HttpCapability,
    lifecycle: Weak<LifecycleManager>,
    router: Arc<InMemoryRouter>,
    docs: Arc<TagRegistry>,
) -> Result<()> {
    http.core_route(
        HttpMethod::Get,
        EXTENSIONS_PATH,
        handler_fn(move |_| {
            let lifecycle = lifecycle.upgrade();
            async move {
                let lifecycle = lifecycle.ok_or_else(|| anyhow::anyhow!("host is shutting down"))?;
                Ok(json!({
                    "extensions": lifecycle.extensions(),
                    "failed": lifecycle.failed(),
                    "capabilities": lifecycle.capability_names(),
                }))
            }
        }),
    )?;
    http.core_route(
        HttpMethod::Get,
        DOCS_PATH,
        handler_fn(move |_| {
            let routes: Vec<_> = router.routes().into_iter().filter(|r| r.spec.include_in_docs).collect();
            let tags = docs.tags();
            async move { Ok(json!({ "tags": tags, "routes": routes })) }
        }),
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extension::NativeModule;
    use crate::extension::native::NativeFactory;
    use crate::scheduler::JobScheduler;

    fn config() -> HostConfig {
        HostConfig::new("/virtual/switchboard")
    }

    #[tokio::test]
    async fn core_routes_survive_extension_teardown() {
        let host = Host::bootstrap(config()).await.unwrap();
        let factory: NativeFactory = Arc::new(|| {
            NativeModule::new(&["http", "schedule"], |caps| {
                caps.http()?.get("/ping", handler_fn(|_| async { Ok(json!("pong")) }))?;
                caps.schedule()?.every(3600, "tick", handler_fn(|_| async { Ok(json!(null)) }))?;
                Ok(())
            })
            .display_name("Ping")
            .into_handle()
        });
        let plugins = host.config().plugins_dir.clone();
        host.lifecycle().load_native(plugins.join("core/ping"), factory).await.unwrap();
        assert_eq!(host.scheduler().jobs().len(), 1);
        assert_eq!(host.docs().tags().len(), 1);

        let listed = host.handle(HttpRequest::new(HttpMethod::Get, EXTENSIONS_PATH)).await;
        let listed = listed.response().cloned().unwrap();
        assert_eq!(listed["extensions"][0]["unique_name"], "ping");
        assert_eq!(listed["extensions"][0]["state"], "POST_REGISTERED");

        assert!(host.lifecycle().unregister("ping").await);
        assert!(host.scheduler().jobs().is_empty());
        assert!(host.docs().tags().is_empty());
        assert!(host.handle(HttpRequest::new(HttpMethod::Get, "/ping")).await.is_no_handler());

        let listed = host.handle(HttpRequest::new(HttpMethod::Get, EXTENSIONS_PATH)).await;
        assert_eq!(listed.response().unwrap()["extensions"], json!([]));
        let docs = host.handle(HttpRequest::new(HttpMethod::Get, DOCS_PATH)).await;
        assert_eq!(docs.response().unwrap()["routes"], json!([]));
        host.shutdown().await;
    }
}
