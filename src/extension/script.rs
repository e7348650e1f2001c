// src/extension/script.rs
//! Rhai extensions.
//!
//! A unit is either `<entry>.rhai` or a package directory `<entry>/` holding a
//! `main.rhai`. Loading compiles the entry, runs its top level once and reads
//! the metadata it declares:
//!
//! ```rhai
//! let display_name = "Status";
//! let description = "Reports that the host is alive";
//!
//! fn register(http, schedule) {
//!     http.get("/status", |event| #{ status: "ok" });
//!     schedule.every(60, "heartbeat", |event| print("still here"));
//! }
//! ```
//!
//! The parameter names of `register` are the capabilities the unit asks for.
//! Handlers are Rhai closures or `Fn("name")` pointers taking one argument:
//! a map with `kind`, `event`, `values` and, where relevant, `path_params`
//! and `job`. Whatever they return becomes the response.
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rhai::module_resolvers::FileModuleResolver;
use rhai::{AST, CallFnOptions, Dynamic, Engine, EvalAltResult, FnPtr, INT, ImmutableString, Scope};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::dispatcher::{Handler, HandlerResult};
use crate::envelope::{Envelope, EventKind, HttpMethod};
use crate::error::{HostError, HostResult};
use crate::facade::{Capabilities, Capability, HttpFacade, MessageFacade, RouteOptions, ScheduleFacade};
use crate::provenance::SourceRoot;
use crate::scheduler::TriggerSpec;

use super::loader::{ExtensionLoader, LoadedUnit, unit_stem};
use super::{CapabilityRequest, ExtensionMetadata, ExtensionModule};

pub const ENTRY_FILE: &str = "main.rhai";
const MAX_EXPR_DEPTH: usize = 64;
pub const SCRIPT_EXTENSION: &str = "rhai";

type ScriptResult<T> = Result<T, Box<EvalAltResult>>;

#[derive(Debug, Clone, Default)]
pub struct ScriptLoader {
    max_operations: Option<u64>,
}

impl ScriptLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Abort any single script evaluation after `limit` operations.
    pub fn with_max_operations(mut self, limit: Option<u64>) -> Self {
        self.max_operations = limit.filter(|l| *l > 0);
        self
    }

    fn engine(&self, name: &str, base: &Path) -> Engine {
        let mut engine = Engine::new();
        // Handlers are closures inside `register`, which debug builds' defaults reject
        // once they reach into `event.event.request...`.
        engine.set_max_expr_depths(MAX_EXPR_DEPTH, MAX_EXPR_DEPTH);
        if let Some(limit) = self.max_operations {
            engine.set_max_operations(limit);
        }
        engine.set_module_resolver(FileModuleResolver::new_with_path(base));

        let extension = name.to_string();
        engine.on_print(move |text| info!(extension = %extension, "{text}"));
        let extension = name.to_string();
        engine.on_debug(move |text, source, pos| {
            debug!(extension = %extension, source = source.unwrap_or_default(), position = %pos, "{text}")
        });

        register_api(&mut engine);
        engine
    }
}

/// The script a unit path runs, if it is a script unit at all.
pub fn entry_file(path: &Path) -> Option<PathBuf> {
    if path.is_dir() {
        let entry = path.join(ENTRY_FILE);
        return entry.is_file().then_some(entry);
    }
    let is_script = path.extension().and_then(|e| e.to_str()) == Some(SCRIPT_EXTENSION);
    (is_script && path.is_file()).then(|| path.to_path_buf())
}

impl ExtensionLoader for ScriptLoader {
    fn name(&self) -> &'static str {
        "rhai"
    }

    fn can_load(&self, path: &Path) -> bool {
        entry_file(path).is_some()
    }

    fn load(&self, path: &Path) -> HostResult<Option<LoadedUnit>> {
        let Some(entry) = entry_file(path) else {
            return Ok(None);
        };
        let root = SourceRoot::resolve(path)?;
        let name = unit_stem(path);
        let load_error = |reason: String| HostError::Load { path: path.to_path_buf(), reason };

        let base = if root.is_dir() {
            root.path().to_path_buf()
        } else {
            root.path().parent().map(Path::to_path_buf).unwrap_or_default()
        };
        let engine = self.engine(&name, &base);

        let mut ast = engine.compile_file(entry.clone()).map_err(|e| load_error(e.to_string()))?;
        ast.set_source(entry.display().to_string());

        let mut scope = Scope::new();
        engine
            .run_ast_with_scope(&mut scope, &ast)
            .map_err(|e| load_error(e.to_string()))?;

        let Some(params) = ast
            .iter_functions()
            .find(|f| f.name == "register")
            .map(|f| f.params.iter().map(|p| p.to_string()).collect::<Vec<String>>())
        else {
            warn!(path = %path.display(), "no `fn register(...)` found; skipping");
            return Ok(None);
        };

        let metadata = ExtensionMetadata {
            display_name: read_string(&scope, "display_name"),
            description: read_string(&scope, "description").unwrap_or_default(),
            author: read_string(&scope, "author"),
        };
        debug!(extension = %name, capabilities = ?params, "script compiled");

        let module = ScriptModule {
            runtime: ScriptRuntime { engine: Arc::new(engine), ast: Arc::new(ast), extension: name.clone() },
            scope: Mutex::new(scope),
            params,
            metadata,
        };
        Ok(Some(LoadedUnit { name, root, module: Arc::new(module) }))
    }
}

fn read_string(scope: &Scope, name: &str) -> Option<String> {
    scope.get_value::<ImmutableString>(name).map(|s| s.to_string())
}

#[derive(Clone)]
struct ScriptRuntime {
    engine: Arc<Engine>,
    ast: Arc<AST>,
    extension: String,
}

impl ScriptRuntime {
    fn invoke(&self, callback: &FnPtr, view: &Value) -> anyhow::Result<Value> {
        let arg = rhai::serde::to_dynamic(view).map_err(|e| anyhow!("cannot pass event to script: {e}"))?;
        let out: Dynamic = callback
            .call(&self.engine, &self.ast, (arg,))
            .map_err(|e| anyhow!("{} handler `{}`: {e}", self.extension, callback.fn_name()))?;
        if out.is_unit() {
            return Ok(Value::Null);
        }
        rhai::serde::from_dynamic(&out).map_err(|e| anyhow!("handler result is not JSON: {e}"))
    }

    fn handler(&self, callback: FnPtr) -> Arc<dyn Handler> {
        Arc::new(ScriptHandler { runtime: self.clone(), callback })
    }
}

struct ScriptModule {
    runtime: ScriptRuntime,
    scope: Mutex<Scope<'static>>,
    params: Vec<String>,
    metadata: ExtensionMetadata,
}

impl ScriptModule {
    fn argument(&self, name: &str, capabilities: &Capabilities) -> Dynamic {
        let runtime = self.runtime.clone();
        match capabilities.get(name) {
            Some(Capability::Http(facade)) => Dynamic::from(ScriptHttp { facade: facade.clone(), runtime }),
            Some(Capability::Schedule(facade)) => {
                Dynamic::from(ScriptSchedule { facade: facade.clone(), runtime })
            }
            Some(Capability::Message(facade)) => {
                Dynamic::from(ScriptMessage { facade: facade.clone(), runtime })
            }
            None => Dynamic::UNIT,
        }
    }
}

impl ExtensionModule for ScriptModule {
    fn metadata(&self) -> ExtensionMetadata {
        self.metadata.clone()
    }

    fn requested_capabilities(&self) -> Vec<CapabilityRequest> {
        self.params.iter().map(CapabilityRequest::required).collect()
    }

    fn register(&self, capabilities: &Capabilities) -> anyhow::Result<()> {
        let args: Vec<Dynamic> = self.params.iter().map(|p| self.argument(p, capabilities)).collect();
        let mut scope = self.scope.lock().unwrap_or_else(PoisonError::into_inner);
        let options = CallFnOptions::new().eval_ast(false).rewind_scope(true);
        let returned = self
            .runtime
            .engine
            .call_fn_with_options::<Dynamic>(options, &mut scope, &self.runtime.ast, "register", args)
            .map_err(|e| anyhow!("register failed: {e}"))?;
        if !returned.is_unit() {
            debug!(extension = %self.runtime.extension, value = %returned, "register returned a value; ignored");
        }
        Ok(())
    }

    fn kind(&self) -> &'static str {
        "rhai"
    }
}

/// Runs a Rhai handler on the blocking pool.
struct ScriptHandler {
    runtime: ScriptRuntime,
    callback: FnPtr,
}

#[async_trait]
impl Handler for ScriptHandler {
    async fn call(&self, envelope: Envelope) -> HandlerResult {
        let view = envelope.script_view();
        let runtime = self.runtime.clone();
        let callback = self.callback.clone();
        let value = tokio::task::spawn_blocking(move || runtime.invoke(&callback, &view))
            .await
            .map_err(|e| anyhow!("script handler did not complete: {e}"))??;

        // Message handlers reply by returning a value.
        if envelope.kind == EventKind::Message && !value.is_null() {
            envelope.context.respond(value.clone());
        }
        Ok(value)
    }
}

#[derive(Clone)]
pub struct ScriptHttp {
    facade: HttpFacade,
    runtime: ScriptRuntime,
}

impl ScriptHttp {
    fn add(&mut self, method: HttpMethod, path: &str, callback: FnPtr) -> ScriptResult<()> {
        self.facade
            .route(method, path, RouteOptions::default(), self.runtime.handler(callback))
            .map(|_| ())
            .map_err(|e| e.to_string().into())
    }
}

#[derive(Clone)]
pub struct ScriptSchedule {
    facade: ScheduleFacade,
    runtime: ScriptRuntime,
}

impl ScriptSchedule {
    fn every(&mut self, seconds: INT, name: &str, callback: FnPtr) -> ScriptResult<String> {
        let seconds = u64::try_from(seconds).map_err(|_| format!("interval must be positive, got {seconds}"))?;
        self.facade
            .every(seconds, name, self.runtime.handler(callback))
            .map_err(|e| e.to_string().into())
    }

    fn cron(&mut self, expression: &str, name: &str, callback: FnPtr) -> ScriptResult<String> {
        self.facade
            .cron(expression, name, self.runtime.handler(callback))
            .map_err(|e| e.to_string().into())
    }

    fn at(&mut self, when: &str, name: &str, callback: FnPtr) -> ScriptResult<String> {
        let at = DateTime::parse_from_rfc3339(when)
            .map_err(|e| format!("`{when}` is not an RFC 3339 timestamp: {e}"))?
            .with_timezone(&Utc);
        self.facade
            .job(TriggerSpec::at(at), crate::facade::JobOptions::named(name), self.runtime.handler(callback))
            .map_err(|e| e.to_string().into())
    }
}

#[derive(Clone)]
pub struct ScriptMessage {
    facade: MessageFacade,
    runtime: ScriptRuntime,
}

impl ScriptMessage {
    fn on(&mut self, tag: &str, callback: FnPtr) -> ScriptResult<()> {
        self.facade
            .on(tag, self.runtime.handler(callback))
            .map(|_| ())
            .map_err(|e| e.to_string().into())
    }
}

fn register_api(engine: &mut Engine) {
    engine.register_type_with_name::<ScriptHttp>("Http");
    for (name, method) in [
        ("get", HttpMethod::Get),
        ("post", HttpMethod::Post),
        ("put", HttpMethod::Put),
        ("delete", HttpMethod::Delete),
        ("patch", HttpMethod::Patch),
    ] {
        engine.register_fn(name, move |h: &mut ScriptHttp, path: &str, callback: FnPtr| {
            h.add(method, path, callback)
        });
    }
    engine.register_fn(
        "route",
        |h: &mut ScriptHttp, method: &str, path: &str, callback: FnPtr| -> ScriptResult<()> {
            let method: HttpMethod = method.parse().map_err(|e: String| -> Box<EvalAltResult> { e.into() })?;
            h.add(method, path, callback)
        },
    );
    engine.register_get("prefix", |h: &mut ScriptHttp| h.facade.prefix().to_string());

    engine.register_type_with_name::<ScriptSchedule>("Schedule");
    engine.register_fn("every", ScriptSchedule::every);
    engine.register_fn("cron", ScriptSchedule::cron);
    engine.register_fn("at", ScriptSchedule::at);

    engine.register_type_with_name::<ScriptMessage>("Message");
    engine.register_fn("on", ScriptMessage::on);
}
