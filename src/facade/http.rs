// src/facade/http.rs
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::dispatcher::{DispatchGate, Dispatcher, Handler, Listener, Predicate, new_gate};
use crate::envelope::{ContextField, Envelope, EventKind, HttpMethod, MatchedRoute};
use crate::error::{HostError, HostResult};
use crate::provenance::Provenance;
use crate::router::{RouteId, RouteSpec, WebRouter};

use super::{Capability, CapabilityProvider, ExtensionScope, check_requires};

/// Router namespace of host-owned routes.
pub const CORE_NAMESPACE: &str = "_switchboard";

#[derive(Debug, Clone)]
pub struct RouteOptions {
    pub name: Option<String>,
    /// Defaults to the extension's display name.
    pub tags: Vec<String>,
    pub include_in_docs: bool,
    pub requires: Vec<ContextField>,
}

impl Default for RouteOptions {
    fn default() -> Self {
        Self { name: None, tags: Vec::new(), include_in_docs: true, requires: Vec::new() }
    }
}

impl RouteOptions {
    pub fn named(name: impl Into<String>) -> Self {
        Self { name: Some(name.into()), ..Default::default() }
    }

    pub fn requires(mut self, fields: &[ContextField]) -> Self {
        self.requires.extend_from_slice(fields);
        self
    }

    pub fn hidden(mut self) -> Self {
        self.include_in_docs = false;
        self
    }
}

/// Process-wide HTTP capability. `http`, `api` and `web` differ only in
/// prefix and documentation visibility.
#[derive(Clone)]
pub struct HttpCapability {
    dispatcher: Arc<Dispatcher>,
    router: Arc<dyn WebRouter>,
    prefix: String,
    include_in_docs: bool,
}

impl HttpCapability {
    pub fn new(dispatcher: Arc<Dispatcher>, router: Arc<dyn WebRouter>) -> Self {
        Self { dispatcher, router, prefix: String::new(), include_in_docs: true }
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into().trim_end_matches('/').to_string();
        self
    }

    pub fn undocumented(mut self) -> Self {
        self.include_in_docs = false;
        self
    }
}

impl HttpCapability {
    /// A host-owned route. Core provenance keeps it out of every teardown.
    pub fn core_route(&self, method: HttpMethod, path: &str, handler: Arc<dyn Handler>) -> HostResult<RouteId> {
        let id = self.router.add_route(RouteSpec {
            method,
            path: path.to_string(),
            name: None,
            namespace: CORE_NAMESPACE.to_string(),
            tags: Vec::new(),
            include_in_docs: false,
            provenance: Provenance::Core,
        })?;
        self.attach(id, method, path.to_string(), CORE_NAMESPACE, Provenance::Core, new_gate(), handler);
        Ok(id)
    }

    #[allow(clippy::too_many_arguments)]
    fn attach(
        &self,
        id: RouteId,
        method: HttpMethod,
        template: String,
        namespace: &str,
        provenance: Provenance,
        gate: DispatchGate,
        handler: Arc<dyn Handler>,
    ) {
        let label = format!("{method} {template}");
        let matcher = RouteMatcher {
            router: self.router.clone(),
            id,
            route: MatchedRoute { route_id: id.0, method, template, namespace: namespace.to_string() },
        };
        self.dispatcher.register(Listener {
            kind: EventKind::Request,
            predicate: Arc::new(matcher),
            handler,
            provenance,
            gate,
            label: label.clone(),
        });
        debug!(namespace, route = %label, "route registered");
    }
}

impl CapabilityProvider for HttpCapability {
    fn provide(&self, scope: &ExtensionScope) -> Capability {
        Capability::Http(HttpFacade { capability: self.clone(), scope: scope.clone() })
    }
}

/// HTTP façade bound to one extension.
#[derive(Clone)]
pub struct HttpFacade {
    capability: HttpCapability,
    scope: ExtensionScope,
}

impl HttpFacade {
    pub fn prefix(&self) -> &str {
        &self.capability.prefix
    }

    pub fn get(&self, path: &str, handler: Arc<dyn Handler>) -> HostResult<RouteId> {
        self.route(HttpMethod::Get, path, RouteOptions::default(), handler)
    }

    pub fn post(&self, path: &str, handler: Arc<dyn Handler>) -> HostResult<RouteId> {
        self.route(HttpMethod::Post, path, RouteOptions::default(), handler)
    }

    pub fn put(&self, path: &str, handler: Arc<dyn Handler>) -> HostResult<RouteId> {
        self.route(HttpMethod::Put, path, RouteOptions::default(), handler)
    }

    pub fn delete(&self, path: &str, handler: Arc<dyn Handler>) -> HostResult<RouteId> {
        self.route(HttpMethod::Delete, path, RouteOptions::default(), handler)
    }

    pub fn patch(&self, path: &str, handler: Arc<dyn Handler>) -> HostResult<RouteId> {
        self.route(HttpMethod::Patch, path, RouteOptions::default(), handler)
    }

    /// Add the route to the router under this extension's namespace, then the
    /// REQUEST record that answers it.
    pub fn route(
        &self,
        method: HttpMethod,
        path: &str,
        options: RouteOptions,
        handler: Arc<dyn Handler>,
    ) -> HostResult<RouteId> {
        check_requires(EventKind::Request, &options.requires)?;
        let template = self.full_path(path)?;

        let tags = if options.tags.is_empty() {
            vec![self.scope.display_name.clone()]
        } else {
            options.tags
        };
        let id = self.capability.router.add_route(RouteSpec {
            method,
            path: template.clone(),
            name: options.name,
            namespace: self.scope.unique_name.clone(),
            tags,
            include_in_docs: self.capability.include_in_docs && options.include_in_docs,
            provenance: self.scope.provenance(),
        })?;

        self.capability.attach(
            id,
            method,
            template,
            &self.scope.unique_name,
            self.scope.provenance(),
            self.scope.gate.clone(),
            handler,
        );
        Ok(id)
    }

    fn full_path(&self, path: &str) -> HostResult<String> {
        if !path.starts_with('/') {
            return Err(HostError::InvalidRoute(path.to_string()));
        }
        let prefix = &self.capability.prefix;
        Ok(match (prefix.is_empty(), path) {
            (true, _) => path.to_string(),
            (false, "/") => prefix.clone(),
            (false, _) => format!("{prefix}{path}"),
        })
    }
}

/// Re-runs router matching for one route and records the match on the context.
struct RouteMatcher {
    router: Arc<dyn WebRouter>,
    id: RouteId,
    route: MatchedRoute,
}

#[async_trait]
impl Predicate for RouteMatcher {
    async fn matches(&self, envelope: &Envelope) -> bool {
        let Some(request) = envelope.payload.as_request() else {
            return false;
        };
        match self.router.match_route(self.id, request.method, &request.path) {
            Some(params) => {
                envelope.context.set_matched_route(self.route.clone(), params);
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::{DispatchOutcome, handler_fn};
    use crate::envelope::HttpRequest;
    use crate::facade::test_support::scope;
    use crate::router::InMemoryRouter;
    use crate::signature::Signer;
    use serde_json::json;

    fn facade(capability: &HttpCapability, name: &str) -> HttpFacade {
        match capability.provide(&scope(name, &format!("/plugins/x/{name}"))) {
            Capability::Http(h) => h,
            _ => unreachable!(),
        }
    }

    fn get(path: &str) -> Envelope {
        Envelope::from_request(HttpRequest::new(HttpMethod::Get, path), &Signer::new("k"))
    }

    #[tokio::test]
    async fn route_answers_with_path_params() {
        let dispatcher = Arc::new(Dispatcher::new());
        let router = Arc::new(InMemoryRouter::new());
        let http = facade(&HttpCapability::new(dispatcher.clone(), router.clone()), "sensors");

        http.route(
            HttpMethod::Get,
            "/sensors/{id}",
            RouteOptions::default().requires(&[ContextField::PathParams]),
            handler_fn(|env: Envelope| async move { Ok(json!({ "id": env.context.path_param("id") })) }),
        )
        .unwrap();

        let envelope = get("/sensors/42");
        let outcome = dispatcher.dispatch(envelope.clone()).await;
        assert_eq!(outcome.response(), Some(&json!({ "id": "42" })));
        let matched = envelope.context.matched_route().unwrap();
        assert_eq!(matched.template, "/sensors/{id}");
        assert_eq!(matched.namespace, "sensors");

        let info = &router.routes()[0];
        assert_eq!(info.spec.tags, vec!["sensors".to_string()]);
        assert_eq!(info.spec.provenance.to_string(), "/plugins/x/sensors");
    }

    #[tokio::test]
    async fn api_prefix_is_applied() {
        let dispatcher = Arc::new(Dispatcher::new());
        let router = Arc::new(InMemoryRouter::new());
        let api = facade(&HttpCapability::new(dispatcher.clone(), router).with_prefix("/api/"), "status");
        assert_eq!(api.prefix(), "/api");

        api.get("/status", handler_fn(|_| async { Ok(json!("up")) })).unwrap();
        api.get("/", handler_fn(|_| async { Ok(json!("root")) })).unwrap();
        assert_eq!(dispatcher.dispatch(get("/api/status")).await.response(), Some(&json!("up")));
        assert_eq!(dispatcher.dispatch(get("/api")).await.response(), Some(&json!("root")));
        assert!(dispatcher.dispatch(get("/status")).await.is_no_handler());
    }

    #[tokio::test]
    async fn conflicting_route_is_rejected_without_a_record() {
        let dispatcher = Arc::new(Dispatcher::new());
        let capability = HttpCapability::new(dispatcher.clone(), Arc::new(InMemoryRouter::new()));
        facade(&capability, "first").get("/a", handler_fn(|_| async { Ok(json!(1)) })).unwrap();

        let err = facade(&capability, "second")
            .get("/a", handler_fn(|_| async { Ok(json!(2)) }))
            .unwrap_err();
        assert!(matches!(err, HostError::RouteConflict { ref owner, .. } if owner == "first"));
        assert_eq!(dispatcher.len(), 1);
        assert!(matches!(
            dispatcher.dispatch(get("/a")).await,
            DispatchOutcome::Handled { response, .. } if response == json!(1)
        ));
    }

    #[test]
    fn unsupported_requirement_and_bad_path_fail() {
        let dispatcher = Arc::new(Dispatcher::new());
        let http = facade(&HttpCapability::new(dispatcher.clone(), Arc::new(InMemoryRouter::new())), "x");
        let job_needed = RouteOptions::default().requires(&[ContextField::Job]);
        assert!(matches!(
            http.route(HttpMethod::Get, "/x", job_needed, handler_fn(|_| async { Ok(json!(null)) })),
            Err(HostError::UnsupportedContextField { .. })
        ));
        assert!(matches!(
            http.get("x", handler_fn(|_| async { Ok(json!(null)) })),
            Err(HostError::InvalidRoute(_))
        ));
        assert!(dispatcher.is_empty());
    }
}
