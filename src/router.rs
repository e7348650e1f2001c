// src/router.rs
//! The web-routing collaborator.
//!
//! The host only needs a narrow slice of a router: add and remove routes,
//! group them into per-extension namespaces, and answer "does this request
//! match that route". [`InMemoryRouter`] implements it with `{param}` templates.
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};

use dashmap::DashMap;
use serde::Serialize;

use crate::envelope::HttpMethod;
use crate::error::{HostError, HostResult};
use crate::provenance::Provenance;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct RouteId(pub u64);

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RouteSpec {
    pub method: HttpMethod,
    pub path: String,
    pub name: Option<String>,
    pub namespace: String,
    pub tags: Vec<String>,
    pub include_in_docs: bool,
    /// Opaque to the router; read back by teardown.
    pub provenance: Provenance,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RouteInfo {
    pub id: RouteId,
    #[serde(flatten)]
    pub spec: RouteSpec,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Namespace {
    pub name: String,
    pub tags: Vec<String>,
    pub provenance: Provenance,
}

pub type PathParams = BTreeMap<String, String>;

pub trait WebRouter: Send + Sync {
    fn create_namespace(&self, namespace: Namespace);
    fn remove_namespace(&self, name: &str) -> bool;
    fn namespaces(&self) -> Vec<Namespace>;

    fn add_route(&self, spec: RouteSpec) -> HostResult<RouteId>;
    fn remove_route(&self, id: RouteId) -> HostResult<()>;
    fn routes(&self) -> Vec<RouteInfo>;

    /// Path parameters when `method`/`path` hit route `id`.
    fn match_route(&self, id: RouteId, method: HttpMethod, path: &str) -> Option<PathParams>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Param(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathTemplate {
    segments: Vec<Segment>,
}

impl PathTemplate {
    pub fn parse(template: &str) -> HostResult<Self> {
        if !template.starts_with('/') {
            return Err(HostError::InvalidRoute(template.to_string()));
        }
        let mut segments = Vec::new();
        for raw in split_path(template) {
            let segment = match raw.strip_prefix('{').and_then(|s| s.strip_suffix('}')) {
                Some(name) if is_identifier(name) => Segment::Param(name.to_string()),
                Some(_) => return Err(HostError::InvalidRoute(template.to_string())),
                None if raw.contains(['{', '}']) => return Err(HostError::InvalidRoute(template.to_string())),
                None => Segment::Literal(raw.to_string()),
            };
            segments.push(segment);
        }
        Ok(Self { segments })
    }

    /// Parameter names erased, so `/a/{x}` and `/a/{y}` collide.
    pub fn shape(&self) -> String {
        let mut out = String::new();
        for s in &self.segments {
            out.push('/');
            match s {
                Segment::Literal(l) => out.push_str(l),
                Segment::Param(_) => out.push_str("{}"),
            }
        }
        if out.is_empty() {
            out.push('/');
        }
        out
    }

    pub fn matches(&self, path: &str) -> Option<PathParams> {
        let parts: Vec<&str> = split_path(path).collect();
        if parts.len() != self.segments.len() {
            return None;
        }
        let mut params = PathParams::new();
        for (segment, part) in self.segments.iter().zip(parts) {
            match segment {
                Segment::Literal(l) if l == part => {}
                Segment::Literal(_) => return None,
                Segment::Param(name) => {
                    params.insert(name.clone(), part.to_string());
                }
            }
        }
        Some(params)
    }
}

fn split_path(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|s| !s.is_empty())
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

struct RouteEntry {
    info: RouteInfo,
    template: PathTemplate,
}

#[derive(Default)]
pub struct InMemoryRouter {
    routes: RwLock<Vec<RouteEntry>>,
    namespaces: DashMap<String, Namespace>,
    next_id: AtomicU64,
}

impl InMemoryRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve a request against every route, in registration order.
    pub fn resolve(&self, method: HttpMethod, path: &str) -> Option<(RouteInfo, PathParams)> {
        self.routes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|e| e.info.spec.method == method)
            .find_map(|e| e.template.matches(path).map(|p| (e.info.clone(), p)))
    }
}

impl WebRouter for InMemoryRouter {
    fn create_namespace(&self, namespace: Namespace) {
        self.namespaces.insert(namespace.name.clone(), namespace);
    }

    fn remove_namespace(&self, name: &str) -> bool {
        self.namespaces.remove(name).is_some()
    }

    fn namespaces(&self) -> Vec<Namespace> {
        let mut all: Vec<Namespace> = self.namespaces.iter().map(|n| n.value().clone()).collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    fn add_route(&self, spec: RouteSpec) -> HostResult<RouteId> {
        let template = PathTemplate::parse(&spec.path)?;
        let shape = template.shape();

        let mut routes = self.routes.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = routes
            .iter()
            .find(|e| e.info.spec.method == spec.method && e.template.shape() == shape)
        {
            return Err(HostError::RouteConflict {
                method: spec.method,
                path: spec.path,
                owner: existing.info.spec.namespace.clone(),
            });
        }

        let id = RouteId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        routes.push(RouteEntry { info: RouteInfo { id, spec }, template });
        Ok(id)
    }

    fn remove_route(&self, id: RouteId) -> HostResult<()> {
        let mut routes = self.routes.write().unwrap_or_else(PoisonError::into_inner);
        let before = routes.len();
        routes.retain(|e| e.info.id != id);
        if routes.len() == before {
            return Err(HostError::InvalidRoute(format!("no route with id {}", id.0)));
        }
        Ok(())
    }

    fn routes(&self) -> Vec<RouteInfo> {
        self.routes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|e| e.info.clone())
            .collect()
    }

    fn match_route(&self, id: RouteId, method: HttpMethod, path: &str) -> Option<PathParams> {
        self.routes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|e| e.info.id == id)
            .filter(|e| e.info.spec.method == method)
            .and_then(|e| e.template.matches(path))
    }
}
