// src/docs.rs
use std::sync::{PoisonError, RwLock};

use serde::Serialize;

use crate::provenance::{Provenance, SourceRoot};

/// One documentation tag, usually one per extension with documented routes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DocTag {
    pub name: String,
    pub description: String,
    pub extension: String,
    #[serde(skip)]
    pub provenance: Provenance,
}

/// The API-documentation collaborator.
pub trait ApiDocs: Send + Sync {
    /// Insert or replace the tag with the same name.
    fn publish(&self, tag: DocTag);
    /// Drop every tag owned by an extension under `root`.
    fn retract_within(&self, root: &SourceRoot) -> usize;
    fn tags(&self) -> Vec<DocTag>;
}

#[derive(Default)]
pub struct TagRegistry {
    tags: RwLock<Vec<DocTag>>,
}

impl TagRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ApiDocs for TagRegistry {
    fn publish(&self, tag: DocTag) {
        let mut tags = self.tags.write().unwrap_or_else(PoisonError::into_inner);
        match tags.iter_mut().find(|t| t.name == tag.name) {
            Some(existing) => *existing = tag,
            None => tags.push(tag),
        }
    }

    fn retract_within(&self, root: &SourceRoot) -> usize {
        let mut tags = self.tags.write().unwrap_or_else(PoisonError::into_inner);
        let before = tags.len();
        tags.retain(|t| !root.contains(&t.provenance));
        before - tags.len()
    }

    fn tags(&self) -> Vec<DocTag> {
        self.tags.read().unwrap_or_else(PoisonError::into_inner).clone()
    }
}
