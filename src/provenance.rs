// src/provenance.rs
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Who created a registration.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Provenance {
    /// Host-owned. Never matched by teardown.
    Core,
    /// The canonical source root of an extension.
    Extension(PathBuf),
}

impl Provenance {
    pub fn path(&self) -> Option<&Path> {
        match self {
            Provenance::Core => None,
            Provenance::Extension(p) => Some(p),
        }
    }

    pub fn is_core(&self) -> bool {
        matches!(self, Provenance::Core)
    }
}

impl fmt::Display for Provenance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Provenance::Core => f.write_str("<core>"),
            Provenance::Extension(p) => write!(f, "{}", p.display()),
        }
    }
}

/// The resolved source location of one extension: a package directory or a single file.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct SourceRoot {
    path: PathBuf,
    is_dir: bool,
}

impl SourceRoot {
    pub fn new(path: impl Into<PathBuf>, is_dir: bool) -> Self {
        Self { path: path.into(), is_dir }
    }

    /// Canonicalize `path` so containment checks compare like with like.
    pub fn resolve(path: &Path) -> std::io::Result<Self> {
        let path = path.canonicalize()?;
        let is_dir = path.is_dir();
        Ok(Self { path, is_dir })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_dir(&self) -> bool {
        self.is_dir
    }

    pub fn provenance(&self) -> Provenance {
        Provenance::Extension(self.path.clone())
    }

    /// Component-wise containment for packages, exact match for single files.
    pub fn contains_path(&self, path: &Path) -> bool {
        if self.is_dir {
            path.starts_with(&self.path)
        } else {
            path == self.path
        }
    }

    pub fn contains(&self, provenance: &Provenance) -> bool {
        match provenance {
            Provenance::Core => false,
            Provenance::Extension(p) => self.contains_path(p),
        }
    }
}
