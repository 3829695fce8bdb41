//! Project-relative paths.
//!
//! Every stack, watched file and changed file is addressed by a [`ProjectPath`]:
//! an absolute, `/`-separated path rooted at the project root (`/` is the root
//! itself). Paths are normalized on construction so equality and ordering are
//! plain string comparisons.

use std::fmt;
use std::path::{Component, Path, PathBuf};

use serde::{Serialize, Serializer};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PathError {
    #[error("project path must be absolute: {0:?}")]
    NotAbsolute(String),

    #[error("path {0:?} escapes the project root")]
    EscapesRoot(String),
}

/// Normalized absolute path inside the project.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProjectPath(String);

impl ProjectPath {
    /// The project root (`/`).
    pub fn root() -> Self {
        Self("/".to_string())
    }

    /// Parse an absolute project path, resolving `.` and `..` segments.
    pub fn new(raw: &str) -> Result<Self, PathError> {
        if !raw.starts_with('/') {
            return Err(PathError::NotAbsolute(raw.to_string()));
        }
        normalize(Vec::new(), raw).ok_or_else(|| PathError::EscapesRoot(raw.to_string()))
    }

    /// Resolve `reference` against `self`: absolute references are taken as-is,
    /// relative ones are joined onto this path.
    pub fn resolve(&self, reference: &str) -> Result<Self, PathError> {
        if reference.starts_with('/') {
            return Self::new(reference);
        }
        normalize(self.segments().collect(), reference)
            .ok_or_else(|| PathError::EscapesRoot(format!("{}/{}", self.0, reference)))
    }

    /// Convert a host path below `root` into a project path.
    pub fn from_host(root: &Path, host: &Path) -> Option<Self> {
        let rel = host.strip_prefix(root).ok()?;
        let mut segments = Vec::new();
        for component in rel.components() {
            match component {
                Component::Normal(part) => segments.push(part.to_str()?.to_string()),
                Component::CurDir => {}
                _ => return None,
            }
        }
        Some(Self::from_segments(&segments))
    }

    /// Parse a root-relative path as printed by git (`dir/file.tf`).
    pub fn from_repo_relative(rel: &str) -> Result<Self, PathError> {
        normalize(Vec::new(), rel).ok_or_else(|| PathError::EscapesRoot(rel.to_string()))
    }

    /// Host filesystem location of this path under `root`.
    pub fn to_host(&self, root: &Path) -> PathBuf {
        let mut out = root.to_path_buf();
        for segment in self.segments() {
            out.push(segment);
        }
        out
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_root(&self) -> bool {
        self.0 == "/"
    }

    /// Path segments, excluding the leading root.
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('/').filter(|s| !s.is_empty())
    }

    /// Final segment, or `None` for the root.
    pub fn file_name(&self) -> Option<&str> {
        self.segments().last()
    }

    /// Parent directory, or `None` for the root.
    pub fn parent(&self) -> Option<Self> {
        if self.is_root() {
            return None;
        }
        let segments: Vec<&str> = self.segments().collect();
        Some(Self::from_segments(&segments[..segments.len() - 1]))
    }

    /// Every ancestor from the parent up to and including the root.
    pub fn ancestors(&self) -> impl Iterator<Item = Self> {
        std::iter::successors(self.parent(), Self::parent)
    }

    /// True if `self` equals `other` or lies below it.
    pub fn is_within(&self, other: &Self) -> bool {
        if other.is_root() || self == other {
            return true;
        }
        self.0.starts_with(&other.0) && self.0.as_bytes().get(other.0.len()) == Some(&b'/')
    }

    pub fn join(&self, segment: &str) -> Self {
        if self.is_root() {
            Self(format!("/{segment}"))
        } else {
            Self(format!("{}/{segment}", self.0))
        }
    }

    fn from_segments<S: AsRef<str>>(segments: &[S]) -> Self {
        if segments.is_empty() {
            return Self::root();
        }
        let mut out = String::new();
        for segment in segments {
            out.push('/');
            out.push_str(segment.as_ref());
        }
        Self(out)
    }
}

fn normalize<'a>(mut base: Vec<&'a str>, raw: &'a str) -> Option<ProjectPath> {
    for part in raw.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                base.pop()?;
            }
            other => base.push(other),
        }
    }
    Some(ProjectPath::from_segments(&base))
}

impl fmt::Display for ProjectPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Serialize for ProjectPath {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}
