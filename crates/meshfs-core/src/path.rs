//! Absolute, `/`-separated filesystem paths.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{MeshFsError, Result};

/// An absolute path inside the mesh filesystem namespace.
///
/// Paths are always rooted at `/`, contain no empty components, and no
/// `.`/`..` segments. The string form is normalized on construction, so two
/// equal paths always compare equal byte-for-byte.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MeshPath(String);

impl MeshPath {
    /// The root path `/`.
    pub fn root() -> Self {
        MeshPath("/".to_string())
    }

    /// Parses and normalizes an absolute path.
    ///
    /// Duplicate separators are collapsed; trailing separators are dropped.
    pub fn new(raw: &str) -> Result<Self> {
        if raw.is_empty() {
            return Err(MeshFsError::InvalidArgument("path must not be empty".to_string()));
        }

        if !raw.starts_with('/') {
            return Err(MeshFsError::InvalidArgument(format!(
                "path must be absolute: {raw}"
            )));
        }

        let mut normalized = String::with_capacity(raw.len());

        for component in raw.split('/').filter(|c| !c.is_empty()) {
            if component == "." || component == ".." {
                return Err(MeshFsError::InvalidArgument(format!(
                    "path must not contain '.' or '..' components: {raw}"
                )));
            }

            normalized.push('/');
            normalized.push_str(component);
        }

        if normalized.is_empty() {
            normalized.push('/');
        }

        Ok(MeshPath(normalized))
    }

    /// Returns true for the root path.
    pub fn is_root(&self) -> bool {
        self.0 == "/"
    }

    /// The parent path, or `None` for root.
    pub fn parent(&self) -> Option<MeshPath> {
        if self.is_root() {
            return None;
        }

        match self.0.rfind('/') {
            Some(0) => Some(MeshPath::root()),
            Some(idx) => Some(MeshPath(self.0[..idx].to_string())),
            None => None,
        }
    }

    /// The final path component; empty for root.
    pub fn name(&self) -> &str {
        if self.is_root() {
            return "";
        }

        match self.0.rfind('/') {
            Some(idx) => &self.0[idx + 1..],
            None => "",
        }
    }

    /// Path components from root to leaf, without empty segments.
    pub fn components(&self) -> Vec<&str> {
        if self.is_root() {
            return Vec::new();
        }

        self.0.split('/').filter(|c| !c.is_empty()).collect()
    }

    /// Appends one component, producing a child path.
    pub fn child(&self, name: &str) -> MeshPath {
        debug_assert!(!name.is_empty() && !name.contains('/'));

        if self.is_root() {
            MeshPath(format!("/{name}"))
        } else {
            MeshPath(format!("{}/{name}", self.0))
        }
    }

    /// Whether this path lies strictly below `other` in the tree.
    pub fn is_subdirectory_of(&self, other: &MeshPath) -> bool {
        if self == other {
            return false;
        }

        if other.is_root() {
            return true;
        }

        self.0.starts_with(&other.0) && self.0.as_bytes().get(other.0.len()) == Some(&b'/')
    }

    /// Whether both paths denote the same entry.
    pub fn is_same(&self, other: &MeshPath) -> bool {
        self == other
    }

    /// The normalized string form.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MeshPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for MeshPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MeshPath({})", self.0)
    }
}

impl FromStr for MeshPath {
    type Err = MeshFsError;

    fn from_str(s: &str) -> Result<Self> {
        MeshPath::new(s)
    }
}
