//! Path type used to key every cached node.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// An absolute path in the synchronized tree.
///
/// Folder paths end in `/` and documents do not. The path is stored as a
/// list of segments plus a folder flag, so parent/child walks never have to
/// slice strings.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct NodePath {
    components: Vec<String>,
    folder: bool,
}

impl NodePath {
    /// The root folder `/`.
    pub fn root() -> Self {
        Self {
            components: Vec::new(),
            folder: true,
        }
    }

    /// Parse an absolute path string.
    ///
    /// # Errors
    /// - Path does not start with `/`
    /// - Path contains an empty segment (`//`)
    pub fn parse(path: &str) -> crate::Result<Self> {
        let Some(rest) = path.strip_prefix('/') else {
            return Err(crate::Error::InvalidPath(format!(
                "path must start with a slash: {path:?}"
            )));
        };
        if rest.is_empty() {
            return Ok(Self::root());
        }

        let (inner, folder) = match rest.strip_suffix('/') {
            Some(inner) => (inner, true),
            None => (rest, false),
        };

        let mut components = Vec::new();
        for segment in inner.split('/') {
            if segment.is_empty() {
                return Err(crate::Error::InvalidPath(format!(
                    "empty path segment in {path:?}"
                )));
            }
            components.push(segment.to_string());
        }

        Ok(Self { components, folder })
    }

    /// Check if this is the root path.
    pub fn is_root(&self) -> bool {
        self.components.is_empty()
    }

    /// Folder paths end in a slash.
    pub fn is_folder(&self) -> bool {
        self.folder
    }

    /// Document paths do not end in a slash.
    pub fn is_document(&self) -> bool {
        !self.folder
    }

    /// The containing folder, or `None` for the root.
    pub fn parent(&self) -> Option<Self> {
        if self.is_root() {
            return None;
        }
        let mut components = self.components.clone();
        components.pop();
        Some(Self {
            components,
            folder: true,
        })
    }

    /// Name of this node as listed in its parent's items map.
    ///
    /// Folder names keep their trailing slash (`"photos/"`).
    pub fn item_name(&self) -> Option<String> {
        let last = self.components.last()?;
        if self.folder {
            Some(format!("{last}/"))
        } else {
            Some(last.clone())
        }
    }

    /// Resolve an item name relative to this folder.
    ///
    /// # Errors
    /// - `self` is a document
    /// - `item` is empty or contains a slash other than a trailing one
    pub fn join(&self, item: &str) -> crate::Result<Self> {
        if !self.folder {
            return Err(crate::Error::InvalidPath(format!(
                "cannot join {item:?} onto document path {self}"
            )));
        }
        let (name, folder) = match item.strip_suffix('/') {
            Some(name) => (name, true),
            None => (item, false),
        };
        if name.is_empty() || name.contains('/') {
            return Err(crate::Error::InvalidPath(format!(
                "invalid item name {item:?}"
            )));
        }
        let mut components = self.components.clone();
        components.push(name.to_string());
        Ok(Self { components, folder })
    }

    /// This path followed by every ancestor up to and including the root.
    ///
    /// `/a/b/c` yields `/a/b/c`, `/a/b/`, `/a/`, `/`.
    pub fn paths_from_root(&self) -> Vec<Self> {
        let mut paths = Vec::with_capacity(self.components.len() + 1);
        let mut current = Some(self.clone());
        while let Some(path) = current {
            current = path.parent();
            paths.push(path);
        }
        paths
    }

    /// Strict ancestor check: `/a/` is an ancestor of `/a/b` but not of itself.
    pub fn is_ancestor_of(&self, other: &Self) -> bool {
        self.folder
            && other.components.len() > self.components.len()
            && other.components[..self.components.len()] == self.components[..]
    }

    /// Number of segments below the root.
    pub fn depth(&self) -> usize {
        self.components.len()
    }

    /// Path segments without slashes.
    pub fn components(&self) -> &[String] {
        &self.components
    }

    /// Whether the path lives under `/public/`.
    pub fn is_public(&self) -> bool {
        self.components.first().map(String::as_str) == Some("public")
    }

    /// Top-level scope this path belongs to, ignoring a leading `/public/`.
    ///
    /// Returns `None` for paths that sit directly in the root, which only
    /// the `*` scope covers.
    pub fn scope(&self) -> Option<&str> {
        let rest = if self.is_public() {
            &self.components[1..]
        } else {
            &self.components[..]
        };
        match rest.len() {
            0 => None,
            1 if !self.folder => None,
            _ => Some(rest[0].as_str()),
        }
    }

    /// Convert to a string representation.
    pub fn to_string_path(&self) -> String {
        if self.is_root() {
            return "/".to_string();
        }
        let mut out = format!("/{}", self.components.join("/"));
        if self.folder {
            out.push('/');
        }
        out
    }
}

impl fmt::Display for NodePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_string_path())
    }
}

impl FromStr for NodePath {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for NodePath {
    type Error = crate::Error;

    fn try_from(value: String) -> crate::Result<Self> {
        Self::parse(&value)
    }
}

impl From<NodePath> for String {
    fn from(path: NodePath) -> Self {
        path.to_string_path()
    }
}
