//! Access policy: which scopes this client may read or write.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::RwLock;
use tracing::debug;

use strata_common::{Error, NodePath, Result};

/// Scope that covers the whole tree.
pub const ROOT_SCOPE: &str = "*";

/// Access level claimed for a scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccessMode {
    #[serde(rename = "r")]
    Read,
    #[serde(rename = "rw")]
    ReadWrite,
}

impl AccessMode {
    /// Whether holding `self` satisfies a request for `wanted`.
    pub fn satisfies(self, wanted: AccessMode) -> bool {
        wanted == AccessMode::Read || self == AccessMode::ReadWrite
    }
}

/// Claimed scopes and their access modes.
#[derive(Debug, Default)]
pub struct Access {
    scopes: RwLock<BTreeMap<String, AccessMode>>,
}

impl Access {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim access to a scope. A later claim replaces an earlier one.
    ///
    /// # Errors
    /// - Scope is empty or contains characters other than
    ///   alphanumerics, `-` and `_` (except the `*` root scope)
    pub fn claim(&self, scope: &str, mode: AccessMode) -> Result<()> {
        validate_scope(scope)?;
        debug!("Claiming {:?} access to scope {}", mode, scope);
        self.write().insert(scope.to_string(), mode);
        Ok(())
    }

    /// Mode claimed for `scope`, if any.
    pub fn get(&self, scope: &str) -> Option<AccessMode> {
        self.read().get(scope).copied()
    }

    pub fn remove(&self, scope: &str) {
        self.write().remove(scope);
    }

    /// Whether `scope` was claimed with at least `mode`.
    pub fn check_permission(&self, scope: &str, mode: AccessMode) -> bool {
        self.get(scope).is_some_and(|actual| actual.satisfies(mode))
    }

    /// Whether `path` may be accessed with `mode`.
    ///
    /// The `*` scope grants every path; otherwise the path's top-level
    /// scope (ignoring a leading `/public/`) must be claimed.
    pub fn check_path_permission(&self, path: &NodePath, mode: AccessMode) -> bool {
        if self.check_permission(ROOT_SCOPE, mode) {
            return true;
        }
        match path.scope() {
            Some(scope) => self.check_permission(scope, mode),
            None => false,
        }
    }

    /// Folders that sync starts from.
    ///
    /// `*` yields only the root; every other scope yields its private and
    /// public folder.
    pub fn root_paths(&self) -> Vec<NodePath> {
        let scopes = self.read();
        if scopes.contains_key(ROOT_SCOPE) {
            return vec![NodePath::root()];
        }
        let mut paths = Vec::with_capacity(scopes.len() * 2);
        for scope in scopes.keys() {
            for raw in [format!("/{scope}/"), format!("/public/{scope}/")] {
                if let Ok(path) = NodePath::parse(&raw) {
                    paths.push(path);
                }
            }
        }
        paths
    }

    pub fn scopes(&self) -> Vec<(String, AccessMode)> {
        self.read()
            .iter()
            .map(|(scope, mode)| (scope.clone(), *mode))
            .collect()
    }

    /// Forget every claimed scope.
    pub fn reset(&self) {
        self.write().clear();
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<String, AccessMode>> {
        self.scopes.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, BTreeMap<String, AccessMode>> {
        self.scopes.write().unwrap_or_else(|e| e.into_inner())
    }
}

fn validate_scope(scope: &str) -> Result<()> {
    if scope == ROOT_SCOPE {
        return Ok(());
    }
    let valid = !scope.is_empty()
        && scope
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(Error::InvalidInput(format!("invalid scope name {scope:?}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(s: &str) -> NodePath {
        NodePath::parse(s).unwrap()
    }

    #[test]
    fn test_claim_and_check() {
        let access = Access::new();
        access.claim("contacts", AccessMode::Read).unwrap();
        access.claim("notes", AccessMode::ReadWrite).unwrap();

        assert!(access.check_permission("contacts", AccessMode::Read));
        assert!(!access.check_permission("contacts", AccessMode::ReadWrite));
        assert!(access.check_permission("notes", AccessMode::ReadWrite));
        assert!(!access.check_permission("other", AccessMode::Read));
    }

    #[test]
    fn test_claim_rejects_bad_scope() {
        let access = Access::new();
        assert!(access.claim("", AccessMode::Read).is_err());
        assert!(access.claim("a/b", AccessMode::Read).is_err());
        assert!(access.claim("*", AccessMode::Read).is_ok());
    }

    #[test]
    fn test_path_permission() {
        let access = Access::new();
        access.claim("notes", AccessMode::ReadWrite).unwrap();

        assert!(access.check_path_permission(&p("/notes/a"), AccessMode::ReadWrite));
        assert!(access.check_path_permission(&p("/public/notes/a"), AccessMode::ReadWrite));
        assert!(access.check_path_permission(&p("/notes/"), AccessMode::Read));
        assert!(!access.check_path_permission(&p("/contacts/a"), AccessMode::Read));
        assert!(!access.check_path_permission(&p("/"), AccessMode::Read));
    }

    #[test]
    fn test_root_scope_grants_everything() {
        let access = Access::new();
        access.claim("*", AccessMode::Read).unwrap();
        assert!(access.check_path_permission(&p("/anything/x"), AccessMode::Read));
        assert!(access.check_path_permission(&p("/"), AccessMode::Read));
        assert!(!access.check_path_permission(&p("/anything/x"), AccessMode::ReadWrite));
        assert_eq!(access.root_paths(), vec![NodePath::root()]);
    }

    #[test]
    fn test_root_paths_and_reset() {
        let access = Access::new();
        access.claim("notes", AccessMode::Read).unwrap();
        let roots: Vec<String> = access.root_paths().into_iter().map(String::from).collect();
        assert_eq!(roots, vec!["/notes/", "/public/notes/"]);

        access.remove("notes");
        assert!(access.get("notes").is_none());

        access.claim("a", AccessMode::Read).unwrap();
        access.reset();
        assert!(access.scopes().is_empty());
    }
}
