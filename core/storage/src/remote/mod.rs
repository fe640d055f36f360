//! Remote key/value client contract.

pub mod memory;

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt;

use strata_common::{NodePath, Result};

/// Outcome of a remote request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// The server answered with this HTTP status code.
    Http(u16),
    /// The request never reached the server.
    Offline,
    /// The request was abandoned after the configured timeout.
    Timeout,
}

impl Status {
    pub const OK: Status = Status::Http(200);
    pub const CREATED: Status = Status::Http(201);
    pub const NOT_MODIFIED: Status = Status::Http(304);
    pub const NOT_FOUND: Status = Status::Http(404);
    pub const PRECONDITION_FAILED: Status = Status::Http(412);

    /// HTTP code, if the server answered.
    pub fn code(&self) -> Option<u16> {
        match self {
            Status::Http(code) => Some(*code),
            Status::Offline | Status::Timeout => None,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Http(code) => write!(f, "{code}"),
            Status::Offline => write!(f, "offline"),
            Status::Timeout => write!(f, "timeout"),
        }
    }
}

/// Request verb.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Put,
    Delete,
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Method::Get => "GET",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
        };
        f.write_str(name)
    }
}

/// Conditional request headers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestOptions {
    /// Only apply if the current revision equals this one.
    pub if_match: Option<String>,
    /// Only apply if the current revision differs (`*`: only if absent).
    pub if_none_match: Option<String>,
}

impl RequestOptions {
    pub fn if_match(revision: impl Into<String>) -> Self {
        Self {
            if_match: Some(revision.into()),
            if_none_match: None,
        }
    }

    pub fn if_none_match(revision: impl Into<String>) -> Self {
        Self {
            if_match: None,
            if_none_match: Some(revision.into()),
        }
    }
}

/// Server response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: Status,
    pub body: Option<Vec<u8>>,
    pub content_type: Option<String>,
    /// Revision (ETag) of the resource after the request.
    pub revision: Option<String>,
}

impl Response {
    /// Response with only a status.
    pub fn status(status: Status) -> Self {
        Self {
            status,
            body: None,
            content_type: None,
            revision: None,
        }
    }

    /// Item names of a folder listing body.
    ///
    /// Returns an empty list when the body is missing or not a JSON object.
    pub fn item_names(&self) -> Vec<String> {
        self.body
            .as_deref()
            .and_then(|body| serde_json::from_slice::<BTreeMap<String, serde_json::Value>>(body).ok())
            .map(|items| items.into_keys().collect())
            .unwrap_or_default()
    }
}

/// Client for a remoteStorage-style key/value server.
///
/// Folder GETs return a JSON listing of item names to metadata
/// (`ETag`, `Content-Type`, `Content-Length`). All writes are conditional
/// on revisions through [`RequestOptions`].
#[async_trait]
pub trait RemoteClient: Send + Sync {
    /// Whether a remote account is configured.
    fn connected(&self) -> bool;

    /// Whether the remote is currently reachable.
    fn online(&self) -> bool;

    /// Whether authorization is implied by the transport, so a 401
    /// does not mean the session expired.
    fn implied_auth(&self) -> bool {
        false
    }

    /// Fetch a document or folder listing.
    ///
    /// # Errors
    /// - Transport failure (the caller treats this as offline)
    async fn get(&self, path: &NodePath, options: RequestOptions) -> Result<Response>;

    /// Store a document.
    async fn put(
        &self,
        path: &NodePath,
        body: Vec<u8>,
        content_type: &str,
        options: RequestOptions,
    ) -> Result<Response>;

    /// Remove a document.
    async fn delete(&self, path: &NodePath, options: RequestOptions) -> Result<Response>;
}
