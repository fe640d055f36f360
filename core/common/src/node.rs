//! Cached node data model.
//!
//! A node holds up to four revision slots:
//! - `common`: the state last known to agree between local and remote
//! - `local`: a pending local modification
//! - `remote`: a freshly observed remote state not yet merged
//! - `push`: the snapshot of `local` currently in flight to the remote

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;

use crate::types::NodePath;

/// Folder listing: item name to presence flag.
///
/// `false` is a tombstone meaning "known deleted locally".
pub type ItemsMap = BTreeMap<String, bool>;

/// Result of a node store read, or the write set of a node store write.
///
/// `None` means the node is absent (on read) or must be deleted (on write).
pub type NodeMap = BTreeMap<NodePath, Option<Node>>;

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Document body as held in a revision slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Body {
    /// The document is deleted (pending local delete, or confirmed gone remotely).
    Deleted,
    /// Document bytes.
    Content(Vec<u8>),
}

impl Body {
    /// Borrow the bytes, if this is not a delete marker.
    pub fn content(&self) -> Option<&[u8]> {
        match self {
            Body::Content(bytes) => Some(bytes),
            Body::Deleted => None,
        }
    }

    /// Clone the bytes out, if this is not a delete marker.
    pub fn to_content(&self) -> Option<Vec<u8>> {
        self.content().map(<[u8]>::to_vec)
    }

    pub fn is_deleted(&self) -> bool {
        matches!(self, Body::Deleted)
    }
}

impl From<Vec<u8>> for Body {
    fn from(bytes: Vec<u8>) -> Self {
        Body::Content(bytes)
    }
}

impl From<&str> for Body {
    fn from(text: &str) -> Self {
        Body::Content(text.as_bytes().to_vec())
    }
}

// Delete markers persist as `false`, content as a base64 string.
impl Serialize for Body {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Body::Deleted => serializer.serialize_bool(false),
            Body::Content(bytes) => serializer.serialize_str(&STANDARD.encode(bytes)),
        }
    }
}

impl<'de> Deserialize<'de> for Body {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Flag(bool),
            Encoded(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Flag(false) => Ok(Body::Deleted),
            Raw::Flag(true) => Err(serde::de::Error::custom(
                "document body cannot be `true`",
            )),
            Raw::Encoded(encoded) => STANDARD
                .decode(encoded)
                .map(Body::Content)
                .map_err(serde::de::Error::custom),
        }
    }
}

/// One revision slot of a node.
///
/// Document slots use `body` and `content_type`; folder slots use
/// `items_map`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Slot {
    /// Opaque version tag (ETag) agreed with or observed on the remote.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<String>,
    /// When this slot was last confirmed, in epoch milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Body>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_length: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items_map: Option<ItemsMap>,
    /// Body this slot replaced; only set while a local write is in progress.
    #[serde(skip)]
    pub previous_body: Option<Vec<u8>>,
    #[serde(skip)]
    pub previous_content_type: Option<String>,
}

impl Slot {
    /// Empty slot carrying only a timestamp.
    pub fn stamped(timestamp: i64) -> Self {
        Self {
            timestamp: Some(timestamp),
            ..Self::default()
        }
    }

    /// Slot announcing a remote revision whose content is not fetched yet.
    pub fn revision_only(revision: impl Into<String>, timestamp: i64) -> Self {
        Self {
            revision: Some(revision.into()),
            timestamp: Some(timestamp),
            ..Self::default()
        }
    }

    /// Document bytes, if present and not a delete marker.
    pub fn content(&self) -> Option<&[u8]> {
        self.body.as_ref().and_then(Body::content)
    }

    pub fn is_delete_marker(&self) -> bool {
        matches!(self.body, Some(Body::Deleted))
    }

    /// Whether the slot says anything about the resource beyond a timestamp.
    pub fn has_state(&self) -> bool {
        self.revision.is_some() || self.body.is_some() || self.items_map.is_some()
    }
}

/// A cached node keyed by its path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub path: NodePath,
    #[serde(default)]
    pub common: Slot,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local: Option<Slot>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote: Option<Slot>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub push: Option<Slot>,
}

impl Node {
    /// Fresh node for a path that is about to be written locally.
    ///
    /// Folder nodes start with an empty common listing.
    pub fn new(path: NodePath) -> Self {
        let mut common = Slot::default();
        if path.is_folder() {
            common.items_map = Some(ItemsMap::new());
        }
        Self {
            path,
            common,
            local: None,
            remote: None,
            push: None,
        }
    }

    /// Node with a completely empty common slot.
    pub fn bare(path: NodePath) -> Self {
        Self {
            path,
            common: Slot::default(),
            local: None,
            remote: None,
            push: None,
        }
    }

    /// A node with no common, local, remote or push state left.
    pub fn is_empty(&self) -> bool {
        !self.common.has_state()
            && self.local.is_none()
            && self.remote.is_none()
            && self.push.is_none()
    }
}
