//! Structural validation of cached nodes and server folder listings.

use serde_json::Value;
use std::collections::BTreeMap;

use strata_common::{ItemsMap, Node, Slot};

/// One entry of a server folder listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListingItem {
    pub revision: String,
    pub content_type: Option<String>,
    pub content_length: Option<u64>,
}

/// Server folder listing keyed by item name (folders end in `/`).
pub type ServerListing = BTreeMap<String, ListingItem>;

/// Whether an item name is usable as a child of a folder.
pub fn valid_item_name(name: &str) -> bool {
    let bare = name.strip_suffix('/').unwrap_or(name);
    !bare.is_empty() && !bare.contains('/')
}

/// A folder listing is corrupt if any name is unusable.
pub fn corrupt_items_map(items: &ItemsMap) -> bool {
    items.keys().any(|name| !valid_item_name(name))
}

/// Whether a single revision slot has an impossible shape.
pub fn corrupt_revision(slot: &Slot, folder: bool) -> bool {
    if slot.revision.as_deref() == Some("") {
        return true;
    }
    if slot.timestamp.is_some_and(|ts| ts < 0) {
        return true;
    }
    if folder {
        slot.body.is_some()
            || slot.content_type.is_some()
            || slot.items_map.as_ref().is_some_and(corrupt_items_map)
    } else {
        slot.items_map.is_some()
    }
}

/// A node is corrupt if any of its slots is.
///
/// Corrupt nodes are never pushed or merged; they are re-fetched.
pub fn is_corrupt(node: &Node) -> bool {
    let folder = node.path.is_folder();
    corrupt_revision(&node.common, folder)
        || [&node.local, &node.remote, &node.push]
            .into_iter()
            .flatten()
            .any(|slot| corrupt_revision(slot, folder))
}

/// Validate a raw server listing object.
///
/// With `strict` (the 0.2 listing format), document entries must also carry
/// a content type and length.
pub fn corrupt_server_items_map(listing: &Value, strict: bool) -> bool {
    let Some(items) = listing.as_object() else {
        return true;
    };
    for (name, item) in items {
        let Some(item) = item.as_object() else {
            return true;
        };
        if !item.get("ETag").is_some_and(Value::is_string) {
            return true;
        }
        if !valid_item_name(name) {
            return true;
        }
        if strict && !name.ends_with('/') {
            if !item.get("Content-Type").is_some_and(Value::is_string) {
                return true;
            }
            if !item.get("Content-Length").is_some_and(Value::is_number) {
                return true;
            }
        }
    }
    false
}

/// Parse a folder GET body into a listing.
///
/// Accepts both the bare `{name: {...}}` object and the 0.2 wrapper
/// `{"@context": ..., "items": {...}}`. An absent or empty body is an
/// empty listing. Returns `None` if the listing is corrupt.
pub fn parse_server_listing(body: Option<&[u8]>) -> Option<ServerListing> {
    let body = match body {
        Some(body) if !body.is_empty() => body,
        _ => return Some(ServerListing::new()),
    };
    let value: Value = serde_json::from_slice(body).ok()?;

    let (items, strict) = match value.get("items") {
        Some(items) if value.get("@context").is_some() => (items.clone(), true),
        _ => (value, false),
    };
    if corrupt_server_items_map(&items, strict) {
        return None;
    }

    let object = items.as_object()?;
    Some(
        object
            .iter()
            .map(|(name, item)| {
                let revision = item
                    .get("ETag")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                let entry = ListingItem {
                    revision,
                    content_type: item
                        .get("Content-Type")
                        .and_then(Value::as_str)
                        .map(str::to_string),
                    content_length: item.get("Content-Length").and_then(Value::as_u64),
                };
                (name.clone(), entry)
            })
            .collect(),
    )
}
