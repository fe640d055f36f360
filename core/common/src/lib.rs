//! Common types shared across the Strata crates.
//!
//! This module provides the path type every cached node is keyed by, the
//! node data model with its revision slots, and the error taxonomy used by
//! the storage and sync layers.

pub mod error;
pub mod node;
pub mod types;

pub use error::{Error, Result};
pub use node::{now_millis, Body, ItemsMap, Node, NodeMap, Slot};
pub use types::NodePath;
