//! Storage contracts for Strata.
//!
//! This module provides the two collaborator interfaces the sync engine
//! consumes, plus reference implementations:
//! - [`NodeStore`]: persistence for cached nodes ([`MemoryStore`],
//!   [`JsonFileStore`]), resolvable by name through [`StoreRegistry`]
//! - [`RemoteClient`]: conditional get/put/delete against a key/value
//!   server ([`MemoryRemote`])
//!
//! # Design Principles
//! - Backend isolation: the sync engine never sees storage specifics
//! - Async operations: all I/O operations are async
//! - Deterministic addressing: a node is found by its path alone

pub mod local;
pub mod memory;
pub mod registry;
pub mod remote;
pub mod store;

pub use local::JsonFileStore;
pub use memory::MemoryStore;
pub use registry::{create_default_registry, StoreFactory, StoreRegistry};
pub use remote::memory::{MemoryRemote, RecordedRequest};
pub use remote::{Method, RemoteClient, RequestOptions, Response, Status};
pub use store::NodeStore;
