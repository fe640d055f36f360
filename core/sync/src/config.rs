//! Synchronizer configuration.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use strata_common::Result;

use crate::events::Origin;

/// Remote backend kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// A remoteStorage server.
    #[default]
    RemoteStorage,
    /// Dropbox; public documents are written remote-first so a share link
    /// can be generated from the authoritative revision.
    Dropbox,
}

/// Which change event origins are delivered to subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChangeEventsConfig {
    pub local: bool,
    pub window: bool,
    pub remote: bool,
    pub conflict: bool,
}

impl Default for ChangeEventsConfig {
    fn default() -> Self {
        Self {
            local: true,
            window: false,
            remote: true,
            conflict: true,
        }
    }
}

impl ChangeEventsConfig {
    /// Whether events of this origin are enabled.
    pub fn enabled(&self, origin: Origin) -> bool {
        match origin {
            Origin::Local => self.local,
            Origin::Window => self.window,
            Origin::Remote => self.remote,
            Origin::Conflict => self.conflict,
        }
    }
}

/// Configuration for the local cache and synchronizer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Concurrent task slots while the remote is online.
    pub num_threads: usize,
    /// Foreground sync cadence; also the refresh age threshold.
    #[serde(with = "millis")]
    pub sync_interval: Duration,
    /// Sync cadence while running in the background.
    #[serde(with = "millis")]
    pub background_sync_interval: Duration,
    pub is_background: bool,
    /// Per-request timeout, reported as a `timeout` status.
    #[serde(with = "millis")]
    pub request_timeout: Duration,
    /// Upper bound on tasks collected by one diff scan.
    pub max_diff_tasks: usize,
    /// Log a warning when a storage commit is pending this long.
    #[serde(with = "millis")]
    pub slow_commit_warning: Duration,
    pub change_events: ChangeEventsConfig,
    pub backend: Backend,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            num_threads: 10,
            sync_interval: Duration::from_secs(10),
            background_sync_interval: Duration::from_secs(60),
            is_background: false,
            request_timeout: Duration::from_secs(30),
            max_diff_tasks: 100,
            slow_commit_warning: Duration::from_secs(10),
            change_events: ChangeEventsConfig::default(),
            backend: Backend::default(),
        }
    }
}

impl SyncConfig {
    /// Interval the scheduler should currently use.
    pub fn current_sync_interval(&self) -> Duration {
        if self.is_background {
            self.background_sync_interval
        } else {
            self.sync_interval
        }
    }

    /// Load a configuration from a JSON file. Missing fields take defaults.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = tokio::fs::read_to_string(path).await?;
        Ok(serde_json::from_str(&content)?)
    }
}

/// Durations are written as integer milliseconds.
mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
