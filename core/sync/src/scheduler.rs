//! Sync scheduling - manual, on-demand and periodic modes.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, RwLock};
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, error, info};

use strata_common::{Error, NodePath, Result};

use crate::engine::SyncReport;

/// Sync mode configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncMode {
    /// Manual sync only.
    Manual,
    /// Sync triggered by local changes.
    OnDemand,
    /// Sync at regular intervals.
    Periodic { interval: Duration },
    /// Both on-demand and periodic.
    Hybrid { interval: Duration },
}

impl SyncMode {
    fn interval(&self) -> Option<Duration> {
        match self {
            SyncMode::Periodic { interval } | SyncMode::Hybrid { interval } => Some(*interval),
            _ => None,
        }
    }

    fn reacts_to_changes(&self) -> bool {
        matches!(self, SyncMode::OnDemand | SyncMode::Hybrid { .. })
    }
}

/// Sync request types.
#[derive(Debug)]
pub enum SyncRequest {
    /// Sync everything the cache knows about.
    Full,
    /// Sync specific paths.
    Paths(Vec<NodePath>),
    /// Shutdown the scheduler.
    Shutdown,
}

type Reply = oneshot::Sender<Result<SyncReport>>;

/// Front end for requesting sync cycles.
pub struct SyncScheduler {
    mode: Arc<RwLock<SyncMode>>,
    request_tx: mpsc::Sender<(SyncRequest, Reply)>,
}

impl SyncScheduler {
    /// Create a scheduler with the given mode.
    ///
    /// The returned handle must be run for requests to be served.
    pub fn new(mode: SyncMode) -> (Self, SyncSchedulerHandle) {
        let (request_tx, request_rx) = mpsc::channel(100);
        let mode = Arc::new(RwLock::new(mode));

        let scheduler = Self {
            mode: mode.clone(),
            request_tx,
        };
        let handle = SyncSchedulerHandle {
            mode,
            request_rx: Some(request_rx),
            changes: None,
        };
        (scheduler, handle)
    }

    /// Request a full sync and wait for its report.
    pub async fn request_sync(&self) -> Result<SyncReport> {
        self.request(SyncRequest::Full).await
    }

    /// Request sync for specific paths.
    pub async fn request_paths_sync(&self, paths: Vec<NodePath>) -> Result<SyncReport> {
        self.request(SyncRequest::Paths(paths)).await
    }

    async fn request(&self, request: SyncRequest) -> Result<SyncReport> {
        let (response_tx, response_rx) = oneshot::channel();
        self.request_tx
            .send((request, response_tx))
            .await
            .map_err(|_| Error::Sync("scheduler not running".to_string()))?;
        response_rx
            .await
            .map_err(|_| Error::Sync("scheduler dropped the sync request".to_string()))?
    }

    /// Queue a sync for `paths` without waiting, if the mode reacts to
    /// changes.
    pub async fn notify_change(&self, paths: Vec<NodePath>) {
        let mode = self.mode.read().await.clone();
        if !mode.reacts_to_changes() {
            debug!("Change notification ignored (mode: {:?})", mode);
            return;
        }
        let (response_tx, _) = oneshot::channel();
        let _ = self
            .request_tx
            .send((SyncRequest::Paths(paths), response_tx))
            .await;
    }

    pub async fn set_mode(&self, mode: SyncMode) {
        *self.mode.write().await = mode;
    }

    pub async fn get_mode(&self) -> SyncMode {
        self.mode.read().await.clone()
    }

    pub async fn shutdown(&self) {
        let (response_tx, _) = oneshot::channel();
        let _ = self
            .request_tx
            .send((SyncRequest::Shutdown, response_tx))
            .await;
    }
}

/// Background half of the scheduler.
pub struct SyncSchedulerHandle {
    mode: Arc<RwLock<SyncMode>>,
    request_rx: Option<mpsc::Receiver<(SyncRequest, Reply)>>,
    changes: Option<broadcast::Receiver<NodePath>>,
}

impl SyncSchedulerHandle {
    /// Feed local diff notifications into on-demand syncs.
    pub fn with_changes(mut self, changes: broadcast::Receiver<NodePath>) -> Self {
        self.changes = Some(changes);
        self
    }

    /// Run the scheduler loop until shutdown.
    ///
    /// Spawn this in a tokio task. `sync_fn` runs one sync cycle.
    pub async fn run<F, Fut>(mut self, sync_fn: F)
    where
        F: Fn(SyncRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<SyncReport>> + Send,
    {
        let Some(mut request_rx) = self.request_rx.take() else {
            error!("Sync scheduler handle was already run");
            return;
        };
        let mut changes = self.changes.take();
        let mut current = self.mode.read().await.interval();
        let mut periodic = create_interval(current);
        let mut last_sync = Instant::now();

        info!("Sync scheduler started");

        loop {
            tokio::select! {
                received = request_rx.recv() => {
                    let Some((request, response_tx)) = received else {
                        info!("All schedulers dropped, stopping");
                        break;
                    };
                    if let SyncRequest::Shutdown = request {
                        info!("Received shutdown request");
                        break;
                    }
                    debug!("Processing sync request: {:?}", request);
                    let result = sync_fn(request).await;
                    last_sync = Instant::now();
                    let _ = response_tx.send(result);
                }

                _ = wait_for_periodic(&mut periodic) => {
                    debug!("Triggering periodic sync, {:?} since last", last_sync.elapsed());
                    match sync_fn(SyncRequest::Full).await {
                        Ok(report) => info!(
                            "Periodic sync finished: completed={}, {} tasks remaining",
                            report.completed, report.tasks_remaining
                        ),
                        Err(e) => error!("Periodic sync failed: {}", e),
                    }
                    last_sync = Instant::now();
                }

                changed = wait_for_change(&mut changes) => {
                    match changed {
                        Ok(path) => {
                            if self.mode.read().await.reacts_to_changes() {
                                debug!("Local change at {}, syncing", path);
                                if let Err(e) = sync_fn(SyncRequest::Full).await {
                                    error!("On-demand sync failed: {}", e);
                                }
                                last_sync = Instant::now();
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            debug!("Skipped {} change notifications", skipped);
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            changes = None;
                        }
                    }
                }
            }

            let expected = self.mode.read().await.interval();
            if expected != current {
                current = expected;
                periodic = create_interval(current);
            }
        }
    }
}

fn create_interval(period: Option<Duration>) -> Option<tokio::time::Interval> {
    period.map(|period| {
        let mut ticks = interval(period);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately; skip it.
        ticks.reset();
        ticks
    })
}

async fn wait_for_periodic(interval: &mut Option<tokio::time::Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn wait_for_change(
    changes: &mut Option<broadcast::Receiver<NodePath>>,
) -> std::result::Result<NodePath, broadcast::error::RecvError> {
    match changes {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn report() -> SyncReport {
        SyncReport {
            completed: true,
            tasks_remaining: 0,
            duration: Duration::from_millis(1),
        }
    }

    fn counting_run(
        handle: SyncSchedulerHandle,
        count: Arc<AtomicU32>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            handle
                .run(move |_request| {
                    let count = count.clone();
                    async move {
                        count.fetch_add(1, Ordering::SeqCst);
                        Ok(report())
                    }
                })
                .await;
        })
    }

    #[tokio::test]
    async fn test_mode_change() {
        let (scheduler, _handle) = SyncScheduler::new(SyncMode::Manual);
        scheduler
            .set_mode(SyncMode::Periodic {
                interval: Duration::from_secs(60),
            })
            .await;
        assert!(matches!(scheduler.get_mode().await, SyncMode::Periodic { .. }));
    }

    #[tokio::test]
    async fn test_sync_request() {
        let (scheduler, handle) = SyncScheduler::new(SyncMode::Manual);
        let count = Arc::new(AtomicU32::new(0));
        let task = counting_run(handle, count.clone());

        let result = scheduler.request_sync().await.unwrap();
        assert!(result.completed);
        assert_eq!(count.load(Ordering::SeqCst), 1);

        scheduler.shutdown().await;
        let _ = task.await;
        assert!(scheduler.request_sync().await.is_err());
    }

    #[tokio::test]
    async fn test_periodic_sync() {
        let (scheduler, handle) = SyncScheduler::new(SyncMode::Periodic {
            interval: Duration::from_millis(20),
        });
        let count = Arc::new(AtomicU32::new(0));
        let task = counting_run(handle, count.clone());

        tokio::time::sleep(Duration::from_millis(110)).await;
        assert!(count.load(Ordering::SeqCst) >= 2);

        scheduler.shutdown().await;
        let _ = task.await;
    }

    #[tokio::test]
    async fn test_on_demand_reacts_to_changes() {
        let (scheduler, handle) = SyncScheduler::new(SyncMode::OnDemand);
        let (tx, rx) = broadcast::channel(16);
        let count = Arc::new(AtomicU32::new(0));
        let task = counting_run(handle.with_changes(rx), count.clone());

        tx.send(NodePath::parse("/a").unwrap()).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);

        scheduler.set_mode(SyncMode::Manual).await;
        tx.send(NodePath::parse("/b").unwrap()).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);

        scheduler.shutdown().await;
        let _ = task.await;
    }
}
