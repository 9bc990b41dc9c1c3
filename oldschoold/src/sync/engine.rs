use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use oldschool_core::Store;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, Interval, interval_at};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::backoff::Backoff;
use super::checkpoint::ProgressTracker;
use super::error::SyncError;
use super::lease::IdentityLease;
use super::materializer::Materializer;
use super::paths::{checkpoint_key, lease_key};
use super::processor::EventProcessor;
use super::snapshot::{Snapshot, SnapshotLoader};
use super::stats::Metrics;
use super::watcher::ChangeFeedWatcher;

pub const MIN_QUEUE_CAPACITY: usize = 128;
const ERROR_CHANNEL_CAPACITY: usize = 2;

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub agent: String,
    pub base_dir: PathBuf,
    pub base_key: String,
    pub queue_capacity: usize,
    /// Start from the stored checkpoint instead of a fresh snapshot when possible.
    pub resume: bool,
    pub prune_directories: bool,
    /// `None` runs without claiming the identity.
    pub lease_ttl: Option<Duration>,
}

impl SyncConfig {
    pub fn new(
        agent: impl Into<String>,
        base_dir: impl Into<PathBuf>,
        base_key: impl Into<String>,
    ) -> Self {
        Self {
            agent: agent.into(),
            base_dir: base_dir.into(),
            base_key: base_key.into(),
            queue_capacity: MIN_QUEUE_CAPACITY,
            resume: true,
            prune_directories: true,
            lease_ttl: Some(Duration::from_secs(30)),
        }
    }

    pub fn checkpoint_key(&self) -> String {
        checkpoint_key(&self.base_key, &self.agent)
    }

    pub fn lease_key(&self) -> String {
        lease_key(&self.base_key, &self.agent)
    }

    fn materializer(&self) -> Materializer {
        Materializer::new(&self.base_dir, &self.base_key).with_pruning(self.prune_directories)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartPoint {
    Snapshot,
    /// Watch from the index after the stored checkpoint.
    Resume(u64),
}

/// Keeps `base_dir` mirrored from `base_key` until cancelled or a session fails.
pub struct Synchronizer<S> {
    store: Arc<S>,
    config: SyncConfig,
    metrics: Arc<dyn Metrics>,
    cancel: CancellationToken,
    fallback: Backoff,
}

impl<S: Store> Synchronizer<S> {
    pub fn new(store: Arc<S>, config: SyncConfig, metrics: Arc<dyn Metrics>) -> Self {
        Self {
            store,
            config,
            metrics,
            cancel: CancellationToken::new(),
            fallback: Backoff::new(Duration::from_millis(250), Duration::from_secs(30)),
        }
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Pacing between snapshot sessions that keep losing the race against the feed.
    pub fn with_fallback_backoff(mut self, fallback: Backoff) -> Self {
        self.fallback = fallback;
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Returns `Ok` only when cancelled; every other exit is the error that ended the run.
    pub async fn run(&self) -> Result<(), SyncError> {
        let lease = self.claim_identity().await?;
        let result = self.run_sessions(lease.as_ref()).await;
        release_identity(lease).await;
        result
    }

    async fn claim_identity(&self) -> Result<Option<IdentityLease<S>>, SyncError> {
        match self.config.lease_ttl {
            Some(ttl) => {
                let key = self.config.lease_key();
                Ok(Some(IdentityLease::acquire(Arc::clone(&self.store), key, ttl).await?))
            }
            None => Ok(None),
        }
    }

    pub async fn decide_start(&self) -> Result<StartPoint, SyncError> {
        if !self.config.resume {
            return Ok(StartPoint::Snapshot);
        }
        let key = self.config.checkpoint_key();
        let mut tracker = ProgressTracker::new(Arc::clone(&self.store), key.clone());
        match tracker.read().await? {
            0 => Ok(StartPoint::Snapshot),
            u64::MAX => {
                warn!(key = %key, "checkpoint is at the last possible index, taking a snapshot");
                Ok(StartPoint::Snapshot)
            }
            index => Ok(StartPoint::Resume(index)),
        }
    }

    async fn run_sessions(&self, lease: Option<&IdentityLease<S>>) -> Result<(), SyncError> {
        let mut start = self.decide_start().await?;
        let mut fallback = self.fallback;
        loop {
            if self.cancel.is_cancelled() {
                return Ok(());
            }
            info!(agent = %self.config.agent, ?start, "starting session");
            let err = match self.run_session(start, lease).await {
                Err(err) if err.is_history_exhausted() => err,
                result => return result,
            };
            if start == StartPoint::Snapshot {
                // The feed outran a fresh snapshot; give the cluster time before refetching.
                let delay = fallback.next_delay().unwrap_or_default();
                warn!(
                    error = %err,
                    delay_ms = delay.as_millis() as u64,
                    "change history passed the snapshot index, retrying snapshot"
                );
                tokio::select! {
                    _ = self.cancel.cancelled() => return Ok(()),
                    _ = tokio::time::sleep(delay) => {}
                }
            } else {
                warn!(
                    error = %err,
                    "change history no longer covers the resume point, taking a snapshot"
                );
                start = StartPoint::Snapshot;
            }
        }
    }

    /// One watcher/processor pair. The watcher subscribes before anything is materialized,
    /// so the snapshot and the feed overlap instead of leaving a gap.
    pub async fn run_session(
        &self,
        start: StartPoint,
        lease: Option<&IdentityLease<S>>,
    ) -> Result<(), SyncError> {
        let materializer = self.config.materializer();
        materializer.create_directory(&self.config.base_key).await?;

        let (from_index, bootstrap) = match start {
            StartPoint::Resume(index) => (following_index(index)?, None),
            StartPoint::Snapshot => {
                let event = SnapshotLoader::fetch(&*self.store, &self.config.base_key).await?;
                let from_index = match event.etcd_index {
                    0 => 0,
                    index => following_index(index)?,
                };
                (from_index, Some(event))
            }
        };

        let session = self.cancel.child_token();
        let capacity = self.config.queue_capacity.max(MIN_QUEUE_CAPACITY);
        let (event_tx, event_rx) = mpsc::channel(capacity);
        let (error_tx, mut error_rx) = mpsc::channel(ERROR_CHANNEL_CAPACITY);
        let (ready_tx, ready_rx) = oneshot::channel();

        let watcher = ChangeFeedWatcher::new(Arc::clone(&self.store), self.config.base_key.clone())
            .spawn(from_index, event_tx, error_tx.clone(), session.clone());

        let processor = EventProcessor::new(
            materializer,
            ProgressTracker::new(Arc::clone(&self.store), self.config.checkpoint_key()),
            Arc::clone(&self.metrics),
        );
        let processor = tokio::spawn(processor.run(ready_rx, event_rx, error_tx, session.clone()));

        // The processor only exits early if it was cancelled.
        let _ = ready_tx.send(bootstrap);

        let result = self.supervise(&mut error_rx, lease, &session).await;
        session.cancel();
        let _ = watcher.await;
        let _ = processor.await;
        result
    }

    async fn supervise(
        &self,
        errors: &mut mpsc::Receiver<SyncError>,
        lease: Option<&IdentityLease<S>>,
        session: &CancellationToken,
    ) -> Result<(), SyncError> {
        let mut refresh = lease.map(|lease| {
            let period = lease.refresh_period();
            interval_at(Instant::now() + period, period)
        });
        loop {
            tokio::select! {
                _ = session.cancelled() => return Ok(()),
                err = errors.recv() => return match err {
                    Some(err) => Err(err),
                    None => Ok(()),
                },
                _ = next_tick(refresh.as_mut()) => {
                    if let Some(lease) = lease {
                        lease.refresh().await?;
                    }
                }
            }
        }
    }

    /// Mirrors a single snapshot and records its index, without watching.
    /// Holds the identity lease for the duration, like a full run.
    pub async fn materialize_once(&self) -> Result<Snapshot, SyncError> {
        let lease = self.claim_identity().await?;
        let result = self.load_and_record().await;
        release_identity(lease).await;
        result
    }

    async fn load_and_record(&self) -> Result<Snapshot, SyncError> {
        let loader = SnapshotLoader::new(self.config.materializer(), Arc::clone(&self.metrics));
        let snapshot = loader.load(&*self.store, &self.config.base_key).await?;
        let key = self.config.checkpoint_key();
        let mut tracker = ProgressTracker::new(Arc::clone(&self.store), key);
        if snapshot.max_index > 0 {
            tracker.advance(snapshot.max_index).await?;
        }
        Ok(snapshot)
    }
}

fn following_index(index: u64) -> Result<u64, SyncError> {
    index
        .checked_add(1)
        .ok_or(SyncError::IndexExhausted { index })
}

async fn release_identity<S: Store>(lease: Option<IdentityLease<S>>) {
    if let Some(lease) = lease {
        if let Err(err) = lease.release().await {
            warn!(error = %err, "failed to release identity lease");
        }
    }
}

async fn next_tick(interval: Option<&mut Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
#[path = "engine_tests.rs"]
mod tests;
