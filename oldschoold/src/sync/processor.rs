use std::sync::Arc;

use oldschool_core::{Action, Event, Store};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use super::checkpoint::ProgressTracker;
use super::error::SyncError;
use super::materializer::{Materializer, Removed};
use super::paths::is_hidden_below;
use super::snapshot::SnapshotLoader;
use super::stats::{Counter, Metrics};

/// Applies queued events one at a time and advances the checkpoint after each.
pub struct EventProcessor<S> {
    materializer: Materializer,
    snapshot: SnapshotLoader,
    tracker: ProgressTracker<S>,
    metrics: Arc<dyn Metrics>,
}

impl<S: Store> EventProcessor<S> {
    pub fn new(
        materializer: Materializer,
        tracker: ProgressTracker<S>,
        metrics: Arc<dyn Metrics>,
    ) -> Self {
        Self {
            snapshot: SnapshotLoader::new(materializer.clone(), Arc::clone(&metrics)),
            materializer,
            tracker,
            metrics,
        }
    }

    pub fn tracker(&self) -> &ProgressTracker<S> {
        &self.tracker
    }

    /// Applies `event` to disk and returns the index it accounts for; 0 when nothing
    /// was mirrored.
    pub async fn apply(&self, event: &Event) -> Result<u64, SyncError> {
        let node = &event.node;
        match event.action {
            Action::Get => self.snapshot.apply_tree(node).await,
            Action::Set => {
                self.metrics.incr(Counter::SetsReceived);
                if self.is_reserved(&node.key) {
                    trace!(key = %node.key, "skipping reserved key");
                    return Ok(0);
                }
                if node.dir {
                    if self.materializer.create_directory(&node.key).await? {
                        self.metrics.incr(Counter::DirectoriesCreated);
                    }
                } else {
                    self.materializer
                        .write_value(&node.key, node.value.as_deref().unwrap_or_default())
                        .await?;
                    self.metrics.incr(Counter::FilesWritten);
                }
                self.metrics.incr(Counter::SetsProcessed);
                Ok(node.modified_index)
            }
            Action::Delete => {
                self.metrics.incr(Counter::DeletesReceived);
                if self.is_reserved(&node.key) {
                    trace!(key = %node.key, "skipping reserved key");
                    return Ok(0);
                }
                match self.materializer.remove(&node.key).await? {
                    Removed::File => self.metrics.incr(Counter::FilesDeleted),
                    Removed::Directory => self.metrics.incr(Counter::DirectoriesDeleted),
                    Removed::Absent => debug!(key = %node.key, "delete for absent entry"),
                }
                self.metrics.incr(Counter::DeletesProcessed);
                Ok(node.modified_index)
            }
        }
    }

    /// Applies `event`, then records its index before returning.
    pub async fn process(&mut self, event: &Event) -> Result<u64, SyncError> {
        let index = self.apply(event).await?;
        if index > 0 {
            self.tracker.advance(index).await?;
        }
        Ok(index)
    }

    /// Waits for `ready`, applies the bootstrap event it carries (if any), then drains
    /// `events` in order until cancelled, the queue closes, or an event fails.
    pub async fn run(
        mut self,
        ready: oneshot::Receiver<Option<Event>>,
        mut events: mpsc::Receiver<Event>,
        errors: mpsc::Sender<SyncError>,
        cancel: CancellationToken,
    ) {
        let bootstrap = tokio::select! {
            _ = cancel.cancelled() => return,
            ready = ready => match ready {
                Ok(bootstrap) => bootstrap,
                Err(_) => return,
            },
        };
        if let Some(event) = bootstrap {
            match self.process(&event).await {
                Ok(max_index) => info!(key = %event.node.key, max_index, "snapshot applied"),
                Err(err) => {
                    let _ = errors.send(err).await;
                    return;
                }
            }
        }

        loop {
            // Cancellation is only observed between events.
            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                event = events.recv() => match event {
                    Some(event) => event,
                    None => return,
                },
            };
            if let Err(err) = self.process(&event).await {
                debug!(
                    key = %event.node.key,
                    index = event.modified_index(),
                    error = %err,
                    "event failed"
                );
                let _ = errors.send(err).await;
                return;
            }
        }
    }

    fn is_reserved(&self, key: &str) -> bool {
        is_hidden_below(self.materializer.base_key(), key)
    }
}
