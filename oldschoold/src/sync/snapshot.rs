use std::sync::Arc;

use oldschool_core::{Action, Event, Node, Store, StoreError};
use tracing::{debug, info};

use super::error::SyncError;
use super::materializer::Materializer;
use super::paths::is_hidden_below;
use super::stats::{Counter, Metrics};

/// Outcome of a full snapshot load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Snapshot {
    /// Highest `modifiedIndex` among the mirrored nodes.
    pub max_index: u64,
    /// Store index the snapshot was read at; the feed continues after it.
    pub store_index: u64,
}

#[derive(Clone)]
pub struct SnapshotLoader {
    materializer: Materializer,
    metrics: Arc<dyn Metrics>,
}

impl SnapshotLoader {
    pub fn new(materializer: Materializer, metrics: Arc<dyn Metrics>) -> Self {
        Self {
            materializer,
            metrics,
        }
    }

    /// Reads the whole subtree. A missing root is an empty snapshot taken at the store
    /// index reported with the miss.
    pub async fn fetch<S: Store>(store: &S, key: &str) -> Result<Event, SyncError> {
        match store.get(key, true).await {
            Ok(event) => Ok(event),
            Err(StoreError::KeyNotFound { index, .. }) => {
                debug!(key, index, "watched root is absent, starting from an empty tree");
                let mut event = Event::new(Action::Get, Node::directory(key, Vec::new(), 0));
                event.etcd_index = index;
                Ok(event)
            }
            Err(err) => Err(err.into()),
        }
    }

    pub async fn load<S: Store>(&self, store: &S, key: &str) -> Result<Snapshot, SyncError> {
        let event = Self::fetch(store, key).await?;
        let max_index = self.apply_tree(&event.node).await?;
        info!(key, max_index, store_index = event.etcd_index, "snapshot applied");
        Ok(Snapshot {
            max_index,
            store_index: event.etcd_index,
        })
    }

    /// Materializes `root` and everything below it depth-first, returning the highest index
    /// seen. Reserved subtrees are skipped; the first failure aborts the walk.
    pub async fn apply_tree(&self, root: &Node) -> Result<u64, SyncError> {
        let base_key = self.materializer.base_key();
        let mut max_index = 0;
        let mut stack = vec![root];
        while let Some(node) = stack.pop() {
            if is_hidden_below(base_key, &node.key) {
                debug!(key = %node.key, "skipping reserved subtree");
                continue;
            }
            if node.dir {
                if self.materializer.create_directory(&node.key).await? {
                    self.metrics.incr(Counter::DirectoriesCreated);
                }
                stack.extend(node.nodes.iter().rev());
            } else {
                self.materializer
                    .write_value(&node.key, node.value.as_deref().unwrap_or_default())
                    .await?;
                self.metrics.incr(Counter::FilesWritten);
            }
            max_index = max_index.max(node.modified_index);
        }
        Ok(max_index)
    }
}
