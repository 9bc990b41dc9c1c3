use std::sync::Arc;

use oldschool_core::{Store, StoreError};
use tracing::debug;

use super::error::SyncError;

/// Durable cursor of the last fully applied index, kept inside the watched namespace.
///
/// The cached value is owned by whichever unit drives `advance`; there is only ever one
/// processor per agent identity, so no locking is involved.
pub struct ProgressTracker<S> {
    store: Arc<S>,
    key: String,
    known: Option<u64>,
}

impl<S: Store> ProgressTracker<S> {
    pub fn new(store: Arc<S>, key: impl Into<String>) -> Self {
        Self {
            store,
            key: key.into(),
            known: None,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Last value read or written by this tracker, if any.
    pub fn known(&self) -> Option<u64> {
        self.known
    }

    /// A missing checkpoint is index 0.
    pub async fn read(&mut self) -> Result<u64, SyncError> {
        let index = match self.store.get(&self.key, false).await {
            Ok(event) => {
                let raw = event.node.value.unwrap_or_default();
                raw.trim()
                    .parse::<u64>()
                    .map_err(|_| SyncError::CorruptCheckpoint {
                        key: self.key.clone(),
                        value: raw.clone(),
                    })?
            }
            Err(StoreError::KeyNotFound { .. }) => 0,
            Err(err) => return Err(err.into()),
        };
        self.known = Some(index);
        Ok(index)
    }

    /// Persists `index` if it is strictly greater than the stored value.
    ///
    /// Returns whether a write happened.
    pub async fn advance(&mut self, index: u64) -> Result<bool, SyncError> {
        let current = match self.known {
            Some(current) => current,
            None => self.read().await?,
        };
        if index <= current {
            debug!(key = %self.key, index, current, "checkpoint already at or past index");
            return Ok(false);
        }
        self.store
            .set(&self.key, &index.to_string())
            .await
            .map_err(|source| SyncError::CheckpointWrite {
                key: self.key.clone(),
                source,
            })?;
        self.known = Some(index);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::fake_store::FakeStore;

    const KEY: &str = "/base/_agents/_a";

    #[tokio::test]
    async fn missing_checkpoint_reads_as_zero() {
        let store = Arc::new(FakeStore::new());
        let mut tracker = ProgressTracker::new(store, KEY);
        assert_eq!(tracker.read().await.unwrap(), 0);
        assert_eq!(tracker.known(), Some(0));
    }

    #[tokio::test]
    async fn reads_decimal_value() {
        let store = Arc::new(FakeStore::new());
        store.put_value(KEY, "42", 50);
        let mut tracker = ProgressTracker::new(store, KEY);
        assert_eq!(tracker.read().await.unwrap(), 42);
    }

    #[tokio::test]
    async fn corrupt_value_is_an_error() {
        let store = Arc::new(FakeStore::new());
        store.put_value(KEY, "forty-two", 50);
        let mut tracker = ProgressTracker::new(store, KEY);
        assert!(matches!(
            tracker.read().await,
            Err(SyncError::CorruptCheckpoint { .. })
        ));
    }

    #[tokio::test]
    async fn advance_initializes_from_store_before_writing() {
        let store = Arc::new(FakeStore::new());
        store.put_value(KEY, "100", 101);
        let mut tracker = ProgressTracker::new(Arc::clone(&store), KEY);

        assert!(!tracker.advance(90).await.unwrap());
        assert_eq!(store.value(KEY).as_deref(), Some("100"));
        assert!(store.writes_to(KEY).is_empty());
    }

    #[tokio::test]
    async fn persisted_value_is_max_regardless_of_order() {
        for sequence in [
            vec![3u64, 9, 1, 9, 4],
            vec![9, 3, 1, 4],
            vec![1, 3, 4, 9],
        ] {
            let store = Arc::new(FakeStore::new());
            let mut tracker = ProgressTracker::new(Arc::clone(&store), KEY);
            for index in &sequence {
                tracker.advance(*index).await.unwrap();
            }
            assert_eq!(store.value(KEY).as_deref(), Some("9"), "{sequence:?}");

            let written: Vec<u64> = store
                .writes_to(KEY)
                .iter()
                .map(|value| value.parse().unwrap())
                .collect();
            assert!(written.windows(2).all(|pair| pair[0] < pair[1]));
        }
    }

    #[tokio::test]
    async fn failed_write_surfaces_as_checkpoint_error() {
        let store = Arc::new(FakeStore::new());
        store.fail_sets(true);
        let mut tracker = ProgressTracker::new(Arc::clone(&store), KEY);

        assert!(matches!(
            tracker.advance(5).await,
            Err(SyncError::CheckpointWrite { .. })
        ));
        assert_eq!(tracker.known(), Some(0));
    }
}
