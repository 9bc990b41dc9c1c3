use std::sync::Arc;

use futures_util::StreamExt;
use oldschool_core::{Event, Store};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::error::SyncError;

/// Forwards the store's recursive feed for one key into the event queue.
pub struct ChangeFeedWatcher<S> {
    store: Arc<S>,
    key: String,
}

impl<S: Store> ChangeFeedWatcher<S> {
    pub fn new(store: Arc<S>, key: impl Into<String>) -> Self {
        Self {
            store,
            key: key.into(),
        }
    }

    pub fn spawn(
        self,
        from_index: u64,
        events: mpsc::Sender<Event>,
        errors: mpsc::Sender<SyncError>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(self.run(from_index, events, errors, cancel))
    }

    /// Runs until cancelled or the feed fails; a failure is reported once, never retried.
    pub async fn run(
        self,
        from_index: u64,
        events: mpsc::Sender<Event>,
        errors: mpsc::Sender<SyncError>,
        cancel: CancellationToken,
    ) {
        if let Err(err) = self.forward(from_index, &events, &cancel).await {
            debug!(key = %self.key, error = %err, "watcher stopping");
            let _ = errors.send(err).await;
        }
    }

    async fn forward(
        &self,
        from_index: u64,
        events: &mpsc::Sender<Event>,
        cancel: &CancellationToken,
    ) -> Result<(), SyncError> {
        let mut stream = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            stream = self.store.watch(&self.key, from_index, true) => stream?,
        };
        info!(key = %self.key, from_index, "watching change feed");

        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                next = stream.next() => next,
            };
            let event = match next {
                Some(Ok(event)) => event,
                Some(Err(err)) => return Err(err.into()),
                None => return Err(SyncError::FeedClosed),
            };
            // Blocks while the queue is full.
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                sent = events.send(event) => {
                    if sent.is_err() {
                        return Ok(());
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::fake_store::{FakeStore, set_event};
    use oldschool_core::{StatusCode, StoreError};
    use std::time::Duration;

    #[tokio::test]
    async fn forwards_events_in_feed_order() {
        let store = Arc::new(FakeStore::new());
        store.push_watch(vec![
            Ok(set_event("/base/a", "1", 5)),
            Ok(set_event("/base/b", "2", 6)),
        ]);
        let (event_tx, mut event_rx) = mpsc::channel(128);
        let (error_tx, _error_rx) = mpsc::channel(2);
        let cancel = CancellationToken::new();

        let handle = ChangeFeedWatcher::new(Arc::clone(&store), "/base").spawn(
            5,
            event_tx,
            error_tx,
            cancel.clone(),
        );

        assert_eq!(event_rx.recv().await.unwrap().modified_index(), 5);
        assert_eq!(event_rx.recv().await.unwrap().modified_index(), 6);
        assert_eq!(store.watch_calls(), vec![5]);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn stream_error_is_reported_exactly_once() {
        let store = Arc::new(FakeStore::new());
        store.push_watch(vec![
            Ok(set_event("/base/a", "1", 5)),
            Err(StoreError::Http {
                status: StatusCode::INTERNAL_SERVER_ERROR,
                body: "boom".into(),
            }),
        ]);
        let (event_tx, mut event_rx) = mpsc::channel(128);
        let (error_tx, mut error_rx) = mpsc::channel(2);

        ChangeFeedWatcher::new(Arc::clone(&store), "/base")
            .run(5, event_tx, error_tx, CancellationToken::new())
            .await;

        assert!(event_rx.recv().await.is_some());
        assert!(event_rx.recv().await.is_none());
        assert!(matches!(error_rx.recv().await, Some(SyncError::Store(_))));
        assert!(error_rx.recv().await.is_none());
        assert_eq!(store.watch_calls().len(), 1);
    }

    #[tokio::test]
    async fn closed_feed_is_an_error() {
        let store = Arc::new(FakeStore::new());
        store.push_watch_then_close(Vec::new());
        let (event_tx, _event_rx) = mpsc::channel(128);
        let (error_tx, mut error_rx) = mpsc::channel(2);

        ChangeFeedWatcher::new(store, "/base")
            .run(1, event_tx, error_tx, CancellationToken::new())
            .await;

        assert!(matches!(error_rx.recv().await, Some(SyncError::FeedClosed)));
    }

    #[tokio::test]
    async fn full_queue_blocks_until_cancelled() {
        let store = Arc::new(FakeStore::new());
        store.push_watch(vec![
            Ok(set_event("/base/a", "1", 5)),
            Ok(set_event("/base/b", "2", 6)),
        ]);
        let (event_tx, mut event_rx) = mpsc::channel(1);
        let (error_tx, mut error_rx) = mpsc::channel(2);
        let cancel = CancellationToken::new();

        let handle = ChangeFeedWatcher::new(store, "/base").spawn(
            5,
            event_tx,
            error_tx,
            cancel.clone(),
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!handle.is_finished());

        cancel.cancel();
        handle.await.unwrap();
        assert_eq!(event_rx.recv().await.unwrap().modified_index(), 5);
        assert!(event_rx.recv().await.is_none());
        assert!(error_rx.recv().await.is_none());
    }
}
