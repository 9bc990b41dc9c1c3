use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use reqwest::StatusCode;
use thiserror::Error;

use crate::node::Event;

/// Ordered feed of changes; ends after yielding an error.
pub type EventStream = BoxStream<'static, Result<Event, StoreError>>;

/// etcd v2 error codes the agent reacts to.
pub mod codes {
    pub const KEY_NOT_FOUND: u64 = 100;
    pub const NODE_EXISTS: u64 = 105;
    pub const RAFT_INTERNAL: u64 = 300;
    pub const LEADER_ELECT: u64 = 301;
    pub const EVENT_INDEX_CLEARED: u64 = 401;
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("invalid response body: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("key not found: {key} (store index {index})")]
    KeyNotFound { key: String, index: u64 },
    #[error("history for index {requested} has been cleared (store index {index})")]
    HistoryExhausted { requested: u64, index: u64 },
    #[error("key already exists: {key}")]
    AlreadyExists { key: String, index: u64 },
    #[error("store error {code} ({status}): {message} [{cause}]")]
    Api {
        status: StatusCode,
        code: u64,
        message: String,
        cause: String,
        index: u64,
    },
    #[error("http {status}: {body}")]
    Http { status: StatusCode, body: String },
    #[error("no store endpoints configured")]
    NoEndpoints,
    #[error("watch stream closed")]
    StreamClosed,
}

impl StoreError {
    /// Failures another cluster member may not share.
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Request(err) => err.is_connect() || err.is_timeout(),
            StoreError::Api { status, code, .. } => {
                matches!(*code, codes::RAFT_INTERNAL | codes::LEADER_ELECT)
                    || status.is_server_error()
            }
            StoreError::Http { status, .. } => status.is_server_error(),
            _ => false,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::KeyNotFound { .. })
    }

    pub fn is_history_exhausted(&self) -> bool {
        matches!(self, StoreError::HistoryExhausted { .. })
    }
}

/// The store as seen by the synchronization engine.
#[async_trait]
pub trait Store: Send + Sync + 'static {
    async fn get(&self, key: &str, recursive: bool) -> Result<Event, StoreError>;

    /// Subscribes to changes at or after `from_index`; zero means "from now".
    async fn watch(
        &self,
        key: &str,
        from_index: u64,
        recursive: bool,
    ) -> Result<EventStream, StoreError>;

    async fn set(&self, key: &str, value: &str) -> Result<u64, StoreError>;

    /// Creates `key` only if it is absent.
    async fn create(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<u64, StoreError>;

    /// Extends the TTL of an existing key without notifying watchers.
    async fn refresh(&self, key: &str, ttl: Duration) -> Result<u64, StoreError>;

    async fn delete(&self, key: &str) -> Result<u64, StoreError>;
}
