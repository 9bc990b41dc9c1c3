use std::sync::Arc;
use std::time::Duration;

use oldschool_core::{Store, StoreError};
use rand::Rng;
use rand::distributions::Alphanumeric;
use tracing::{debug, info, warn};

use super::error::SyncError;

const TOKEN_LEN: usize = 16;

/// Exclusive claim on an agent name, held as a TTL key that must be refreshed.
pub struct IdentityLease<S> {
    store: Arc<S>,
    key: String,
    token: String,
    ttl: Duration,
}

impl<S: Store> IdentityLease<S> {
    /// Fails with `IdentityInUse` while another process holds the key.
    pub async fn acquire(
        store: Arc<S>,
        key: impl Into<String>,
        ttl: Duration,
    ) -> Result<Self, SyncError> {
        let key = key.into();
        let token: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(TOKEN_LEN)
            .map(char::from)
            .collect();
        match store.create(&key, &token, Some(ttl)).await {
            Ok(_) => {}
            Err(StoreError::AlreadyExists { .. }) => return Err(SyncError::IdentityInUse { key }),
            Err(err) => return Err(err.into()),
        }
        info!(key = %key, ttl_secs = ttl.as_secs(), "identity lease acquired");
        Ok(Self {
            store,
            key,
            token,
            ttl,
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    /// A third of the TTL, so two refreshes can fail before the key expires.
    pub fn refresh_period(&self) -> Duration {
        (self.ttl / 3).max(Duration::from_millis(100))
    }

    pub async fn refresh(&self) -> Result<(), SyncError> {
        match self.store.refresh(&self.key, self.ttl).await {
            Ok(_) => {
                debug!(key = %self.key, "identity lease refreshed");
                Ok(())
            }
            Err(StoreError::KeyNotFound { .. }) => Err(SyncError::LeaseLost {
                key: self.key.clone(),
            }),
            Err(err) => Err(err.into()),
        }
    }

    /// Deletes the key if it still carries this lease's token.
    pub async fn release(self) -> Result<(), SyncError> {
        let current = match self.store.get(&self.key, false).await {
            Ok(event) => event.node.value,
            Err(StoreError::KeyNotFound { .. }) => return Ok(()),
            Err(err) => return Err(err.into()),
        };
        if current.as_deref() != Some(self.token.as_str()) {
            warn!(key = %self.key, "identity lease was taken over, leaving it in place");
            return Ok(());
        }
        match self.store.delete(&self.key).await {
            Ok(_) | Err(StoreError::KeyNotFound { .. }) => {
                info!(key = %self.key, "identity lease released");
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }
}
