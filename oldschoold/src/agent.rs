use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use oldschool_core::{DEFAULT_ENDPOINT, EtcdClient};
use tokio::task::JoinHandle;
use tokio::time::{Instant, interval_at};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use url::Url;

use crate::sync::backoff::Backoff;
use crate::sync::engine::{MIN_QUEUE_CAPACITY, SyncConfig, Synchronizer};
use crate::sync::paths::normalize_key;
use crate::sync::snapshot::Snapshot;
use crate::sync::stats::{Metrics, Statistics};

const DEFAULT_LEASE_TTL_SECS: u64 = 30;
const DEFAULT_STATS_SECS: u64 = 2;

/// Values given on the command line; each one wins over its environment variable.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CliOverrides {
    pub name: Option<String>,
    pub endpoints: Option<String>,
    pub base_dir: Option<String>,
    pub base_key: Option<String>,
}

#[derive(Clone, Debug)]
pub struct AgentConfig {
    pub name: String,
    pub endpoints: Vec<Url>,
    pub base_dir: PathBuf,
    pub base_key: String,
    pub queue_capacity: usize,
    pub resume: bool,
    pub prune_directories: bool,
    pub lease_ttl: Option<Duration>,
    /// Zero disables the periodic statistics line.
    pub stats_interval: Duration,
    pub restart_on_error: bool,
    /// Restarts allowed before giving up; `None` retries forever.
    pub restart_limit: Option<u32>,
    pub sync_cluster: bool,
}

impl AgentConfig {
    pub fn from_env(overrides: &CliOverrides) -> anyhow::Result<Self> {
        Self::from_lookup(overrides, |name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(overrides: &CliOverrides, lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let pick = |cli: &Option<String>, env: &str| {
            cli.clone()
                .or_else(|| lookup(env))
                .filter(|value| !value.trim().is_empty())
        };

        let name = pick(&overrides.name, "OLDSCHOOL_NAME")
            .context("agent name is required (--name or OLDSCHOOL_NAME)")?;
        validate_agent_name(&name)?;

        let endpoints = parse_endpoints(
            &pick(&overrides.endpoints, "OLDSCHOOL_ENDPOINTS")
                .unwrap_or_else(|| DEFAULT_ENDPOINT.to_string()),
        )?;

        let raw_dir = pick(&overrides.base_dir, "OLDSCHOOL_BASE_DIR")
            .context("base directory is required (--base-dir or OLDSCHOOL_BASE_DIR)")?;
        let base_dir = if raw_dir.starts_with('~') {
            let home = dirs::home_dir().context("home directory is unavailable")?;
            expand_with_home(&raw_dir, &home)
        } else {
            PathBuf::from(raw_dir)
        };

        let base_key = pick(&overrides.base_key, "OLDSCHOOL_BASE_KEY")
            .context("base key is required (--base-etcd-dir or OLDSCHOOL_BASE_KEY)")?;
        let base_key = normalize_key(&base_key);

        let min_capacity = MIN_QUEUE_CAPACITY as u64;
        let queue_capacity =
            parse_u64(lookup("OLDSCHOOL_QUEUE_CAPACITY"), min_capacity).max(min_capacity) as usize;
        let lease_secs = parse_u64(lookup("OLDSCHOOL_LEASE_TTL_SECS"), DEFAULT_LEASE_TTL_SECS);
        let lease_ttl = (lease_secs > 0).then(|| Duration::from_secs(lease_secs));

        Ok(Self {
            name,
            endpoints,
            base_dir,
            base_key,
            queue_capacity,
            resume: parse_bool(lookup("OLDSCHOOL_RESUME"), true),
            prune_directories: parse_bool(lookup("OLDSCHOOL_PRUNE_DIRECTORIES"), true),
            lease_ttl,
            stats_interval: Duration::from_secs(parse_u64(
                lookup("OLDSCHOOL_STATS_SECS"),
                DEFAULT_STATS_SECS,
            )),
            restart_on_error: parse_bool(lookup("OLDSCHOOL_RESTART_ON_ERROR"), false),
            restart_limit: match parse_u64(lookup("OLDSCHOOL_RESTART_LIMIT"), 0) {
                0 => None,
                limit => Some(u32::try_from(limit).unwrap_or(u32::MAX)),
            },
            sync_cluster: parse_bool(lookup("OLDSCHOOL_SYNC_CLUSTER"), true),
        })
    }

    pub fn sync_config(&self) -> SyncConfig {
        SyncConfig {
            agent: self.name.clone(),
            base_dir: self.base_dir.clone(),
            base_key: self.base_key.clone(),
            queue_capacity: self.queue_capacity,
            resume: self.resume,
            prune_directories: self.prune_directories,
            lease_ttl: self.lease_ttl,
        }
    }
}

pub struct AgentRuntime {
    config: AgentConfig,
    client: Arc<EtcdClient>,
    stats: Arc<Statistics>,
    backoff: Backoff,
}

impl AgentRuntime {
    pub async fn bootstrap(config: AgentConfig) -> anyhow::Result<Self> {
        let mut client =
            EtcdClient::new(config.endpoints.clone()).context("invalid store endpoints")?;
        if config.sync_cluster {
            if let Err(err) = client.sync_cluster().await {
                warn!(error = %err, "cluster sync failed, keeping configured endpoints");
            }
        }
        for endpoint in client.endpoints() {
            info!(%endpoint, "store node");
        }

        tokio::fs::create_dir_all(&config.base_dir)
            .await
            .with_context(|| format!("failed to create base directory at {:?}", config.base_dir))?;

        Ok(Self {
            client: Arc::new(client),
            stats: Arc::new(Statistics::default()),
            backoff: Backoff::default().with_limit(config.restart_limit),
            config,
        })
    }

    /// Replaces the restart pacing; the configured restart limit still applies.
    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff.with_limit(self.config.restart_limit);
        self
    }

    pub fn statistics(&self) -> Arc<Statistics> {
        Arc::clone(&self.stats)
    }

    fn synchronizer(&self, cancel: CancellationToken) -> Synchronizer<EtcdClient> {
        Synchronizer::new(
            Arc::clone(&self.client),
            self.config.sync_config(),
            Arc::clone(&self.stats) as Arc<dyn Metrics>,
        )
        .with_cancellation(cancel)
    }

    /// Mirrors one snapshot and exits.
    pub async fn run_once(&self) -> anyhow::Result<Snapshot> {
        let snapshot = self
            .synchronizer(CancellationToken::new())
            .materialize_once()
            .await
            .context("snapshot failed")?;
        info!(
            max_index = snapshot.max_index,
            store_index = snapshot.store_index,
            stats = %self.stats.snapshot(),
            "one-shot mirror complete"
        );
        Ok(snapshot)
    }

    pub async fn run(self) -> anyhow::Result<()> {
        info!(
            agent = %self.config.name,
            base_dir = %self.config.base_dir.display(),
            base_key = %self.config.base_key,
            resume = self.config.resume,
            "agent started"
        );
        let cancel = CancellationToken::new();
        let interrupt = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("interrupt received, shutting down");
                    cancel.cancel();
                }
            })
        };
        let ticker = spawn_stats_ticker(
            Arc::clone(&self.stats),
            self.config.stats_interval,
            cancel.clone(),
        );

        let result = self.run_until_cancelled(&cancel).await;

        cancel.cancel();
        interrupt.abort();
        if let Some(ticker) = ticker {
            let _ = ticker.await;
        }
        info!(stats = %self.stats.snapshot(), "agent stopped");
        result
    }

    /// Runs synchronizer sessions until `cancel` fires. Failures end the run unless
    /// restarts are enabled.
    pub async fn run_until_cancelled(&self, cancel: &CancellationToken) -> anyhow::Result<()> {
        let mut backoff = self.backoff;
        loop {
            let err = match self.synchronizer(cancel.child_token()).run().await {
                Ok(()) => return Ok(()),
                Err(err) => err,
            };
            if cancel.is_cancelled() {
                warn!(error = %err, "synchronizer failed while shutting down");
                return Ok(());
            }
            if !self.config.restart_on_error {
                return Err(err).context("synchronizer stopped");
            }
            let Some(delay) = backoff.next_delay() else {
                return Err(err).with_context(|| {
                    format!("synchronizer stopped after {} restarts", backoff.attempts())
                });
            };
            warn!(
                error = %err,
                attempt = backoff.attempts(),
                delay_ms = delay.as_millis() as u64,
                "synchronizer failed, restarting"
            );
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

fn spawn_stats_ticker(
    stats: Arc<Statistics>,
    period: Duration,
    cancel: CancellationToken,
) -> Option<JoinHandle<()>> {
    if period.is_zero() {
        return None;
    }
    Some(tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + period, period);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => info!("{}", stats.snapshot()),
            }
        }
    }))
}

include!("agent_helpers.rs");

#[cfg(test)]
#[path = "agent_tests.rs"]
mod tests;
