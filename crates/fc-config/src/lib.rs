//! Configuration sync (C6): periodically reconciles pool and queue
//! definitions from an external source of truth into the running router.
//!
//! The source is abstracted behind `PoolConfigSource`/`QueueConfigSource` so
//! the sync loop doesn't care whether definitions come from a TOML file, an
//! HTTP control plane, or a database -- only `FileConfigSource` (TOML) is
//! built here. Application to the router goes through `ConfigReconciler`,
//! implemented by whatever owns pool/queue state, so this crate never
//! depends on the router crate directly.

use async_trait::async_trait;
use fc_common::{PoolConfig, QueueConfig};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{error, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read { path: PathBuf, source: std::io::Error },
    #[error("failed to parse config file {path}: {source}")]
    Parse { path: PathBuf, source: toml::de::Error },
    #[error("reconciliation failed: {0}")]
    Reconcile(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// A snapshot of pool and queue definitions pulled from a config source.
#[derive(Debug, Clone, Default)]
pub struct ConfigSnapshot {
    pub pools: Vec<PoolConfig>,
    pub queues: Vec<QueueConfig>,
}

#[async_trait]
pub trait PoolConfigSource: Send + Sync {
    async fn load_pools(&self) -> Result<Vec<PoolConfig>>;
}

#[async_trait]
pub trait QueueConfigSource: Send + Sync {
    async fn load_queues(&self) -> Result<Vec<QueueConfig>>;
}

/// A single configured change stream plus the name of the projection
/// mapper it should dispatch through. Kept deliberately thin -- the
/// projector binary resolves `mapper` against its own registry of known
/// mapper names rather than this crate knowing about `fc-stream` types.
#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
pub struct StreamConfigEntry {
    pub name: String,
    pub source_database: String,
    pub source_collection: String,
    #[serde(default = "default_batch_max_size")]
    pub batch_max_size: u32,
    #[serde(default = "default_batch_max_wait_ms")]
    pub batch_max_wait_ms: u64,
    #[serde(default = "default_watch_operations")]
    pub watch_operations: Vec<String>,
    #[serde(default = "default_max_concurrent_batches")]
    pub max_concurrent_batches: u32,
    pub mapper: String,
}

fn default_batch_max_size() -> u32 {
    100
}

fn default_batch_max_wait_ms() -> u64 {
    1000
}

fn default_watch_operations() -> Vec<String> {
    vec!["insert".to_string(), "update".to_string(), "replace".to_string()]
}

fn default_max_concurrent_batches() -> u32 {
    4
}

#[async_trait]
pub trait StreamConfigSource: Send + Sync {
    async fn load_streams(&self) -> Result<Vec<StreamConfigEntry>>;
}

/// Applies a reconciled snapshot to whatever owns live pool/queue state.
/// Implemented by the router's queue manager at the composition root;
/// decoupling it this way keeps this crate free of a dependency on
/// `fc-router`.
#[async_trait]
pub trait ConfigReconciler: Send + Sync {
    async fn reconcile(&self, snapshot: &ConfigSnapshot) -> std::result::Result<(), String>;
}

#[derive(serde::Deserialize)]
struct FileLayout {
    #[serde(default)]
    pools: Vec<PoolConfig>,
    #[serde(default)]
    queues: Vec<QueueConfig>,
    #[serde(default)]
    streams: Vec<StreamConfigEntry>,
}

/// TOML-backed config source, re-read from disk on every poll.
pub struct FileConfigSource {
    path: PathBuf,
}

impl FileConfigSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    async fn load(&self) -> Result<FileLayout> {
        let contents = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|source| ConfigError::Read { path: self.path.clone(), source })?;
        toml::from_str(&contents).map_err(|source| ConfigError::Parse { path: self.path.clone(), source })
    }
}

#[async_trait]
impl PoolConfigSource for FileConfigSource {
    async fn load_pools(&self) -> Result<Vec<PoolConfig>> {
        Ok(self.load().await?.pools)
    }
}

#[async_trait]
impl QueueConfigSource for FileConfigSource {
    async fn load_queues(&self) -> Result<Vec<QueueConfig>> {
        Ok(self.load().await?.queues)
    }
}

#[async_trait]
impl StreamConfigSource for FileConfigSource {
    async fn load_streams(&self) -> Result<Vec<StreamConfigEntry>> {
        Ok(self.load().await?.streams)
    }
}

/// Drives periodic reconciliation (C6). The first sync is load-bearing: if
/// it fails after exhausting retries, startup aborts rather than running
/// with an empty/unknown pool set. Subsequent failures are logged and
/// skipped -- the previous snapshot stays in effect.
pub struct ConfigSyncer {
    pool_source: Box<dyn PoolConfigSource>,
    queue_source: Box<dyn QueueConfigSource>,
    sync_interval: Duration,
    initial_retry_attempts: u32,
    initial_retry_delay: Duration,
}

impl ConfigSyncer {
    pub fn new(
        pool_source: Box<dyn PoolConfigSource>,
        queue_source: Box<dyn QueueConfigSource>,
        sync_interval: Duration,
    ) -> Self {
        Self {
            pool_source,
            queue_source,
            sync_interval,
            initial_retry_attempts: 12,
            initial_retry_delay: Duration::from_secs(5),
        }
    }

    async fn load_snapshot(&self) -> std::result::Result<ConfigSnapshot, ConfigError> {
        let pools = self.pool_source.load_pools().await?;
        let queues = self.queue_source.load_queues().await?;
        Ok(ConfigSnapshot { pools, queues })
    }

    /// Blocks on the initial sync, retrying up to `initial_retry_attempts`
    /// times at `initial_retry_delay` spacing. A failure here is fatal --
    /// the caller should abort startup.
    pub async fn initial_sync(&self, reconciler: &dyn ConfigReconciler) -> Result<()> {
        let mut last_err = None;
        for attempt in 1..=self.initial_retry_attempts {
            match self.load_snapshot().await {
                Ok(snapshot) => {
                    reconciler.reconcile(&snapshot).await.map_err(ConfigError::Reconcile)?;
                    info!(pools = snapshot.pools.len(), queues = snapshot.queues.len(), "initial config sync succeeded");
                    return Ok(());
                }
                Err(e) => {
                    warn!(attempt, max_attempts = self.initial_retry_attempts, error = %e, "initial config sync attempt failed");
                    last_err = Some(e);
                    if attempt < self.initial_retry_attempts {
                        tokio::time::sleep(self.initial_retry_delay).await;
                    }
                }
            }
        }
        let err = last_err.expect("loop runs at least once");
        error!(error = %err, "initial config sync exhausted all retries, aborting startup");
        Err(err)
    }

    /// Runs the periodic reconciliation loop. Intended to be spawned as a
    /// background task after `initial_sync` succeeds; a leader-gated caller
    /// can skip calling `reconcile` when not primary and still keep this
    /// loop alive for its own bookkeeping.
    pub async fn run(&self, reconciler: &dyn ConfigReconciler, should_reconcile: impl Fn() -> bool + Send + Sync) {
        let mut ticker = tokio::time::interval(self.sync_interval);
        ticker.tick().await; // first tick fires immediately; skip it, initial_sync already ran
        loop {
            ticker.tick().await;
            if !should_reconcile() {
                continue;
            }
            match self.load_snapshot().await {
                Ok(snapshot) => {
                    if let Err(e) = reconciler.reconcile(&snapshot).await {
                        warn!(error = %e, "periodic config reconciliation failed, keeping previous snapshot");
                    }
                }
                Err(e) => {
                    warn!(error = %e, "periodic config sync failed, keeping previous snapshot");
                }
            }
        }
    }
}

pub fn default_config_path() -> PathBuf {
    Path::new("config").join("flowcatalyst.toml")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct RecordingReconciler {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl ConfigReconciler for RecordingReconciler {
        async fn reconcile(&self, snapshot: &ConfigSnapshot) -> std::result::Result<(), String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if snapshot.pools.is_empty() && snapshot.queues.is_empty() {
                return Err("empty snapshot".to_string());
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn initial_sync_reads_toml_file_and_reconciles() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flowcatalyst.toml");
        tokio::fs::write(
            &path,
            r#"
            [[pools]]
            code = "DEFAULT-POOL"
            concurrency = 10

            [[queues]]
            queue_identifier = "local"
            broker_type = "EMBEDDED"
            "#,
        )
        .await
        .unwrap();

        let syncer = ConfigSyncer::new(
            Box::new(FileConfigSource::new(&path)),
            Box::new(FileConfigSource::new(&path)),
            Duration::from_secs(60),
        );
        let calls = Arc::new(AtomicUsize::new(0));
        let reconciler = RecordingReconciler { calls: calls.clone() };

        syncer.initial_sync(&reconciler).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn file_config_source_loads_stream_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flowcatalyst.toml");
        tokio::fs::write(
            &path,
            r#"
            [[streams]]
            name = "dispatch-jobs"
            source_database = "flowcatalyst"
            source_collection = "dispatch_jobs"
            mapper = "dispatch_job"
            "#,
        )
        .await
        .unwrap();

        let source = FileConfigSource::new(&path);
        let streams = source.load_streams().await.unwrap();
        assert_eq!(streams.len(), 1);
        assert_eq!(streams[0].name, "dispatch-jobs");
        assert_eq!(streams[0].batch_max_size, 100);
        assert_eq!(streams[0].mapper, "dispatch_job");
    }

    #[tokio::test]
    async fn initial_sync_fails_fatally_when_file_missing() {
        let syncer = ConfigSyncer {
            pool_source: Box::new(FileConfigSource::new("/nonexistent/flowcatalyst.toml")),
            queue_source: Box::new(FileConfigSource::new("/nonexistent/flowcatalyst.toml")),
            sync_interval: Duration::from_secs(60),
            initial_retry_attempts: 2,
            initial_retry_delay: Duration::from_millis(1),
        };
        let calls = Arc::new(AtomicUsize::new(0));
        let reconciler = RecordingReconciler { calls };

        let result = syncer.initial_sync(&reconciler).await;
        assert!(result.is_err());
    }
}
