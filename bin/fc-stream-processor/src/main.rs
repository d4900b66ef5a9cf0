//! Change-Stream Projector composition root: wires config loading, leader
//! election, the stream processor, and the operational HTTP surface
//! together, then runs until a shutdown signal.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use fc_api::{create_router, AppState};
use fc_common::WarningSink;
use fc_config::{default_config_path, FileConfigSource, StreamConfigEntry, StreamConfigSource};
use fc_router::{HealthService, HealthServiceConfig, WarningService, WarningServiceConfig};
use fc_standby::{InMemoryLeaderElector, LeaderElector, RedisLeaderElector};
use fc_stream::{CheckpointStore, DispatchJobProjectionMapper, MongoCheckpointStore, PassthroughMapper, ProjectionMapper, StreamConfig, StreamProcessor};
use tokio::signal;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const INITIAL_RETRY_ATTEMPTS: u32 = 12;
const INITIAL_RETRY_DELAY: Duration = Duration::from_secs(5);
const WATCHER_REPORT_INTERVAL: Duration = Duration::from_secs(10);

/// Resolves a config-file mapper name into the concrete `ProjectionMapper`
/// the projector ships. A name with no match is a configuration error, not
/// a silent no-op, since a misconfigured stream would otherwise tail
/// forever without writing anything.
fn resolve_mapper(entry: &StreamConfigEntry) -> Result<Arc<dyn ProjectionMapper>> {
    let target_collection = format!("{}_read", entry.source_collection);
    match entry.mapper.as_str() {
        "passthrough" => Ok(Arc::new(PassthroughMapper::new(entry.source_collection.clone(), target_collection))),
        "dispatch_job" => Ok(Arc::new(DispatchJobProjectionMapper::new(target_collection))),
        other => anyhow::bail!("unknown projection mapper \"{other}\" for stream \"{}\"", entry.name),
    }
}

fn stream_config_from_entry(entry: &StreamConfigEntry) -> StreamConfig {
    StreamConfig {
        name: entry.name.clone(),
        source_database: entry.source_database.clone(),
        source_collection: entry.source_collection.clone(),
        batch_max_size: entry.batch_max_size,
        batch_max_wait_ms: entry.batch_max_wait_ms,
        watch_operations: entry.watch_operations.clone(),
        max_concurrent_batches: entry.max_concurrent_batches,
    }
}

/// Blocks on the initial stream config load, retrying with a fixed delay.
/// Mirrors `ConfigSyncer::initial_sync`'s shape in `fc-config`: a failure
/// here is fatal, the caller should abort startup rather than run with no
/// streams configured.
async fn load_streams_with_retry(source: &dyn StreamConfigSource) -> Result<Vec<StreamConfigEntry>> {
    let mut last_err = None;
    for attempt in 1..=INITIAL_RETRY_ATTEMPTS {
        match source.load_streams().await {
            Ok(streams) => return Ok(streams),
            Err(e) => {
                warn!(attempt, max_attempts = INITIAL_RETRY_ATTEMPTS, error = %e, "initial stream config load attempt failed");
                last_err = Some(e);
                if attempt < INITIAL_RETRY_ATTEMPTS {
                    tokio::time::sleep(INITIAL_RETRY_DELAY).await;
                }
            }
        }
    }
    Err(last_err.expect("loop runs at least once").into())
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into())).init();

    info!("starting FlowCatalyst Change-Stream Projector");

    let warning_service = Arc::new(WarningService::new(WarningServiceConfig::default()));
    let health_service = Arc::new(HealthService::new(HealthServiceConfig::default()));

    let mongo_uri = std::env::var("MONGODB_URI").unwrap_or_else(|_| "mongodb://localhost:27017".to_string());
    let checkpoint_db_name = std::env::var("CHECKPOINT_DATABASE").unwrap_or_else(|_| "flowcatalyst".to_string());
    let client = mongodb::Client::with_uri_str(&mongo_uri).await.context("failed to connect to MongoDB")?;

    let mongo_checkpoint_store = MongoCheckpointStore::new(&client, &checkpoint_db_name, "stream_checkpoints");
    mongo_checkpoint_store.ping().await.context("checkpoint store unreachable at startup")?;
    let checkpoint_store: Arc<dyn CheckpointStore> = Arc::new(mongo_checkpoint_store);

    let config_path = std::env::var("CONFIG_PATH").map(std::path::PathBuf::from).unwrap_or_else(|_| default_config_path());
    let config_source = FileConfigSource::new(config_path);
    let entries = load_streams_with_retry(&config_source).await.context("initial stream config load failed, aborting startup")?;

    let leader: Arc<dyn LeaderElector> = match std::env::var("REDIS_URL") {
        Ok(url) => {
            let redis_client = redis::Client::open(url).context("invalid REDIS_URL")?;
            Arc::new(RedisLeaderElector::new(redis_client, "flowcatalyst:projector:leader", 30, 10))
        }
        Err(_) => {
            info!("REDIS_URL not set, running single-instance with an always-primary elector");
            Arc::new(InMemoryLeaderElector::new())
        }
    };
    leader.tick().await;
    if !leader.is_primary() {
        warn!("starting as a standby replica; streams will not be tailed until this instance acquires the leader lease");
    }

    let mut streams = Vec::with_capacity(entries.len());
    for entry in &entries {
        let mapper = resolve_mapper(entry)?;
        streams.push((stream_config_from_entry(entry), mapper));
    }

    let mut processor = StreamProcessor::new();
    if leader.is_primary() && !streams.is_empty() {
        let database_name = streams.first().map(|(c, _)| c.source_database.clone()).unwrap_or_else(|| checkpoint_db_name.clone());
        let db = client.database(&database_name);
        processor.spawn(client.clone(), db, streams, checkpoint_store.clone()).await.context("failed to spawn change stream watchers")?;
    } else if streams.is_empty() {
        warn!("no streams configured, projector is idle");
    }
    let processor = Arc::new(tokio::sync::RwLock::new(processor));

    {
        let processor = processor.clone();
        let health_service = health_service.clone();
        let warning_service = warning_service.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(WATCHER_REPORT_INTERVAL);
            loop {
                ticker.tick().await;
                for status in processor.read().await.statuses() {
                    if status.has_fatal_error {
                        warning_service.warn(
                            fc_common::WarningCategory::Checkpoint,
                            fc_common::WarningSeverity::Critical,
                            format!("stream {} has a fatal checkpoint/projection error and has stopped", status.name),
                            "StreamProcessor",
                        );
                    }
                    health_service.report_watcher_status(status);
                }
            }
        });
    }

    {
        let leader = leader.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(10));
            loop {
                ticker.tick().await;
                leader.tick().await;
            }
        });
    }

    {
        let warning_service = warning_service.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(300));
            loop {
                ticker.tick().await;
                warning_service.cleanup();
            }
        });
    }

    let metrics_handle = metrics_exporter_prometheus::PrometheusBuilder::new().install_recorder().context("failed to install metrics recorder")?;
    let app = create_router(AppState::projector_only(health_service.clone(), metrics_handle)).layer(TraceLayer::new_for_http());

    let api_port: u16 = std::env::var("API_PORT").ok().and_then(|v| v.parse().ok()).unwrap_or(8081);
    let addr = SocketAddr::from(([0, 0, 0, 0], api_port));
    let listener = tokio::net::TcpListener::bind(addr).await.context("failed to bind HTTP listener")?;
    info!(port = api_port, "operational HTTP surface listening");

    let server_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "HTTP server exited");
        }
    });

    shutdown_signal().await;
    info!("shutdown signal received, draining");

    server_handle.abort();
    processor.read().await.drain_all();
    leader.release().await;

    info!("Change-Stream Projector shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async { signal::ctrl_c().await.expect("failed to install Ctrl+C handler") };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate()).expect("failed to install signal handler").recv().await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
