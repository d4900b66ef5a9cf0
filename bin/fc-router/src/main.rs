//! Message Router composition root: wires config sync, leader election,
//! broker consumers, the queue manager, its lifecycle sweepers, and the
//! operational HTTP surface together, then runs until a shutdown signal.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use fc_api::{create_router, AppState};
use fc_common::{BrokerType, QueueConfig, RuntimeSettings};
use fc_config::{default_config_path, ConfigSyncer, FileConfigSource};
use fc_queue::embedded::EmbeddedQueue;
use fc_queue::sqs::SqsQueueConsumer;
use fc_queue::QueueConsumer;
use fc_router::{
    ConsumerFactory, HealthService, HealthServiceConfig, HttpMediator, HttpMediatorConfig,
    LifecycleConfig, LifecycleManager, MetricsConfig, PoolMetricsCollector, QueueManager,
    WarningService, WarningServiceConfig,
};
use fc_standby::{InMemoryLeaderElector, LeaderElector, RedisLeaderElector};
use tokio::signal;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Builds consumers from queue config during reconciliation. Embedded
/// queues share one SQLite pool so restarts keep their backlog.
struct BrokerConsumerFactory {
    sqs_client: aws_sdk_sqs::Client,
    embedded_pool: sqlx::SqlitePool,
    default_visibility_seconds: u32,
}

#[async_trait]
impl ConsumerFactory for BrokerConsumerFactory {
    async fn build(&self, config: &QueueConfig) -> fc_common::Result<Arc<dyn QueueConsumer>> {
        match config.broker_type {
            BrokerType::Sqs => {
                let visibility = self.default_visibility_seconds as i32;
                let consumer = SqsQueueConsumer::from_queue_url(self.sqs_client.clone(), config.queue_identifier.clone(), visibility).await;
                Ok(Arc::new(consumer))
            }
            BrokerType::Embedded => {
                let queue = EmbeddedQueue::new(self.embedded_pool.clone(), config.queue_identifier.clone(), self.default_visibility_seconds);
                queue.init_schema().await.map_err(|e| fc_common::FlowCatalystError::Queue(e.to_string()))?;
                Ok(Arc::new(queue))
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into())).init();

    info!("starting FlowCatalyst Message Router");

    let settings = RuntimeSettings::default();
    let warning_service = Arc::new(WarningService::new(WarningServiceConfig::default()));
    let health_service = Arc::new(HealthService::new(HealthServiceConfig::default()));

    let mediator = Arc::new(HttpMediator::new(HttpMediatorConfig::default()).with_warning_sink(warning_service.clone()));
    let default_pool_code = std::env::var("DEFAULT_POOL_CODE").unwrap_or_else(|_| "default".to_string());
    let metrics_collector = Arc::new(PoolMetricsCollector::new(MetricsConfig { default_pool_code }));
    let queue_manager = Arc::new(QueueManager::with_metrics(mediator, warning_service.clone(), settings.clone(), metrics_collector));

    let aws_cfg = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
    let sqs_client = aws_sdk_sqs::Client::new(&aws_cfg);

    let embedded_db_url = std::env::var("EMBEDDED_QUEUE_DB").unwrap_or_else(|_| "sqlite::memory:".to_string());
    let embedded_pool = sqlx::SqlitePool::connect(&embedded_db_url).await.context("failed to open embedded queue database")?;

    queue_manager
        .set_consumer_factory(Arc::new(BrokerConsumerFactory {
            sqs_client,
            embedded_pool,
            default_visibility_seconds: 30,
        }))
        .await;

    let leader: Arc<dyn LeaderElector> = match std::env::var("REDIS_URL") {
        Ok(url) => {
            let client = redis::Client::open(url).context("invalid REDIS_URL")?;
            Arc::new(RedisLeaderElector::new(client, "flowcatalyst:router:leader", settings.leader_lease_seconds, settings.leader_refresh_seconds))
        }
        Err(_) => {
            info!("REDIS_URL not set, running single-instance with an always-primary elector");
            Arc::new(InMemoryLeaderElector::new())
        }
    };

    let config_path = std::env::var("CONFIG_PATH").map(std::path::PathBuf::from).unwrap_or_else(|_| default_config_path());
    let syncer = ConfigSyncer::new(
        Box::new(FileConfigSource::new(config_path.clone())),
        Box::new(FileConfigSource::new(config_path)),
        Duration::from_secs(settings.sync_interval_seconds),
    );

    syncer.initial_sync(queue_manager.as_ref()).await.context("initial config sync failed, aborting startup")?;

    queue_manager.start().await;

    let lifecycle = LifecycleManager::start(queue_manager.clone(), warning_service.clone(), health_service.clone(), leader.clone(), LifecycleConfig::from_runtime_settings(&settings));

    {
        let queue_manager = queue_manager.clone();
        let leader = leader.clone();
        tokio::spawn(async move {
            syncer.run(queue_manager.as_ref(), || leader.is_primary()).await;
        });
    }

    {
        let leader = leader.clone();
        let refresh_interval = Duration::from_secs(settings.leader_refresh_seconds);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(refresh_interval);
            loop {
                ticker.tick().await;
                leader.tick().await;
            }
        });
    }

    spawn_consumer_loops(queue_manager.clone(), health_service.clone(), leader.clone());

    let metrics_handle = metrics_exporter_prometheus::PrometheusBuilder::new().install_recorder().context("failed to install metrics recorder")?;
    let app = create_router(AppState::router_only(queue_manager.clone(), health_service.clone(), metrics_handle)).layer(TraceLayer::new_for_http());

    let api_port: u16 = std::env::var("API_PORT").ok().and_then(|v| v.parse().ok()).unwrap_or(8080);
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
    lifecycle.shutdown().await;
    leader.release().await;
    queue_manager.shutdown(Duration::from_secs(30)).await;

    info!("Message Router shutdown complete");
    Ok(())
}

/// Per-consumer poll loops. `QueueManager` owns consumer lifecycle but does
/// not itself spawn the polling tasks -- that stays here so the consumer
/// registry remains agnostic to how messages arrive.
fn spawn_consumer_loops(manager: Arc<QueueManager>, health_service: Arc<HealthService>, leader: Arc<dyn LeaderElector>) {
    tokio::spawn(async move {
        let mut known: std::collections::HashSet<String> = std::collections::HashSet::new();
        let mut ticker = tokio::time::interval(Duration::from_secs(5));

        loop {
            ticker.tick().await;
            if !leader.is_primary() {
                continue;
            }

            for id in manager.consumer_ids().await {
                if known.insert(id.clone()) {
                    let manager = manager.clone();
                    let health_service = health_service.clone();
                    let consumer_id = id.clone();
                    tokio::spawn(async move { poll_consumer(manager, health_service, consumer_id).await });
                }
            }
        }
    });
}

async fn poll_consumer(manager: Arc<QueueManager>, health_service: Arc<HealthService>, queue_identifier: String) {
    loop {
        let consumers = manager.snapshot_consumers().await;
        let Some(consumer) = consumers.get(&queue_identifier).cloned() else {
            info!(queue = %queue_identifier, "consumer removed, stopping poll loop");
            return;
        };

        match consumer.poll(10).await {
            Ok(messages) if !messages.is_empty() => {
                manager.route_batch(messages, consumer.clone()).await;
            }
            Ok(_) => {}
            Err(fc_queue::QueueError::Stopped) => {
                info!(queue = %queue_identifier, "consumer stopped, ending poll loop");
                return;
            }
            Err(e) => {
                error!(queue = %queue_identifier, error = %e, "poll failed");
            }
        }

        health_service.report_consumer_health(fc_common::ConsumerHealth {
            queue_identifier: queue_identifier.clone(),
            is_healthy: consumer.is_healthy(),
            last_poll_age_millis: consumer.last_poll_age().map(|d| d.as_millis() as i64),
            is_running: !consumer.is_fully_stopped(),
        });
    }
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
