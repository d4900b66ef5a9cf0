//! Queue Manager (C4): owns the cross-pool dedup state, pool registry, and
//! consumer registry that make at-least-once broker delivery behave
//! correctly under redelivery, external requeues, pool reconfiguration, and
//! leaks.
//!
//! Three concurrent maps track in-flight work, keyed by `pipelineKey`
//! (`brokerMessageId` if the broker supplies one, else `pointer.id`):
//! `by_pipeline_key` holds the entry itself, `by_timestamp` exists
//! separately so the leak sweeper can scan acceptance times without
//! touching the entry map, and `by_app_id` maps the application message id
//! back to its pipeline key for requeue detection. All three are wrapped in
//! their own `Arc` so the completion task spawned per submission can keep
//! them alive without borrowing the manager.

use dashmap::DashMap;
use fc_common::{
    FlowCatalystError, PipelineEntry, PoolConfig, PoolStats, QueueConfig, Result, RuntimeSettings,
    WarningCategory, WarningSeverity, WarningSink,
};
use async_trait::async_trait;
use fc_queue::{BrokerMessage, QueueConsumer};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{oneshot, Mutex as AsyncMutex, RwLock};
use tracing::{debug, info, warn};

use crate::mediator::Mediator;
use crate::metrics::PoolMetricsCollector;
use crate::pool::{AckDecision, PoolSubmission, ProcessPool};
use crate::warning::WarningService;

const DEFAULT_GROUP: &str = "__DEFAULT__";

/// Builds a live consumer from a queue definition. Implemented at the
/// composition root, where the concrete broker clients (SQS, SQLite pool)
/// are available, so `reconcile_queues` can apply config-sourced queue
/// definitions the same way `reconcile_pools` applies pool definitions.
#[async_trait]
pub trait ConsumerFactory: Send + Sync {
    async fn build(&self, config: &QueueConfig) -> Result<Arc<dyn QueueConsumer>>;
}

/// API-facing snapshot of an in-flight message, used by the operational
/// health surface.
#[derive(Debug, Clone, serde::Serialize, utoipa::ToSchema)]
pub struct InFlightMessageInfo {
    pub pipeline_key: String,
    pub app_message_id: String,
    pub pool_code: String,
    pub queue_identifier: String,
    pub in_flight_millis: u64,
}

impl From<&PipelineEntry> for InFlightMessageInfo {
    fn from(entry: &PipelineEntry) -> Self {
        Self {
            pipeline_key: entry.pipeline_key.clone(),
            app_message_id: entry.app_message_id.clone(),
            pool_code: entry.pool_code.clone(),
            queue_identifier: entry.queue_identifier.clone(),
            in_flight_millis: entry.elapsed().as_millis() as u64,
        }
    }
}

pub struct QueueManager {
    mediator: Arc<dyn Mediator>,
    warnings: Arc<WarningService>,
    settings: RwLock<RuntimeSettings>,

    by_pipeline_key: Arc<DashMap<String, PipelineEntry>>,
    by_timestamp: Arc<DashMap<String, Instant>>,
    by_app_id: Arc<DashMap<String, String>>,

    pools: DashMap<String, Arc<ProcessPool>>,
    draining_pools: DashMap<String, Arc<ProcessPool>>,
    pool_configs: RwLock<HashMap<String, PoolConfig>>,

    consumers: RwLock<HashMap<String, Arc<dyn QueueConsumer>>>,
    draining_consumers: RwLock<HashMap<String, Arc<dyn QueueConsumer>>>,
    consumer_factory: RwLock<Option<Arc<dyn ConsumerFactory>>>,

    /// Broker message ids whose ack failed because the receipt token had
    /// already expired by the time mediation completed. Deleted on the
    /// next redelivery of the same id instead of being retried inline,
    /// since a direct retry would race the broker's own redelivery.
    pending_delete_broker_ids: Arc<AsyncMutex<HashSet<String>>>,

    metrics: Arc<PoolMetricsCollector>,

    running: AtomicBool,
    batch_counter: AtomicU64,
}

impl QueueManager {
    pub fn new(mediator: Arc<dyn Mediator>, warnings: Arc<WarningService>, settings: RuntimeSettings) -> Self {
        Self::with_metrics(mediator, warnings, settings, Arc::new(PoolMetricsCollector::default()))
    }

    pub fn with_metrics(
        mediator: Arc<dyn Mediator>,
        warnings: Arc<WarningService>,
        settings: RuntimeSettings,
        metrics: Arc<PoolMetricsCollector>,
    ) -> Self {
        Self {
            mediator,
            warnings,
            settings: RwLock::new(settings),
            by_pipeline_key: Arc::new(DashMap::new()),
            by_timestamp: Arc::new(DashMap::new()),
            by_app_id: Arc::new(DashMap::new()),
            pools: DashMap::new(),
            draining_pools: DashMap::new(),
            pool_configs: RwLock::new(HashMap::new()),
            consumers: RwLock::new(HashMap::new()),
            draining_consumers: RwLock::new(HashMap::new()),
            consumer_factory: RwLock::new(None),
            pending_delete_broker_ids: Arc::new(AsyncMutex::new(HashSet::new())),
            metrics,
            running: AtomicBool::new(false),
            batch_counter: AtomicU64::new(0),
        }
    }

    pub async fn start(&self) {
        self.running.store(true, Ordering::SeqCst);
        for pool in self.pools.iter() {
            pool.value().start().await;
        }
        info!("queue manager started");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Installs the consumer factory `reconcile` uses to build consumers for
    /// newly-configured queues. Left unset, queue reconciliation is a no-op
    /// and consumers must be wired manually via `add_consumer`.
    pub async fn set_consumer_factory(&self, factory: Arc<dyn ConsumerFactory>) {
        *self.consumer_factory.write().await = Some(factory);
    }

    // ------------------------------------------------------------------
    // Pool registry
    // ------------------------------------------------------------------

    async fn get_or_create_pool(&self, pool_code: &str) -> Result<Arc<ProcessPool>> {
        if let Some(pool) = self.pools.get(pool_code) {
            return Ok(pool.value().clone());
        }

        let settings = self.settings.read().await;
        if self.pools.len() >= settings.max_pools {
            self.warnings.warn(
                fc_common::WarningCategory::PoolCapacity,
                fc_common::WarningSeverity::Error,
                format!("refusing to create pool {pool_code}: max_pools ({}) reached", settings.max_pools),
                "QueueManager",
            );
            return Err(FlowCatalystError::Pool(format!("max_pools limit reached, cannot create {pool_code}")));
        }
        let warn_threshold = settings.pool_warning_threshold;
        drop(settings);

        let config = self
            .pool_configs
            .read()
            .await
            .get(pool_code)
            .cloned()
            .unwrap_or_else(|| PoolConfig { code: pool_code.to_string(), concurrency: fc_common::DEFAULT_POOL_CONCURRENCY, rate_limit_per_minute: None });

        let pool = Arc::new(ProcessPool::with_metrics(config, self.mediator.clone(), self.metrics.clone()));
        pool.start().await;
        self.pools.insert(pool_code.to_string(), pool.clone());

        if self.pools.len() >= warn_threshold {
            self.warnings.warn(
                fc_common::WarningCategory::PoolCapacity,
                fc_common::WarningSeverity::Warn,
                format!("pool count {} at or above warning threshold {}", self.pools.len(), warn_threshold),
                "QueueManager",
            );
        }

        Ok(pool)
    }

    /// Reconciles the live pool set against a freshly loaded config
    /// for dynamic reconfiguration. Pools removed from config drain;
    /// pools whose parameters changed get a fresh instance under the same
    /// code while the old one drains in the background.
    pub async fn reconcile_pools(&self, configs: &[PoolConfig]) -> Result<()> {
        let desired: HashMap<String, PoolConfig> = configs.iter().map(|c| (c.code.clone(), c.clone())).collect();
        let mut current = self.pool_configs.write().await;

        for (code, new_config) in &desired {
            match current.get(code) {
                None => {
                    current.insert(code.clone(), new_config.clone());
                    if let Err(e) = self.get_or_create_pool(code).await {
                        warn!(pool_code = %code, error = %e, "failed to create pool during reconciliation");
                    }
                }
                Some(existing) if existing != new_config => {
                    current.insert(code.clone(), new_config.clone());
                    if let Some((_, old_pool)) = self.pools.remove(code) {
                        old_pool.drain().await;
                        self.draining_pools.insert(format!("{code}#{}", uuid::Uuid::new_v4()), old_pool);
                    }
                    if let Err(e) = self.get_or_create_pool(code).await {
                        warn!(pool_code = %code, error = %e, "failed to recreate pool during reconciliation");
                    }
                }
                Some(_) => {}
            }
        }

        let removed: Vec<String> = current.keys().filter(|code| !desired.contains_key(*code)).cloned().collect();
        for code in removed {
            current.remove(&code);
            if let Some((_, pool)) = self.pools.remove(&code) {
                pool.drain().await;
                self.draining_pools.insert(format!("{code}#{}", uuid::Uuid::new_v4()), pool);
            }
        }

        Ok(())
    }

    pub async fn cleanup_draining_pools(&self) {
        let drained: Vec<String> = self.draining_pools.iter().filter(|e| e.value().is_fully_drained()).map(|e| e.key().clone()).collect();
        for key in drained {
            if let Some((_, pool)) = self.draining_pools.remove(&key) {
                pool.shutdown().await;
                info!(pool_code = pool.code(), "drained pool fully shut down");
            }
        }
    }

    pub fn pool_stats(&self) -> Vec<PoolStats> {
        self.pools.iter().map(|e| e.value().get_stats()).collect()
    }

    pub fn pool_codes(&self) -> Vec<String> {
        self.pools.iter().map(|e| e.key().clone()).collect()
    }

    pub async fn update_pool_config(&self, pool_code: &str, concurrency: Option<u32>, rate_limit_per_minute: Option<Option<u32>>) -> Result<()> {
        let pool = self.pools.get(pool_code).map(|e| e.value().clone()).ok_or_else(|| FlowCatalystError::Pool(format!("unknown pool {pool_code}")))?;
        if let Some(c) = concurrency {
            pool.update_concurrency(c).await;
        }
        if let Some(rl) = rate_limit_per_minute {
            pool.update_rate_limit(rl);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Consumer registry
    // ------------------------------------------------------------------

    pub async fn add_consumer(&self, consumer: Arc<dyn QueueConsumer>) -> Result<()> {
        consumer.start().await.map_err(|e| FlowCatalystError::Queue(e.to_string()))?;
        self.consumers.write().await.insert(consumer.queue_identifier().to_string(), consumer);
        Ok(())
    }

    pub async fn remove_consumer(&self, queue_identifier: &str) {
        if let Some(consumer) = self.consumers.write().await.remove(queue_identifier) {
            consumer.stop().await;
            self.draining_consumers.write().await.insert(queue_identifier.to_string(), consumer);
        }
    }

    pub async fn consumer_ids(&self) -> Vec<String> {
        self.consumers.read().await.keys().cloned().collect()
    }

    pub async fn is_consumer_healthy(&self, queue_identifier: &str) -> Option<bool> {
        self.consumers.read().await.get(queue_identifier).map(|c| c.is_healthy())
    }

    pub async fn restart_consumer(&self, queue_identifier: &str) -> Result<()> {
        let consumer = self
            .consumers
            .read()
            .await
            .get(queue_identifier)
            .cloned()
            .ok_or_else(|| FlowCatalystError::Queue(format!("unknown consumer {queue_identifier}")))?;
        consumer.stop().await;
        consumer.start().await.map_err(|e| FlowCatalystError::Queue(e.to_string()))?;
        Ok(())
    }

    pub async fn snapshot_consumers(&self) -> HashMap<String, Arc<dyn QueueConsumer>> {
        self.consumers.read().await.clone()
    }

    /// Reconciles the live consumer set against a freshly loaded config,
    /// analogous to `reconcile_pools`: new queue identifiers get a consumer
    /// built via `factory`, removed ones drain, and a consumer is left alone
    /// if its queue identifier still appears (broker parameters like
    /// `connections` are a restart concern for that consumer type, not
    /// something this registry can hot-swap generically).
    pub async fn reconcile_queues(&self, configs: &[QueueConfig], factory: &dyn ConsumerFactory) -> Result<()> {
        let desired: HashSet<String> = configs.iter().map(|c| c.queue_identifier.clone()).collect();
        let current: HashSet<String> = self.consumer_ids().await.into_iter().collect();

        for config in configs {
            if !current.contains(&config.queue_identifier) {
                match factory.build(config).await {
                    Ok(consumer) => {
                        if let Err(e) = self.add_consumer(consumer).await {
                            warn!(queue = %config.queue_identifier, error = %e, "failed to start consumer during reconciliation");
                        }
                    }
                    Err(e) => warn!(queue = %config.queue_identifier, error = %e, "failed to build consumer during reconciliation"),
                }
            }
        }

        for queue_identifier in current.difference(&desired) {
            self.remove_consumer(queue_identifier).await;
        }

        Ok(())
    }

    // ------------------------------------------------------------------
    // Routing
    // ------------------------------------------------------------------

    fn pipeline_key_for(message: &BrokerMessage) -> String {
        message.broker_message_id.clone().filter(|id| !id.is_empty()).unwrap_or_else(|| message.pointer.id.clone())
    }

    /// Batch routing: three phases so duplicates never consume pool
    /// capacity and a submit failure never lets a later same-group message
    /// overtake it.
    pub async fn route_batch(&self, messages: Vec<BrokerMessage>, consumer: Arc<dyn QueueConsumer>) {
        if messages.is_empty() {
            return;
        }

        if !self.is_running() {
            for msg in messages {
                let _ = consumer.nak(&msg.receipt_token, None).await;
            }
            return;
        }

        let batch_id = self.batch_counter.fetch_add(1, Ordering::SeqCst).to_string();

        // Phase 1: dedup.
        let mut unique = Vec::with_capacity(messages.len());
        {
            let mut pending_deletes = self.pending_delete_broker_ids.lock().await;
            for msg in messages {
                let pipeline_key = Self::pipeline_key_for(&msg);

                if let Some(broker_id) = &msg.broker_message_id {
                    if pending_deletes.remove(broker_id) {
                        debug!(broker_message_id = %broker_id, "deleting redelivery whose prior ack failed on an expired receipt");
                        let _ = consumer.ack(&msg.receipt_token).await;
                        continue;
                    }
                }

                if let Some(mut entry) = self.by_pipeline_key.get_mut(&pipeline_key) {
                    entry.receipt_token = msg.receipt_token.clone();
                    if msg.broker_message_id.is_some() {
                        entry.broker_message_id = msg.broker_message_id.clone();
                    }
                    debug!(pipeline_key = %pipeline_key, "visibility redelivery, updated receipt token and nacking duplicate");
                    let _ = consumer.nak(&msg.receipt_token, None).await;
                    continue;
                }

                if let Some(existing_key_ref) = self.by_app_id.get(&msg.pointer.id) {
                    let existing_key = existing_key_ref.value().clone();
                    drop(existing_key_ref);
                    if existing_key != pipeline_key && self.by_pipeline_key.contains_key(&existing_key) {
                        debug!(app_message_id = %msg.pointer.id, "external requeue while original still inflight, acking duplicate");
                        let _ = consumer.ack(&msg.receipt_token).await;
                        continue;
                    }
                }

                unique.push(msg);
            }
        }

        if unique.is_empty() {
            return;
        }

        // Phase 2: group by pool, reject the whole group on capacity/rate limit.
        let mut by_pool: HashMap<String, Vec<BrokerMessage>> = HashMap::new();
        for msg in unique {
            let code = if msg.pointer.pool_code.is_empty() { fc_common::DEFAULT_POOL_CODE.to_string() } else { msg.pointer.pool_code.clone() };
            by_pool.entry(code).or_default().push(msg);
        }

        for (pool_code, pool_messages) in by_pool {
            let pool = match self.get_or_create_pool(&pool_code).await {
                Ok(p) => p,
                Err(e) => {
                    warn!(pool_code = %pool_code, error = %e, "could not obtain pool for batch group");
                    for msg in pool_messages {
                        let _ = consumer.nak(&msg.receipt_token, Some(5)).await;
                    }
                    continue;
                }
            };

            if pool.is_rate_limited() || !pool.has_capacity(pool_messages.len()) {
                debug!(pool_code = %pool_code, size = pool_messages.len(), "rejecting batch group on capacity/rate limit");
                for msg in pool_messages {
                    let _ = consumer.nak(&msg.receipt_token, Some(5)).await;
                }
                continue;
            }

            // Phase 3: order-preserving dispatch, grouped by messageGroupId,
            // with a per-group failure barrier.
            let mut by_group: HashMap<String, Vec<BrokerMessage>> = HashMap::new();
            let mut group_order: Vec<String> = Vec::new();
            for msg in pool_messages {
                let group = msg.pointer.message_group_id.clone().filter(|s| !s.is_empty()).unwrap_or_else(|| DEFAULT_GROUP.to_string());
                if !by_group.contains_key(&group) {
                    group_order.push(group.clone());
                }
                by_group.entry(group).or_default().push(msg);
            }

            for group in group_order {
                let group_messages = by_group.remove(&group).unwrap_or_default();
                let mut barrier = false;
                for msg in group_messages {
                    if barrier {
                        let _ = consumer.nak(&msg.receipt_token, Some(1)).await;
                        continue;
                    }
                    let accepted = self.submit_one(&pool, &pool_code, &batch_id, msg, consumer.clone()).await;
                    if !accepted {
                        barrier = true;
                    }
                }
            }
        }
    }

    async fn submit_one(&self, pool: &Arc<ProcessPool>, pool_code: &str, batch_id: &str, msg: BrokerMessage, consumer: Arc<dyn QueueConsumer>) -> bool {
        let pipeline_key = Self::pipeline_key_for(&msg);
        let app_message_id = msg.pointer.id.clone();
        let now = Instant::now();

        let entry = PipelineEntry {
            pipeline_key: pipeline_key.clone(),
            app_message_id: app_message_id.clone(),
            pool_code: pool_code.to_string(),
            message_group_id: msg.pointer.message_group_id.clone(),
            queue_identifier: msg.queue_identifier.clone(),
            accepted_at: now,
            receipt_token: msg.receipt_token.clone(),
            broker_message_id: msg.broker_message_id.clone(),
        };
        self.by_pipeline_key.insert(pipeline_key.clone(), entry);
        self.by_timestamp.insert(pipeline_key.clone(), now);
        self.by_app_id.insert(app_message_id.clone(), pipeline_key.clone());

        let (ack_tx, ack_rx) = oneshot::channel();
        let submission = PoolSubmission { pointer: msg.pointer.clone(), pipeline_key: pipeline_key.clone(), batch_id: Some(batch_id.to_string()), ack_tx };

        let accepted = pool.submit(submission).await;
        if !accepted {
            self.by_pipeline_key.remove(&pipeline_key);
            self.by_timestamp.remove(&pipeline_key);
            self.by_app_id.remove(&app_message_id);
        }

        // Spawned regardless of acceptance: a rejected submission still has
        // an `AckDecision::Nak` waiting on `ack_rx` that must reach the
        // broker, it just never touches the (already-removed) pipeline maps.
        tokio::spawn(Self::complete_submission(
            ack_rx,
            pipeline_key,
            app_message_id,
            msg.broker_message_id.clone(),
            msg.receipt_token.clone(),
            self.by_pipeline_key.clone(),
            self.by_timestamp.clone(),
            self.by_app_id.clone(),
            self.pending_delete_broker_ids.clone(),
            consumer,
        ));

        accepted
    }

    /// Awaits the worker's ack/nak decision, looks up the *current* receipt
    /// token (which may have been updated in place by a later redelivery,
    /// P7), and performs the terminal broker call. The pipeline entry is
    /// removed before the broker call so a racing redelivery never finds a
    /// stale map entry. `original_receipt_token` is the fallback used when
    /// the submission was rejected before ever reaching a pool worker, in
    /// which case the caller already removed the (momentary) pipeline entry.
    async fn complete_submission(
        ack_rx: oneshot::Receiver<AckDecision>,
        pipeline_key: String,
        app_message_id: String,
        original_broker_message_id: Option<String>,
        original_receipt_token: String,
        by_pipeline_key: Arc<DashMap<String, PipelineEntry>>,
        by_timestamp: Arc<DashMap<String, Instant>>,
        by_app_id: Arc<DashMap<String, String>>,
        pending_delete_broker_ids: Arc<AsyncMutex<HashSet<String>>>,
        consumer: Arc<dyn QueueConsumer>,
    ) {
        let decision = match ack_rx.await {
            Ok(d) => d,
            Err(_) => AckDecision::Nak { delay_seconds: None },
        };

        let token = by_pipeline_key.get(&pipeline_key).map(|e| e.receipt_token.clone()).unwrap_or(original_receipt_token);
        by_pipeline_key.remove(&pipeline_key);
        by_timestamp.remove(&pipeline_key);
        by_app_id.remove(&app_message_id);

        match decision {
            AckDecision::Ack => {
                if consumer.ack(&token).await.is_err() {
                    if let Some(broker_id) = original_broker_message_id {
                        pending_delete_broker_ids.lock().await.insert(broker_id);
                    }
                }
            }
            AckDecision::Nak { delay_seconds } => {
                let _ = consumer.nak(&token, delay_seconds).await;
            }
        }
    }

    // ------------------------------------------------------------------
    // Sweepers
    // ------------------------------------------------------------------

    /// Stale pipeline sweeper: removes entries whose acceptance
    /// predates the TTL from all three maps and warns -- these represent
    /// probable stuck messages (a worker that never completed).
    pub async fn sweep_stale_pipeline_entries(&self) {
        let ttl = std::time::Duration::from_secs(self.settings.read().await.stale_pipeline_ttl_seconds);
        let stale: Vec<String> = self.by_timestamp.iter().filter(|e| e.value().elapsed() > ttl).map(|e| e.key().clone()).collect();

        for key in &stale {
            if let Some((_, entry)) = self.by_pipeline_key.remove(key) {
                self.by_app_id.remove(&entry.app_message_id);
            }
            self.by_timestamp.remove(key);
        }

        if !stale.is_empty() {
            warn!(count = stale.len(), "swept stale pipeline entries past ttl, probable stuck messages");
            self.warnings.warn(
                fc_common::WarningCategory::Processing,
                fc_common::WarningSeverity::Warn,
                format!("{} pipeline entries exceeded the stale ttl and were swept", stale.len()),
                "QueueManager",
            );
        }
    }

    /// Visibility extender: for entries older than the threshold,
    /// extends the broker's visibility so a slow-but-healthy worker isn't
    /// redelivered out from under itself.
    pub async fn extend_visibility_for_long_running(&self, consumers_by_queue: &HashMap<String, Arc<dyn QueueConsumer>>) {
        let settings = self.settings.read().await;
        let threshold = std::time::Duration::from_secs(settings.visibility_extend_threshold_seconds);
        let extend_by = settings.visibility_extend_by_seconds;
        drop(settings);

        let long_running: Vec<PipelineEntry> = self.by_pipeline_key.iter().filter(|e| e.value().elapsed() > threshold).map(|e| e.value().clone()).collect();

        for entry in long_running {
            if let Some(consumer) = consumers_by_queue.get(&entry.queue_identifier) {
                match consumer.extend_visibility(&entry.receipt_token, extend_by).await {
                    Ok(()) => debug!(pipeline_key = %entry.pipeline_key, extend_by, "extended visibility for long-running message"),
                    Err(e) => warn!(pipeline_key = %entry.pipeline_key, error = %e, "failed to extend visibility"),
                }
            }
        }
    }

    /// Leak detector: if the pipeline map outgrows the sum of all
    /// pool queue capacities (the most work that could legitimately be in
    /// flight at once), something is leaking entries without cleaning them
    /// up.
    pub async fn check_pipeline_leak(&self) {
        let min_threshold = fc_common::MIN_QUEUE_CAPACITY as usize;
        let total_capacity: usize = self.pools.iter().map(|e| e.value().get_stats().queue_capacity as usize).sum();
        let threshold = total_capacity.max(min_threshold);
        let size = self.by_pipeline_key.len();

        self.metrics.record_pipeline_size(size);
        self.metrics.record_pool_stats(&self.pool_stats());

        if size > threshold {
            warn!(size, threshold, "pipeline map leak detected");
            self.warnings.warn(
                fc_common::WarningCategory::Resource,
                fc_common::WarningSeverity::Critical,
                format!("pipeline map has {size} entries, exceeding the {threshold} capacity-derived threshold"),
                "QueueManager",
            );
        }
    }

    pub fn pipeline_size(&self) -> usize {
        self.by_pipeline_key.len()
    }

    pub fn in_flight_messages(&self) -> Vec<InFlightMessageInfo> {
        self.by_pipeline_key.iter().map(|e| InFlightMessageInfo::from(e.value())).collect()
    }

    // ------------------------------------------------------------------
    // Shutdown
    // ------------------------------------------------------------------

    pub async fn shutdown(&self, drain_timeout: std::time::Duration) {
        self.running.store(false, Ordering::SeqCst);

        for consumer in self.consumers.read().await.values() {
            consumer.stop().await;
        }
        for pool in self.pools.iter() {
            pool.value().drain().await;
        }

        let deadline = Instant::now() + drain_timeout;
        while Instant::now() < deadline {
            if self.pools.iter().all(|e| e.value().is_fully_drained()) {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        }

        for pool in self.pools.iter() {
            pool.value().shutdown().await;
        }
        self.by_pipeline_key.clear();
        self.by_timestamp.clear();
        self.by_app_id.clear();
        info!("queue manager shut down");
    }
}

/// Applies a config sync snapshot's pool and queue definitions to the live
/// registries. Queue reconciliation only runs if a `ConsumerFactory` has
/// been installed via `set_consumer_factory`; the composition root installs
/// one built from its concrete broker clients (SQS, SQLite pool) before the
/// first sync.
#[async_trait::async_trait]
impl fc_config::ConfigReconciler for QueueManager {
    async fn reconcile(&self, snapshot: &fc_config::ConfigSnapshot) -> std::result::Result<(), String> {
        self.reconcile_pools(&snapshot.pools).await.map_err(|e| e.to_string())?;

        if let Some(factory) = self.consumer_factory.read().await.clone() {
            self.reconcile_queues(&snapshot.queues, factory.as_ref()).await.map_err(|e| e.to_string())?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use fc_common::{MediationOutcome, MediationType};
    use std::collections::HashMap as Map;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Mutex as TokioMutex;

    struct AlwaysSucceed;
    #[async_trait]
    impl Mediator for AlwaysSucceed {
        async fn mediate(&self, _pointer: &fc_common::MessagePointer) -> MediationOutcome {
            MediationOutcome::success(200)
        }
    }

    struct RecordingConsumer {
        queue_identifier: String,
        acked: Arc<TokioMutex<Vec<String>>>,
        naked: Arc<TokioMutex<Vec<String>>>,
        poll_count: AtomicUsize,
    }

    impl RecordingConsumer {
        fn new(queue_identifier: &str) -> Self {
            Self {
                queue_identifier: queue_identifier.to_string(),
                acked: Arc::new(TokioMutex::new(Vec::new())),
                naked: Arc::new(TokioMutex::new(Vec::new())),
                poll_count: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl QueueConsumer for RecordingConsumer {
        fn queue_identifier(&self) -> &str {
            &self.queue_identifier
        }
        async fn start(&self) -> fc_queue::Result<()> {
            Ok(())
        }
        async fn stop(&self) {}
        async fn poll(&self, _max_messages: u32) -> fc_queue::Result<Vec<BrokerMessage>> {
            self.poll_count.fetch_add(1, Ordering::SeqCst);
            Ok(vec![])
        }
        async fn ack(&self, receipt_token: &str) -> fc_queue::Result<()> {
            self.acked.lock().await.push(receipt_token.to_string());
            Ok(())
        }
        async fn nak(&self, receipt_token: &str, _delay_seconds: Option<u32>) -> fc_queue::Result<()> {
            self.naked.lock().await.push(receipt_token.to_string());
            Ok(())
        }
        async fn extend_visibility(&self, _receipt_token: &str, _seconds: u32) -> fc_queue::Result<()> {
            Ok(())
        }
        fn is_healthy(&self) -> bool {
            true
        }
        fn last_poll_age(&self) -> Option<std::time::Duration> {
            Some(std::time::Duration::from_secs(0))
        }
        fn is_fully_stopped(&self) -> bool {
            true
        }
    }

    fn pointer(id: &str, group: Option<&str>) -> fc_common::MessagePointer {
        fc_common::MessagePointer {
            id: id.to_string(),
            pool_code: "P".to_string(),
            message_group_id: group.map(|s| s.to_string()),
            mediation_type: MediationType::Http,
            mediation_target: "http://example.invalid".to_string(),
            auth_token: None,
            payload: vec![],
            headers: Map::new(),
            timeout_seconds: None,
        }
    }

    fn manager() -> QueueManager {
        QueueManager::new(Arc::new(AlwaysSucceed), Arc::new(WarningService::new(Default::default())), RuntimeSettings::default())
    }

    #[tokio::test]
    async fn unique_message_is_accepted_and_eventually_acked() {
        let manager = manager();
        manager.start().await;
        let consumer: Arc<dyn QueueConsumer> = Arc::new(RecordingConsumer::new("q1"));

        let msg = BrokerMessage { pointer: pointer("M1", None), broker_message_id: Some("B1".into()), receipt_token: "T1".into(), queue_identifier: "q1".into() };
        manager.route_batch(vec![msg], consumer.clone()).await;

        for _ in 0..20 {
            if manager.pipeline_size() == 0 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        assert_eq!(manager.pipeline_size(), 0);
    }

    #[tokio::test]
    async fn visibility_redelivery_updates_token_and_nacks_duplicate() {
        let manager = manager();
        let consumer: Arc<dyn QueueConsumer> = Arc::new(RecordingConsumer::new("q1"));

        let first = BrokerMessage { pointer: pointer("M1", None), broker_message_id: Some("B1".into()), receipt_token: "T1".into(), queue_identifier: "q1".into() };
        manager.by_pipeline_key.insert(
            "B1".to_string(),
            PipelineEntry {
                pipeline_key: "B1".into(),
                app_message_id: "M1".into(),
                pool_code: "P".into(),
                message_group_id: None,
                queue_identifier: "q1".into(),
                accepted_at: Instant::now(),
                receipt_token: "T1".into(),
                broker_message_id: Some("B1".into()),
            },
        );
        manager.by_app_id.insert("M1".into(), "B1".into());

        let redelivery = BrokerMessage { pointer: pointer("M1", None), broker_message_id: Some("B1".into()), receipt_token: "T2".into(), queue_identifier: "q1".into() };
        manager.route_batch(vec![redelivery], consumer).await;

        assert_eq!(manager.by_pipeline_key.get("B1").unwrap().receipt_token, "T2");
        let _ = first;
    }

    #[tokio::test]
    async fn external_requeue_acks_duplicate_and_keeps_one_entry() {
        let manager = manager();
        let consumer: Arc<dyn QueueConsumer> = Arc::new(RecordingConsumer::new("q1"));

        manager.by_pipeline_key.insert(
            "B1".to_string(),
            PipelineEntry {
                pipeline_key: "B1".into(),
                app_message_id: "M1".into(),
                pool_code: "P".into(),
                message_group_id: None,
                queue_identifier: "q1".into(),
                accepted_at: Instant::now(),
                receipt_token: "T1".into(),
                broker_message_id: Some("B1".into()),
            },
        );
        manager.by_app_id.insert("M1".into(), "B1".into());

        let requeued = BrokerMessage { pointer: pointer("M1", None), broker_message_id: Some("B2".into()), receipt_token: "T3".into(), queue_identifier: "q1".into() };
        manager.route_batch(vec![requeued], consumer).await;

        assert_eq!(manager.pipeline_size(), 1);
        assert!(manager.by_pipeline_key.contains_key("B1"));
    }

    #[tokio::test]
    async fn leak_detector_warns_past_threshold() {
        let manager = manager();
        for i in 0..5 {
            manager.by_pipeline_key.insert(
                format!("k{i}"),
                PipelineEntry {
                    pipeline_key: format!("k{i}"),
                    app_message_id: format!("m{i}"),
                    pool_code: "P".into(),
                    message_group_id: None,
                    queue_identifier: "q1".into(),
                    accepted_at: Instant::now(),
                    receipt_token: "t".into(),
                    broker_message_id: None,
                },
            );
        }
        // With no pools registered the floor is MIN_QUEUE_CAPACITY, far above 5.
        manager.check_pipeline_leak().await;
        assert_eq!(manager.pipeline_size(), 5);
    }

    #[tokio::test]
    async fn stale_sweeper_removes_expired_entries_from_all_maps() {
        let manager = manager();
        {
            let mut settings = manager.settings.write().await;
            settings.stale_pipeline_ttl_seconds = 0;
        }
        manager.by_pipeline_key.insert(
            "B1".to_string(),
            PipelineEntry {
                pipeline_key: "B1".into(),
                app_message_id: "M1".into(),
                pool_code: "P".into(),
                message_group_id: None,
                queue_identifier: "q1".into(),
                accepted_at: Instant::now() - std::time::Duration::from_secs(1),
                receipt_token: "T1".into(),
                broker_message_id: Some("B1".into()),
            },
        );
        manager.by_timestamp.insert("B1".to_string(), Instant::now() - std::time::Duration::from_secs(1));
        manager.by_app_id.insert("M1".into(), "B1".into());

        manager.sweep_stale_pipeline_entries().await;

        assert!(!manager.by_pipeline_key.contains_key("B1"));
        assert!(!manager.by_app_id.contains_key("M1"));
        assert!(!manager.by_timestamp.contains_key("B1"));
    }
}
