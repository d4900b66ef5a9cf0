//! Process Pool (C3): bounded per-pool concurrency, rate limiting, and
//! per-message-group FIFO ordering with a submit-failure barrier.
//!
//! Each message group gets its own mpsc queue and worker task so that
//! ordering within a group is wait-free against other groups; the pool's
//! `Semaphore` is the single cross-group concurrency bound.

use dashmap::{DashMap, DashSet};
use fc_common::{MediationResult, MessagePointer, PoolConfig, PoolStats};
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use parking_lot::{Mutex, RwLock};
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Semaphore};
use tracing::{debug, error, info, warn};

use crate::mediator::Mediator;
use crate::metrics::PoolMetricsCollector;

const DEFAULT_GROUP: &str = "__DEFAULT__";
const GROUP_QUEUE_DEPTH: usize = 256;
const GROUP_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

pub enum AckDecision {
    Ack,
    Nak { delay_seconds: Option<u32> },
}

/// Work handed to the pool. `pipeline_key` and `ack_tx` let the caller (the
/// QueueManager) learn the outcome without the pool knowing anything about
/// broker semantics.
pub struct PoolSubmission {
    pub pointer: MessagePointer,
    pub pipeline_key: String,
    pub batch_id: Option<String>,
    pub ack_tx: oneshot::Sender<AckDecision>,
}

type SharedRateLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

pub struct ProcessPool {
    code: String,
    mediator: Arc<dyn Mediator>,
    config: Mutex<PoolConfig>,
    semaphore: Arc<Semaphore>,
    effective_concurrency: AtomicU32,
    message_group_queues: Arc<DashMap<String, mpsc::Sender<PoolSubmission>>>,
    failed_batch_groups: Arc<DashSet<String>>,
    rate_limiter: Arc<RwLock<Option<Arc<SharedRateLimiter>>>>,
    running: AtomicBool,
    queue_size: Arc<AtomicU32>,
    active_workers: Arc<AtomicU32>,
    metrics: Arc<PoolMetricsCollector>,
}

fn build_rate_limiter(rpm: Option<u32>) -> Option<Arc<SharedRateLimiter>> {
    rpm.and_then(NonZeroU32::new).map(|nz| Arc::new(RateLimiter::direct(Quota::per_minute(nz))))
}

impl ProcessPool {
    pub fn new(config: PoolConfig, mediator: Arc<dyn Mediator>) -> Self {
        Self::with_metrics(config, mediator, Arc::new(PoolMetricsCollector::default()))
    }

    pub fn with_metrics(config: PoolConfig, mediator: Arc<dyn Mediator>, metrics: Arc<PoolMetricsCollector>) -> Self {
        let concurrency = config.concurrency;
        let rate_limiter = build_rate_limiter(config.rate_limit_per_minute);

        Self {
            code: config.code.clone(),
            mediator,
            config: Mutex::new(config),
            semaphore: Arc::new(Semaphore::new(concurrency as usize)),
            effective_concurrency: AtomicU32::new(concurrency),
            message_group_queues: Arc::new(DashMap::new()),
            failed_batch_groups: Arc::new(DashSet::new()),
            rate_limiter: Arc::new(RwLock::new(rate_limiter)),
            running: AtomicBool::new(false),
            queue_size: Arc::new(AtomicU32::new(0)),
            active_workers: Arc::new(AtomicU32::new(0)),
            metrics,
        }
    }

    pub async fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(pool_code = %self.code, concurrency = self.effective_concurrency.load(Ordering::SeqCst), "process pool started");
    }

    fn queue_capacity(&self) -> u32 {
        self.config.lock().queue_capacity()
    }

    pub fn available_capacity(&self) -> usize {
        let capacity = self.queue_capacity() as usize;
        let used = self.queue_size.load(Ordering::SeqCst) as usize;
        capacity.saturating_sub(used)
    }

    pub fn has_capacity(&self, n: usize) -> bool {
        self.available_capacity() >= n
    }

    pub fn is_rate_limited(&self) -> bool {
        self.rate_limiter.read().as_ref().map(|rl| rl.check().is_err()).unwrap_or(false)
    }

    /// Marks a batch+group as failed so the rest of that group's messages
    /// in this batch are rejected without reaching a worker (failure
    /// barrier, P4).
    pub fn mark_batch_group_failed(&self, batch_id: &str, group_id: &str) {
        self.failed_batch_groups.insert(format!("{batch_id}|{group_id}"));
    }

    /// Returns `true` if the submission was enqueued onto a group worker,
    /// `false` if it was rejected outright (the `ack_tx` has already been
    /// resolved with a `Nak` in that case). Callers driving a batch use the
    /// `false` return to stop submitting later messages in the same group
    /// without even constructing them.
    pub async fn submit(&self, submission: PoolSubmission) -> bool {
        if !self.running.load(Ordering::SeqCst) {
            let _ = submission.ack_tx.send(AckDecision::Nak { delay_seconds: Some(5) });
            return false;
        }

        let capacity = self.queue_capacity();
        if self.queue_size.load(Ordering::SeqCst) >= capacity {
            debug!(pool_code = %self.code, "pool at capacity, rejecting submission");
            let _ = submission.ack_tx.send(AckDecision::Nak { delay_seconds: Some(5) });
            return false;
        }

        let group_id = submission
            .pointer
            .message_group_id
            .as_ref()
            .filter(|s| !s.is_empty())
            .cloned()
            .unwrap_or_else(|| DEFAULT_GROUP.to_string());

        if let Some(batch_id) = &submission.batch_id {
            let key = format!("{batch_id}|{group_id}");
            if self.failed_batch_groups.contains(&key) {
                debug!(message_id = %submission.pointer.id, batch_group = %key, "failure barrier active, nacking for fifo");
                let _ = submission.ack_tx.send(AckDecision::Nak { delay_seconds: Some(1) });
                return false;
            }
        }

        self.queue_size.fetch_add(1, Ordering::SeqCst);
        let group_tx = self.get_or_create_group_queue(&group_id);
        if group_tx.send(submission).await.is_err() {
            error!(pool_code = %self.code, group_id = %group_id, "group worker gone, dropping submission");
            self.queue_size.fetch_sub(1, Ordering::SeqCst);
            return false;
        }
        self.metrics.record_submitted(&self.code);
        true
    }

    fn get_or_create_group_queue(&self, group_id: &str) -> mpsc::Sender<PoolSubmission> {
        if let Some(tx) = self.message_group_queues.get(group_id) {
            return tx.clone();
        }

        let (tx, rx) = mpsc::channel(GROUP_QUEUE_DEPTH);
        self.message_group_queues.insert(group_id.to_string(), tx.clone());

        let worker = GroupWorker {
            group_id: group_id.to_string(),
            pool_code: self.code.clone(),
            semaphore: self.semaphore.clone(),
            mediator: self.mediator.clone(),
            rate_limiter: self.rate_limiter.clone(),
            queue_size: self.queue_size.clone(),
            active_workers: self.active_workers.clone(),
            failed_batch_groups: self.failed_batch_groups.clone(),
            message_group_queues: self.message_group_queues.clone(),
            metrics: self.metrics.clone(),
        };
        tokio::spawn(worker.run(rx));

        tx
    }

    pub async fn drain(&self) {
        info!(pool_code = %self.code, "draining pool");
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_fully_drained(&self) -> bool {
        self.queue_size.load(Ordering::SeqCst) == 0 && self.active_workers.load(Ordering::SeqCst) == 0
    }

    pub async fn shutdown(&self) {
        info!(pool_code = %self.code, "shutting down pool");
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn get_stats(&self) -> PoolStats {
        let config = self.config.lock();
        PoolStats {
            pool_code: self.code.clone(),
            concurrency: self.effective_concurrency.load(Ordering::SeqCst),
            active_workers: self.active_workers.load(Ordering::SeqCst),
            queue_size: self.queue_size.load(Ordering::SeqCst),
            queue_capacity: config.queue_capacity(),
            rate_limit_per_minute: config.rate_limit_per_minute,
            is_rate_limited: self.is_rate_limited(),
        }
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn concurrency(&self) -> u32 {
        self.effective_concurrency.load(Ordering::SeqCst)
    }

    pub fn rate_limit_per_minute(&self) -> Option<u32> {
        self.config.lock().rate_limit_per_minute
    }

    pub fn queue_size(&self) -> u32 {
        self.queue_size.load(Ordering::SeqCst)
    }

    pub fn active_workers(&self) -> u32 {
        self.active_workers.load(Ordering::SeqCst)
    }

    /// Resizes worker concurrency. Growing adds permits immediately;
    /// shrinking removes permits as they become free, so in-progress
    /// workers above the new target finish uninterrupted (open question
    /// resolved in favor of "in-progress is inviolate").
    pub async fn update_concurrency(&self, new_concurrency: u32) {
        self.config.lock().concurrency = new_concurrency;
        let old = self.effective_concurrency.swap(new_concurrency, Ordering::SeqCst);
        if new_concurrency == old {
            return;
        }

        if new_concurrency > old {
            self.semaphore.add_permits((new_concurrency - old) as usize);
            info!(pool_code = %self.code, old, new = new_concurrency, "increased pool concurrency");
        } else {
            let to_remove = old - new_concurrency;
            let semaphore = self.semaphore.clone();
            let pool_code = self.code.clone();
            tokio::spawn(async move {
                if let Ok(permit) = semaphore.acquire_many_owned(to_remove).await {
                    permit.forget();
                    info!(pool_code = %pool_code, removed = to_remove, "reduced pool concurrency");
                }
            });
        }
    }

    /// Swaps the rate limiter in place; outstanding work is unaffected
    /// without dropping outstanding work.
    pub fn update_rate_limit(&self, new_rate_limit: Option<u32>) {
        self.config.lock().rate_limit_per_minute = new_rate_limit;
        *self.rate_limiter.write() = build_rate_limiter(new_rate_limit);
        info!(pool_code = %self.code, new = ?new_rate_limit, "updated pool rate limit");
    }
}

struct GroupWorker {
    group_id: String,
    pool_code: String,
    semaphore: Arc<Semaphore>,
    mediator: Arc<dyn Mediator>,
    rate_limiter: Arc<RwLock<Option<Arc<SharedRateLimiter>>>>,
    queue_size: Arc<AtomicU32>,
    active_workers: Arc<AtomicU32>,
    failed_batch_groups: Arc<DashSet<String>>,
    message_group_queues: Arc<DashMap<String, mpsc::Sender<PoolSubmission>>>,
    metrics: Arc<PoolMetricsCollector>,
}

impl GroupWorker {
    async fn run(self, mut rx: mpsc::Receiver<PoolSubmission>) {
        debug!(group_id = %self.group_id, pool_code = %self.pool_code, "group worker started");

        loop {
            let submission = match tokio::time::timeout(GROUP_IDLE_TIMEOUT, rx.recv()).await {
                Ok(Some(s)) => s,
                Ok(None) => break,
                Err(_) => {
                    if rx.is_empty() {
                        self.message_group_queues.remove(&self.group_id);
                        break;
                    }
                    continue;
                }
            };

            self.queue_size.fetch_sub(1, Ordering::SeqCst);

            if let Some(batch_id) = &submission.batch_id {
                let key = format!("{batch_id}|{}", self.group_id);
                if self.failed_batch_groups.contains(&key) {
                    debug!(message_id = %submission.pointer.id, batch_group = %key, "failure barrier tripped after enqueue, nacking without mediating");
                    let _ = submission.ack_tx.send(AckDecision::Nak { delay_seconds: Some(1) });
                    continue;
                }
            }

            if self.rate_limiter.read().as_ref().map(|rl| rl.check().is_err()).unwrap_or(false) {
                debug!(message_id = %submission.pointer.id, pool_code = %self.pool_code, "rate limit exceeded, fast-fail nacking without a permit");
                self.metrics.record_rate_limited(&self.pool_code);
                let _ = submission.ack_tx.send(AckDecision::Nak { delay_seconds: Some(1) });
                continue;
            }

            let permit = match self.semaphore.clone().acquire_owned().await {
                Ok(p) => p,
                Err(_) => {
                    let _ = submission.ack_tx.send(AckDecision::Nak { delay_seconds: Some(5) });
                    break;
                }
            };

            self.active_workers.fetch_add(1, Ordering::SeqCst);

            let outcome = self.mediator.mediate(&submission.pointer).await;

            let decision = match outcome.result {
                MediationResult::Success => {
                    debug!(message_id = %submission.pointer.id, "mediation succeeded");
                    AckDecision::Ack
                }
                MediationResult::ErrorConfig => {
                    warn!(message_id = %submission.pointer.id, error = ?outcome.error_message, "permanent misconfiguration, acking");
                    AckDecision::Ack
                }
                _ => {
                    warn!(message_id = %submission.pointer.id, result = ?outcome.result, error = ?outcome.error_message, "mediation failed, nacking");
                    if let Some(batch_id) = &submission.batch_id {
                        self.failed_batch_groups.insert(format!("{batch_id}|{}", self.group_id));
                    }
                    AckDecision::Nak { delay_seconds: None }
                }
            };

            match decision {
                AckDecision::Ack => self.metrics.record_acked(&self.pool_code),
                AckDecision::Nak { .. } => self.metrics.record_naked(&self.pool_code),
            }
            let _ = submission.ack_tx.send(decision);

            self.active_workers.fetch_sub(1, Ordering::SeqCst);
            drop(permit);
        }

        debug!(group_id = %self.group_id, pool_code = %self.pool_code, "group worker exited");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use fc_common::{MediationOutcome, MediationType};
    use std::collections::HashMap;

    struct AlwaysSucceed;
    #[async_trait]
    impl Mediator for AlwaysSucceed {
        async fn mediate(&self, _pointer: &MessagePointer) -> MediationOutcome {
            MediationOutcome::success(200)
        }
    }

    struct AlwaysFail;
    #[async_trait]
    impl Mediator for AlwaysFail {
        async fn mediate(&self, _pointer: &MessagePointer) -> MediationOutcome {
            MediationOutcome::classify(503)
        }
    }

    fn pointer(id: &str, group: Option<&str>) -> MessagePointer {
        MessagePointer {
            id: id.to_string(),
            pool_code: "P".to_string(),
            message_group_id: group.map(|s| s.to_string()),
            mediation_type: MediationType::Http,
            mediation_target: "http://example.invalid".to_string(),
            auth_token: None,
            payload: vec![],
            headers: HashMap::new(),
            timeout_seconds: None,
        }
    }

    #[tokio::test]
    async fn submit_success_acks() {
        let pool = ProcessPool::new(
            PoolConfig { code: "P".into(), concurrency: 2, rate_limit_per_minute: None },
            Arc::new(AlwaysSucceed),
        );
        pool.start().await;

        let (tx, rx) = oneshot::channel();
        pool.submit(PoolSubmission { pointer: pointer("M1", None), pipeline_key: "M1".into(), batch_id: None, ack_tx: tx }).await;

        match rx.await.unwrap() {
            AckDecision::Ack => {}
            _ => panic!("expected ack"),
        }
    }

    #[tokio::test]
    async fn failure_barrier_nacks_remaining_group_members() {
        let pool = ProcessPool::new(
            PoolConfig { code: "P".into(), concurrency: 1, rate_limit_per_minute: None },
            Arc::new(AlwaysFail),
        );
        pool.start().await;

        let (tx1, rx1) = oneshot::channel();
        pool.submit(PoolSubmission { pointer: pointer("M1", Some("g1")), pipeline_key: "M1".into(), batch_id: Some("b1".into()), ack_tx: tx1 }).await;
        assert!(matches!(rx1.await.unwrap(), AckDecision::Nak { .. }));

        // Give the worker a beat to record the failure in failed_batch_groups.
        tokio::task::yield_now().await;

        let (tx2, rx2) = oneshot::channel();
        pool.submit(PoolSubmission { pointer: pointer("M2", Some("g1")), pipeline_key: "M2".into(), batch_id: Some("b1".into()), ack_tx: tx2 }).await;
        assert!(matches!(rx2.await.unwrap(), AckDecision::Nak { .. }));
    }

    #[tokio::test]
    async fn update_concurrency_increase_adds_permits() {
        let pool = ProcessPool::new(
            PoolConfig { code: "P".into(), concurrency: 1, rate_limit_per_minute: None },
            Arc::new(AlwaysSucceed),
        );
        pool.update_concurrency(5).await;
        assert_eq!(pool.concurrency(), 5);
    }
}
