//! Metrics: counters `messages.submitted/acked/naked/rate_limited`,
//! `consumer.stall_events/restarts`, `default_pool.usage`; gauges
//! `pipeline.size`, `pools.active`, `pool.active_workers`,
//! `pool.queue_size`. A thin wrapper over the `metrics` facade so callers
//! don't sprinkle string literals across the crate.

use fc_common::PoolStats;

#[derive(Debug, Clone, Default)]
pub struct MetricsConfig {
    pub default_pool_code: String,
}

#[derive(Default)]
pub struct PoolMetricsCollector {
    config: MetricsConfig,
}

impl PoolMetricsCollector {
    pub fn new(config: MetricsConfig) -> Self {
        Self { config }
    }

    pub fn record_submitted(&self, pool_code: &str) {
        metrics::counter!("messages.submitted", "pool" => pool_code.to_string()).increment(1);
    }

    pub fn record_acked(&self, pool_code: &str) {
        metrics::counter!("messages.acked", "pool" => pool_code.to_string()).increment(1);
    }

    pub fn record_naked(&self, pool_code: &str) {
        metrics::counter!("messages.naked", "pool" => pool_code.to_string()).increment(1);
    }

    pub fn record_rate_limited(&self, pool_code: &str) {
        metrics::counter!("messages.rate_limited", "pool" => pool_code.to_string()).increment(1);
        if pool_code == self.config.default_pool_code {
            metrics::gauge!("default_pool.usage").increment(1.0);
        }
    }

    pub fn record_consumer_stall(&self, consumer_id: &str) {
        metrics::counter!("consumer.stall_events", "consumer" => consumer_id.to_string()).increment(1);
    }

    pub fn record_consumer_restart(&self, consumer_id: &str) {
        metrics::counter!("consumer.restarts", "consumer" => consumer_id.to_string()).increment(1);
    }

    pub fn record_pipeline_size(&self, size: usize) {
        metrics::gauge!("pipeline.size").set(size as f64);
    }

    pub fn record_pool_stats(&self, stats: &[PoolStats]) {
        metrics::gauge!("pools.active").set(stats.len() as f64);
        for s in stats {
            metrics::gauge!("pool.active_workers", "pool" => s.pool_code.clone()).set(s.active_workers as f64);
            metrics::gauge!("pool.queue_size", "pool" => s.pool_code.clone()).set(s.queue_size as f64);
        }
    }
}
