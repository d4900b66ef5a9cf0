//! Health Service: rolling view of consumer and watcher liveness, used by
//! the operational surface and the consumer auto-restart sweeper.

use dashmap::DashMap;
use fc_common::{ConsumerHealth, HealthReport, HealthStatus, PoolStats, WatcherStatus};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct HealthServiceConfig {
    /// A consumer whose last successful poll is older than this is
    /// considered stalled for auto-restart purposes.
    pub stall_threshold: Duration,
    pub pool_warning_ratio: f64,
}

impl Default for HealthServiceConfig {
    fn default() -> Self {
        Self { stall_threshold: Duration::from_secs(60), pool_warning_ratio: 0.85 }
    }
}

pub struct HealthService {
    config: HealthServiceConfig,
    consumers: DashMap<String, ConsumerHealth>,
    watchers: DashMap<String, WatcherStatus>,
}

impl HealthService {
    pub fn new(config: HealthServiceConfig) -> Self {
        Self { config, consumers: DashMap::new(), watchers: DashMap::new() }
    }

    pub fn report_consumer_health(&self, health: ConsumerHealth) {
        self.consumers.insert(health.queue_identifier.clone(), health);
    }

    pub fn report_watcher_status(&self, status: WatcherStatus) {
        self.watchers.insert(status.name.clone(), status);
    }

    pub fn consumer_healths(&self) -> Vec<ConsumerHealth> {
        self.consumers.iter().map(|e| e.value().clone()).collect()
    }

    pub fn watcher_statuses(&self) -> Vec<WatcherStatus> {
        self.watchers.iter().map(|e| e.value().clone()).collect()
    }

    pub fn get_stalled_consumers(&self) -> Vec<String> {
        let threshold_millis = self.config.stall_threshold.as_millis() as i64;
        self.consumers
            .iter()
            .filter(|e| {
                let health = e.value();
                !health.is_healthy || health.last_poll_age_millis.map(|age| age > threshold_millis).unwrap_or(false)
            })
            .map(|e| e.key().clone())
            .collect()
    }

    /// Synthesizes a report from the latest consumer/watcher readings plus
    /// the pool stats the manager hands in. Degraded takes precedence over
    /// Warning; an empty fleet is Healthy by default.
    pub fn get_health_report(&self, pool_stats: &[PoolStats]) -> HealthReport {
        let mut issues = Vec::new();
        let mut status = HealthStatus::Healthy;

        for consumer in self.consumers.iter() {
            let health = consumer.value();
            if !health.is_healthy {
                status = HealthStatus::Degraded;
                issues.push(format!("consumer {} is unhealthy", health.queue_identifier));
            } else if health.last_poll_age_millis.map(|a| a > self.config.stall_threshold.as_millis() as i64).unwrap_or(false) {
                status = status.max(HealthStatus::Warning);
                issues.push(format!("consumer {} poll is stale", health.queue_identifier));
            }
        }

        for watcher in self.watchers.iter() {
            let w = watcher.value();
            if w.has_fatal_error {
                status = HealthStatus::Degraded;
                issues.push(format!("watcher {} has a fatal error", w.name));
            } else if !w.running {
                status = status.max(HealthStatus::Warning);
                issues.push(format!("watcher {} is not running", w.name));
            }
        }

        for stats in pool_stats {
            if stats.queue_capacity > 0 {
                let usage = stats.queue_size as f64 / stats.queue_capacity as f64;
                if usage >= self.config.pool_warning_ratio {
                    status = status.max(HealthStatus::Warning);
                    issues.push(format!("pool {} queue at {:.0}% capacity", stats.pool_code, usage * 100.0));
                }
            }
        }

        HealthReport { status, issues }
    }
}

trait HealthStatusOrd {
    fn max(self, other: HealthStatus) -> HealthStatus;
}

impl HealthStatusOrd for HealthStatus {
    fn max(self, other: HealthStatus) -> HealthStatus {
        fn rank(s: HealthStatus) -> u8 {
            match s {
                HealthStatus::Healthy => 0,
                HealthStatus::Warning => 1,
                HealthStatus::Degraded => 2,
            }
        }
        if rank(other) > rank(self) {
            other
        } else {
            self
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn healthy_fleet_reports_healthy() {
        let service = HealthService::new(HealthServiceConfig::default());
        service.report_consumer_health(ConsumerHealth {
            queue_identifier: "q1".into(),
            is_healthy: true,
            last_poll_age_millis: Some(10),
            is_running: true,
        });
        let report = service.get_health_report(&[]);
        assert_eq!(report.status, HealthStatus::Healthy);
    }

    #[test]
    fn unhealthy_consumer_degrades_and_is_flagged_stalled() {
        let service = HealthService::new(HealthServiceConfig::default());
        service.report_consumer_health(ConsumerHealth {
            queue_identifier: "q1".into(),
            is_healthy: false,
            last_poll_age_millis: None,
            is_running: false,
        });
        let report = service.get_health_report(&[]);
        assert_eq!(report.status, HealthStatus::Degraded);
        assert_eq!(service.get_stalled_consumers(), vec!["q1".to_string()]);
    }

    #[test]
    fn fatal_watcher_error_degrades() {
        let service = HealthService::new(HealthServiceConfig::default());
        service.report_watcher_status(WatcherStatus {
            name: "events".into(),
            running: false,
            has_fatal_error: true,
            batches_processed: 10,
            checkpointed_seq: 5,
            in_flight: 0,
            available_slots: 4,
        });
        assert_eq!(service.get_health_report(&[]).status, HealthStatus::Degraded);
    }
}
