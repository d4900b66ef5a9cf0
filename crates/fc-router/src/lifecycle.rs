//! Lifecycle Manager: spawns the Queue Manager's background sweepers
//! as independent tasks gated on a shutdown broadcast and, where needed,
//! on primary leadership so a standby replica stays idle.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::health::HealthService;
use crate::manager::QueueManager;
use crate::warning::WarningService;
use fc_common::{WarningCategory, WarningSeverity};
use fc_standby::LeaderElector;

#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    pub visibility_extension_interval: Duration,
    pub leak_detector_interval: Duration,
    pub consumer_health_interval: Duration,
    pub warning_cleanup_interval: Duration,
    pub health_report_interval: Duration,
    pub stale_pipeline_sweep_interval: Duration,
    pub pool_drain_cleanup_interval: Duration,
    pub consumer_restart_delay: Duration,
    pub max_restart_attempts: u32,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            visibility_extension_interval: Duration::from_secs(55),
            leak_detector_interval: Duration::from_secs(30),
            consumer_health_interval: Duration::from_secs(30),
            warning_cleanup_interval: Duration::from_secs(300),
            health_report_interval: Duration::from_secs(60),
            stale_pipeline_sweep_interval: Duration::from_secs(300),
            pool_drain_cleanup_interval: Duration::from_secs(60),
            consumer_restart_delay: Duration::from_secs(5),
            max_restart_attempts: 3,
        }
    }
}

impl LifecycleConfig {
    pub fn from_runtime_settings(settings: &fc_common::RuntimeSettings) -> Self {
        Self {
            visibility_extension_interval: Duration::from_secs(settings.visibility_extend_interval_seconds),
            leak_detector_interval: Duration::from_secs(settings.leak_detector_interval_seconds),
            stale_pipeline_sweep_interval: Duration::from_secs(settings.stale_pipeline_sweep_interval_seconds),
            ..Default::default()
        }
    }
}

pub struct LifecycleManager {
    shutdown_tx: broadcast::Sender<()>,
    warning_service: Arc<WarningService>,
    health_service: Arc<HealthService>,
}

impl LifecycleManager {
    pub fn start(
        manager: Arc<QueueManager>,
        warning_service: Arc<WarningService>,
        health_service: Arc<HealthService>,
        leader: Arc<dyn LeaderElector>,
        config: LifecycleConfig,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);

        // Visibility extender: gated on leadership since every replica
        // shares the same broker visibility state.
        {
            let manager = manager.clone();
            let leader = leader.clone();
            let mut shutdown_rx = shutdown_tx.subscribe();
            let interval = config.visibility_extension_interval;

            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            if !leader.is_primary() { continue; }
                            debug!("running visibility extension sweep");
                            let consumers = manager.snapshot_consumers().await;
                            manager.extend_visibility_for_long_running(&consumers).await;
                        }
                        _ = shutdown_rx.recv() => {
                            info!("visibility extender shutting down");
                            break;
                        }
                    }
                }
            });
        }

        // Stale pipeline sweeper: TTL-based cleanup of entries a
        // worker never completed.
        {
            let manager = manager.clone();
            let leader = leader.clone();
            let mut shutdown_rx = shutdown_tx.subscribe();
            let interval = config.stale_pipeline_sweep_interval;

            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            if !leader.is_primary() { continue; }
                            manager.sweep_stale_pipeline_entries().await;
                        }
                        _ = shutdown_rx.recv() => {
                            info!("stale pipeline sweeper shutting down");
                            break;
                        }
                    }
                }
            });
        }

        // Leak detector.
        {
            let manager = manager.clone();
            let leader = leader.clone();
            let mut shutdown_rx = shutdown_tx.subscribe();
            let interval = config.leak_detector_interval;

            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            if !leader.is_primary() { continue; }
                            manager.check_pipeline_leak().await;
                        }
                        _ = shutdown_rx.recv() => {
                            info!("leak detector shutting down");
                            break;
                        }
                    }
                }
            });
        }

        // Pool draining cleanup: shuts a drained pool down fully once it
        // reports no queued work and no active workers. Runs regardless of
        // leadership since it only touches this instance's own pool set.
        {
            let manager = manager.clone();
            let mut shutdown_rx = shutdown_tx.subscribe();
            let interval = config.pool_drain_cleanup_interval;

            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            manager.cleanup_draining_pools().await;
                        }
                        _ = shutdown_rx.recv() => {
                            info!("pool drain cleanup shutting down");
                            break;
                        }
                    }
                }
            });
        }

        // Consumer health monitor with auto-restart.
        {
            let manager = manager.clone();
            let health_service = health_service.clone();
            let warning_service = warning_service.clone();
            let leader = leader.clone();
            let mut shutdown_rx = shutdown_tx.subscribe();
            let interval = config.consumer_health_interval;
            let restart_delay = config.consumer_restart_delay;
            let max_attempts = config.max_restart_attempts;

            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                let mut restart_attempts: std::collections::HashMap<String, u32> = std::collections::HashMap::new();

                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            if !leader.is_primary() { continue; }
                            let stalled = health_service.get_stalled_consumers();

                            for consumer_id in &stalled {
                                let attempts = restart_attempts.entry(consumer_id.clone()).or_insert(0);

                                if *attempts < max_attempts {
                                    warn!(consumer_id = %consumer_id, attempt = *attempts + 1, max_attempts, "stalled consumer detected, attempting restart");
                                    warning_service.add_warning(
                                        WarningCategory::ConsumerHealth,
                                        WarningSeverity::Warn,
                                        format!("consumer {consumer_id} is stalled, restart attempt {}", *attempts + 1),
                                        "LifecycleManager".to_string(),
                                    );

                                    tokio::time::sleep(restart_delay).await;

                                    match manager.restart_consumer(consumer_id).await {
                                        Ok(()) => {
                                            *attempts += 1;
                                            info!(consumer_id = %consumer_id, "consumer restart initiated");
                                        }
                                        Err(e) => {
                                            warn!(consumer_id = %consumer_id, error = %e, "consumer restart failed");
                                        }
                                    }
                                } else {
                                    error!(consumer_id = %consumer_id, attempts = *attempts, "consumer restart attempts exhausted");
                                    warning_service.add_warning(
                                        WarningCategory::ConsumerHealth,
                                        WarningSeverity::Critical,
                                        format!("consumer {consumer_id} restart failed after {} attempts, manual intervention required", *attempts),
                                        "LifecycleManager".to_string(),
                                    );
                                }
                            }

                            restart_attempts.retain(|id, _| stalled.contains(id));
                        }
                        _ = shutdown_rx.recv() => {
                            info!("consumer health monitor shutting down");
                            break;
                        }
                    }
                }
            });
        }

        // Warning service cleanup.
        {
            let warning_service = warning_service.clone();
            let mut shutdown_rx = shutdown_tx.subscribe();
            let interval = config.warning_cleanup_interval;

            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            debug!("running warning service cleanup");
                            warning_service.cleanup();
                        }
                        _ = shutdown_rx.recv() => {
                            info!("warning cleanup task shutting down");
                            break;
                        }
                    }
                }
            });
        }

        // Health report logger.
        {
            let manager = manager.clone();
            let health_service = health_service.clone();
            let mut shutdown_rx = shutdown_tx.subscribe();
            let interval = config.health_report_interval;

            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            let pool_stats = manager.pool_stats();
                            let report = health_service.get_health_report(&pool_stats);
                            if !report.issues.is_empty() {
                                warn!(status = ?report.status, issues = ?report.issues, "health report");
                            } else {
                                debug!(status = ?report.status, "health report: ok");
                            }
                        }
                        _ = shutdown_rx.recv() => {
                            info!("health report logger shutting down");
                            break;
                        }
                    }
                }
            });
        }

        info!("lifecycle manager started with all background tasks");

        Self { shutdown_tx, warning_service, health_service }
    }

    pub fn warning_service(&self) -> &Arc<WarningService> {
        &self.warning_service
    }

    pub fn health_service(&self) -> &Arc<HealthService> {
        &self.health_service
    }

    pub async fn shutdown(&self) {
        info!("lifecycle manager shutting down");
        let _ = self.shutdown_tx.send(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_documented_cadence() {
        let config = LifecycleConfig::default();
        assert_eq!(config.visibility_extension_interval, Duration::from_secs(55));
        assert_eq!(config.leak_detector_interval, Duration::from_secs(30));
        assert_eq!(config.stale_pipeline_sweep_interval, Duration::from_secs(300));
    }

    #[test]
    fn from_runtime_settings_overrides_sweeper_intervals() {
        let settings = fc_common::RuntimeSettings::default();
        let config = LifecycleConfig::from_runtime_settings(&settings);
        assert_eq!(config.visibility_extension_interval, Duration::from_secs(settings.visibility_extend_interval_seconds));
        assert_eq!(config.leak_detector_interval, Duration::from_secs(settings.leak_detector_interval_seconds));
    }
}
