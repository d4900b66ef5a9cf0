//! Warning Service: in-memory, bounded, categorized operator warnings
//! Surfaced on the operational endpoint and used to report runtime error conditions. Implements
//! `fc_common::WarningSink` so the mediator, pools, and manager can all
//! report through the same trait object without depending on this crate's
//! concrete type.

use dashmap::DashMap;
use fc_common::{Warning, WarningCategory, WarningSeverity, WarningSink};
use std::time::Duration;
use tracing::info;

#[derive(Debug, Clone)]
pub struct WarningServiceConfig {
    /// Warnings older than this are purged on cleanup, regardless of
    /// acknowledgement state.
    pub retention: Duration,
    /// Hard cap on stored warnings; oldest are evicted first once exceeded.
    pub max_stored: usize,
}

impl Default for WarningServiceConfig {
    fn default() -> Self {
        Self { retention: Duration::from_secs(24 * 3600), max_stored: 10_000 }
    }
}

pub struct WarningService {
    config: WarningServiceConfig,
    warnings: DashMap<String, Warning>,
}

impl WarningService {
    pub fn new(config: WarningServiceConfig) -> Self {
        Self { config, warnings: DashMap::new() }
    }

    pub fn add_warning(&self, category: WarningCategory, severity: WarningSeverity, message: String, source: String) -> String {
        let warning = Warning::new(category, severity, message, source);
        let id = warning.id.clone();

        if self.warnings.len() >= self.config.max_stored {
            self.evict_oldest();
        }

        self.warnings.insert(id.clone(), warning);
        id
    }

    fn evict_oldest(&self) {
        if let Some(oldest) = self.warnings.iter().min_by_key(|e| e.value().created_at).map(|e| e.key().clone()) {
            self.warnings.remove(&oldest);
        }
    }

    pub fn list(&self) -> Vec<Warning> {
        let mut warnings: Vec<_> = self.warnings.iter().map(|e| e.value().clone()).collect();
        warnings.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        warnings
    }

    pub fn critical(&self) -> Vec<Warning> {
        self.list().into_iter().filter(|w| w.severity == WarningSeverity::Critical && !w.acknowledged).collect()
    }

    pub fn acknowledge(&self, id: &str) -> bool {
        self.warnings.get_mut(id).map(|mut w| w.acknowledged = true).is_some()
    }

    pub fn acknowledge_all(&self) -> usize {
        let mut count = 0;
        for mut entry in self.warnings.iter_mut() {
            if !entry.value().acknowledged {
                entry.value_mut().acknowledged = true;
                count += 1;
            }
        }
        count
    }

    /// Periodic cleanup: drops warnings past
    /// retention, acknowledged or not.
    pub fn cleanup(&self) {
        let cutoff = chrono::Utc::now() - chrono::Duration::from_std(self.config.retention).unwrap_or(chrono::Duration::hours(24));
        let stale: Vec<String> = self.warnings.iter().filter(|e| e.value().created_at < cutoff).map(|e| e.key().clone()).collect();
        let removed = stale.len();
        for id in stale {
            self.warnings.remove(&id);
        }
        if removed > 0 {
            info!(removed, "purged stale warnings");
        }
    }

    pub fn len(&self) -> usize {
        self.warnings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.warnings.is_empty()
    }
}

impl WarningSink for WarningService {
    fn warn(&self, category: WarningCategory, severity: WarningSeverity, message: String, source: &str) {
        self.add_warning(category, severity, message, source.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_and_acknowledge_round_trips() {
        let service = WarningService::new(WarningServiceConfig::default());
        let id = service.add_warning(WarningCategory::Routing, WarningSeverity::Warn, "oops".into(), "test".into());
        assert_eq!(service.list().len(), 1);
        assert!(service.acknowledge(&id));
        assert!(service.list()[0].acknowledged);
    }

    #[test]
    fn critical_filters_unacknowledged_only() {
        let service = WarningService::new(WarningServiceConfig::default());
        let id = service.add_warning(WarningCategory::PoolCapacity, WarningSeverity::Critical, "full".into(), "test".into());
        assert_eq!(service.critical().len(), 1);
        service.acknowledge(&id);
        assert_eq!(service.critical().len(), 0);
    }

    #[test]
    fn eviction_keeps_store_bounded() {
        let service = WarningService::new(WarningServiceConfig { retention: Duration::from_secs(3600), max_stored: 2 });
        service.add_warning(WarningCategory::Routing, WarningSeverity::Info, "a".into(), "t".into());
        service.add_warning(WarningCategory::Routing, WarningSeverity::Info, "b".into(), "t".into());
        service.add_warning(WarningCategory::Routing, WarningSeverity::Info, "c".into(), "t".into());
        assert_eq!(service.len(), 2);
    }
}
