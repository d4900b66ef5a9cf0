//! Shared wire and domain types for the FlowCatalyst message-plane core.
//!
//! No I/O lives here: this crate is the vocabulary `fc-queue`, `fc-router`,
//! `fc-stream` and `fc-config` all speak, kept free of broker/HTTP/database
//! dependencies so it can be pulled in by every leaf crate without pulling
//! their transitive stacks along.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use utoipa::ToSchema;

// ============================================================================
// Message Pointer (router wire format)
// ============================================================================

/// The compact descriptor of work consumed from a broker. Carries no retry
/// state of its own -- that lives on the broker side of the `BrokerMessage`
/// envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagePointer {
    pub id: String,
    pub pool_code: String,
    #[serde(default)]
    pub message_group_id: Option<String>,
    #[serde(default = "MediationType::default")]
    pub mediation_type: MediationType,
    pub mediation_target: String,
    #[serde(default)]
    pub auth_token: Option<String>,
    #[serde(default)]
    pub payload: Vec<u8>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub timeout_seconds: Option<u32>,
}

impl MessagePointer {
    pub fn timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.timeout_seconds.unwrap_or(DEFAULT_MEDIATION_TIMEOUT_SECONDS) as u64)
    }
}

pub const DEFAULT_MEDIATION_TIMEOUT_SECONDS: u32 = 30;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum MediationType {
    #[default]
    #[serde(rename = "HTTP")]
    Http,
}

// ============================================================================
// In-pipeline tracking (Queue Manager dedup state)
// ============================================================================

/// In-memory record for a single in-flight message. One entry lives under
/// `pipeline_key` and, separately, under `pointer.id` -- see
/// `fc-router::manager` for the map ownership invariants.
#[derive(Debug, Clone)]
pub struct PipelineEntry {
    pub pipeline_key: String,
    pub app_message_id: String,
    pub pool_code: String,
    pub message_group_id: Option<String>,
    pub queue_identifier: String,
    pub accepted_at: std::time::Instant,
    /// Current receipt/ack token. Updated in place on redelivery so the
    /// eventual ack uses the broker's latest valid token (P7).
    pub receipt_token: String,
    pub broker_message_id: Option<String>,
}

impl PipelineEntry {
    pub fn elapsed(&self) -> std::time::Duration {
        self.accepted_at.elapsed()
    }
}

// ============================================================================
// Pool / Queue configuration (read from the external config source)
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct PoolConfig {
    pub code: String,
    pub concurrency: u32,
    #[serde(default)]
    pub rate_limit_per_minute: Option<u32>,
}

pub const DEFAULT_POOL_CONCURRENCY: u32 = 20;
pub const DEFAULT_POOL_CODE: &str = "DEFAULT-POOL";
pub const QUEUE_CAPACITY_MULTIPLIER: u32 = 10;
pub const MIN_QUEUE_CAPACITY: u32 = 500;

impl PoolConfig {
    pub fn queue_capacity(&self) -> u32 {
        std::cmp::max(self.concurrency * QUEUE_CAPACITY_MULTIPLIER, MIN_QUEUE_CAPACITY)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueConfig {
    pub queue_identifier: String,
    pub broker_type: BrokerType,
    #[serde(default)]
    pub connections: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BrokerType {
    Sqs,
    Embedded,
}

/// Knobs that aren't per-pool/per-queue: sweeper intervals, pool limits,
/// leader lease timing. Read once at startup and reconciled alongside pool
/// and queue config on each sync tick.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeSettings {
    pub message_router_enabled: bool,
    pub max_pools: usize,
    pub pool_warning_threshold: usize,
    pub sync_interval_seconds: u64,
    pub stale_pipeline_sweep_interval_seconds: u64,
    pub stale_pipeline_ttl_seconds: u64,
    pub visibility_extend_interval_seconds: u64,
    pub visibility_extend_threshold_seconds: u64,
    pub visibility_extend_by_seconds: u32,
    pub leak_detector_interval_seconds: u64,
    pub leader_lease_seconds: u64,
    pub leader_refresh_seconds: u64,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            message_router_enabled: true,
            max_pools: 2000,
            pool_warning_threshold: 1000,
            sync_interval_seconds: 60,
            stale_pipeline_sweep_interval_seconds: 300,
            stale_pipeline_ttl_seconds: 3600,
            visibility_extend_interval_seconds: 55,
            visibility_extend_threshold_seconds: 50,
            visibility_extend_by_seconds: 120,
            leak_detector_interval_seconds: 30,
            leader_lease_seconds: 30,
            leader_refresh_seconds: 10,
        }
    }
}

// ============================================================================
// Mediation outcome (HTTP Mediator result classification)
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediationResult {
    Success,
    ErrorClient,
    ErrorServer,
    ErrorConfig,
    ErrorTimeout,
    ErrorTransport,
}

impl MediationResult {
    /// Whether the router should ACK (remove permanently) rather than NAK.
    pub fn is_ack(&self) -> bool {
        matches!(self, MediationResult::Success | MediationResult::ErrorConfig)
    }
}

#[derive(Debug, Clone)]
pub struct MediationOutcome {
    pub result: MediationResult,
    pub status_code: Option<u16>,
    pub error_message: Option<String>,
}

impl MediationOutcome {
    pub fn success(status: u16) -> Self {
        Self { result: MediationResult::Success, status_code: Some(status), error_message: None }
    }

    pub fn classify(status: u16) -> Self {
        let result = match status {
            200..=299 => MediationResult::Success,
            404 | 410 => MediationResult::ErrorConfig,
            408 | 429 => MediationResult::ErrorServer,
            400..=499 => MediationResult::ErrorClient,
            500..=599 => MediationResult::ErrorServer,
            _ => MediationResult::ErrorServer,
        };
        Self { result, status_code: Some(status), error_message: None }
    }

    pub fn timeout() -> Self {
        Self { result: MediationResult::ErrorTimeout, status_code: None, error_message: Some("request timed out".into()) }
    }

    pub fn transport(message: String) -> Self {
        Self { result: MediationResult::ErrorTransport, status_code: None, error_message: Some(message) }
    }

    pub fn internal_error(message: String) -> Self {
        Self { result: MediationResult::ErrorServer, status_code: None, error_message: Some(message) }
    }
}

// ============================================================================
// Warning system
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
pub enum WarningCategory {
    Routing,
    Processing,
    Configuration,
    RateLimiting,
    QueueConnectivity,
    PoolCapacity,
    ConsumerHealth,
    Resource,
    Projection,
    Checkpoint,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, ToSchema)]
pub enum WarningSeverity {
    Info,
    Warn,
    Error,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Warning {
    pub id: String,
    pub category: WarningCategory,
    pub severity: WarningSeverity,
    pub message: String,
    pub source: String,
    pub created_at: DateTime<Utc>,
    pub acknowledged: bool,
}

impl Warning {
    pub fn new(category: WarningCategory, severity: WarningSeverity, message: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            category,
            severity,
            message: message.into(),
            source: source.into(),
            created_at: Utc::now(),
            acknowledged: false,
        }
    }
}

/// Abstract sink external collaborators (and this crate's own components)
/// report warnings to. `fc-router::WarningService` is the in-memory
/// implementation; tests can substitute a recording fake.
pub trait WarningSink: Send + Sync {
    fn warn(&self, category: WarningCategory, severity: WarningSeverity, message: String, source: &str);
}

// ============================================================================
// Health
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub enum HealthStatus {
    Healthy,
    Warning,
    Degraded,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub issues: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct PoolStats {
    pub pool_code: String,
    pub concurrency: u32,
    pub active_workers: u32,
    pub queue_size: u32,
    pub queue_capacity: u32,
    pub rate_limit_per_minute: Option<u32>,
    pub is_rate_limited: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ConsumerHealth {
    pub queue_identifier: String,
    pub is_healthy: bool,
    pub last_poll_age_millis: Option<i64>,
    pub is_running: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct WatcherStatus {
    pub name: String,
    pub running: bool,
    pub has_fatal_error: bool,
    pub batches_processed: u64,
    pub checkpointed_seq: u64,
    pub in_flight: u32,
    pub available_slots: u32,
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum FlowCatalystError {
    #[error("queue error: {0}")]
    Queue(String),
    #[error("pool error: {0}")]
    Pool(String),
    #[error("mediation error: {0}")]
    Mediation(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("leader election error: {0}")]
    Standby(String),
    #[error("projection error: {0}")]
    Projection(String),
    #[error("shutdown in progress")]
    ShutdownInProgress,
}

pub type Result<T> = std::result::Result<T, FlowCatalystError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_permanent_misconfiguration_as_ack() {
        let outcome = MediationOutcome::classify(404);
        assert_eq!(outcome.result, MediationResult::ErrorConfig);
        assert!(outcome.result.is_ack());

        let outcome = MediationOutcome::classify(410);
        assert_eq!(outcome.result, MediationResult::ErrorConfig);
    }

    #[test]
    fn classifies_retry_after_and_server_errors_as_server() {
        assert_eq!(MediationOutcome::classify(429).result, MediationResult::ErrorServer);
        assert_eq!(MediationOutcome::classify(408).result, MediationResult::ErrorServer);
        assert_eq!(MediationOutcome::classify(503).result, MediationResult::ErrorServer);
    }

    #[test]
    fn classifies_other_4xx_as_client() {
        assert_eq!(MediationOutcome::classify(400).result, MediationResult::ErrorClient);
        assert_eq!(MediationOutcome::classify(422).result, MediationResult::ErrorClient);
    }

    #[test]
    fn pool_config_queue_capacity_enforces_floor() {
        let small = PoolConfig { code: "p".into(), concurrency: 2, rate_limit_per_minute: None };
        assert_eq!(small.queue_capacity(), MIN_QUEUE_CAPACITY);

        let large = PoolConfig { code: "p".into(), concurrency: 100, rate_limit_per_minute: None };
        assert_eq!(large.queue_capacity(), 1000);
    }
}
