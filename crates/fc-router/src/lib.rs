//! FlowCatalyst Message Router
//!
//! Wires together the Queue Manager (C4), Process Pools (C3), the HTTP
//! Mediator (C1), and the warning/health/metrics services behind the
//! operational surface. Config sync (`fc-config`) and leader election
//! (`fc-standby`) compose over this crate at the binary's entry point
//! rather than living inside it, so this crate stays testable without a
//! network or Redis.

pub mod health;
pub mod lifecycle;
pub mod manager;
pub mod mediator;
pub mod metrics;
pub mod pool;
pub mod warning;

pub use health::{HealthService, HealthServiceConfig};
pub use lifecycle::{LifecycleConfig, LifecycleManager};
pub use manager::{ConsumerFactory, InFlightMessageInfo, QueueManager};
pub use mediator::{HttpMediator, HttpMediatorConfig, Mediator};
pub use metrics::{MetricsConfig, PoolMetricsCollector};
pub use pool::{AckDecision, PoolSubmission, ProcessPool};
pub use warning::{WarningService, WarningServiceConfig};

pub use fc_common::{FlowCatalystError, Result};
