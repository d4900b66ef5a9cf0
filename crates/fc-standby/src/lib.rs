//! Single-primary leader election (C8). Exactly one instance of a
//! horizontally-scaled deployment should run the sweepers, the change
//! stream watchers, and anything else that must not run concurrently
//! across replicas.
//!
//! `RedisLeaderElector` implements this with a Redis `SET NX PX` lease that
//! is periodically renewed; `InMemoryLeaderElector` is always primary and
//! exists for single-instance deployments and tests.

use async_trait::async_trait;
use redis::AsyncCommands;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum StandbyError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

pub type Result<T> = std::result::Result<T, StandbyError>;

/// Elects and tracks a single primary instance across a fleet.
#[async_trait]
pub trait LeaderElector: Send + Sync {
    /// Attempt to acquire or renew the lease. Returns the current primary
    /// status after the attempt.
    async fn tick(&self) -> bool;

    /// Cheap, non-blocking read of the last known primary status. Gates
    /// per-cycle work in sweepers and watchers.
    fn is_primary(&self) -> bool;

    /// Release the lease immediately, e.g. on graceful shutdown, so a
    /// standby can take over without waiting out the full lease TTL.
    async fn release(&self);
}

/// Redis-backed elector using a `SET key value NX PX ttl` lease. Renewal
/// uses a Lua compare-and-set so only the current holder can extend it.
pub struct RedisLeaderElector {
    client: redis::Client,
    lease_key: String,
    instance_id: String,
    lease_ttl: Duration,
    refresh_interval: Duration,
    is_primary: AtomicBool,
}

const RENEW_SCRIPT: &str = r#"
if redis.call("get", KEYS[1]) == ARGV[1] then
    return redis.call("pexpire", KEYS[1], ARGV[2])
else
    return 0
end
"#;

const RELEASE_SCRIPT: &str = r#"
if redis.call("get", KEYS[1]) == ARGV[1] then
    return redis.call("del", KEYS[1])
else
    return 0
end
"#;

impl RedisLeaderElector {
    pub fn new(client: redis::Client, lease_key: impl Into<String>, lease_seconds: u64, refresh_seconds: u64) -> Self {
        Self {
            client,
            lease_key: lease_key.into(),
            instance_id: Uuid::new_v4().to_string(),
            lease_ttl: Duration::from_secs(lease_seconds),
            refresh_interval: Duration::from_secs(refresh_seconds),
            is_primary: AtomicBool::new(false),
        }
    }

    pub fn refresh_interval(&self) -> Duration {
        self.refresh_interval
    }

    async fn try_acquire_or_renew(&self) -> Result<bool> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let ttl_millis = self.lease_ttl.as_millis() as usize;

        if self.is_primary.load(Ordering::SeqCst) {
            let renewed: i32 = redis::Script::new(RENEW_SCRIPT)
                .key(&self.lease_key)
                .arg(&self.instance_id)
                .arg(ttl_millis)
                .invoke_async(&mut conn)
                .await?;
            if renewed == 1 {
                return Ok(true);
            }
            warn!(lease = %self.lease_key, "lost leader lease on renewal, will attempt reacquire");
        }

        let acquired: bool = conn
            .set_nx(&self.lease_key, &self.instance_id)
            .await
            .unwrap_or(false);
        if acquired {
            let _: () = conn.pexpire(&self.lease_key, ttl_millis as i64).await?;
            return Ok(true);
        }
        Ok(false)
    }
}

#[async_trait]
impl LeaderElector for RedisLeaderElector {
    async fn tick(&self) -> bool {
        let result = self.try_acquire_or_renew().await;
        let became_primary = matches!(result, Ok(true));
        let was_primary = self.is_primary.swap(became_primary, Ordering::SeqCst);

        if became_primary && !was_primary {
            info!(lease = %self.lease_key, instance = %self.instance_id, "acquired leader lease");
        } else if !became_primary && was_primary {
            warn!(lease = %self.lease_key, instance = %self.instance_id, "demoted from leader");
        } else if let Err(e) = result {
            warn!(lease = %self.lease_key, error = %e, "leader election tick failed, assuming standby");
        } else {
            debug!(lease = %self.lease_key, primary = became_primary, "leader election tick");
        }

        became_primary
    }

    fn is_primary(&self) -> bool {
        self.is_primary.load(Ordering::SeqCst)
    }

    async fn release(&self) {
        if !self.is_primary.swap(false, Ordering::SeqCst) {
            return;
        }
        let Ok(mut conn) = self.client.get_multiplexed_async_connection().await else {
            return;
        };
        let _: std::result::Result<i32, _> = redis::Script::new(RELEASE_SCRIPT)
            .key(&self.lease_key)
            .arg(&self.instance_id)
            .invoke_async(&mut conn)
            .await;
        info!(lease = %self.lease_key, "released leader lease");
    }
}

/// Always primary. Used for single-instance deployments and tests where
/// coordinating a fleet is out of scope.
#[derive(Default)]
pub struct InMemoryLeaderElector {
    primary: Arc<AtomicBool>,
}

impl InMemoryLeaderElector {
    pub fn new() -> Self {
        let primary = Arc::new(AtomicBool::new(true));
        Self { primary }
    }
}

#[async_trait]
impl LeaderElector for InMemoryLeaderElector {
    async fn tick(&self) -> bool {
        self.primary.load(Ordering::SeqCst)
    }

    fn is_primary(&self) -> bool {
        self.primary.load(Ordering::SeqCst)
    }

    async fn release(&self) {
        self.primary.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn in_memory_elector_is_always_primary_until_released() {
        let elector = InMemoryLeaderElector::new();
        assert!(elector.tick().await);
        assert!(elector.is_primary());
        elector.release().await;
        assert!(!elector.is_primary());
    }
}
