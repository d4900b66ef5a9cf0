//! Embedded broker adapter: a SQLite-backed FIFO queue that mimics SQS
//! semantics (receipt-handle based ack/nak, visibility timeout, message
//! group ordering) without external infrastructure. Used for local dev and
//! for exercising the `QueueConsumer` trait boundary in tests.

use crate::{BrokerMessage, QueueConsumer, QueueError, Result};
use async_trait::async_trait;
use fc_common::MessagePointer;
use parking_lot::Mutex;
use sqlx::{Row, SqlitePool};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

pub struct EmbeddedQueue {
    pool: SqlitePool,
    identifier: String,
    default_visibility_seconds: i64,
    running: AtomicBool,
    last_poll: Mutex<Option<Instant>>,
}

impl EmbeddedQueue {
    pub fn new(pool: SqlitePool, identifier: String, default_visibility_seconds: u32) -> Self {
        Self {
            pool,
            identifier,
            default_visibility_seconds: default_visibility_seconds as i64,
            running: AtomicBool::new(false),
            last_poll: Mutex::new(None),
        }
    }

    pub async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS queue_messages (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                message_id TEXT NOT NULL,
                pointer_json TEXT NOT NULL,
                message_group_id TEXT,
                visible_at INTEGER NOT NULL,
                receipt_token TEXT NOT NULL,
                delivery_count INTEGER NOT NULL DEFAULT 0
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| QueueError::Connection(e.to_string()))?;
        Ok(())
    }

    /// Enqueue a pointer for delivery. `message_id` is the stable broker
    /// message identifier returned on every redelivery of this row (the
    /// embedded broker does not rotate it, unlike SQS).
    pub async fn enqueue(&self, pointer: &MessagePointer) -> Result<()> {
        let pointer_json = serde_json::to_string(pointer).map_err(|e| QueueError::Broker(e.to_string()))?;
        let message_id = uuid::Uuid::new_v4().to_string();
        let receipt_token = uuid::Uuid::new_v4().to_string();
        sqlx::query(
            "INSERT INTO queue_messages (message_id, pointer_json, message_group_id, visible_at, receipt_token) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&message_id)
        .bind(&pointer_json)
        .bind(&pointer.message_group_id)
        .bind(now_millis())
        .bind(&receipt_token)
        .execute(&self.pool)
        .await
        .map_err(|e| QueueError::Broker(e.to_string()))?;
        Ok(())
    }

    fn default_visibility_millis(&self) -> i64 {
        self.default_visibility_seconds * 1000
    }
}

fn now_millis() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_millis() as i64
}

#[async_trait]
impl QueueConsumer for EmbeddedQueue {
    fn queue_identifier(&self) -> &str {
        &self.identifier
    }

    async fn start(&self) -> Result<()> {
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    async fn poll(&self, max_messages: u32) -> Result<Vec<BrokerMessage>> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(QueueError::Stopped);
        }

        let now = now_millis();
        let rows = sqlx::query(
            "SELECT seq, message_id, pointer_json FROM queue_messages WHERE visible_at <= ? ORDER BY seq ASC LIMIT ?",
        )
        .bind(now)
        .bind(max_messages as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| QueueError::Broker(e.to_string()))?;

        *self.last_poll.lock() = Some(Instant::now());

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let seq: i64 = row.get("seq");
            let message_id: String = row.get("message_id");
            let pointer_json: String = row.get("pointer_json");

            // Each delivery gets a fresh receipt token and an advanced
            // visible_at, matching the "claim on delivery" semantics of a
            // real broker's in-flight window.
            let new_token = uuid::Uuid::new_v4().to_string();
            let next_visible = now + self.default_visibility_millis();
            let updated = sqlx::query(
                "UPDATE queue_messages SET receipt_token = ?, visible_at = ?, delivery_count = delivery_count + 1 WHERE seq = ?",
            )
            .bind(&new_token)
            .bind(next_visible)
            .bind(seq)
            .execute(&self.pool)
            .await
            .map_err(|e| QueueError::Broker(e.to_string()))?;

            if updated.rows_affected() == 0 {
                continue;
            }

            match serde_json::from_str::<MessagePointer>(&pointer_json) {
                Ok(pointer) => out.push(BrokerMessage {
                    pointer,
                    broker_message_id: Some(message_id),
                    receipt_token: new_token,
                    queue_identifier: self.identifier.clone(),
                }),
                Err(e) => {
                    warn!(queue = %self.identifier, error = %e, "malformed embedded pointer, dropping row");
                    let _ = sqlx::query("DELETE FROM queue_messages WHERE seq = ?").bind(seq).execute(&self.pool).await;
                }
            }
        }

        debug!(queue = %self.identifier, count = out.len(), "polled embedded queue");
        Ok(out)
    }

    async fn ack(&self, receipt_token: &str) -> Result<()> {
        sqlx::query("DELETE FROM queue_messages WHERE receipt_token = ?")
            .bind(receipt_token)
            .execute(&self.pool)
            .await
            .map_err(|e| QueueError::Broker(e.to_string()))?;
        Ok(())
    }

    async fn nak(&self, receipt_token: &str, delay_seconds: Option<u32>) -> Result<()> {
        let delay_millis = delay_seconds.map(|d| d as i64 * 1000).unwrap_or_else(|| self.default_visibility_millis());
        let visible_at = now_millis() + delay_millis;
        sqlx::query("UPDATE queue_messages SET visible_at = ? WHERE receipt_token = ?")
            .bind(visible_at)
            .bind(receipt_token)
            .execute(&self.pool)
            .await
            .map_err(|e| QueueError::Broker(e.to_string()))?;
        Ok(())
    }

    async fn extend_visibility(&self, receipt_token: &str, seconds: u32) -> Result<()> {
        let visible_at = now_millis() + seconds as i64 * 1000;
        sqlx::query("UPDATE queue_messages SET visible_at = ? WHERE receipt_token = ?")
            .bind(visible_at)
            .bind(receipt_token)
            .execute(&self.pool)
            .await
            .map_err(|e| QueueError::Broker(e.to_string()))?;
        Ok(())
    }

    fn is_healthy(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn last_poll_age(&self) -> Option<Duration> {
        self.last_poll.lock().map(|t| t.elapsed())
    }

    fn is_fully_stopped(&self) -> bool {
        !self.running.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fc_common::MediationType;
    use std::collections::HashMap;

    async fn new_queue() -> EmbeddedQueue {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        let q = EmbeddedQueue::new(pool, "test-queue".to_string(), 5);
        q.init_schema().await.unwrap();
        q.start().await.unwrap();
        q
    }

    fn pointer(id: &str) -> MessagePointer {
        MessagePointer {
            id: id.to_string(),
            pool_code: "P".to_string(),
            message_group_id: None,
            mediation_type: MediationType::Http,
            mediation_target: "http://example.invalid".to_string(),
            auth_token: None,
            payload: b"{}".to_vec(),
            headers: HashMap::new(),
            timeout_seconds: None,
        }
    }

    #[tokio::test]
    async fn enqueue_then_poll_then_ack_removes_message() {
        let q = new_queue().await;
        q.enqueue(&pointer("M1")).await.unwrap();

        let msgs = q.poll(10).await.unwrap();
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].pointer.id, "M1");

        q.ack(&msgs[0].receipt_token).await.unwrap();
        let msgs = q.poll(10).await.unwrap();
        assert!(msgs.is_empty());
    }

    #[tokio::test]
    async fn nak_makes_message_invisible_until_delay_elapses() {
        let q = new_queue().await;
        q.enqueue(&pointer("M1")).await.unwrap();

        let msgs = q.poll(10).await.unwrap();
        q.nak(&msgs[0].receipt_token, Some(100)).await.unwrap();

        let msgs = q.poll(10).await.unwrap();
        assert!(msgs.is_empty(), "message should stay invisible for its nak delay");
    }

    #[tokio::test]
    async fn fifo_order_is_preserved() {
        let q = new_queue().await;
        q.enqueue(&pointer("M1")).await.unwrap();
        q.enqueue(&pointer("M2")).await.unwrap();
        q.enqueue(&pointer("M3")).await.unwrap();

        let msgs = q.poll(10).await.unwrap();
        let ids: Vec<_> = msgs.iter().map(|m| m.pointer.id.clone()).collect();
        assert_eq!(ids, vec!["M1", "M2", "M3"]);
    }
}
