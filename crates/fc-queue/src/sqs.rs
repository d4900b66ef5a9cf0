//! SQS broker adapter.

use crate::{BrokerMessage, QueueConsumer, QueueError, ReceiptTokenUpdatable, Result};
use async_trait::async_trait;
use aws_sdk_sqs::Client;
use fc_common::MessagePointer;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// The JSON wire shape inbound SQS bodies carry. Required: `id`,
/// `poolCode`, `mediationTarget`. Everything else defaults.
#[derive(Debug, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct WirePointer {
    id: String,
    pool_code: String,
    mediation_target: String,
    #[serde(default)]
    message_group_id: Option<String>,
    #[serde(default)]
    mediation_type: Option<String>,
    #[serde(default)]
    auth_token: Option<String>,
    #[serde(default)]
    payload: Option<String>,
    #[serde(default)]
    headers: HashMap<String, String>,
    #[serde(default)]
    timeout_seconds: Option<u32>,
}

impl From<WirePointer> for MessagePointer {
    fn from(w: WirePointer) -> Self {
        MessagePointer {
            id: w.id,
            pool_code: w.pool_code,
            message_group_id: w.message_group_id,
            mediation_type: fc_common::MediationType::Http,
            mediation_target: w.mediation_target,
            auth_token: w.auth_token,
            payload: w.payload.map(|p| p.into_bytes()).unwrap_or_default(),
            headers: w.headers,
            timeout_seconds: w.timeout_seconds,
        }
    }
}

pub struct SqsQueueConsumer {
    client: Client,
    queue_url: String,
    identifier: String,
    visibility_timeout: i32,
    running: AtomicBool,
    last_poll: Mutex<Option<Instant>>,
}

impl SqsQueueConsumer {
    pub async fn from_queue_url(client: Client, queue_url: String, visibility_timeout: i32) -> Self {
        let identifier = queue_url.clone();
        Self {
            client,
            queue_url,
            identifier,
            visibility_timeout,
            running: AtomicBool::new(false),
            last_poll: Mutex::new(None),
        }
    }
}

impl ReceiptTokenUpdatable for SqsQueueConsumer {}

#[async_trait]
impl QueueConsumer for SqsQueueConsumer {
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

        let resp = self
            .client
            .receive_message()
            .queue_url(&self.queue_url)
            .max_number_of_messages(max_messages.min(10) as i32)
            .wait_time_seconds(10)
            .message_attribute_names("All")
            .send()
            .await
            .map_err(|e| QueueError::Broker(e.to_string()))?;

        *self.last_poll.lock() = Some(Instant::now());

        let mut out = Vec::new();
        for msg in resp.messages() {
            let receipt_token = match msg.receipt_handle() {
                Some(r) => r.to_string(),
                None => continue,
            };
            let broker_message_id = msg.message_id().map(|s| s.to_string());
            let body = match msg.body() {
                Some(b) => b,
                None => {
                    warn!(queue = %self.identifier, "SQS message had no body, ACKing to drop it");
                    let _ = self.ack(&receipt_token).await;
                    continue;
                }
            };

            match serde_json::from_str::<WirePointer>(body) {
                Ok(wire) => {
                    out.push(BrokerMessage {
                        pointer: wire.into(),
                        broker_message_id,
                        receipt_token,
                        queue_identifier: self.identifier.clone(),
                    });
                }
                Err(e) => {
                    warn!(queue = %self.identifier, error = %e, "malformed pointer payload, ACKing to prevent infinite retry");
                    let _ = self.ack(&receipt_token).await;
                }
            }
        }

        debug!(queue = %self.identifier, count = out.len(), "polled SQS");
        Ok(out)
    }

    async fn ack(&self, receipt_token: &str) -> Result<()> {
        self.client
            .delete_message()
            .queue_url(&self.queue_url)
            .receipt_handle(receipt_token)
            .send()
            .await
            .map_err(|e| QueueError::Broker(e.to_string()))?;
        Ok(())
    }

    async fn nak(&self, receipt_token: &str, delay_seconds: Option<u32>) -> Result<()> {
        // No explicit delay means "reset visibility to default",
        // i.e. the queue's own configured visibility timeout.
        let timeout = delay_seconds.map(|d| d as i32).unwrap_or(self.visibility_timeout);
        self.client
            .change_message_visibility()
            .queue_url(&self.queue_url)
            .receipt_handle(receipt_token)
            .visibility_timeout(timeout)
            .send()
            .await
            .map_err(|e| QueueError::Broker(e.to_string()))?;
        Ok(())
    }

    async fn extend_visibility(&self, receipt_token: &str, seconds: u32) -> Result<()> {
        self.client
            .change_message_visibility()
            .queue_url(&self.queue_url)
            .receipt_handle(receipt_token)
            .visibility_timeout(seconds as i32)
            .send()
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

impl std::fmt::Debug for SqsQueueConsumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqsQueueConsumer").field("queue_url", &self.queue_url).finish()
    }
}
