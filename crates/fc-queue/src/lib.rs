//! Queue Consumer abstraction and broker adapters (C5).
//!
//! `QueueConsumer` is the capability set the Queue Manager is polymorphic
//! over; broker variants differ only in implementation. `sqs` and
//! `embedded` are the two adapters built out here, matching the "at least
//! SQS + embedded" floor in the spec.

pub mod embedded;
pub mod error;
pub mod sqs;

use async_trait::async_trait;
use fc_common::MessagePointer;
use std::time::Duration;

pub use error::QueueError;

pub type Result<T> = std::result::Result<T, QueueError>;

/// One message pulled off a broker, bundled with the pointer it carried and
/// the ack/nak/visibility capabilities of its origin broker.
#[derive(Debug, Clone)]
pub struct BrokerMessage {
    pub pointer: MessagePointer,
    /// Broker's own identifier for this delivery. May change on redelivery.
    pub broker_message_id: Option<String>,
    /// Ack/nak credential. May change on redelivery.
    pub receipt_token: String,
    pub queue_identifier: String,
}

/// Capability set a consumer must expose. The manager never
/// downcasts to a concrete broker type -- everything it needs is here or
/// behind `ReceiptTokenUpdatable`.
#[async_trait]
pub trait QueueConsumer: Send + Sync {
    /// Unique identifier for this consumer (used for health/metrics keying
    /// and for routing duplicate-detection messages back to their origin).
    fn queue_identifier(&self) -> &str;

    async fn start(&self) -> Result<()>;
    async fn stop(&self);

    /// Poll for up to `max_messages` new messages. Returns an empty vec on
    /// an idle poll -- never blocks indefinitely.
    async fn poll(&self, max_messages: u32) -> Result<Vec<BrokerMessage>>;

    async fn ack(&self, receipt_token: &str) -> Result<()>;
    async fn nak(&self, receipt_token: &str, delay_seconds: Option<u32>) -> Result<()>;
    /// Emulates fast-fail visibility: a consumer
    /// that cannot honor a short redelivery delay degrades to an
    /// immediate nak.
    async fn nak_fast_fail(&self, receipt_token: &str) -> Result<()> {
        self.nak(receipt_token, Some(1)).await
    }
    async fn extend_visibility(&self, receipt_token: &str, seconds: u32) -> Result<()>;

    fn is_healthy(&self) -> bool;
    fn last_poll_age(&self) -> Option<Duration>;
    fn is_fully_stopped(&self) -> bool;
}

/// Optional capability: brokers (SQS) that hand out a fresh receipt token
/// on every redelivery, distinct from identity-based token mutation.
/// Consumers that don't support this degrade silently -- the redelivery
/// path accepts that the eventual ack may fail and the broker will
/// redeliver again.
pub trait ReceiptTokenUpdatable {
    fn supports_token_update(&self) -> bool {
        true
    }
}
