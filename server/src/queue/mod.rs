//! Message queue seam.
//!
//! At-least-once delivery with an approximate per-message receive
//! counter, content deduplication IDs honored inside a dedup window,
//! and batch consumption where the consumer reports the subset of
//! deliveries that must be redelivered.

pub mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::AppResult;

pub use memory::InMemoryQueue;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutgoingMessage {
    /// Ordering hint; messages in one group are delivered in order.
    pub group_id: String,
    /// Identical dedup IDs inside the dedup window collapse to one
    /// message.
    pub dedup_id: String,
    /// JSON-encoded payload.
    pub body: String,
}

/// One received message. Dropping it without `ack` or `nack` leaves it
/// in flight; a consumer must settle every delivery it takes.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub receipt: String,
    pub body: String,
    /// Approximate delivery count, 1-based (first delivery is 1).
    pub receive_count: u32,
}

impl Delivery {
    /// 0-based retry count derived from the receive counter.
    pub fn retry_count(&self) -> u32 {
        self.receive_count.saturating_sub(1)
    }
}

#[async_trait]
pub trait MessageQueue: Send + Sync {
    /// Enqueue a message. Returns the message ID, or `None` when the
    /// dedup window swallowed it.
    async fn send(&self, message: OutgoingMessage) -> AppResult<Option<String>>;

    /// Take up to `max` messages, marking them in flight.
    async fn receive(&self, max: usize) -> AppResult<Vec<Delivery>>;

    /// Settle a delivery as processed.
    async fn ack(&self, receipt: &str) -> AppResult<()>;

    /// Return a delivery for redelivery; its receive count grows.
    async fn nack(&self, receipt: &str) -> AppResult<()>;

    /// Messages waiting for delivery (excludes in-flight).
    async fn pending(&self) -> AppResult<usize>;
}
