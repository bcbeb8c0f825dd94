use async_trait::async_trait;
use std::time::Duration;

use crate::error::Result;
use crate::jobs::model::{Delivery, QueueDepth, QueueMessage};

/// Ordered hand-off between the dispatcher and the worker pool.
///
/// Delivery is at-least-once: a fetched message stays leased until it is
/// acked or nacked, and a lease that outlives the visibility timeout is
/// handed out again by [`Broker::reap_expired`].
#[async_trait]
pub trait Broker: Send + Sync + 'static {
    async fn enqueue(&self, message: QueueMessage) -> Result<()>;

    /// Lease the oldest visible message on `queue`, FIFO within the queue.
    async fn fetch(
        &self,
        queue: &str,
        worker_id: &str,
        visibility_timeout: Duration,
    ) -> Result<Option<Delivery>>;

    /// Remove the message for good. Returns `false` when the lease is no
    /// longer held by this delivery (it expired and was re-leased).
    async fn ack(&self, delivery: &Delivery) -> Result<bool>;

    /// Give the message back, visible again after `delay`.
    async fn nack(&self, delivery: &Delivery, delay: Duration) -> Result<bool>;

    /// Return expired leases to the ready set. Returns how many were reclaimed.
    async fn reap_expired(&self) -> Result<u64>;

    async fn depth(&self, queue: &str) -> Result<QueueDepth>;
}
