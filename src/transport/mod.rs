//! Message transports consumed by the streaming engines.
//!
//! Two patterns are needed: best-effort publish/subscribe for fast
//! delivery, and strictly alternating request/reply for reliable delivery.
//! Addresses are opaque strings; [`MemoryTransport`] connects endpoints
//! inside one process.

pub mod memory;

pub use memory::MemoryTransport;

use crate::error::Result;
use bytes::Bytes;
use std::time::Duration;

/// Sending end of a publish/subscribe channel.
pub trait Publisher: Send {
    /// Offer `message` to every connected subscriber. Subscribers whose
    /// queue is full miss the message. Returns how many received it.
    fn send(&self, message: Bytes) -> Result<usize>;

    fn subscriber_count(&self) -> usize;
}

/// Receiving end of a publish/subscribe channel.
pub trait Subscriber: Send {
    /// Next message, or `None` after `timeout`.
    ///
    /// Returns [`crate::error::StreamError::Closed`] once the publisher is
    /// gone and the queue has drained.
    fn receive(&mut self, timeout: Duration) -> Result<Option<Bytes>>;
}

/// Server end of a request/reply channel. Every received request must be
/// answered with exactly one reply before the next is received.
pub trait Replier: Send {
    fn receive_request(&mut self, timeout: Duration) -> Result<Option<Bytes>>;

    fn send_reply(&mut self, reply: Bytes) -> Result<()>;
}

/// Client end of a request/reply channel.
pub trait Requester: Send {
    fn send_request(&mut self, request: Bytes) -> Result<()>;

    fn receive_reply(&mut self, timeout: Duration) -> Result<Option<Bytes>>;
}

/// Opens endpoints on an address space.
pub trait Transport: Send + Sync {
    fn open_publisher(&self, address: &str) -> Result<Box<dyn Publisher>>;

    fn open_subscriber(&self, address: &str, queue_depth: usize) -> Result<Box<dyn Subscriber>>;

    fn open_replier(
        &self,
        address: &str,
        timeout: Duration,
        queue_depth: usize,
    ) -> Result<Box<dyn Replier>>;

    fn open_requester(&self, address: &str, timeout: Duration) -> Result<Box<dyn Requester>>;
}
