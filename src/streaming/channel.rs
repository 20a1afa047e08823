//! Buffer queue between the writer's `end_step` and its delivery thread.
//!
//! Bounded so a slow consumer pushes back on the producer instead of
//! growing memory without limit.

use bytes::Bytes;
use crossbeam_channel::{bounded, Receiver, Sender};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Default capacity of the writer's buffer queue.
pub const DEFAULT_QUEUE_DEPTH: usize = 64;

/// Granularity of every polling loop in the engines.
pub const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Request a reliable-mode reader sends to pull the next message.
pub const STEP_REQUEST: &[u8] = b"Step";

// =============================================================================
// Outgoing messages
// =============================================================================

/// A sealed message waiting for delivery.
#[derive(Debug, Clone)]
pub enum Outgoing {
    /// Payload and index for steps `first_step..=last_step`.
    Data {
        buffer: Bytes,
        first_step: u64,
        last_step: u64,
    },
    /// End-of-stream record.
    End {
        buffer: Bytes,
        final_step: Option<u64>,
    },
}

impl Outgoing {
    pub fn buffer(&self) -> &Bytes {
        match self {
            Self::Data { buffer, .. } | Self::End { buffer, .. } => buffer,
        }
    }

    pub fn is_end(&self) -> bool {
        matches!(self, Self::End { .. })
    }
}

pub type OutgoingSender = Sender<Outgoing>;
pub type OutgoingReceiver = Receiver<Outgoing>;

/// Create the bounded queue feeding a delivery thread.
pub fn outgoing_channel(depth: usize) -> (OutgoingSender, OutgoingReceiver) {
    bounded(depth.max(1))
}

// =============================================================================
// Delivery counters
// =============================================================================

/// Counters shared between the writer and its delivery thread.
#[derive(Debug, Default)]
pub struct DeliveryCounters {
    /// Messages handed to the transport (or to a requester).
    released: AtomicU64,
    /// Incremented by the aggregation factor on every reliable-mode release.
    sent_steps: AtomicU64,
    bytes: AtomicU64,
    /// Fast-mode messages no subscriber accepted.
    dropped: AtomicU64,
}

impl DeliveryCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_release(&self, bytes: usize, steps: u64) {
        self.released.fetch_add(1, Ordering::AcqRel);
        self.sent_steps.fetch_add(steps, Ordering::AcqRel);
        self.bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_drop(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn released(&self) -> u64 {
        self.released.load(Ordering::Acquire)
    }

    pub fn sent_steps(&self) -> u64 {
        self.sent_steps.load(Ordering::Acquire)
    }

    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
