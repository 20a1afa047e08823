//! Step-based streaming engines.
//!
//! # Architecture
//!
//! ```text
//! writer thread          delivery thread             reader thread
//! +-------------+  queue  +----------------+  wire  +----------------+
//! | StreamWriter| ------> | publish/reply  | -----> | StreamReader   |
//! | (serialize) |         | (transport)    |        | (deserialize)  |
//! +-------------+         +----------------+        +----------------+
//! ```
//!
//! Fast delivery publishes every sealed message to all subscribers and
//! never waits for them. Reliable delivery keeps messages queued until a
//! reader pulls them with a request, one message per request.

pub mod channel;
pub mod reader;
pub mod writer;

pub use channel::{DeliveryCounters, Outgoing, DEFAULT_QUEUE_DEPTH, POLL_INTERVAL};
pub use reader::StreamReader;
pub use writer::{PutMode, StreamWriter};

use crate::handshake::{HandshakeCoordinator, StreamTopology};
use crate::operator::OperatorRegistry;
use std::sync::Arc;

/// Outcome of `begin_step`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepStatus {
    Ok,
    /// No new step within the timeout; try again.
    NotReady,
    /// Every step up to the producer's final step has been consumed.
    EndOfStream,
    /// The stream broke without an end-of-stream record.
    OtherError,
}

/// Which buffered step a reader advances to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StepMode {
    /// The oldest complete step after the current one.
    #[default]
    NextAvailable,
    /// The newest complete step; older buffered steps are discarded.
    LatestAvailable,
}

/// What an engine needs to know about its surroundings at open.
#[derive(Debug, Clone)]
pub struct EngineContext {
    /// This process's rank among the stream's writers or readers.
    pub rank: u32,
    pub topology: StreamTopology,
    pub operators: Arc<OperatorRegistry>,
}

impl Default for EngineContext {
    fn default() -> Self {
        Self {
            rank: 0,
            topology: StreamTopology::default(),
            operators: Arc::new(OperatorRegistry::with_defaults()),
        }
    }
}

impl EngineContext {
    /// Context for `stream` after its handshake has completed.
    pub fn from_handshake(rank: u32, coordinator: &HandshakeCoordinator, stream: &str) -> Self {
        Self {
            rank,
            topology: coordinator.topology(stream),
            ..Default::default()
        }
    }

    pub fn with_operators(mut self, operators: Arc<OperatorRegistry>) -> Self {
        self.operators = operators;
        self
    }
}
