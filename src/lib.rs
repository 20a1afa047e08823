//! Step-based streaming of self-describing array data between applications.
//!
//! A producer opens a [`StreamWriter`], and for every step defines typed
//! variables and puts blocks of them. Consumers open a [`StreamReader`] on
//! the same endpoint and pull the steps, selecting sub-boxes of global
//! arrays. Before either opens, the [`HandshakeCoordinator`] lets every
//! process of both applications learn who writes and who reads each
//! stream.
//!
//! ```text
//! handshake   -> which ranks write / read a stream
//! format      -> wire messages: payload + index, end-of-stream record
//! transport   -> publish/subscribe and request/reply endpoints
//! streaming   -> StreamWriter / StreamReader step engines
//! ```

pub mod config;
pub mod error;
pub mod format;
pub mod handshake;
pub mod logging;
pub mod monitor;
pub mod operator;
pub mod streaming;
pub mod transport;
pub mod types;

pub use config::{DeliveryMode, StreamConfig};
pub use error::{Result, StreamError};
pub use format::{VarBlock, WireDeserializer, WireSerializer};
pub use handshake::{HandshakeCoordinator, HandshakeSettings, StreamTopology};
pub use operator::{Operator, OperatorRegistry};
pub use streaming::{
    EngineContext, PutMode, StepMode, StepStatus, StreamReader, StreamWriter,
};
pub use transport::{MemoryTransport, Transport};
pub use types::{AttributeValue, DataType, Dims, Element, Params, Variable};
