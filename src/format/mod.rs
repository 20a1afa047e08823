//! Wire format for step streaming.
//!
//! One data message carries the payload bytes of one or more steps plus a
//! structured index describing every block:
//!
//! ```text
//! +----------------+----------------+-------------------+----------------+
//! | meta offset u64| meta size u64  | payload bytes ... | index bytes    |
//! +----------------+----------------+-------------------+----------------+
//! ```
//!
//! Header integers are little-endian. The index is an [`IndexValue`] map:
//! `"attributes-section"` (first message only) holds the attribute set, every
//! other key is a decimal step number mapping rank -> list of block records.
//!
//! Messages shorter than [`CONTROL_THRESHOLD`] are first tried as a control
//! record `{ "final-step": uint | null }` marking the end of the stream.

pub mod deserializer;
pub mod index;
pub mod selection;
pub mod serializer;

pub use deserializer::{PutOutcome, WireDeserializer};
pub use index::IndexValue;
pub use selection::{calculate_overlap, copy_selection};
pub use serializer::WireSerializer;

use crate::types::{BlockLayout, DataType, Dims, Params};

/// Fixed header: metadata offset and metadata size.
pub const HEADER_SIZE: usize = 16;

/// Messages below this size are tried as control records first.
pub const CONTROL_THRESHOLD: usize = 128;

/// Index key holding the attribute set.
pub const ATTRIBUTES_SECTION: &str = "attributes-section";

/// Control record key carrying the final absolute step.
pub const FINAL_STEP_KEY: &str = "final-step";

/// Block record keys.
pub(crate) mod keys {
    pub const NAME: &str = "N";
    pub const START: &str = "O";
    pub const COUNT: &str = "C";
    pub const SHAPE: &str = "S";
    pub const SIZE: &str = "I";
    pub const POSITION: &str = "P";
    pub const TYPE: &str = "Y";
    pub const LAYOUT: &str = "L";
    pub const COMPRESSION: &str = "Z";
    pub const PARAMS: &str = "ZP";
    pub const TIMESTAMP: &str = "W";
    pub const VALUE: &str = "V";
}

/// Identifies one received message in the deserializer's buffer table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferKey(pub u64);

/// One producer rank's contribution to one variable at one step.
#[derive(Debug, Clone, PartialEq)]
pub struct VarBlock {
    pub step: u64,
    pub name: String,
    pub rank: u32,
    pub start: Dims,
    pub count: Dims,
    pub shape: Option<Dims>,
    /// Bytes stored in the message (after any operator).
    pub size: usize,
    /// Byte offset of the block inside its message.
    pub position: usize,
    pub data_type: DataType,
    pub layout: BlockLayout,
    pub compression: Option<String>,
    pub params: Params,
    /// Wall-clock completion time of the step on the producer, in ms.
    pub timestamp_ms: Option<i64>,
    pub buffer_key: BufferKey,
}

impl VarBlock {
    /// Size of the block once any operator has been inverted.
    pub fn decoded_size(&self) -> usize {
        crate::types::element_count(&self.count) as usize * self.data_type.size()
    }
}
