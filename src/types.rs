//! Core data model: element types, shapes, variables and attributes.

use crate::error::{Result, StreamError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Extents of a box, one entry per dimension.
pub type Dims = Vec<u64>;

/// Free-form string parameters (engine options, per-block operator params).
pub type Params = BTreeMap<String, String>;

/// Number of elements in a box with the given count. Scalars (no
/// dimensions) hold one element.
pub fn element_count(count: &[u64]) -> u64 {
    count.iter().product()
}

// =============================================================================
// Element types
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    Int8,
    Int16,
    Int32,
    Int64,
    UInt8,
    UInt16,
    UInt32,
    UInt64,
    Float,
    Double,
    ComplexFloat,
    ComplexDouble,
}

impl DataType {
    /// Size of one element in bytes.
    pub fn size(&self) -> usize {
        match self {
            Self::Int8 | Self::UInt8 => 1,
            Self::Int16 | Self::UInt16 => 2,
            Self::Int32 | Self::UInt32 | Self::Float => 4,
            Self::Int64 | Self::UInt64 | Self::Double | Self::ComplexFloat => 8,
            Self::ComplexDouble => 16,
        }
    }

    /// Size of the scalar component that endianness applies to.
    pub fn swap_unit(&self) -> usize {
        match self {
            Self::ComplexFloat => 4,
            Self::ComplexDouble => 8,
            other => other.size(),
        }
    }

    /// Stable type tag written to the wire index.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Int8 => "int8_t",
            Self::Int16 => "int16_t",
            Self::Int32 => "int32_t",
            Self::Int64 => "int64_t",
            Self::UInt8 => "uint8_t",
            Self::UInt16 => "uint16_t",
            Self::UInt32 => "uint32_t",
            Self::UInt64 => "uint64_t",
            Self::Float => "float",
            Self::Double => "double",
            Self::ComplexFloat => "float complex",
            Self::ComplexDouble => "double complex",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        Some(match tag {
            "int8_t" => Self::Int8,
            "int16_t" => Self::Int16,
            "int32_t" => Self::Int32,
            "int64_t" => Self::Int64,
            "uint8_t" => Self::UInt8,
            "uint16_t" => Self::UInt16,
            "uint32_t" => Self::UInt32,
            "uint64_t" => Self::UInt64,
            "float" => Self::Float,
            "double" => Self::Double,
            "float complex" => Self::ComplexFloat,
            "double complex" => Self::ComplexDouble,
            _ => return None,
        })
    }
}

/// A plain numeric element that can be put to and read from a stream.
pub trait Element: Copy + Default + Send + Sync + 'static {
    const DATA_TYPE: DataType;

    /// Append the native-endian bytes of `values` to `out`.
    fn extend_bytes(values: &[Self], out: &mut Vec<u8>);

    /// Overwrite `out` from native-endian `bytes` (`bytes.len()` must be
    /// `out.len() * size_of::<Self>()`).
    fn fill_from_bytes(bytes: &[u8], out: &mut [Self]);
}

macro_rules! impl_element {
    ($t:ty, $tag:expr) => {
        impl Element for $t {
            const DATA_TYPE: DataType = $tag;

            fn extend_bytes(values: &[Self], out: &mut Vec<u8>) {
                out.reserve(values.len() * std::mem::size_of::<$t>());
                for v in values {
                    out.extend_from_slice(&v.to_ne_bytes());
                }
            }

            fn fill_from_bytes(bytes: &[u8], out: &mut [Self]) {
                const N: usize = std::mem::size_of::<$t>();
                for (dst, chunk) in out.iter_mut().zip(bytes.chunks_exact(N)) {
                    let mut raw = [0u8; N];
                    raw.copy_from_slice(chunk);
                    *dst = <$t>::from_ne_bytes(raw);
                }
            }
        }
    };
}

impl_element!(i8, DataType::Int8);
impl_element!(i16, DataType::Int16);
impl_element!(i32, DataType::Int32);
impl_element!(i64, DataType::Int64);
impl_element!(u8, DataType::UInt8);
impl_element!(u16, DataType::UInt16);
impl_element!(u32, DataType::UInt32);
impl_element!(u64, DataType::UInt64);
impl_element!(f32, DataType::Float);
impl_element!(f64, DataType::Double);

// =============================================================================
// Block layout flags
// =============================================================================

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BlockLayout: u8 {
        const ROW_MAJOR = 1 << 0;
        const LITTLE_ENDIAN = 1 << 1;
    }
}

impl BlockLayout {
    /// Row-major layout in the host byte order.
    pub fn native() -> Self {
        let mut layout = Self::ROW_MAJOR;
        if cfg!(target_endian = "little") {
            layout |= Self::LITTLE_ENDIAN;
        }
        layout
    }

    pub fn is_row_major(&self) -> bool {
        self.contains(Self::ROW_MAJOR)
    }

    /// Whether element bytes must be swapped to be read on this host.
    pub fn needs_swap(&self) -> bool {
        self.contains(Self::LITTLE_ENDIAN) != cfg!(target_endian = "little")
    }
}

impl Default for BlockLayout {
    fn default() -> Self {
        Self::native()
    }
}

// =============================================================================
// Variables
// =============================================================================

/// Operator applied to every block of a variable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperatorSpec {
    pub id: String,
    pub params: Params,
}

/// A named, typed array (or scalar) defined by a producer.
///
/// `shape` is empty for local arrays and scalars; `count` is empty for
/// scalars.
#[derive(Debug, Clone, PartialEq)]
pub struct Variable {
    pub name: String,
    pub data_type: DataType,
    pub shape: Dims,
    pub start: Dims,
    pub count: Dims,
    pub operator: Option<OperatorSpec>,
}

impl Variable {
    /// A global array: this rank contributes the `start`/`count` box of `shape`.
    pub fn global(
        name: impl Into<String>,
        data_type: DataType,
        shape: Dims,
        start: Dims,
        count: Dims,
    ) -> Result<Self> {
        let var = Self {
            name: name.into(),
            data_type,
            shape,
            start,
            count,
            operator: None,
        };
        var.validate()?;
        Ok(var)
    }

    /// A local array with no global shape.
    pub fn local(name: impl Into<String>, data_type: DataType, count: Dims) -> Self {
        let start = vec![0; count.len()];
        Self {
            name: name.into(),
            data_type,
            shape: Vec::new(),
            start,
            count,
            operator: None,
        }
    }

    pub fn scalar(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            data_type,
            shape: Vec::new(),
            start: Vec::new(),
            count: Vec::new(),
            operator: None,
        }
    }

    pub fn is_scalar(&self) -> bool {
        self.count.is_empty()
    }

    pub fn shape(&self) -> &Dims {
        &self.shape
    }

    pub fn count(&self) -> &Dims {
        &self.count
    }

    /// Change the box this rank writes, or the box a reader selects.
    pub fn set_selection(&mut self, start: Dims, count: Dims) -> Result<()> {
        let previous = (
            std::mem::replace(&mut self.start, start),
            std::mem::replace(&mut self.count, count),
        );
        if let Err(e) = self.validate() {
            self.start = previous.0;
            self.count = previous.1;
            return Err(e);
        }
        Ok(())
    }

    pub fn set_operator(&mut self, id: impl Into<String>, params: Params) {
        self.operator = Some(OperatorSpec {
            id: id.into(),
            params,
        });
    }

    /// Bytes in one block of this variable's current selection.
    pub fn payload_size(&self) -> usize {
        element_count(&self.count) as usize * self.data_type.size()
    }

    fn validate(&self) -> Result<()> {
        if self.start.len() != self.count.len() {
            return Err(StreamError::invalid(format!(
                "variable {}: start has {} dimensions, count has {}",
                self.name,
                self.start.len(),
                self.count.len()
            )));
        }
        if !self.shape.is_empty() {
            if self.shape.len() != self.count.len() {
                return Err(StreamError::invalid(format!(
                    "variable {}: shape has {} dimensions, count has {}",
                    self.name,
                    self.shape.len(),
                    self.count.len()
                )));
            }
            for (d, ((s, c), g)) in self
                .start
                .iter()
                .zip(&self.count)
                .zip(&self.shape)
                .enumerate()
            {
                if s + c > *g {
                    return Err(StreamError::invalid(format!(
                        "variable {}: box {}+{} exceeds shape {} in dimension {}",
                        self.name, s, c, g, d
                    )));
                }
            }
        }
        Ok(())
    }
}

// =============================================================================
// Attributes
// =============================================================================

/// Step-invariant metadata attached to a stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    Text(String),
    TextArray(Vec<String>),
    Int(i64),
    IntArray(Vec<i64>),
    UInt(u64),
    Float(f64),
    FloatArray(Vec<f64>),
}

impl From<&str> for AttributeValue {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<String> for AttributeValue {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<i64> for AttributeValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<u64> for AttributeValue {
    fn from(v: u64) -> Self {
        Self::UInt(v)
    }
}

impl From<f64> for AttributeValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<Vec<f64>> for AttributeValue {
    fn from(v: Vec<f64>) -> Self {
        Self::FloatArray(v)
    }
}

/// Name to value map of stream attributes.
pub type AttributeRegistry = BTreeMap<String, AttributeValue>;
