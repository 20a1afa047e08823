//! Producer side of the wire format.

use crate::error::{Result, StreamError};
use crate::format::{keys, IndexValue, ATTRIBUTES_SECTION, FINAL_STEP_KEY, HEADER_SIZE};
use crate::operator::OperatorRegistry;
use crate::types::{AttributeRegistry, AttributeValue, BlockLayout, Element, Variable};
use bytes::{BufMut, Bytes, BytesMut};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::trace;

/// Initial capacity for the first buffer of a stream.
const MIN_BUFFER_SIZE: usize = 1024;

/// Accumulates block payloads and their index records for one rank until
/// [`WireSerializer::get_local_pack`] seals them into a message.
#[derive(Debug)]
pub struct WireSerializer {
    rank: u32,
    layout: BlockLayout,
    operators: Arc<OperatorRegistry>,
    buffer: BytesMut,
    steps: BTreeMap<u64, Vec<IndexValue>>,
    attributes: Option<IndexValue>,
    last_size: usize,
}

impl WireSerializer {
    pub fn new(rank: u32, operators: Arc<OperatorRegistry>) -> Self {
        Self {
            rank,
            layout: BlockLayout::native(),
            operators,
            buffer: BytesMut::new(),
            steps: BTreeMap::new(),
            attributes: None,
            last_size: MIN_BUFFER_SIZE,
        }
    }

    /// Start a fresh message, sized from the previous message.
    pub fn new_buffer(&mut self) {
        self.buffer = BytesMut::with_capacity(self.last_size.max(MIN_BUFFER_SIZE));
        self.buffer.put_bytes(0, HEADER_SIZE);
        self.steps.clear();
        self.attributes = None;
    }

    /// Whether anything was recorded since the last `new_buffer`.
    pub fn has_data(&self) -> bool {
        !self.steps.is_empty() || self.attributes.is_some()
    }

    /// Bytes accumulated so far in the open message.
    pub fn local_buffer_size(&self) -> usize {
        self.buffer.len()
    }

    /// Append one block of raw native-endian bytes for `var` at `step`.
    pub fn put(&mut self, var: &Variable, step: u64, payload: &[u8]) -> Result<()> {
        let expected = var.payload_size();
        if payload.len() != expected {
            return Err(StreamError::invalid(format!(
                "variable {}: payload has {} bytes, selection needs {}",
                var.name,
                payload.len(),
                expected
            )));
        }
        if self.buffer.len() < HEADER_SIZE {
            self.new_buffer();
        }

        let mut record = BTreeMap::new();
        let operated;
        let bytes: &[u8] = match &var.operator {
            Some(spec) => {
                let operator = self.operators.get(&spec.id)?;
                operated = operator
                    .operate(payload, var.data_type, &var.count, &spec.params)
                    .map_err(|source| StreamError::Operator {
                        id: spec.id.clone(),
                        source,
                    })?;
                record.insert(keys::COMPRESSION.to_string(), IndexValue::from(spec.id.as_str()));
                let params = spec
                    .params
                    .iter()
                    .map(|(k, v)| (k.clone(), IndexValue::from(v.as_str())))
                    .collect();
                record.insert(keys::PARAMS.to_string(), IndexValue::Map(params));
                &operated
            }
            None => payload,
        };

        let position = self.buffer.len();
        self.buffer.put_slice(bytes);

        record.insert(keys::NAME.to_string(), IndexValue::from(var.name.as_str()));
        record.insert(keys::START.to_string(), IndexValue::from_dims(&var.start));
        record.insert(keys::COUNT.to_string(), IndexValue::from_dims(&var.count));
        if !var.shape.is_empty() {
            record.insert(keys::SHAPE.to_string(), IndexValue::from_dims(&var.shape));
        }
        record.insert(keys::SIZE.to_string(), IndexValue::UInt(bytes.len() as u64));
        record.insert(keys::POSITION.to_string(), IndexValue::UInt(position as u64));
        record.insert(keys::TYPE.to_string(), IndexValue::from(var.data_type.as_str()));
        record.insert(
            keys::LAYOUT.to_string(),
            IndexValue::UInt(u64::from(self.layout.bits())),
        );

        trace!(
            name = %var.name,
            step,
            position,
            bytes = bytes.len(),
            "WireSerializer::put"
        );
        self.steps
            .entry(step)
            .or_default()
            .push(IndexValue::Map(record));
        Ok(())
    }

    /// Typed convenience over [`WireSerializer::put`].
    pub fn put_values<T: Element>(&mut self, var: &Variable, step: u64, values: &[T]) -> Result<()> {
        if T::DATA_TYPE != var.data_type {
            return Err(StreamError::invalid(format!(
                "variable {} is {}, values are {}",
                var.name,
                var.data_type.as_str(),
                T::DATA_TYPE.as_str()
            )));
        }
        let mut bytes = Vec::new();
        T::extend_bytes(values, &mut bytes);
        self.put(var, step, &bytes)
    }

    /// Include the full attribute set in the open message.
    pub fn attach_attributes(&mut self, attributes: &AttributeRegistry) {
        let records = attributes
            .iter()
            .map(|(name, value)| {
                let mut record = BTreeMap::new();
                record.insert(keys::NAME.to_string(), IndexValue::from(name.as_str()));
                let (tag, encoded) = attribute_to_index(value);
                record.insert(keys::TYPE.to_string(), IndexValue::from(tag));
                record.insert(keys::VALUE.to_string(), encoded);
                IndexValue::Map(record)
            })
            .collect();
        self.attributes = Some(IndexValue::List(records));
    }

    /// Stamp this rank's blocks of `step` with the current wall-clock time.
    pub fn attach_timestamp(&mut self, step: u64) {
        let now = chrono::Utc::now().timestamp_millis();
        if let Some(records) = self.steps.get_mut(&step) {
            for record in records.iter_mut() {
                if let Some(map) = record.as_map_mut() {
                    map.insert(keys::TIMESTAMP.to_string(), IndexValue::Int(now));
                }
            }
        }
    }

    /// Seal the open message: write the header, append the index and hand
    /// back an immutable shared buffer.
    pub fn get_local_pack(&mut self) -> Bytes {
        if self.buffer.len() < HEADER_SIZE {
            self.new_buffer();
        }

        let mut root = BTreeMap::new();
        if let Some(attributes) = self.attributes.take() {
            root.insert(ATTRIBUTES_SECTION.to_string(), attributes);
        }
        for (step, records) in std::mem::take(&mut self.steps) {
            let mut ranks = BTreeMap::new();
            ranks.insert(self.rank.to_string(), IndexValue::List(records));
            root.insert(step.to_string(), IndexValue::Map(ranks));
        }
        let index = IndexValue::Map(root);

        let meta_offset = self.buffer.len() as u64;
        let meta_size = index.encoded_len() as u64;
        index.encode_into(&mut self.buffer);
        self.buffer[0..8].copy_from_slice(&meta_offset.to_le_bytes());
        self.buffer[8..16].copy_from_slice(&meta_size.to_le_bytes());

        let pack = std::mem::take(&mut self.buffer).freeze();
        self.last_size = pack.len();
        trace!(bytes = pack.len(), meta_offset, meta_size, "WireSerializer::get_local_pack");
        pack
    }

    /// Control record announcing the last step of the stream (`None` when
    /// nothing was written).
    pub fn end_signal(final_step: Option<u64>) -> Bytes {
        let mut root = BTreeMap::new();
        root.insert(
            FINAL_STEP_KEY.to_string(),
            final_step.map_or(IndexValue::Null, IndexValue::UInt),
        );
        IndexValue::Map(root).encode()
    }
}

// =============================================================================
// Attribute encoding
// =============================================================================

pub(crate) fn attribute_to_index(value: &AttributeValue) -> (&'static str, IndexValue) {
    match value {
        AttributeValue::Text(s) => ("string", IndexValue::from(s.as_str())),
        AttributeValue::TextArray(items) => (
            "string[]",
            IndexValue::List(items.iter().map(|s| IndexValue::from(s.as_str())).collect()),
        ),
        AttributeValue::Int(v) => ("int64_t", IndexValue::Int(*v)),
        AttributeValue::IntArray(items) => (
            "int64_t[]",
            IndexValue::List(items.iter().map(|v| IndexValue::Int(*v)).collect()),
        ),
        AttributeValue::UInt(v) => ("uint64_t", IndexValue::UInt(*v)),
        AttributeValue::Float(v) => ("double", IndexValue::Float(*v)),
        AttributeValue::FloatArray(items) => (
            "double[]",
            IndexValue::List(items.iter().map(|v| IndexValue::Float(*v)).collect()),
        ),
    }
}

pub(crate) fn attribute_from_index(tag: &str, value: &IndexValue) -> Option<AttributeValue> {
    fn list<T>(value: &IndexValue, f: impl Fn(&IndexValue) -> Option<T>) -> Option<Vec<T>> {
        value.as_list()?.iter().map(f).collect()
    }
    Some(match (tag, value) {
        ("string", IndexValue::Str(s)) => AttributeValue::Text(s.clone()),
        ("string[]", v) => AttributeValue::TextArray(list(v, |i| i.as_str().map(String::from))?),
        ("int64_t", IndexValue::Int(v)) => AttributeValue::Int(*v),
        ("int64_t[]", v) => AttributeValue::IntArray(list(v, |i| match i {
            IndexValue::Int(x) => Some(*x),
            _ => None,
        })?),
        ("uint64_t", IndexValue::UInt(v)) => AttributeValue::UInt(*v),
        ("double", IndexValue::Float(v)) => AttributeValue::Float(*v),
        ("double[]", v) => AttributeValue::FloatArray(list(v, |i| match i {
            IndexValue::Float(x) => Some(*x),
            _ => None,
        })?),
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DataType;

    fn serializer() -> WireSerializer {
        WireSerializer::new(0, Arc::new(OperatorRegistry::with_defaults()))
    }

    fn header(pack: &[u8]) -> (usize, usize) {
        let offset = u64::from_le_bytes(pack[0..8].try_into().unwrap()) as usize;
        let size = u64::from_le_bytes(pack[8..16].try_into().unwrap()) as usize;
        (offset, size)
    }

    #[test]
    fn test_header_points_at_index() {
        let mut s = serializer();
        s.new_buffer();
        let var = Variable::local("v", DataType::Int32, vec![4]);
        s.put_values(&var, 0, &[1i32, 2, 3, 4]).unwrap();
        let pack = s.get_local_pack();

        let (offset, size) = header(&pack);
        assert_eq!(offset, HEADER_SIZE + 16);
        assert_eq!(offset + size, pack.len());

        let index = IndexValue::decode(&pack[offset..]).unwrap();
        let block = &index.get("0").unwrap().get("0").unwrap().as_list().unwrap()[0];
        assert_eq!(block.get(keys::NAME).unwrap().as_str(), Some("v"));
        assert_eq!(block.get(keys::POSITION).unwrap().as_u64(), Some(16));
        assert_eq!(block.get(keys::SIZE).unwrap().as_u64(), Some(16));
        assert!(block.get(keys::SHAPE).is_none());
    }

    #[test]
    fn test_payload_size_checked() {
        let mut s = serializer();
        let var = Variable::local("v", DataType::Double, vec![3]);
        let err = s.put(&var, 0, &[0u8; 16]).unwrap_err();
        assert!(matches!(err, StreamError::InvalidArgument(_)));
    }

    #[test]
    fn test_put_values_type_checked() {
        let mut s = serializer();
        let var = Variable::local("v", DataType::Double, vec![2]);
        assert!(s.put_values(&var, 0, &[1.0f32, 2.0]).is_err());
    }

    #[test]
    fn test_sizing_hint_follows_previous_pack() {
        let mut s = serializer();
        s.new_buffer();
        let var = Variable::local("big", DataType::UInt8, vec![5000]);
        s.put(&var, 0, &[7u8; 5000]).unwrap();
        let first = s.get_local_pack();

        s.new_buffer();
        assert!(s.buffer.capacity() >= first.len());
        assert_eq!(s.local_buffer_size(), HEADER_SIZE);
        assert!(!s.has_data());
    }

    #[test]
    fn test_operator_records_compression() {
        let mut s = serializer();
        s.new_buffer();
        let mut var = Variable::local("z", DataType::UInt8, vec![4096]);
        var.set_operator("zstd", Default::default());
        s.put(&var, 2, &[0u8; 4096]).unwrap();
        let pack = s.get_local_pack();

        let (offset, _) = header(&pack);
        let index = IndexValue::decode(&pack[offset..]).unwrap();
        let block = &index.get("2").unwrap().get("0").unwrap().as_list().unwrap()[0];
        assert_eq!(block.get(keys::COMPRESSION).unwrap().as_str(), Some("zstd"));
        assert!(block.get(keys::SIZE).unwrap().as_u64().unwrap() < 4096);
    }

    #[test]
    fn test_unknown_operator_is_config_error() {
        let mut s = serializer();
        let mut var = Variable::local("z", DataType::UInt8, vec![4]);
        var.set_operator("sz", Default::default());
        assert!(matches!(s.put(&var, 0, &[0u8; 4]), Err(StreamError::Config(_))));
    }

    #[test]
    fn test_attributes_and_timestamp() {
        let mut s = serializer();
        s.new_buffer();
        let var = Variable::scalar("t", DataType::Double);
        s.put_values(&var, 0, &[0.5f64]).unwrap();
        let mut attrs = AttributeRegistry::new();
        attrs.insert("units".to_string(), AttributeValue::from("K"));
        attrs.insert("dt".to_string(), AttributeValue::from(vec![0.1, 0.2]));
        s.attach_attributes(&attrs);
        s.attach_timestamp(0);
        let pack = s.get_local_pack();

        let (offset, _) = header(&pack);
        let index = IndexValue::decode(&pack[offset..]).unwrap();
        assert_eq!(index.get(ATTRIBUTES_SECTION).unwrap().as_list().unwrap().len(), 2);
        let block = &index.get("0").unwrap().get("0").unwrap().as_list().unwrap()[0];
        assert!(matches!(block.get(keys::TIMESTAMP), Some(IndexValue::Int(_))));
    }

    #[test]
    fn test_end_signal_is_small() {
        let signal = WireSerializer::end_signal(Some(41));
        assert!(signal.len() < crate::format::CONTROL_THRESHOLD);
        let decoded = IndexValue::decode(&signal).unwrap();
        assert_eq!(decoded.get(FINAL_STEP_KEY).unwrap().as_u64(), Some(41));
    }

    #[test]
    fn test_attribute_index_roundtrip() {
        for value in [
            AttributeValue::from("x"),
            AttributeValue::TextArray(vec!["a".into(), "b".into()]),
            AttributeValue::Int(-3),
            AttributeValue::IntArray(vec![]),
            AttributeValue::UInt(9),
            AttributeValue::Float(1.25),
        ] {
            let (tag, encoded) = attribute_to_index(&value);
            assert_eq!(attribute_from_index(tag, &encoded), Some(value));
        }
        assert_eq!(attribute_from_index("double", &IndexValue::Null), None);
    }
}
