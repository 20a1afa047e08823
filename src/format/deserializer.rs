//! Consumer side of the wire format.
//!
//! Received messages are kept whole in a buffer table; the per-step index
//! only records where each block lives. A message may carry several steps,
//! so a buffer is released only once no live step references it.

use crate::error::{Result, StreamError};
use crate::format::serializer::attribute_from_index;
use crate::format::{
    keys, BufferKey, IndexValue, VarBlock, ATTRIBUTES_SECTION, CONTROL_THRESHOLD,
    FINAL_STEP_KEY, HEADER_SIZE,
};
use crate::types::{AttributeRegistry, BlockLayout, DataType, Params};
use bytes::Bytes;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, trace, warn};

/// What a call to [`WireDeserializer::put`] found in a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PutOutcome {
    /// A data message; `steps` lists the steps it contributed blocks to.
    Data { blocks: usize, steps: Vec<u64> },
    /// An end-of-stream control record.
    EndOfStream { final_step: Option<u64> },
    /// Zero-length message, ignored.
    Empty,
}

#[derive(Debug, Default)]
struct State {
    buffers: HashMap<BufferKey, Bytes>,
    steps: BTreeMap<u64, Arc<Vec<VarBlock>>>,
    min_step: Option<u64>,
    max_step: Option<u64>,
    /// Highest erased step; blocks at or below it arrive too late.
    erased_through: Option<u64>,
    attributes: AttributeRegistry,
    attributes_received: bool,
    final_step: Option<u64>,
    end_signals: usize,
}

#[derive(Debug, Default)]
pub struct WireDeserializer {
    state: Mutex<State>,
    next_key: AtomicU64,
}

impl WireDeserializer {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Classify and index one received message.
    pub fn put(&self, buffer: Bytes) -> Result<PutOutcome> {
        if buffer.is_empty() {
            return Ok(PutOutcome::Empty);
        }

        if buffer.len() < CONTROL_THRESHOLD {
            if let Some(final_step) = try_control_record(&buffer) {
                let mut state = self.lock();
                state.end_signals += 1;
                state.final_step = state.final_step.max(final_step);
                debug!(?final_step, signals = state.end_signals, "WireDeserializer::put: end of stream");
                return Ok(PutOutcome::EndOfStream { final_step });
            }
        }

        let (meta_offset, meta_size) = read_header(&buffer)?;
        let index = IndexValue::decode(&buffer[meta_offset..meta_offset + meta_size])?;
        let root = index
            .as_map()
            .ok_or_else(|| StreamError::protocol("index root is not a map"))?;

        let key = BufferKey(self.next_key.fetch_add(1, Ordering::Relaxed));
        let mut attributes = None;
        let mut blocks = Vec::new();
        for (section, value) in root {
            if section == ATTRIBUTES_SECTION {
                attributes = Some(parse_attributes(value));
                continue;
            }
            let step: u64 = section
                .parse()
                .map_err(|_| StreamError::protocol(format!("invalid step key `{}`", section)))?;
            let ranks = value
                .as_map()
                .ok_or_else(|| StreamError::protocol(format!("step {} is not a rank map", step)))?;
            for (rank, records) in ranks {
                let rank: u32 = rank
                    .parse()
                    .map_err(|_| StreamError::protocol(format!("invalid rank key `{}`", rank)))?;
                let records = records.as_list().ok_or_else(|| {
                    StreamError::protocol(format!("step {} rank {} is not a list", step, rank))
                })?;
                for record in records {
                    blocks.push(parse_block(record, step, rank, key, meta_offset)?);
                }
            }
        }

        let mut state = self.lock();
        if let Some(attributes) = attributes {
            if !state.attributes_received {
                state.attributes = attributes;
                state.attributes_received = true;
            }
        }

        let watermark = state.erased_through;
        let total = blocks.len();
        blocks.retain(|b| watermark.map_or(true, |w| b.step > w));
        if blocks.len() < total {
            debug!(
                dropped = total - blocks.len(),
                ?watermark,
                "WireDeserializer::put: ignoring blocks for erased steps"
            );
        }
        if blocks.is_empty() {
            return Ok(PutOutcome::Data {
                blocks: 0,
                steps: Vec::new(),
            });
        }

        state.buffers.insert(key, buffer);
        let count = blocks.len();
        let mut steps = BTreeSet::new();
        for block in blocks {
            let step = block.step;
            steps.insert(step);
            state.min_step = Some(state.min_step.map_or(step, |m| m.min(step)));
            state.max_step = Some(state.max_step.map_or(step, |m| m.max(step)));
            Arc::make_mut(state.steps.entry(step).or_default()).push(block);
        }
        trace!(?key, blocks = count, buffers = state.buffers.len(), "WireDeserializer::put");
        Ok(PutOutcome::Data {
            blocks: count,
            steps: steps.into_iter().collect(),
        })
    }

    /// Shared snapshot of the blocks observed for `step`.
    pub fn get_meta_data(&self, step: u64) -> Option<Arc<Vec<VarBlock>>> {
        self.lock().steps.get(&step).cloned()
    }

    /// The message a block points into, while it is still live.
    pub fn raw_buffer(&self, key: BufferKey) -> Option<Bytes> {
        self.lock().buffers.get(&key).cloned()
    }

    /// Drop `step` from the index and release every buffer no remaining
    /// step still references.
    pub fn erase(&self, step: u64) {
        let mut state = self.lock();
        if let Some(blocks) = state.steps.remove(&step) {
            let candidates: BTreeSet<BufferKey> = blocks.iter().map(|b| b.buffer_key).collect();
            for key in candidates {
                let referenced = state
                    .steps
                    .values()
                    .any(|later| later.iter().any(|b| b.buffer_key == key));
                if !referenced {
                    state.buffers.remove(&key);
                    trace!(?key, step, "WireDeserializer::erase: released buffer");
                }
            }
        }
        let next = step.saturating_add(1);
        state.min_step = Some(state.steps.keys().next().map_or(next, |&k| k.min(next)));
        state.erased_through = Some(state.erased_through.map_or(step, |w| w.max(step)));
    }

    /// Release everything: all steps, buffers, the step range and the
    /// watermark. Attributes and end-of-stream bookkeeping are kept.
    pub fn clear(&self) {
        let mut state = self.lock();
        state.steps.clear();
        state.buffers.clear();
        state.min_step = None;
        state.max_step = None;
        state.erased_through = None;
    }

    pub fn min_step(&self) -> Option<u64> {
        self.lock().min_step
    }

    pub fn max_step(&self) -> Option<u64> {
        self.lock().max_step
    }

    /// First live step strictly after `current` (or the first live step).
    pub fn next_step_after(&self, current: Option<u64>) -> Option<u64> {
        let state = self.lock();
        match current {
            Some(c) => state.steps.range(c.saturating_add(1)..).next().map(|(k, _)| *k),
            None => state.steps.keys().next().copied(),
        }
    }

    pub fn latest_step(&self) -> Option<u64> {
        self.lock().steps.keys().next_back().copied()
    }

    /// Distinct producer ranks that contributed blocks to `step`.
    pub fn step_ranks(&self, step: u64) -> usize {
        self.lock().steps.get(&step).map_or(0, |blocks| {
            blocks.iter().map(|b| b.rank).collect::<BTreeSet<_>>().len()
        })
    }

    pub fn live_steps(&self) -> Vec<u64> {
        self.lock().steps.keys().copied().collect()
    }

    pub fn buffer_count(&self) -> usize {
        self.lock().buffers.len()
    }

    pub fn contains_buffer(&self, key: BufferKey) -> bool {
        self.lock().buffers.contains_key(&key)
    }

    pub fn attributes(&self) -> AttributeRegistry {
        self.lock().attributes.clone()
    }

    /// Highest final step announced by any end-of-stream record.
    pub fn final_step(&self) -> Option<u64> {
        self.lock().final_step
    }

    /// Number of end-of-stream records received.
    pub fn end_signals(&self) -> usize {
        self.lock().end_signals
    }
}

// =============================================================================
// Parsing helpers
// =============================================================================

/// `Some(final_step)` when `buffer` is an end-of-stream record.
fn try_control_record(buffer: &[u8]) -> Option<Option<u64>> {
    let value = IndexValue::decode(buffer).ok()?;
    let map = value.as_map()?;
    if map.len() != 1 {
        return None;
    }
    match map.get(FINAL_STEP_KEY)? {
        IndexValue::Null => Some(None),
        other => other.as_u64().map(Some),
    }
}

fn read_header(buffer: &[u8]) -> Result<(usize, usize)> {
    if buffer.len() < HEADER_SIZE {
        return Err(StreamError::protocol(format!(
            "message of {} bytes is shorter than the header",
            buffer.len()
        )));
    }
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&buffer[0..8]);
    let offset = u64::from_le_bytes(raw);
    raw.copy_from_slice(&buffer[8..16]);
    let size = u64::from_le_bytes(raw);

    let end = offset.checked_add(size);
    if offset < HEADER_SIZE as u64 || end.map_or(true, |e| e > buffer.len() as u64) {
        return Err(StreamError::protocol(format!(
            "header points outside message: offset {} size {} in {} bytes",
            offset,
            size,
            buffer.len()
        )));
    }
    Ok((offset as usize, size as usize))
}

fn field<'a>(record: &'a IndexValue, key: &str, step: u64) -> Result<&'a IndexValue> {
    record.get(key).ok_or_else(|| {
        StreamError::protocol(format!("step {} block record missing `{}`", step, key))
    })
}

fn dims_field(record: &IndexValue, key: &str, step: u64) -> Result<Vec<u64>> {
    field(record, key, step)?
        .to_dims()
        .ok_or_else(|| StreamError::protocol(format!("step {} field `{}` is not dims", step, key)))
}

fn uint_field(record: &IndexValue, key: &str, step: u64) -> Result<u64> {
    field(record, key, step)?
        .as_u64()
        .ok_or_else(|| StreamError::protocol(format!("step {} field `{}` is not a uint", step, key)))
}

fn parse_block(
    record: &IndexValue,
    step: u64,
    rank: u32,
    buffer_key: BufferKey,
    payload_end: usize,
) -> Result<VarBlock> {
    let name = field(record, keys::NAME, step)?
        .as_str()
        .ok_or_else(|| StreamError::protocol("block name is not a string"))?
        .to_string();
    let type_tag = field(record, keys::TYPE, step)?
        .as_str()
        .ok_or_else(|| StreamError::protocol("block type is not a string"))?;
    let data_type = DataType::from_tag(type_tag)
        .ok_or_else(|| StreamError::protocol(format!("unsupported type `{}`", type_tag)))?;
    let start = dims_field(record, keys::START, step)?;
    let count = dims_field(record, keys::COUNT, step)?;
    if start.len() != count.len() {
        return Err(StreamError::protocol(format!(
            "block {} at step {}: start and count differ in rank",
            name, step
        )));
    }
    let shape = match record.get(keys::SHAPE) {
        Some(v) => Some(
            v.to_dims()
                .ok_or_else(|| StreamError::protocol("block shape is not dims"))?,
        ),
        None => None,
    };
    let size = uint_field(record, keys::SIZE, step)? as usize;
    let position = uint_field(record, keys::POSITION, step)? as usize;
    if position < HEADER_SIZE || position.checked_add(size).map_or(true, |e| e > payload_end) {
        return Err(StreamError::protocol(format!(
            "block {} at step {} lies outside the payload ({}+{} > {})",
            name, step, position, size, payload_end
        )));
    }

    let layout = match record.get(keys::LAYOUT).and_then(IndexValue::as_u64) {
        Some(bits) => BlockLayout::from_bits_truncate(bits as u8),
        None => BlockLayout::ROW_MAJOR | BlockLayout::LITTLE_ENDIAN,
    };
    let compression = record
        .get(keys::COMPRESSION)
        .and_then(IndexValue::as_str)
        .map(String::from);
    let params: Params = record
        .get(keys::PARAMS)
        .and_then(IndexValue::as_map)
        .map(|m| {
            m.iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                .collect()
        })
        .unwrap_or_default();
    let timestamp_ms = match record.get(keys::TIMESTAMP) {
        Some(IndexValue::Int(t)) => Some(*t),
        _ => None,
    };

    let block = VarBlock {
        step,
        name,
        rank,
        start,
        count,
        shape,
        size,
        position,
        data_type,
        layout,
        compression,
        params,
        timestamp_ms,
        buffer_key,
    };
    if block.compression.is_none() && block.size != block.decoded_size() {
        return Err(StreamError::protocol(format!(
            "block {} at step {} holds {} bytes, its box needs {}",
            block.name,
            step,
            block.size,
            block.decoded_size()
        )));
    }
    Ok(block)
}

fn parse_attributes(section: &IndexValue) -> AttributeRegistry {
    let mut attributes = AttributeRegistry::new();
    for record in section.as_list().unwrap_or_default() {
        let name = record.get(keys::NAME).and_then(IndexValue::as_str);
        let tag = record.get(keys::TYPE).and_then(IndexValue::as_str);
        let parsed = match (name, tag, record.get(keys::VALUE)) {
            (Some(name), Some(tag), Some(value)) => {
                attribute_from_index(tag, value).map(|v| (name.to_string(), v))
            }
            _ => None,
        };
        match parsed {
            Some((name, value)) => {
                attributes.insert(name, value);
            }
            None => warn!("WireDeserializer: skipping malformed attribute record"),
        }
    }
    attributes
}
