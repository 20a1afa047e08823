//! Per-block payload operators (compression) and their registry.
//!
//! An operator is an opaque capability: the serializer calls
//! [`Operator::operate`] on a block's raw bytes when the variable names an
//! operator, and the reader calls [`Operator::inverse_operate`] before
//! copying a selection out of the block.

use crate::error::{Result, StreamError};
use crate::types::{DataType, Dims, Params};
use anyhow::Context;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

pub trait Operator: Send + Sync {
    /// Identifier recorded on the wire for blocks this operator encoded.
    fn id(&self) -> &str;

    fn operate(
        &self,
        data: &[u8],
        data_type: DataType,
        count: &Dims,
        params: &Params,
    ) -> anyhow::Result<Vec<u8>>;

    /// Restore the original bytes. `expected_size` is the decoded size.
    fn inverse_operate(
        &self,
        data: &[u8],
        expected_size: usize,
        params: &Params,
    ) -> anyhow::Result<Vec<u8>>;
}

// =============================================================================
// Built-in operators
// =============================================================================

/// zstd frame compression. Parameter `level` (default 3).
#[derive(Debug, Default)]
pub struct ZstdOperator;

impl Operator for ZstdOperator {
    fn id(&self) -> &str {
        "zstd"
    }

    fn operate(
        &self,
        data: &[u8],
        _data_type: DataType,
        _count: &Dims,
        params: &Params,
    ) -> anyhow::Result<Vec<u8>> {
        let level = match params.get("level") {
            Some(level) => level
                .parse::<i32>()
                .with_context(|| format!("invalid zstd level `{}`", level))?,
            None => 3,
        };
        zstd::bulk::compress(data, level).context("zstd compression failed")
    }

    fn inverse_operate(
        &self,
        data: &[u8],
        expected_size: usize,
        _params: &Params,
    ) -> anyhow::Result<Vec<u8>> {
        zstd::bulk::decompress(data, expected_size).context("zstd decompression failed")
    }
}

/// LZ4 block compression with a size prefix.
#[derive(Debug, Default)]
pub struct Lz4Operator;

impl Operator for Lz4Operator {
    fn id(&self) -> &str {
        "lz4"
    }

    fn operate(
        &self,
        data: &[u8],
        _data_type: DataType,
        _count: &Dims,
        _params: &Params,
    ) -> anyhow::Result<Vec<u8>> {
        Ok(lz4_flex::compress_prepend_size(data))
    }

    fn inverse_operate(
        &self,
        data: &[u8],
        _expected_size: usize,
        _params: &Params,
    ) -> anyhow::Result<Vec<u8>> {
        lz4_flex::decompress_size_prepended(data).context("lz4 decompression failed")
    }
}

// =============================================================================
// Registry
// =============================================================================

/// Runtime map from operator id to implementation.
#[derive(Clone, Default)]
pub struct OperatorRegistry {
    operators: HashMap<String, Arc<dyn Operator>>,
}

impl fmt::Debug for OperatorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut ids: Vec<_> = self.operators.keys().collect();
        ids.sort();
        f.debug_struct("OperatorRegistry").field("ids", &ids).finish()
    }
}

impl OperatorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in `zstd` and `lz4` operators.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(ZstdOperator));
        registry.register(Arc::new(Lz4Operator));
        registry
    }

    /// Add or replace an operator under its own id.
    pub fn register(&mut self, operator: Arc<dyn Operator>) {
        self.operators.insert(operator.id().to_string(), operator);
    }

    pub fn get(&self, id: &str) -> Result<Arc<dyn Operator>> {
        self.operators
            .get(id)
            .cloned()
            .ok_or_else(|| StreamError::config(format!("no operator registered as `{}`", id)))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.operators.contains_key(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Vec<u8> {
        (0..4096u32).flat_map(|i| (i % 17).to_le_bytes()).collect()
    }

    #[test]
    fn test_zstd_roundtrip() {
        let op = ZstdOperator;
        let data = sample();
        let mut params = Params::new();
        params.insert("level".to_string(), "5".to_string());

        let packed = op
            .operate(&data, DataType::UInt32, &vec![4096], &params)
            .unwrap();
        assert!(packed.len() < data.len());
        let unpacked = op.inverse_operate(&packed, data.len(), &params).unwrap();
        assert_eq!(unpacked, data);
    }

    #[test]
    fn test_zstd_bad_level() {
        let mut params = Params::new();
        params.insert("level".to_string(), "high".to_string());
        assert!(ZstdOperator
            .operate(&[1, 2, 3], DataType::UInt8, &vec![3], &params)
            .is_err());
    }

    #[test]
    fn test_lz4_roundtrip() {
        let op = Lz4Operator;
        let data = sample();
        let packed = op
            .operate(&data, DataType::UInt32, &vec![4096], &Params::new())
            .unwrap();
        let unpacked = op
            .inverse_operate(&packed, data.len(), &Params::new())
            .unwrap();
        assert_eq!(unpacked, data);
    }

    #[test]
    fn test_registry_lookup() {
        let registry = OperatorRegistry::with_defaults();
        assert!(registry.contains("zstd"));
        assert!(registry.contains("lz4"));
        assert_eq!(registry.get("lz4").unwrap().id(), "lz4");
        assert!(matches!(registry.get("sz"), Err(StreamError::Config(_))));
    }
}
