//! Chained write batch

use bytes::Bytes;
use ouroboros_level_kv::BatchOp;

/// Caller-assembled batch of mutations, applied atomically by
/// [`Database::write`](crate::Database::write)
///
/// Writing consumes the batch, so the same batch cannot be applied twice.
#[derive(Debug, Default)]
pub struct WriteBatch {
    ops: Vec<BatchOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, key: impl Into<Bytes>, value: impl Into<Bytes>) -> &mut Self {
        self.ops.push(BatchOp::put(key, value));
        self
    }

    pub fn del(&mut self, key: impl Into<Bytes>) -> &mut Self {
        self.ops.push(BatchOp::delete(key));
        self
    }

    pub fn clear(&mut self) -> &mut Self {
        self.ops.clear();
        self
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn ops(&self) -> &[BatchOp] {
        &self.ops
    }

    pub fn into_ops(self) -> Vec<BatchOp> {
        self.ops
    }
}
