//! Reduction operators and the process-wide operator table.
//!
//! A [`ReductionOp`] is a small vtable over raw byte slices: initialize a
//! right-hand-side value, apply one into a left-hand-side field, or fold two
//! right-hand sides together. Reduction managers size their allocations from
//! `sizeof_rhs` and hand the op to the copy engine; the core never interprets
//! the bytes itself.
//!
//! Every node must register the same operators under the same ids before any
//! reduction instance crosses the wire.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::{Error, ErrorKind, Result};
use crate::types::ReductionOpId;

/// A reduction operator over untyped field storage.
pub trait ReductionOp: Send + Sync {
    /// Size in bytes of a left-hand-side (destination field) value.
    fn sizeof_lhs(&self) -> usize;

    /// Size in bytes of a right-hand-side (reduction) value.
    fn sizeof_rhs(&self) -> usize;

    /// Writes the identity value into an rhs slot.
    fn init(&self, rhs: &mut [u8]);

    /// Applies an rhs value into an lhs field.
    fn apply(&self, lhs: &mut [u8], rhs: &[u8]);

    /// Folds `rhs2` into `rhs1`.
    fn fold(&self, rhs1: &mut [u8], rhs2: &[u8]);
}

/// Registry of reduction operators keyed by id.
#[derive(Default)]
pub struct ReductionOpTable {
    ops: RwLock<BTreeMap<ReductionOpId, Arc<dyn ReductionOp>>>,
}

impl ReductionOpTable {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an operator under `id`.
    ///
    /// # Panics
    ///
    /// Panics if `id` is already taken; operator tables are written once at
    /// startup and never mutated afterwards.
    pub fn register(&self, id: ReductionOpId, op: Arc<dyn ReductionOp>) {
        let previous = self.ops.write().insert(id, op);
        assert!(previous.is_none(), "reduction op {id} registered twice");
    }

    /// Looks up the operator registered under `id`.
    pub fn find(&self, id: ReductionOpId) -> Result<Arc<dyn ReductionOp>> {
        self.ops
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::new(ErrorKind::UnknownReductionOp).with_context(format!("{id}")))
    }
}

/// Signed 64-bit integer sum.
#[derive(Debug, Clone, Copy, Default)]
pub struct SumReductionI64;

impl SumReductionI64 {
    fn read(bytes: &[u8]) -> i64 {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&bytes[..8]);
        i64::from_le_bytes(buf)
    }
}

impl ReductionOp for SumReductionI64 {
    fn sizeof_lhs(&self) -> usize {
        8
    }

    fn sizeof_rhs(&self) -> usize {
        8
    }

    fn init(&self, rhs: &mut [u8]) {
        rhs[..8].copy_from_slice(&0i64.to_le_bytes());
    }

    fn apply(&self, lhs: &mut [u8], rhs: &[u8]) {
        let sum = Self::read(lhs).wrapping_add(Self::read(rhs));
        lhs[..8].copy_from_slice(&sum.to_le_bytes());
    }

    fn fold(&self, rhs1: &mut [u8], rhs2: &[u8]) {
        let sum = Self::read(rhs1).wrapping_add(Self::read(rhs2));
        rhs1[..8].copy_from_slice(&sum.to_le_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sum_apply_and_fold() {
        let op = SumReductionI64;
        let mut lhs = 5i64.to_le_bytes().to_vec();
        let rhs = 7i64.to_le_bytes().to_vec();
        op.apply(&mut lhs, &rhs);
        assert_eq!(SumReductionI64::read(&lhs), 12);

        let mut acc = vec![0u8; 8];
        op.init(&mut acc);
        op.fold(&mut acc, &rhs);
        op.fold(&mut acc, &rhs);
        assert_eq!(SumReductionI64::read(&acc), 14);
    }

    #[test]
    fn table_register_and_find() {
        let table = ReductionOpTable::new();
        table.register(ReductionOpId(1), Arc::new(SumReductionI64));
        assert_eq!(table.find(ReductionOpId(1)).unwrap().sizeof_rhs(), 8);
        let missing = match table.find(ReductionOpId(2)) {
            Err(e) => e,
            Ok(_) => panic!("expected ReductionOpId(2) to be missing"),
        };
        assert_eq!(missing.kind(), ErrorKind::UnknownReductionOp);
    }

    #[test]
    #[should_panic(expected = "registered twice")]
    fn duplicate_registration_panics() {
        let table = ReductionOpTable::new();
        table.register(ReductionOpId(1), Arc::new(SumReductionI64));
        table.register(ReductionOpId(1), Arc::new(SumReductionI64));
    }
}
