//! Memories, allocation handles, and per-memory instance bookkeeping.
//!
//! A [`MemoryManager`] owns the byte pool of one memory and tracks every
//! physical manager whose allocation lives there. Managers report their
//! lifecycle edges (activate/deactivate, validate/invalidate) here; the
//! eviction policy reads those flags together with mapper-supplied
//! garbage-collection priorities to pick victims when a memory fills up.
//!
//! Allocation is immediate: the ready event of a fresh instance is
//! [`Event::NONE`]. Deferred deletions are recorded with the event they are
//! conditioned on and freed from the pool at once; the external event graph
//! owns the actual reclamation timing.

use std::collections::BTreeMap;

use core::fmt;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::event::Event;
use crate::types::{DistributedId, GcPriority, InstanceId, MapperId, MemoryId, ProcessorId};

/// Size in bytes of a pointer slot in list-reduction records.
pub const POINTER_SIZE: usize = 8;

// ---------------------------------------------------------------------------
// PhysicalInstance / InstanceFlags
// ---------------------------------------------------------------------------

/// A handle to one backing allocation inside one memory.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PhysicalInstance {
    /// Allocation id; zero means no instance.
    pub id: InstanceId,
    /// The memory holding the bytes.
    pub memory: MemoryId,
    /// Allocation size in bytes.
    pub size: usize,
}

impl PhysicalInstance {
    /// The absent instance.
    pub const NONE: Self = Self {
        id: InstanceId(0),
        memory: MemoryId(0),
        size: 0,
    };

    /// Returns true if this handle names a real allocation.
    #[must_use]
    pub const fn exists(&self) -> bool {
        self.id.0 != 0
    }
}

impl fmt::Debug for PhysicalInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.exists() {
            write!(f, "Instance({} in {}, {} bytes)", self.id, self.memory, self.size)
        } else {
            write!(f, "Instance(none)")
        }
    }
}

/// Bit flags attached to an instance manager.
///
/// Unknown bits are preserved verbatim so newer peers can round-trip flags
/// through older ones.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct InstanceFlags(pub u32);

impl InstanceFlags {
    /// No flags.
    pub const NONE: Self = Self(0);
    /// The allocation is an attached external file.
    pub const ATTACH_FILE: Self = Self(1);

    /// Returns true if every bit of `other` is set in `self`.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Union of flag sets.
    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }
}

impl fmt::Debug for InstanceFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InstanceFlags({:#x})", self.0)
    }
}

// ---------------------------------------------------------------------------
// MemoryManager
// ---------------------------------------------------------------------------

/// Lifecycle counters of one memory, for tests and diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MemoryStats {
    /// Number of 0→1 activation edges seen.
    pub activations: u64,
    /// Number of →0 deactivation edges seen.
    pub deactivations: u64,
    /// Number of 0→1 validation edges seen.
    pub validations: u64,
    /// Number of →0 invalidation edges seen.
    pub invalidations: u64,
}

#[derive(Debug, Default)]
struct InstanceRecord {
    active: bool,
    valid: bool,
    priority: GcPriority,
    remote: bool,
}

#[derive(Default)]
struct MemoryState {
    allocated: usize,
    next_instance: u64,
    live: BTreeMap<InstanceId, usize>,
    records: BTreeMap<DistributedId, InstanceRecord>,
    stats: MemoryStats,
    deletions: Vec<(PhysicalInstance, Event)>,
}

/// Tracks allocations and manager lifecycle state for one memory.
pub struct MemoryManager {
    memory: MemoryId,
    capacity: usize,
    state: Mutex<MemoryState>,
}

impl MemoryManager {
    /// Creates a manager for `memory` with the given byte capacity.
    #[must_use]
    pub fn new(memory: MemoryId, capacity: usize) -> Self {
        Self {
            memory,
            capacity,
            state: Mutex::new(MemoryState::default()),
        }
    }

    /// The memory this manager governs.
    #[must_use]
    pub const fn memory(&self) -> MemoryId {
        self.memory
    }

    /// Total byte capacity.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes currently allocated.
    #[must_use]
    pub fn allocated_bytes(&self) -> usize {
        self.state.lock().allocated
    }

    /// Reserves `size` bytes, returning the handle and its ready event.
    ///
    /// Returns `None` when the memory cannot hold the request; the caller is
    /// expected to try another memory or evict. Immediate allocations are
    /// ready at once, so the event is [`Event::NONE`].
    pub fn create_instance(&self, size: usize) -> Option<(PhysicalInstance, Event)> {
        let mut state = self.state.lock();
        if state.allocated + size > self.capacity {
            debug!(
                memory = %self.memory,
                requested = size,
                free = self.capacity - state.allocated,
                "allocation refused"
            );
            return None;
        }
        state.allocated += size;
        state.next_instance += 1;
        let id = InstanceId(state.next_instance);
        state.live.insert(id, size);
        let instance = PhysicalInstance {
            id,
            memory: self.memory,
            size,
        };
        Some((instance, Event::NONE))
    }

    /// Destroys an allocation, conditioned on `deferred`.
    ///
    /// The pool bytes are released immediately; the deletion record keeps
    /// the event so the external graph can sequence actual reuse.
    ///
    /// # Panics
    ///
    /// Panics if the instance is not live in this memory; destroying twice
    /// is a caller bug.
    pub fn destroy_instance(&self, instance: PhysicalInstance, deferred: Event) {
        let mut state = self.state.lock();
        let size = state
            .live
            .remove(&instance.id)
            .unwrap_or_else(|| panic!("destroying unknown instance {} in {}", instance.id, self.memory));
        state.allocated -= size;
        state.deletions.push((instance, deferred));
        info!(
            memory = %self.memory,
            instance = %instance.id,
            deferred = %deferred,
            "deleting physical instance"
        );
    }

    /// Returns true while an allocation is live.
    #[must_use]
    pub fn instance_exists(&self, id: InstanceId) -> bool {
        self.state.lock().live.contains_key(&id)
    }

    /// Registers a remote proxy whose allocation lives in this memory.
    pub fn register_remote_instance(&self, did: DistributedId) {
        let mut state = self.state.lock();
        let record = state.records.entry(did).or_default();
        record.remote = true;
    }

    /// Removes a proxy's record; the owner-side twin is [`Self::retire_instance`].
    pub fn unregister_remote_instance(&self, did: DistributedId) {
        self.retire_instance(did);
    }

    /// Drops all bookkeeping for a manager.
    pub fn retire_instance(&self, did: DistributedId) {
        let mut state = self.state.lock();
        if let Some(record) = state.records.remove(&did) {
            if record.active || record.valid {
                warn!(memory = %self.memory, manager = %did, "retiring an instance still in use");
            }
        }
    }

    /// Notes a manager's 0→1 activation edge.
    pub fn activate_instance(&self, did: DistributedId) {
        let mut state = self.state.lock();
        state.records.entry(did).or_default().active = true;
        state.stats.activations += 1;
    }

    /// Notes a manager's →0 deactivation edge.
    pub fn deactivate_instance(&self, did: DistributedId) {
        let mut state = self.state.lock();
        state.records.entry(did).or_default().active = false;
        state.stats.deactivations += 1;
    }

    /// Notes a manager's 0→1 validation edge.
    pub fn validate_instance(&self, did: DistributedId) {
        let mut state = self.state.lock();
        state.records.entry(did).or_default().valid = true;
        state.stats.validations += 1;
    }

    /// Notes a manager's →0 invalidation edge.
    pub fn invalidate_instance(&self, did: DistributedId) {
        let mut state = self.state.lock();
        state.records.entry(did).or_default().valid = false;
        state.stats.invalidations += 1;
    }

    /// Applies a mapper's eviction priority hint.
    pub fn set_garbage_collection_priority(
        &self,
        did: DistributedId,
        mapper: MapperId,
        processor: ProcessorId,
        priority: GcPriority,
    ) {
        debug!(
            memory = %self.memory,
            manager = %did,
            mapper = %mapper,
            processor = %processor,
            priority = %priority,
            "gc priority hint"
        );
        let mut state = self.state.lock();
        state.records.entry(did).or_default().priority = priority;
    }

    /// Managers eligible for eviction, lowest priority first.
    ///
    /// A manager qualifies once it is both inactive and invalid and its
    /// priority is not pinned to [`GcPriority::NEVER`].
    #[must_use]
    pub fn eviction_candidates(&self) -> Vec<DistributedId> {
        let state = self.state.lock();
        let mut candidates: Vec<_> = state
            .records
            .iter()
            .filter(|(_, record)| {
                !record.active && !record.valid && record.priority != GcPriority::NEVER
            })
            .map(|(did, record)| (record.priority, *did))
            .collect();
        candidates.sort_unstable();
        candidates.into_iter().map(|(_, did)| did).collect()
    }

    /// Lifecycle counters so far.
    #[must_use]
    pub fn stats(&self) -> MemoryStats {
        self.state.lock().stats
    }

    /// Deletions issued so far, with their deferred events.
    #[must_use]
    pub fn deletions(&self) -> Vec<(PhysicalInstance, Event)> {
        self.state.lock().deletions.clone()
    }
}

impl fmt::Debug for MemoryManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryManager")
            .field("memory", &self.memory)
            .field("capacity", &self.capacity)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocation_respects_capacity() {
        let manager = MemoryManager::new(MemoryId(1), 100);
        let (first, ready) = manager.create_instance(60).unwrap();
        assert!(first.exists());
        assert!(!ready.exists());
        assert!(manager.create_instance(60).is_none());
        let (second, _) = manager.create_instance(40).unwrap();
        assert_ne!(first.id, second.id);
        assert_eq!(manager.allocated_bytes(), 100);
    }

    #[test]
    fn destroy_releases_bytes_and_logs_deletion() {
        let manager = MemoryManager::new(MemoryId(1), 100);
        let (instance, _) = manager.create_instance(80).unwrap();
        manager.destroy_instance(instance, Event(5));
        assert_eq!(manager.allocated_bytes(), 0);
        assert!(!manager.instance_exists(instance.id));
        assert_eq!(manager.deletions(), vec![(instance, Event(5))]);
    }

    #[test]
    #[should_panic(expected = "destroying unknown instance")]
    fn double_destroy_aborts() {
        let manager = MemoryManager::new(MemoryId(1), 100);
        let (instance, _) = manager.create_instance(10).unwrap();
        manager.destroy_instance(instance, Event::NONE);
        manager.destroy_instance(instance, Event::NONE);
    }

    #[test]
    fn lifecycle_counters() {
        let manager = MemoryManager::new(MemoryId(1), 100);
        let did = DistributedId::new(1, crate::types::AddressSpace(0));
        manager.activate_instance(did);
        manager.validate_instance(did);
        manager.invalidate_instance(did);
        manager.deactivate_instance(did);
        let stats = manager.stats();
        assert_eq!(stats.activations, 1);
        assert_eq!(stats.deactivations, 1);
        assert_eq!(stats.validations, 1);
        assert_eq!(stats.invalidations, 1);
    }

    #[test]
    fn eviction_candidates_sorted_by_priority() {
        let manager = MemoryManager::new(MemoryId(1), 100);
        let space = crate::types::AddressSpace(0);
        let low = DistributedId::new(1, space);
        let high = DistributedId::new(2, space);
        let pinned = DistributedId::new(3, space);
        let busy = DistributedId::new(4, space);
        let mapper = MapperId(0);
        let proc = ProcessorId(0);
        manager.set_garbage_collection_priority(low, mapper, proc, GcPriority(-5));
        manager.set_garbage_collection_priority(high, mapper, proc, GcPriority(5));
        manager.set_garbage_collection_priority(pinned, mapper, proc, GcPriority::NEVER);
        manager.activate_instance(busy);
        assert_eq!(manager.eviction_candidates(), vec![low, high]);
    }

    #[test]
    fn flags_preserve_unknown_bits() {
        let flags = InstanceFlags(0b1010_0001);
        assert!(flags.contains(InstanceFlags::ATTACH_FILE));
        assert_eq!(flags.union(InstanceFlags(0b10)).0, 0b1010_0011);
    }
}
