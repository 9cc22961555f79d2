//! The explicitly threaded runtime handle.
//!
//! A [`Runtime`] is one node's view of the cluster: its address space, the
//! process-wide registries (reduction operators, interned constraints, the
//! collectable table that owns every live manager), the region forest, the
//! memory managers, and the transport seam. There are no hidden singletons;
//! every component that needs runtime services takes the handle as an
//! argument.
//!
//! Incoming messages enter through [`Runtime::process_message`], which
//! implements the receive side of the distribution protocol: reference
//! deltas, proxy revocations, constraint-set distribution, and manager
//! transfers (including the duplicate-registration drop).

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::config::RuntimeConfig;
use crate::error::{Error, ErrorKind, Result};
use crate::event::Event;
use crate::forest::RegionTreeForest;
use crate::layout::constraint::ConstraintRegistry;
use crate::manager::PhysicalManager;
use crate::memory::MemoryManager;
use crate::reduction::ReductionOpTable;
use crate::types::{AddressSpace, DistributedId, MemoryId};
use crate::wire::Message;

/// The cross-node send seam.
///
/// The runtime guarantees it never calls `send` while holding any internal
/// lock. Implementations must deliver payloads from one sender to one target
/// in send order; the reference-counting protocol depends on per-pair FIFO.
pub trait Transport: Send + Sync {
    /// Ships an encoded message from `from` to `target`.
    fn send(&self, from: AddressSpace, target: AddressSpace, payload: Vec<u8>);
}

/// Transport for single-node runtimes; any send is a configuration bug.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullTransport;

impl Transport for NullTransport {
    fn send(&self, from: AddressSpace, target: AddressSpace, _payload: Vec<u8>) {
        panic!("no transport configured: send from {from} to {target}");
    }
}

/// One node's runtime state.
pub struct Runtime {
    config: RuntimeConfig,
    address_space: AddressSpace,
    next_did: AtomicU64,
    next_event: AtomicU64,
    reduction_ops: ReductionOpTable,
    constraints: ConstraintRegistry,
    forest: Arc<RegionTreeForest>,
    memories: RwLock<BTreeMap<MemoryId, Arc<MemoryManager>>>,
    collectables: Mutex<BTreeMap<DistributedId, Arc<PhysicalManager>>>,
    transport: Arc<dyn Transport>,
}

impl Runtime {
    /// Creates a runtime with the given transport.
    #[must_use]
    pub fn new(config: RuntimeConfig, transport: Arc<dyn Transport>) -> Self {
        let address_space = AddressSpace(config.address_space);
        Self {
            config,
            address_space,
            next_did: AtomicU64::new(1),
            next_event: AtomicU64::new(1),
            reduction_ops: ReductionOpTable::new(),
            constraints: ConstraintRegistry::new(),
            forest: Arc::new(RegionTreeForest::new()),
            memories: RwLock::new(BTreeMap::new()),
            collectables: Mutex::new(BTreeMap::new()),
            transport,
        }
    }

    /// Creates a runtime that never sends; for single-node use.
    #[must_use]
    pub fn single_node(config: RuntimeConfig) -> Self {
        Self::new(config, Arc::new(NullTransport))
    }

    /// The local node.
    #[must_use]
    pub const fn address_space(&self) -> AddressSpace {
        self.address_space
    }

    /// The configuration this runtime was built from.
    #[must_use]
    pub const fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// The region forest.
    #[must_use]
    pub const fn forest(&self) -> &Arc<RegionTreeForest> {
        &self.forest
    }

    /// The constraint registry.
    #[must_use]
    pub const fn constraints(&self) -> &ConstraintRegistry {
        &self.constraints
    }

    /// The reduction-op table.
    #[must_use]
    pub const fn reduction_ops(&self) -> &ReductionOpTable {
        &self.reduction_ops
    }

    /// Mints a distributed id owned by this node.
    #[must_use]
    pub fn next_distributed_id(&self) -> DistributedId {
        let sequence = self.next_did.fetch_add(1, Ordering::Relaxed);
        DistributedId::new(sequence, self.address_space)
    }

    /// Mints a fresh event token, unique across the cluster.
    #[must_use]
    pub fn new_event(&self) -> Event {
        let sequence = self.next_event.fetch_add(1, Ordering::Relaxed);
        Event((u64::from(self.address_space.0) << 48) | sequence)
    }

    // -- memories ----------------------------------------------------------

    /// Creates the memory manager for `memory`.
    ///
    /// # Panics
    ///
    /// Panics if the memory already exists; the machine model is fixed at
    /// startup.
    pub fn create_memory(&self, memory: MemoryId, capacity: usize) -> Arc<MemoryManager> {
        let manager = Arc::new(MemoryManager::new(memory, capacity));
        let previous = self.memories.write().insert(memory, Arc::clone(&manager));
        assert!(previous.is_none(), "memory {memory} created twice");
        manager
    }

    /// Creates a memory with the configured default capacity.
    pub fn create_default_memory(&self, memory: MemoryId) -> Arc<MemoryManager> {
        self.create_memory(memory, self.config.default_memory_capacity)
    }

    /// Looks up the memory manager for `memory`.
    pub fn find_memory_manager(&self, memory: MemoryId) -> Result<Arc<MemoryManager>> {
        self.memories
            .read()
            .get(&memory)
            .cloned()
            .ok_or_else(|| Error::new(ErrorKind::UnknownMemory).with_context(format!("{memory}")))
    }

    // -- collectables ------------------------------------------------------

    /// Enters a manager into the owning table.
    pub fn register_collectable(&self, manager: &Arc<PhysicalManager>) {
        let previous = self
            .collectables
            .lock()
            .insert(manager.did(), Arc::clone(manager));
        assert!(
            previous.is_none(),
            "collectable {} registered twice",
            manager.did()
        );
    }

    /// Looks up a live manager by id.
    pub fn find_collectable(&self, did: DistributedId) -> Result<Arc<PhysicalManager>> {
        self.collectables
            .lock()
            .get(&did)
            .cloned()
            .ok_or_else(|| Error::new(ErrorKind::UnknownCollectable).with_context(format!("{did}")))
    }

    /// Removes a manager from the owning table.
    pub fn remove_collectable(&self, did: DistributedId) {
        self.collectables.lock().remove(&did);
    }

    /// Number of live collectables; diagnostic.
    #[must_use]
    pub fn collectable_count(&self) -> usize {
        self.collectables.lock().len()
    }

    /// Warns about owner-side managers whose allocations are still live.
    ///
    /// Returns the number of leaks found. Run at shutdown; a nonzero count
    /// indicates an upstream reference-counting bug, and the allocations are
    /// reclaimed by process exit.
    pub fn check_leaks(&self) -> usize {
        if !self.config.leak_check {
            return 0;
        }
        let managers: Vec<_> = self.collectables.lock().values().cloned().collect();
        let mut leaks = 0;
        for manager in managers {
            if manager.is_owner()
                && manager.instance().exists()
                && manager.memory().instance_exists(manager.instance().id)
            {
                warn!(
                    manager = %manager.did(),
                    instance = %manager.instance().id,
                    memory = %manager.memory().memory(),
                    "leaking physical instance"
                );
                leaks += 1;
            }
        }
        leaks
    }

    // -- messaging ---------------------------------------------------------

    /// Encodes and ships a message to `target`.
    pub fn send_message(&self, target: AddressSpace, message: &Message) {
        debug_assert_ne!(target, self.address_space, "message addressed to self");
        self.transport.send(self.address_space, target, message.encode());
    }

    /// Decodes and dispatches a message received from `source`.
    pub fn process_message(&self, source: AddressSpace, payload: &[u8]) -> Result<()> {
        let message = Message::decode(payload)?;
        match message {
            Message::GcUpdate { did, update } => {
                let manager = self.find_collectable(did)?;
                manager.handle_gc_update(self, update);
                Ok(())
            }
            Message::RemoveRemoteDid { did } => {
                // The proxy may already be gone locally; revocation races
                // with local teardown and both endings are quiescent.
                match self.find_collectable(did) {
                    Ok(manager) => manager.handle_remove_remote_did(self),
                    Err(_) => debug!(%did, "remote-did revocation for unknown proxy"),
                }
                Ok(())
            }
            Message::Constraints { id, set } => {
                self.constraints.record_remote(id, set);
                Ok(())
            }
            Message::InstanceManager {
                did,
                owner_space,
                memory,
                instance,
                instance_domain,
                region,
                use_event,
                flags,
                layout,
            } => PhysicalManager::handle_send_instance_manager(
                self,
                source,
                did,
                owner_space,
                memory,
                instance,
                instance_domain,
                region,
                use_event,
                flags,
                &layout,
            ),
            Message::ReductionManager {
                did,
                owner_space,
                memory,
                instance,
                instance_domain,
                region,
                redop,
                logical_field,
                foldable,
                ptr_space,
                use_event,
            } => PhysicalManager::handle_send_reduction_manager(
                self,
                source,
                did,
                owner_space,
                memory,
                instance,
                instance_domain,
                region,
                redop,
                logical_field,
                foldable,
                ptr_space,
                use_event,
            ),
        }
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("address_space", &self.address_space)
            .field("collectables", &self.collectable_count())
            .finish_non_exhaustive()
    }
}
