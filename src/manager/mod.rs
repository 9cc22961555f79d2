//! Physical managers: the per-allocation control objects.
//!
//! A [`PhysicalManager`] is the distributed, reference-counted handle to one
//! backing allocation. The shared header carries the identity (distributed
//! id, owner and local node, memory, region, domain); the [`ManagerKind`]
//! sum carries the flavor-specific payload — a layout for normal instances,
//! a reduction binding for fold and list instances.
//!
//! # Ownership
//!
//! The node encoded in the distributed id owns the manager; every other node
//! holding it has a proxy. Proxies forward their aggregate 0→1 / →0
//! reference edges to the owner and are pinned by a remote-did reference the
//! owner revokes at destruction time. The owner destroys the manager — and
//! the allocation, conditioned on the caller's deferred event — the first
//! time both counters return to zero after having been positive.
//!
//! All counter transitions, the top-view registry, and the remote-instance
//! set are serialized under one per-manager lock. Nothing is sent and no
//! other component is called while that lock is held.

pub mod builder;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::Result;
use crate::event::Event;
use crate::forest::{LogicalRegion, RegionNode, RegionTreeForest};
use crate::gc::{GcUpdate, LifecycleState, RefCounts, ReferenceKind};
use crate::layout::description::{CopySrcDstField, LayoutDescription, LayoutPayload};
use crate::memory::{InstanceFlags, MemoryManager, PhysicalInstance, POINTER_SIZE};
use crate::reduction::ReductionOp;
use crate::runtime::Runtime;
use crate::types::{
    AddressSpace, ContextUid, DistributedId, Domain, FieldId, FieldMask, GcPriority, MapperId,
    ProcessorId, ReductionOpId, SerdezId, ViewId,
};
use crate::wire::Message;

// ---------------------------------------------------------------------------
// ManagerKind
// ---------------------------------------------------------------------------

/// Flavor-specific payload of a physical manager.
pub enum ManagerKind {
    /// An ordinary field-major instance.
    Instance {
        /// The packing plan shared with equal-shaped instances.
        layout: Arc<LayoutDescription>,
        /// Ready event of the backing allocation.
        use_event: Event,
        /// Attachment flags; unknown bits ride along.
        flags: InstanceFlags,
    },
    /// A fold-reduction buffer: one rhs slot per point, folded in place.
    FoldReduction {
        /// The bound reduction operator id.
        redop: ReductionOpId,
        /// The operator vtable.
        op: Arc<dyn ReductionOp>,
        /// The single logical field being reduced.
        logical_field: FieldId,
        /// Ready event of the backing allocation.
        use_event: Event,
    },
    /// A list-reduction buffer of appended `(pointer, rhs)` records.
    ListReduction {
        /// The bound reduction operator id.
        redop: ReductionOpId,
        /// The operator vtable.
        op: Arc<dyn ReductionOp>,
        /// The single logical field being reduced.
        logical_field: FieldId,
        /// The space of pointer slots.
        ptr_space: Domain,
    },
}

impl std::fmt::Debug for ManagerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Instance { flags, .. } => {
                f.debug_struct("Instance").field("flags", flags).finish_non_exhaustive()
            }
            Self::FoldReduction { redop, logical_field, .. } => f
                .debug_struct("FoldReduction")
                .field("redop", redop)
                .field("field", logical_field)
                .finish_non_exhaustive(),
            Self::ListReduction { redop, logical_field, .. } => f
                .debug_struct("ListReduction")
                .field("redop", redop)
                .field("field", logical_field)
                .finish_non_exhaustive(),
        }
    }
}

// ---------------------------------------------------------------------------
// PhysicalManager
// ---------------------------------------------------------------------------

struct GcState {
    counts: RefCounts,
    top_views: BTreeMap<ContextUid, ViewId>,
    /// Peers holding a proxy; populated only on the owner.
    remote_instances: BTreeSet<AddressSpace>,
    /// Pin held by proxies until the owner revokes it.
    remote_did_ref: bool,
    deletion_performed: bool,
}

/// Construction arguments for [`PhysicalManager::create`].
pub struct ManagerArgs {
    /// Globally unique id; its low bits name the owner.
    pub did: DistributedId,
    /// The owning node.
    pub owner_space: AddressSpace,
    /// The memory holding the allocation.
    pub memory: Arc<MemoryManager>,
    /// The region this manager was created for.
    pub region_node: Arc<RegionNode>,
    /// The backing allocation.
    pub instance: PhysicalInstance,
    /// The index domain the allocation covers.
    pub instance_domain: Domain,
    /// True when the domain was synthesized by the builder.
    pub owns_domain: bool,
    /// Flavor payload.
    pub kind: ManagerKind,
    /// Register with the region node and runtime immediately.
    pub register_now: bool,
}

/// The distributed reference-counted handle to one allocation.
pub struct PhysicalManager {
    did: DistributedId,
    owner_space: AddressSpace,
    local_space: AddressSpace,
    memory: Arc<MemoryManager>,
    region_node: Arc<RegionNode>,
    instance: PhysicalInstance,
    instance_domain: Domain,
    owns_domain: bool,
    kind: ManagerKind,
    gc: Mutex<GcState>,
}

impl PhysicalManager {
    /// Creates a manager and wires it into the local tables.
    ///
    /// With `register_now`, the manager registers with its region node and
    /// the runtime's collectable table before returning; receive paths pass
    /// false and register only after winning the region-node race. Proxies
    /// additionally register with their memory manager and start pinned by
    /// the remote-did reference.
    pub fn create(rt: &Runtime, args: ManagerArgs) -> Arc<Self> {
        let local_space = rt.address_space();
        let is_owner = args.owner_space == local_space;
        let manager = Arc::new(Self {
            did: args.did,
            owner_space: args.owner_space,
            local_space,
            memory: args.memory,
            region_node: args.region_node,
            instance: args.instance,
            instance_domain: args.instance_domain,
            owns_domain: args.owns_domain,
            kind: args.kind,
            gc: Mutex::new(GcState {
                counts: RefCounts::new(),
                top_views: BTreeMap::new(),
                remote_instances: BTreeSet::new(),
                remote_did_ref: !is_owner,
                deletion_performed: false,
            }),
        });
        if !is_owner {
            manager.memory.register_remote_instance(manager.did);
        }
        if args.register_now {
            let registered = manager.region_node.register_physical_manager(&manager);
            assert!(registered, "fresh manager {} already registered", manager.did);
            rt.register_collectable(&manager);
        }
        manager
    }

    // -- identity ----------------------------------------------------------

    /// The distributed id.
    #[must_use]
    pub const fn did(&self) -> DistributedId {
        self.did
    }

    /// The owning node.
    #[must_use]
    pub const fn owner_space(&self) -> AddressSpace {
        self.owner_space
    }

    /// The local node.
    #[must_use]
    pub const fn local_space(&self) -> AddressSpace {
        self.local_space
    }

    /// True on the owning node.
    #[must_use]
    pub fn is_owner(&self) -> bool {
        self.owner_space == self.local_space
    }

    /// The memory manager of the backing memory.
    #[must_use]
    pub const fn memory(&self) -> &Arc<MemoryManager> {
        &self.memory
    }

    /// The region this manager was created for.
    #[must_use]
    pub const fn region_node(&self) -> &Arc<RegionNode> {
        &self.region_node
    }

    /// The backing allocation handle.
    #[must_use]
    pub const fn instance(&self) -> PhysicalInstance {
        self.instance
    }

    /// The index domain the allocation covers.
    #[must_use]
    pub const fn instance_domain(&self) -> &Domain {
        &self.instance_domain
    }

    /// True when the builder synthesized (and the manager owns) the domain.
    #[must_use]
    pub const fn owns_domain(&self) -> bool {
        self.owns_domain
    }

    /// The flavor payload.
    #[must_use]
    pub const fn kind(&self) -> &ManagerKind {
        &self.kind
    }

    /// True for normal (non-reduction) managers.
    #[must_use]
    pub const fn is_instance_manager(&self) -> bool {
        matches!(self.kind, ManagerKind::Instance { .. })
    }

    /// True for either reduction flavor.
    #[must_use]
    pub const fn is_reduction_manager(&self) -> bool {
        matches!(
            self.kind,
            ManagerKind::FoldReduction { .. } | ManagerKind::ListReduction { .. }
        )
    }

    /// True for fold-reduction managers.
    #[must_use]
    pub const fn is_foldable(&self) -> bool {
        matches!(self.kind, ManagerKind::FoldReduction { .. })
    }

    /// The layout, for normal managers.
    #[must_use]
    pub const fn layout(&self) -> Option<&Arc<LayoutDescription>> {
        match &self.kind {
            ManagerKind::Instance { layout, .. } => Some(layout),
            _ => None,
        }
    }

    /// The allocation's ready event; list buffers are ready at creation.
    #[must_use]
    pub const fn use_event(&self) -> Event {
        match &self.kind {
            ManagerKind::Instance { use_event, .. }
            | ManagerKind::FoldReduction { use_event, .. } => *use_event,
            ManagerKind::ListReduction { .. } => Event::NONE,
        }
    }

    /// The pointer space, for list-reduction managers.
    #[must_use]
    pub const fn pointer_space(&self) -> Option<&Domain> {
        match &self.kind {
            ManagerKind::ListReduction { ptr_space, .. } => Some(ptr_space),
            _ => None,
        }
    }

    /// The bound reduction operator, for reduction managers.
    #[must_use]
    pub const fn reduction_op_id(&self) -> Option<ReductionOpId> {
        match &self.kind {
            ManagerKind::FoldReduction { redop, .. }
            | ManagerKind::ListReduction { redop, .. } => Some(*redop),
            ManagerKind::Instance { .. } => None,
        }
    }

    /// The reduced logical field, for reduction managers.
    #[must_use]
    pub const fn logical_field(&self) -> Option<FieldId> {
        match &self.kind {
            ManagerKind::FoldReduction { logical_field, .. }
            | ManagerKind::ListReduction { logical_field, .. } => Some(*logical_field),
            ManagerKind::Instance { .. } => None,
        }
    }

    /// True when the allocation is an attached external file.
    #[must_use]
    pub const fn is_attached_file(&self) -> bool {
        match &self.kind {
            ManagerKind::Instance { flags, .. } => flags.contains(InstanceFlags::ATTACH_FILE),
            _ => false,
        }
    }

    /// Size in bytes the backing allocation must cover.
    #[must_use]
    pub fn instance_size(&self) -> usize {
        match &self.kind {
            ManagerKind::Instance { layout, .. } => {
                layout.total_field_size() * self.instance_domain.volume()
            }
            ManagerKind::FoldReduction { op, .. } => {
                op.sizeof_rhs() * self.instance_domain.volume()
            }
            ManagerKind::ListReduction { op, ptr_space, .. } => {
                (POINTER_SIZE + op.sizeof_rhs()) * ptr_space.volume()
            }
        }
    }

    // -- lifecycle ---------------------------------------------------------

    /// Snapshot of the reference counters.
    #[must_use]
    pub fn ref_counts(&self) -> RefCounts {
        self.gc.lock().counts
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn lifecycle_state(&self) -> LifecycleState {
        self.gc.lock().counts.state()
    }

    /// Adds resource references.
    ///
    /// The 0→1 edge activates the instance with the memory manager and, on a
    /// proxy, forwards one unit to the owner.
    pub fn add_resource_refs(&self, rt: &Runtime, count: u32) {
        let transition = {
            let mut gc = self.gc.lock();
            gc.counts
                .add_resource(count)
                .unwrap_or_else(|violation| panic!("{violation} on manager {}", self.did))
        };
        if transition == crate::gc::ResourceTransition::Activated {
            self.memory.activate_instance(self.did);
            if !self.is_owner() {
                self.send_gc_update(rt, ReferenceKind::Resource, true);
            }
        }
    }

    /// Removes resource references.
    ///
    /// The →0 edge deactivates the instance; on the owner it also destroys
    /// the manager, deleting the allocation conditioned on `deferred`
    /// (typically the join of all outstanding uses). On a proxy it forwards
    /// the removal of this node's unit to the owner.
    pub fn remove_resource_refs(self: &Arc<Self>, rt: &Runtime, count: u32, deferred: Event) {
        let transition = {
            let mut gc = self.gc.lock();
            gc.counts
                .remove_resource(count)
                .unwrap_or_else(|violation| panic!("{violation} on manager {}", self.did))
        };
        if transition == crate::gc::ResourceTransition::Deactivated {
            self.memory.deactivate_instance(self.did);
            if self.is_owner() {
                self.collect(rt, deferred);
            } else {
                self.send_gc_update(rt, ReferenceKind::Resource, false);
            }
        }
    }

    /// Adds valid references; the 0→1 edge validates with the memory manager.
    pub fn add_valid_refs(&self, rt: &Runtime, count: u32) {
        let transition = {
            let mut gc = self.gc.lock();
            gc.counts
                .add_valid(count)
                .unwrap_or_else(|violation| panic!("{violation} on manager {}", self.did))
        };
        if transition == crate::gc::ValidTransition::Validated {
            self.memory.validate_instance(self.did);
            if !self.is_owner() {
                self.send_gc_update(rt, ReferenceKind::Valid, true);
            }
        }
    }

    /// Removes valid references; the →0 edge invalidates.
    pub fn remove_valid_refs(&self, rt: &Runtime, count: u32) {
        let transition = {
            let mut gc = self.gc.lock();
            gc.counts
                .remove_valid(count)
                .unwrap_or_else(|violation| panic!("{violation} on manager {}", self.did))
        };
        if transition == crate::gc::ValidTransition::Invalidated {
            self.memory.invalidate_instance(self.did);
            if !self.is_owner() {
                self.send_gc_update(rt, ReferenceKind::Valid, false);
            }
        }
    }

    /// Applies a reference delta received from a proxy.
    pub fn handle_gc_update(self: &Arc<Self>, rt: &Runtime, update: GcUpdate) {
        match (update.kind, update.add) {
            (ReferenceKind::Resource, true) => self.add_resource_refs(rt, update.count),
            (ReferenceKind::Resource, false) => {
                self.remove_resource_refs(rt, update.count, Event::NONE);
            }
            (ReferenceKind::Valid, true) => self.add_valid_refs(rt, update.count),
            (ReferenceKind::Valid, false) => self.remove_valid_refs(rt, update.count),
        }
    }

    fn send_gc_update(&self, rt: &Runtime, kind: ReferenceKind, add: bool) {
        rt.send_message(
            self.owner_space,
            &Message::GcUpdate {
                did: self.did,
                update: GcUpdate { kind, add, count: 1 },
            },
        );
    }

    /// Owner-side destruction: revoke proxies, delete the allocation, and
    /// unwire from every local table. Idempotent.
    fn collect(self: &Arc<Self>, rt: &Runtime, deferred: Event) {
        debug_assert!(self.is_owner());
        let targets = {
            let mut gc = self.gc.lock();
            if gc.counts.is_destroyed() {
                return;
            }
            gc.counts.mark_destroyed();
            std::mem::take(&mut gc.remote_instances)
        };
        for target in targets {
            rt.send_message(target, &Message::RemoveRemoteDid { did: self.did });
        }
        if self.instance.exists() {
            self.perform_deletion(deferred);
        }
        if self.owns_domain {
            debug!(manager = %self.did, "dropping synthesized instance domain");
        }
        self.region_node.unregister_physical_manager(self.did);
        self.memory.retire_instance(self.did);
        rt.remove_collectable(self.did);
    }

    /// Proxy-side teardown when the owner revokes the remote-did reference.
    pub fn handle_remove_remote_did(&self, rt: &Runtime) {
        debug_assert!(!self.is_owner());
        {
            let mut gc = self.gc.lock();
            if !gc.remote_did_ref {
                return;
            }
            gc.remote_did_ref = false;
            if gc.counts.resource() > 0 || gc.counts.valid() > 0 {
                warn!(
                    manager = %self.did,
                    "owner revoked a proxy that still holds references"
                );
            }
            gc.counts.mark_destroyed();
        }
        self.region_node.unregister_physical_manager(self.did);
        self.memory.unregister_remote_instance(self.did);
        rt.remove_collectable(self.did);
    }

    /// Deletes the backing allocation, conditioned on `deferred`.
    ///
    /// Owner-only; repeated calls are no-ops after the first.
    ///
    /// # Panics
    ///
    /// Panics when called on a proxy.
    pub fn perform_deletion(&self, deferred: Event) {
        assert!(
            self.is_owner(),
            "perform_deletion on remote proxy {}",
            self.did
        );
        {
            let mut gc = self.gc.lock();
            if gc.deletion_performed {
                return;
            }
            gc.deletion_performed = true;
        }
        self.memory.destroy_instance(self.instance, deferred);
    }

    /// Routes a mapper's eviction hint to the memory manager.
    pub fn set_garbage_collection_priority(
        &self,
        mapper: MapperId,
        processor: ProcessorId,
        priority: GcPriority,
    ) {
        self.memory
            .set_garbage_collection_priority(self.did, mapper, processor, priority);
    }

    // -- top views ---------------------------------------------------------

    /// Registers the top view of a context.
    ///
    /// # Panics
    ///
    /// Panics if the context already has a top view on this manager.
    pub fn register_logical_top_view(&self, context: ContextUid, view: ViewId) {
        let mut gc = self.gc.lock();
        let previous = gc.top_views.insert(context, view);
        assert!(
            previous.is_none(),
            "duplicate top view for context {context} on manager {}",
            self.did
        );
    }

    /// Unregisters a top view by identity.
    ///
    /// # Panics
    ///
    /// Panics if the view is not registered; unbalanced unregistration is a
    /// view-layer bug.
    pub fn unregister_logical_top_view(&self, view: ViewId) {
        let mut gc = self.gc.lock();
        let context = gc
            .top_views
            .iter()
            .find_map(|(context, &candidate)| (candidate == view).then_some(*context));
        match context {
            Some(context) => {
                gc.top_views.remove(&context);
            }
            None => panic!("unregistering unknown top view {view} on manager {}", self.did),
        }
    }

    /// Looks up the top view of a context.
    #[must_use]
    pub fn find_logical_top_view(&self, context: ContextUid) -> Option<ViewId> {
        self.gc.lock().top_views.get(&context).copied()
    }

    // -- queries -----------------------------------------------------------

    /// True iff every region shares this manager's tree and is covered by
    /// the instance domain.
    ///
    /// Dominance is checked per dimensionality with explicit arms; a region
    /// whose domain has a different dimensionality is never met.
    #[must_use]
    pub fn meets_regions(&self, forest: &RegionTreeForest, regions: &[LogicalRegion]) -> bool {
        for region in regions {
            if region.tree_id != self.region_node.handle().tree_id {
                return false;
            }
            let node = forest
                .get_node(*region)
                .expect("region handle not present in the forest");
            if Arc::ptr_eq(&node, &self.region_node) {
                continue;
            }
            if !self.instance_domain.dominates(node.row_source().domain()) {
                return false;
            }
        }
        true
    }

    // -- copies ------------------------------------------------------------

    /// Appends copy descriptors for the allocated fields in `copy_mask`.
    ///
    /// # Panics
    ///
    /// Panics on reduction managers; reductions use
    /// [`Self::find_field_offsets`].
    pub fn compute_copy_offsets(&self, copy_mask: &FieldMask, fields: &mut Vec<CopySrcDstField>) {
        match &self.kind {
            ManagerKind::Instance { layout, .. } => {
                layout.compute_copy_offsets(copy_mask, self.instance, fields);
            }
            _ => panic!("copy offsets requested from reduction manager {}", self.did),
        }
    }

    /// Appends the copy descriptor for one field.
    ///
    /// # Panics
    ///
    /// Panics on reduction managers or unknown fields.
    pub fn compute_copy_offsets_for_field(
        &self,
        field: FieldId,
        fields: &mut Vec<CopySrcDstField>,
    ) {
        match &self.kind {
            ManagerKind::Instance { layout, .. } => {
                layout.compute_copy_offsets_for_field(field, self.instance, fields);
            }
            _ => panic!("copy offsets requested from reduction manager {}", self.did),
        }
    }

    /// Appends copy descriptors for the given fields in caller order.
    ///
    /// # Panics
    ///
    /// Panics on reduction managers or unknown fields.
    pub fn compute_copy_offsets_for_fields(
        &self,
        copy_fields: &[FieldId],
        fields: &mut Vec<CopySrcDstField>,
    ) {
        match &self.kind {
            ManagerKind::Instance { layout, .. } => {
                layout.compute_copy_offsets_for_fields(copy_fields, self.instance, fields);
            }
            _ => panic!("copy offsets requested from reduction manager {}", self.did),
        }
    }

    /// Appends the reduction buffer descriptor.
    ///
    /// The mask is accepted for interface symmetry but ignored: reduction
    /// buffers currently cover exactly their one logical field.
    ///
    /// # Panics
    ///
    /// Panics on normal instance managers.
    pub fn find_field_offsets(&self, _reduce_mask: &FieldMask, fields: &mut Vec<CopySrcDstField>) {
        assert!(self.instance.exists(), "reduction manager {} has no instance", self.did);
        match &self.kind {
            ManagerKind::FoldReduction { op, logical_field, .. } => {
                fields.push(CopySrcDstField {
                    instance: self.instance,
                    field_id: *logical_field,
                    offset: 0,
                    size: op.sizeof_rhs(),
                    serdez_id: SerdezId(0),
                });
            }
            ManagerKind::ListReduction { op, logical_field, .. } => {
                fields.push(CopySrcDstField {
                    instance: self.instance,
                    field_id: *logical_field,
                    offset: POINTER_SIZE,
                    size: op.sizeof_rhs(),
                    serdez_id: SerdezId(0),
                });
            }
            ManagerKind::Instance { .. } => {
                panic!("field offsets requested from instance manager {}", self.did)
            }
        }
    }

    /// Schedules a reduction from `src_fields` into `dst_fields` over
    /// `space`, returning the completion event.
    ///
    /// Fold buffers reduce densely whether or not the request is precise.
    /// List buffers require `precise` and key an indirect copy on their
    /// pointer slot.
    ///
    /// # Panics
    ///
    /// Panics on normal instance managers, and with an unimplemented
    /// diagnostic for non-precise list reductions.
    #[allow(clippy::too_many_arguments)]
    pub fn issue_reduction(
        &self,
        rt: &Runtime,
        forest: &RegionTreeForest,
        src_fields: Vec<CopySrcDstField>,
        dst_fields: Vec<CopySrcDstField>,
        space: Domain,
        precondition: Event,
        fold: bool,
        precise: bool,
    ) -> Event {
        assert!(self.instance.exists(), "reduction manager {} has no instance", self.did);
        match &self.kind {
            ManagerKind::FoldReduction { redop, .. } => forest.issue_reduction_copy(
                rt,
                space,
                *redop,
                fold,
                src_fields,
                dst_fields,
                precondition,
            ),
            ManagerKind::ListReduction { redop, logical_field, .. } => {
                assert!(
                    precise,
                    "unimplemented: non-precise list reduction on manager {}",
                    self.did
                );
                let index = CopySrcDstField {
                    instance: self.instance,
                    field_id: *logical_field,
                    offset: 0,
                    size: POINTER_SIZE,
                    serdez_id: SerdezId(0),
                };
                forest.issue_indirect_copy(
                    rt,
                    space,
                    index,
                    *redop,
                    fold,
                    src_fields,
                    dst_fields,
                    precondition,
                )
            }
            ManagerKind::Instance { .. } => {
                panic!("reduction issued on instance manager {}", self.did)
            }
        }
    }

    // -- distribution ------------------------------------------------------

    /// True if `target` already holds a proxy.
    #[must_use]
    pub fn has_remote_instance(&self, target: AddressSpace) -> bool {
        self.gc.lock().remote_instances.contains(&target)
    }

    /// Sends this manager to `target` unless it already holds a proxy.
    ///
    /// Instance managers ship their constraint set on first contact and
    /// record the layout as known to the target only after the transfer
    /// message is on the wire. Returns the distributed id either way.
    pub fn send_manager(&self, rt: &Runtime, target: AddressSpace) -> DistributedId {
        debug_assert!(self.is_owner(), "only the owner distributes manager {}", self.did);
        if self.has_remote_instance(target) {
            return self.did;
        }
        debug!(manager = %self.did, %target, "sending manager");
        match &self.kind {
            ManagerKind::Instance { layout, use_event, flags } => {
                let constraints = layout.constraints();
                if constraints.record_send(target) {
                    rt.send_message(
                        target,
                        &Message::Constraints {
                            id: constraints.id(),
                            set: constraints.set().clone(),
                        },
                    );
                }
                rt.send_message(
                    target,
                    &Message::InstanceManager {
                        did: self.did,
                        owner_space: self.owner_space,
                        memory: self.memory.memory(),
                        instance: self.instance,
                        instance_domain: self.instance_domain.clone(),
                        region: self.region_node.handle(),
                        use_event: *use_event,
                        flags: *flags,
                        layout: layout.pack(target),
                    },
                );
                self.gc.lock().remote_instances.insert(target);
                layout.update_known_nodes(target);
            }
            ManagerKind::FoldReduction { redop, logical_field, use_event, .. } => {
                rt.send_message(
                    target,
                    &Message::ReductionManager {
                        did: self.did,
                        owner_space: self.owner_space,
                        memory: self.memory.memory(),
                        instance: self.instance,
                        instance_domain: self.instance_domain.clone(),
                        region: self.region_node.handle(),
                        redop: *redop,
                        logical_field: *logical_field,
                        foldable: true,
                        ptr_space: None,
                        use_event: *use_event,
                    },
                );
                self.gc.lock().remote_instances.insert(target);
            }
            ManagerKind::ListReduction { redop, logical_field, ptr_space, .. } => {
                rt.send_message(
                    target,
                    &Message::ReductionManager {
                        did: self.did,
                        owner_space: self.owner_space,
                        memory: self.memory.memory(),
                        instance: self.instance,
                        instance_domain: self.instance_domain.clone(),
                        region: self.region_node.handle(),
                        redop: *redop,
                        logical_field: *logical_field,
                        foldable: false,
                        ptr_space: Some(ptr_space.clone()),
                        use_event: Event::NONE,
                    },
                );
                self.gc.lock().remote_instances.insert(target);
            }
        }
        self.did
    }

    /// Receive path for an instance-manager transfer.
    #[allow(clippy::too_many_arguments)]
    pub fn handle_send_instance_manager(
        rt: &Runtime,
        source: AddressSpace,
        did: DistributedId,
        owner_space: AddressSpace,
        memory: crate::types::MemoryId,
        instance: PhysicalInstance,
        instance_domain: Domain,
        region: LogicalRegion,
        use_event: Event,
        flags: InstanceFlags,
        layout: &LayoutPayload,
    ) -> Result<()> {
        let region_node = rt.forest().get_node(region)?;
        let layout =
            LayoutDescription::handle_unpack(layout, source, &region_node, rt.constraints())?;
        let memory = rt.find_memory_manager(memory)?;
        let manager = Self::create(
            rt,
            ManagerArgs {
                did,
                owner_space,
                memory,
                region_node: Arc::clone(&region_node),
                instance,
                instance_domain,
                owns_domain: false,
                kind: ManagerKind::Instance { layout, use_event, flags },
                register_now: false,
            },
        );
        Self::finish_remote_registration(rt, &region_node, manager);
        Ok(())
    }

    /// Receive path for a reduction-manager transfer.
    #[allow(clippy::too_many_arguments)]
    pub fn handle_send_reduction_manager(
        rt: &Runtime,
        _source: AddressSpace,
        did: DistributedId,
        owner_space: AddressSpace,
        memory: crate::types::MemoryId,
        instance: PhysicalInstance,
        instance_domain: Domain,
        region: LogicalRegion,
        redop: ReductionOpId,
        logical_field: FieldId,
        foldable: bool,
        ptr_space: Option<Domain>,
        use_event: Event,
    ) -> Result<()> {
        let region_node = rt.forest().get_node(region)?;
        let op = rt.reduction_ops().find(redop)?;
        let memory = rt.find_memory_manager(memory)?;
        let kind = if foldable {
            ManagerKind::FoldReduction { redop, op, logical_field, use_event }
        } else {
            let ptr_space = ptr_space.ok_or_else(|| {
                crate::error::Error::new(crate::error::ErrorKind::Wire)
                    .with_context("list reduction manager without pointer space")
            })?;
            ManagerKind::ListReduction { redop, op, logical_field, ptr_space }
        };
        let manager = Self::create(
            rt,
            ManagerArgs {
                did,
                owner_space,
                memory,
                region_node: Arc::clone(&region_node),
                instance,
                instance_domain,
                owns_domain: false,
                kind,
                register_now: false,
            },
        );
        Self::finish_remote_registration(rt, &region_node, manager);
        Ok(())
    }

    /// Registers a received proxy, or drops the tentative copy when a
    /// concurrent transfer already registered an equivalent one.
    fn finish_remote_registration(
        rt: &Runtime,
        region_node: &Arc<RegionNode>,
        manager: Arc<Self>,
    ) {
        if region_node.register_physical_manager(&manager) {
            rt.register_collectable(&manager);
        } else {
            debug!(manager = %manager.did, "dropping tentative duplicate proxy");
            manager.memory.unregister_remote_instance(manager.did);
        }
    }
}

impl std::fmt::Debug for PhysicalManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PhysicalManager")
            .field("did", &self.did)
            .field("owner", &self.owner_space)
            .field("kind", &self.kind)
            .field("instance", &self.instance)
            .finish_non_exhaustive()
    }
}
