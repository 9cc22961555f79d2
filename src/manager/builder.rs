//! The instance builder: regions + constraints → a live manager.
//!
//! A builder is transient. It resolves the requested regions into a covering
//! domain and common ancestor, pulls field layout data from the ancestor's
//! field space, reserves bytes in the target memory, and constructs the
//! manager flavor the constraint set's specialization asks for. Allocation
//! failure is the one recoverable outcome: the builder hands back `None` and
//! the caller tries another memory or evicts.

use std::sync::Arc;

use tracing::debug;

use crate::forest::{LogicalRegion, RegionNode, RegionTreeForest};
use crate::layout::constraint::{FieldPlacement, LayoutConstraintSet, SpecializationKind};
use crate::manager::{ManagerArgs, ManagerKind, PhysicalManager};
use crate::memory::{MemoryManager, POINTER_SIZE};
use crate::reduction::ReductionOp;
use crate::runtime::Runtime;
use crate::types::{Domain, FieldId, FieldMask, Rect, ReductionOpId, SerdezId};

/// Builds one physical instance for a set of regions under a constraint set.
pub struct InstanceBuilder {
    regions: Vec<LogicalRegion>,
    constraints: LayoutConstraintSet,
    memory: Arc<MemoryManager>,
    // Derived by initialize().
    ancestor: Option<Arc<RegionNode>>,
    instance_domain: Option<Domain>,
    owns_domain: bool,
    field_sizes: Vec<(FieldId, usize)>,
    mask_index_map: Vec<usize>,
    serdez: Vec<SerdezId>,
    instance_mask: FieldMask,
    block_size: usize,
    redop_id: ReductionOpId,
    reduction_op: Option<Arc<dyn ReductionOp>>,
    valid: bool,
}

impl InstanceBuilder {
    /// Creates a builder for the given request.
    ///
    /// # Panics
    ///
    /// Panics if `regions` is empty.
    #[must_use]
    pub fn new(
        regions: Vec<LogicalRegion>,
        constraints: LayoutConstraintSet,
        memory: Arc<MemoryManager>,
    ) -> Self {
        assert!(!regions.is_empty(), "instance builder needs at least one region");
        Self {
            regions,
            constraints,
            memory,
            ancestor: None,
            instance_domain: None,
            owns_domain: false,
            field_sizes: Vec::new(),
            mask_index_map: Vec::new(),
            serdez: Vec::new(),
            instance_mask: FieldMask::new(),
            block_size: 0,
            redop_id: ReductionOpId(0),
            reduction_op: None,
            valid: false,
        }
    }

    /// Bytes the allocation will need, for mapper-side budgeting.
    pub fn compute_needed_size(&mut self, rt: &Runtime, forest: &RegionTreeForest) -> usize {
        if !self.valid {
            self.initialize(rt, forest);
        }
        self.needed_size()
    }

    fn needed_size(&self) -> usize {
        let domain_volume = self.instance_domain.as_ref().map_or(0, Domain::volume);
        match self.constraints.specialization {
            SpecializationKind::Normal => {
                let per_point: usize = self.field_sizes.iter().map(|(_, size)| size).sum();
                per_point * domain_volume
            }
            SpecializationKind::ReductionFold => {
                self.reduction_op().sizeof_rhs() * domain_volume
            }
            SpecializationKind::ReductionList => {
                // One pointer slot per point of the covering domain.
                (POINTER_SIZE + self.reduction_op().sizeof_rhs()) * domain_volume
            }
            SpecializationKind::Virtual => 0,
        }
    }

    fn reduction_op(&self) -> &Arc<dyn ReductionOp> {
        self.reduction_op
            .as_ref()
            .expect("reduction op resolved during initialization")
    }

    /// Resolves regions, reserves bytes, and constructs the manager.
    ///
    /// Returns `None` when the memory cannot hold the allocation.
    ///
    /// # Panics
    ///
    /// Panics on contract violations: a virtual specialization, a fold
    /// request with more than one field, a field axis in the interior of
    /// the dimension ordering, or regions with no common ancestor.
    pub fn create_physical_instance(
        &mut self,
        rt: &Runtime,
        forest: &RegionTreeForest,
    ) -> Option<Arc<PhysicalManager>> {
        if !self.valid {
            self.initialize(rt, forest);
        }
        let size = self.needed_size();
        let (instance, ready) = match self.memory.create_instance(size) {
            Some(allocation) => allocation,
            None => {
                debug!(
                    memory = %self.memory.memory(),
                    bytes = size,
                    "instance allocation failed"
                );
                return None;
            }
        };
        let ancestor = Arc::clone(self.ancestor.as_ref().expect("initialized"));
        let instance_domain = self.instance_domain.clone().expect("initialized");
        let did = rt.next_distributed_id();
        let kind = match self.constraints.specialization {
            SpecializationKind::Normal => {
                let field_space = ancestor.column_source();
                let entry = rt.constraints().intern(self.constraints.clone());
                let layout = match field_space.find_layout_description(self.instance_mask, &entry)
                {
                    Some(layout) => layout,
                    None => field_space.create_layout_description(
                        self.instance_mask,
                        entry,
                        &self.mask_index_map,
                        &self.serdez,
                        &self.field_sizes,
                    ),
                };
                ManagerKind::Instance {
                    layout,
                    use_event: ready,
                    flags: crate::memory::InstanceFlags::NONE,
                }
            }
            SpecializationKind::ReductionFold => {
                assert!(
                    self.field_sizes.len() == 1,
                    "fold reduction instance requires exactly one field, got {}",
                    self.field_sizes.len()
                );
                ManagerKind::FoldReduction {
                    redop: self.redop_id,
                    op: Arc::clone(self.reduction_op()),
                    logical_field: self.field_sizes[0].0,
                    use_event: ready,
                }
            }
            SpecializationKind::ReductionList => {
                assert!(
                    self.field_sizes.len() == 1,
                    "list reduction instance requires exactly one field, got {}",
                    self.field_sizes.len()
                );
                let slots = instance_domain.volume();
                let ptr_space =
                    Domain::Rect1(Rect::new([0], [slots as i64 - 1]));
                ManagerKind::ListReduction {
                    redop: self.redop_id,
                    op: Arc::clone(self.reduction_op()),
                    logical_field: self.field_sizes[0].0,
                    ptr_space,
                }
            }
            SpecializationKind::Virtual => unreachable!("rejected during initialization"),
        };
        let manager = PhysicalManager::create(
            rt,
            ManagerArgs {
                did,
                owner_space: rt.address_space(),
                memory: Arc::clone(&self.memory),
                region_node: ancestor,
                instance,
                instance_domain,
                owns_domain: self.owns_domain,
                kind,
                register_now: true,
            },
        );
        debug!(manager = %manager.did(), bytes = size, "created physical instance");
        Some(manager)
    }

    fn initialize(&mut self, rt: &Runtime, forest: &RegionTreeForest) {
        self.compute_ancestor_and_domain(forest);
        self.compute_layout_parameters(rt, forest);
        self.valid = true;
    }

    /// Resolves the covering domain and the common ancestor region.
    ///
    /// A single region keeps its own domain. Multiple regions combine into
    /// an element-mask union (unstructured) or a rectangle convex hull
    /// (structured); the synthesized domain belongs to the manager.
    fn compute_ancestor_and_domain(&mut self, forest: &RegionTreeForest) {
        let mut ancestor = forest
            .get_node(self.regions[0])
            .expect("building an instance for an unknown region");
        let mut domain = ancestor.row_source().domain().clone();
        if self.regions.len() > 1 {
            for handle in &self.regions[1..] {
                let next = forest
                    .get_node(*handle)
                    .expect("building an instance for an unknown region");
                domain = domain.covering_union(next.row_source().domain());
                ancestor = Self::find_common_ancestor(&ancestor, &next);
            }
            self.owns_domain = true;
        }
        self.ancestor = Some(ancestor);
        self.instance_domain = Some(domain);
    }

    /// Climbs both nodes to equal depth, then in lockstep until they meet.
    ///
    /// # Panics
    ///
    /// Panics when a parent chain runs out before the nodes meet; regions
    /// combined into one instance must share a tree.
    fn find_common_ancestor(one: &Arc<RegionNode>, two: &Arc<RegionNode>) -> Arc<RegionNode> {
        let mut one = Arc::clone(one);
        let mut two = Arc::clone(two);
        let climb = |node: &Arc<RegionNode>| -> Arc<RegionNode> {
            Arc::clone(node.parent().unwrap_or_else(|| {
                panic!("no common ancestor for regions in tree {}", node.handle().tree_id)
            }))
        };
        while one.depth() > two.depth() {
            one = climb(&one);
        }
        while one.depth() < two.depth() {
            two = climb(&two);
        }
        while !Arc::ptr_eq(&one, &two) {
            one = climb(&one);
            two = climb(&two);
        }
        one
    }

    /// Pulls field layout data from the field space and fixes the blocking.
    fn compute_layout_parameters(&mut self, rt: &Runtime, _forest: &RegionTreeForest) {
        let ancestor = self.ancestor.as_ref().expect("ancestor resolved");
        let created = ancestor
            .column_source()
            .compute_create_offsets(&self.constraints.fields.field_set)
            .unwrap_or_else(|err| panic!("instance builder field lookup failed: {err}"));
        self.field_sizes = created.field_sizes;
        self.mask_index_map = created.mask_index_map;
        self.serdez = created.serdez;
        self.instance_mask = created.mask;
        let domain_volume = self.instance_domain.as_ref().map_or(0, Domain::volume);
        match self.constraints.specialization {
            SpecializationKind::Normal => {
                self.block_size = match self.constraints.ordering.field_placement() {
                    FieldPlacement::Leading => 1,
                    FieldPlacement::Trailing | FieldPlacement::Absent => domain_volume,
                    FieldPlacement::Interior => panic!(
                        "unimplemented: field axis in the interior of the dimension ordering"
                    ),
                };
            }
            SpecializationKind::ReductionFold | SpecializationKind::ReductionList => {
                self.block_size = 1;
                self.redop_id = self.constraints.reduction_op;
                let op = rt
                    .reduction_ops()
                    .find(self.redop_id)
                    .unwrap_or_else(|err| panic!("instance builder reduction lookup failed: {err}"));
                self.reduction_op = Some(op);
            }
            SpecializationKind::Virtual => {
                panic!(
                    "illegal request to create an instance with {} specialization",
                    SpecializationKind::Virtual
                );
            }
        }
    }

    /// Element blocking of the layout: 1 for AOS, the domain volume for SOA.
    #[must_use]
    pub const fn block_size(&self) -> usize {
        self.block_size
    }
}

impl std::fmt::Debug for InstanceBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceBuilder")
            .field("regions", &self.regions)
            .field("specialization", &self.constraints.specialization)
            .field("valid", &self.valid)
            .finish_non_exhaustive()
    }
}
