//! The region-tree collaborators the instance core consumes.
//!
//! The wider runtime keeps a forest of region trees: index spaces crossed
//! with field spaces, sliced into logical regions. The instance core needs a
//! narrow slice of that machinery — domain lookup, field-space offset
//! computation, the per-field-space layout table, per-region manager
//! registration, and the copy-issue seam — and this module implements
//! exactly that slice.
//!
//! Copies are not executed here. Issuing a reduction or indirect copy
//! records the request in the forest's copy log and returns a fresh
//! completion event; the DMA engine behind the log is external.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use tracing::debug;

use crate::error::{Error, ErrorKind, Result};
use crate::event::Event;
use crate::layout::constraint::InternedConstraints;
use crate::layout::description::{CopySrcDstField, LayoutDescription};
use crate::manager::PhysicalManager;
use crate::runtime::Runtime;
use crate::types::{
    Domain, DistributedId, FieldId, FieldMask, FieldSpaceId, IndexSpaceId, ReductionOpId, SerdezId,
    TreeId,
};

// ---------------------------------------------------------------------------
// LogicalRegion
// ---------------------------------------------------------------------------

/// A handle naming one logical region: a tree, an index slice, a field space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LogicalRegion {
    /// The region tree this region belongs to.
    pub tree_id: TreeId,
    /// The index-space slice.
    pub index_space: IndexSpaceId,
    /// The field space.
    pub field_space: FieldSpaceId,
}

// ---------------------------------------------------------------------------
// IndexSpaceNode
// ---------------------------------------------------------------------------

/// An index-space node: a domain at a depth in its tree.
#[derive(Debug)]
pub struct IndexSpaceNode {
    id: IndexSpaceId,
    domain: Domain,
    depth: u32,
}

impl IndexSpaceNode {
    /// The node id.
    #[must_use]
    pub const fn id(&self) -> IndexSpaceId {
        self.id
    }

    /// The node's domain. Index spaces here are always materialized, so the
    /// lookup that blocks in a full runtime returns immediately.
    #[must_use]
    pub const fn domain(&self) -> &Domain {
        &self.domain
    }

    /// Depth below the tree root.
    #[must_use]
    pub const fn depth(&self) -> u32 {
        self.depth
    }
}

// ---------------------------------------------------------------------------
// FieldSpaceNode
// ---------------------------------------------------------------------------

/// Field layout data derived from a field set, in creation order.
#[derive(Debug, Clone)]
pub struct CreatedFields {
    /// `(field, size)` pairs in field-set order.
    pub field_sizes: Vec<(FieldId, usize)>,
    /// For mask position `k`, the field-set position stored there.
    pub mask_index_map: Vec<usize>,
    /// Serdez ids in field-set order.
    pub serdez: Vec<SerdezId>,
    /// The allocated-fields mask.
    pub mask: FieldMask,
}

#[derive(Debug, Clone, Copy)]
struct FieldSlot {
    index: usize,
    size: usize,
    serdez: SerdezId,
}

/// A field space: the column axis of a region tree.
///
/// Owns the field table (id → bit index, size, serdez) and the table of
/// layout descriptions materialized against this space. Layouts are held
/// weakly: they live exactly as long as some manager references them.
pub struct FieldSpaceNode {
    id: FieldSpaceId,
    fields: Mutex<FieldTable>,
    layouts: Mutex<HashMap<u64, Vec<Weak<LayoutDescription>>>>,
}

#[derive(Default)]
struct FieldTable {
    slots: BTreeMap<FieldId, FieldSlot>,
    next_index: usize,
}

impl FieldSpaceNode {
    fn new(id: FieldSpaceId) -> Self {
        Self {
            id,
            fields: Mutex::new(FieldTable::default()),
            layouts: Mutex::new(HashMap::new()),
        }
    }

    /// The node id.
    #[must_use]
    pub const fn id(&self) -> FieldSpaceId {
        self.id
    }

    /// Allocates a field with the given size and serdez functor.
    ///
    /// Bit indexes are handed out in allocation order, which every node of a
    /// cluster reproduces by allocating fields in the same order.
    ///
    /// # Panics
    ///
    /// Panics if the field is already allocated.
    pub fn allocate_field(&self, field: FieldId, size: usize, serdez: SerdezId) {
        let mut table = self.fields.lock();
        let index = table.next_index;
        assert!(
            index < crate::types::MAX_FIELDS,
            "field space {} is full",
            self.id
        );
        let previous = table.slots.insert(
            field,
            FieldSlot {
                index,
                size,
                serdez,
            },
        );
        assert!(previous.is_none(), "field {field} allocated twice in {}", self.id);
        table.next_index += 1;
    }

    /// Derives layout-creation data for a field set.
    ///
    /// Returns sizes and serdez ids in field-set order, the allocated-fields
    /// mask, and the map from mask positions back to field-set positions.
    pub fn compute_create_offsets(&self, field_set: &[FieldId]) -> Result<CreatedFields> {
        let table = self.fields.lock();
        let mut field_sizes = Vec::with_capacity(field_set.len());
        let mut serdez = Vec::with_capacity(field_set.len());
        let mut mask = FieldMask::new();
        let mut positions: Vec<(usize, usize)> = Vec::with_capacity(field_set.len());
        for (set_position, &field) in field_set.iter().enumerate() {
            let slot = table.slots.get(&field).ok_or_else(|| {
                Error::new(ErrorKind::UnknownField)
                    .with_context(format!("{field} in field space {}", self.id))
            })?;
            field_sizes.push((field, slot.size));
            serdez.push(slot.serdez);
            mask.set(slot.index);
            positions.push((slot.index, set_position));
        }
        positions.sort_unstable();
        let mask_index_map = positions.into_iter().map(|(_, pos)| pos).collect();
        Ok(CreatedFields {
            field_sizes,
            mask_index_map,
            serdez,
            mask,
        })
    }

    /// Renumbers a field set into this node's local mask.
    ///
    /// Incoming masks use the sender's bit numbering; the field ids are the
    /// cluster-stable names, so the local mask is rebuilt from them.
    pub fn transform_field_mask(&self, field_set: &[FieldId]) -> Result<FieldMask> {
        let table = self.fields.lock();
        let mut mask = FieldMask::new();
        for field in field_set {
            let slot = table.slots.get(field).ok_or_else(|| {
                Error::new(ErrorKind::UnknownField)
                    .with_context(format!("{field} in field space {}", self.id))
            })?;
            mask.set(slot.index);
        }
        Ok(mask)
    }

    /// Looks up a live layout matching the mask and constraint set.
    #[must_use]
    pub fn find_layout_description(
        &self,
        mask: FieldMask,
        constraints: &Arc<InternedConstraints>,
    ) -> Option<Arc<LayoutDescription>> {
        let mut layouts = self.layouts.lock();
        Self::find_locked(&mut layouts, mask, constraints)
    }

    fn find_locked(
        layouts: &mut HashMap<u64, Vec<Weak<LayoutDescription>>>,
        mask: FieldMask,
        constraints: &Arc<InternedConstraints>,
    ) -> Option<Arc<LayoutDescription>> {
        let bucket = layouts.get_mut(&mask.hash_key())?;
        let mut found = None;
        bucket.retain(|weak| match weak.upgrade() {
            Some(layout) => {
                if found.is_none()
                    && layout.allocated_fields() == mask
                    && layout.constraints().id() == constraints.id()
                {
                    found = Some(layout);
                }
                true
            }
            None => false,
        });
        found
    }

    /// Creates (or finds, losing a race) a layout for this field space.
    pub fn create_layout_description(
        &self,
        mask: FieldMask,
        constraints: Arc<InternedConstraints>,
        mask_index_map: &[usize],
        serdez: &[SerdezId],
        field_sizes: &[(FieldId, usize)],
    ) -> Arc<LayoutDescription> {
        let mut layouts = self.layouts.lock();
        if let Some(existing) = Self::find_locked(&mut layouts, mask, &constraints) {
            return existing;
        }
        let layout = Arc::new(LayoutDescription::new(
            self.id,
            mask,
            constraints,
            mask_index_map,
            serdez,
            field_sizes,
        ));
        layouts
            .entry(mask.hash_key())
            .or_default()
            .push(Arc::downgrade(&layout));
        layout
    }
}

impl std::fmt::Debug for FieldSpaceNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FieldSpaceNode")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// RegionNode
// ---------------------------------------------------------------------------

/// One logical region: an index slice crossed with a field space.
pub struct RegionNode {
    handle: LogicalRegion,
    row_source: Arc<IndexSpaceNode>,
    column_source: Arc<FieldSpaceNode>,
    parent: Option<Arc<RegionNode>>,
    managers: Mutex<BTreeMap<DistributedId, Weak<PhysicalManager>>>,
}

impl RegionNode {
    /// The region handle.
    #[must_use]
    pub const fn handle(&self) -> LogicalRegion {
        self.handle
    }

    /// The index-space node.
    #[must_use]
    pub const fn row_source(&self) -> &Arc<IndexSpaceNode> {
        &self.row_source
    }

    /// The field-space node.
    #[must_use]
    pub const fn column_source(&self) -> &Arc<FieldSpaceNode> {
        &self.column_source
    }

    /// The parent region, if any.
    #[must_use]
    pub const fn parent(&self) -> Option<&Arc<RegionNode>> {
        self.parent.as_ref()
    }

    /// Depth of this region below its tree root.
    #[must_use]
    pub fn depth(&self) -> u32 {
        self.row_source.depth()
    }

    /// Registers a manager against this region.
    ///
    /// Returns false if a manager with the same distributed id is already
    /// registered; the caller then drops its tentative copy.
    pub fn register_physical_manager(&self, manager: &Arc<PhysicalManager>) -> bool {
        let mut managers = self.managers.lock();
        managers.retain(|_, weak| weak.strong_count() > 0);
        match managers.entry(manager.did()) {
            std::collections::btree_map::Entry::Occupied(_) => false,
            std::collections::btree_map::Entry::Vacant(slot) => {
                slot.insert(Arc::downgrade(manager));
                true
            }
        }
    }

    /// Removes a manager registration.
    pub fn unregister_physical_manager(&self, did: DistributedId) {
        self.managers.lock().remove(&did);
    }

    /// Looks up a registered manager by id.
    #[must_use]
    pub fn find_physical_manager(&self, did: DistributedId) -> Option<Arc<PhysicalManager>> {
        self.managers.lock().get(&did).and_then(Weak::upgrade)
    }
}

impl std::fmt::Debug for RegionNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegionNode")
            .field("handle", &self.handle)
            .field("depth", &self.depth())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Copy log
// ---------------------------------------------------------------------------

/// The flavor of an issued copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CopyKind {
    /// A bulk reduction copy.
    Reduction {
        /// The reduction operator.
        redop: ReductionOpId,
        /// True to fold rhs into rhs, false to apply rhs into lhs.
        fold: bool,
    },
    /// An indirect reduction copy keyed by a pointer field.
    Indirect {
        /// The reduction operator.
        redop: ReductionOpId,
        /// True to fold rhs into rhs, false to apply rhs into lhs.
        fold: bool,
        /// The pointer-slot descriptor.
        index: CopySrcDstField,
    },
}

/// One issued copy request, as handed to the DMA engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyRecord {
    /// The copy flavor.
    pub kind: CopyKind,
    /// The index domain the copy ranges over.
    pub space: Domain,
    /// Source descriptors in mask order.
    pub src_fields: Vec<CopySrcDstField>,
    /// Destination descriptors in mask order.
    pub dst_fields: Vec<CopySrcDstField>,
    /// The event the copy waits on.
    pub precondition: Event,
    /// The completion event handed back to the caller.
    pub completion: Event,
}

// ---------------------------------------------------------------------------
// RegionTreeForest
// ---------------------------------------------------------------------------

/// The forest of region trees, narrowed to what the instance core consumes.
pub struct RegionTreeForest {
    regions: RwLock<BTreeMap<LogicalRegion, Arc<RegionNode>>>,
    field_spaces: RwLock<BTreeMap<FieldSpaceId, Arc<FieldSpaceNode>>>,
    next_index_space: AtomicU64,
    next_field_space: AtomicU32,
    copies: Mutex<Vec<CopyRecord>>,
}

impl Default for RegionTreeForest {
    fn default() -> Self {
        Self::new()
    }
}

impl RegionTreeForest {
    /// Creates an empty forest.
    #[must_use]
    pub fn new() -> Self {
        Self {
            regions: RwLock::new(BTreeMap::new()),
            field_spaces: RwLock::new(BTreeMap::new()),
            next_index_space: AtomicU64::new(1),
            next_field_space: AtomicU32::new(1),
            copies: Mutex::new(Vec::new()),
        }
    }

    /// Creates a fresh field space.
    pub fn create_field_space(&self) -> Arc<FieldSpaceNode> {
        let id = FieldSpaceId(self.next_field_space.fetch_add(1, Ordering::Relaxed));
        let node = Arc::new(FieldSpaceNode::new(id));
        self.field_spaces.write().insert(id, Arc::clone(&node));
        node
    }

    /// Looks up a field space by id.
    pub fn get_field_space(&self, id: FieldSpaceId) -> Result<Arc<FieldSpaceNode>> {
        self.field_spaces
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::new(ErrorKind::UnknownRegion).with_context(format!("{id}")))
    }

    /// Creates a region with its own index-space node.
    ///
    /// The region's depth is one below its parent; roots sit at depth zero.
    pub fn create_region(
        &self,
        tree_id: TreeId,
        domain: Domain,
        field_space: &Arc<FieldSpaceNode>,
        parent: Option<&Arc<RegionNode>>,
    ) -> Arc<RegionNode> {
        let index_space = IndexSpaceId(self.next_index_space.fetch_add(1, Ordering::Relaxed));
        let depth = parent.map_or(0, |node| node.depth() + 1);
        let row_source = Arc::new(IndexSpaceNode {
            id: index_space,
            domain,
            depth,
        });
        let handle = LogicalRegion {
            tree_id,
            index_space,
            field_space: field_space.id(),
        };
        let node = Arc::new(RegionNode {
            handle,
            row_source,
            column_source: Arc::clone(field_space),
            parent: parent.map(Arc::clone),
            managers: Mutex::new(BTreeMap::new()),
        });
        self.regions.write().insert(handle, Arc::clone(&node));
        node
    }

    /// Resolves a region handle to its node.
    pub fn get_node(&self, handle: LogicalRegion) -> Result<Arc<RegionNode>> {
        self.regions
            .read()
            .get(&handle)
            .cloned()
            .ok_or_else(|| Error::new(ErrorKind::UnknownRegion).with_context(format!("{handle:?}")))
    }

    /// Schedules a bulk reduction copy; returns its completion event.
    pub fn issue_reduction_copy(
        &self,
        rt: &Runtime,
        space: Domain,
        redop: ReductionOpId,
        fold: bool,
        src_fields: Vec<CopySrcDstField>,
        dst_fields: Vec<CopySrcDstField>,
        precondition: Event,
    ) -> Event {
        let completion = rt.new_event();
        debug!(%redop, fold, %completion, "issuing reduction copy");
        self.copies.lock().push(CopyRecord {
            kind: CopyKind::Reduction { redop, fold },
            space,
            src_fields,
            dst_fields,
            precondition,
            completion,
        });
        completion
    }

    /// Schedules an indirect reduction copy keyed by a pointer field.
    pub fn issue_indirect_copy(
        &self,
        rt: &Runtime,
        space: Domain,
        index: CopySrcDstField,
        redop: ReductionOpId,
        fold: bool,
        src_fields: Vec<CopySrcDstField>,
        dst_fields: Vec<CopySrcDstField>,
        precondition: Event,
    ) -> Event {
        let completion = rt.new_event();
        debug!(%redop, fold, %completion, "issuing indirect reduction copy");
        self.copies.lock().push(CopyRecord {
            kind: CopyKind::Indirect { redop, fold, index },
            space,
            src_fields,
            dst_fields,
            precondition,
            completion,
        });
        completion
    }

    /// The copies issued so far, oldest first.
    #[must_use]
    pub fn copy_log(&self) -> Vec<CopyRecord> {
        self.copies.lock().clone()
    }
}

impl std::fmt::Debug for RegionTreeForest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegionTreeForest")
            .field("regions", &self.regions.read().len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::constraint::{ConstraintRegistry, DimensionKind, LayoutConstraintSet};
    use crate::types::Rect;

    fn forest_with_fields() -> (RegionTreeForest, Arc<FieldSpaceNode>) {
        let forest = RegionTreeForest::new();
        let fs = forest.create_field_space();
        fs.allocate_field(FieldId(5), 8, SerdezId(0));
        fs.allocate_field(FieldId(1), 4, SerdezId(0));
        (forest, fs)
    }

    #[test]
    fn create_offsets_maps_mask_order_to_set_order() {
        let (_, fs) = forest_with_fields();
        // Field 5 sits at bit 0 (allocated first), field 1 at bit 1.
        let created = fs
            .compute_create_offsets(&[FieldId(1), FieldId(5)])
            .unwrap();
        assert_eq!(created.field_sizes, vec![(FieldId(1), 4), (FieldId(5), 8)]);
        assert_eq!(created.mask, FieldMask::from_indexes([0, 1]));
        // Mask position 0 holds field 5, which is set position 1.
        assert_eq!(created.mask_index_map, vec![1, 0]);
    }

    #[test]
    fn unknown_field_is_an_error() {
        let (_, fs) = forest_with_fields();
        let err = fs.compute_create_offsets(&[FieldId(9)]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnknownField);
    }

    #[test]
    fn transform_rebuilds_local_mask() {
        let (_, fs) = forest_with_fields();
        let mask = fs.transform_field_mask(&[FieldId(5)]).unwrap();
        assert_eq!(mask, FieldMask::with_bit(0));
    }

    #[test]
    fn layout_table_finds_live_layouts_only() {
        let (_, fs) = forest_with_fields();
        let registry = ConstraintRegistry::new();
        let entry = registry.intern(LayoutConstraintSet::normal(
            vec![FieldId(5)],
            vec![DimensionKind::X, DimensionKind::Field],
        ));
        let created = fs.compute_create_offsets(&[FieldId(5)]).unwrap();
        let layout = fs.create_layout_description(
            created.mask,
            Arc::clone(&entry),
            &created.mask_index_map,
            &created.serdez,
            &created.field_sizes,
        );
        let found = fs.find_layout_description(created.mask, &entry).unwrap();
        assert!(Arc::ptr_eq(&layout, &found));
        drop(found);
        drop(layout);
        assert!(fs.find_layout_description(created.mask, &entry).is_none());
    }

    #[test]
    fn create_layout_deduplicates() {
        let (_, fs) = forest_with_fields();
        let registry = ConstraintRegistry::new();
        let entry = registry.intern(LayoutConstraintSet::normal(
            vec![FieldId(5)],
            vec![DimensionKind::X, DimensionKind::Field],
        ));
        let created = fs.compute_create_offsets(&[FieldId(5)]).unwrap();
        let first = fs.create_layout_description(
            created.mask,
            Arc::clone(&entry),
            &created.mask_index_map,
            &created.serdez,
            &created.field_sizes,
        );
        let second = fs.create_layout_description(
            created.mask,
            Arc::clone(&entry),
            &created.mask_index_map,
            &created.serdez,
            &created.field_sizes,
        );
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn region_depths_follow_parents() {
        let (forest, fs) = forest_with_fields();
        let root = forest.create_region(
            TreeId(1),
            Domain::Rect1(Rect::new([0], [15])),
            &fs,
            None,
        );
        let child = forest.create_region(
            TreeId(1),
            Domain::Rect1(Rect::new([0], [7])),
            &fs,
            Some(&root),
        );
        assert_eq!(root.depth(), 0);
        assert_eq!(child.depth(), 1);
        let resolved = forest.get_node(child.handle()).unwrap();
        assert!(Arc::ptr_eq(&resolved, &child));
        assert!(forest
            .get_node(LogicalRegion {
                tree_id: TreeId(9),
                index_space: IndexSpaceId(99),
                field_space: fs.id(),
            })
            .is_err());
    }
}
