//! Layout descriptions: where each field lives inside an allocation.
//!
//! A [`LayoutDescription`] is created by a field-space node when an
//! allocation materializes a constraint set, and is shared by every manager
//! whose instance uses the same packing. It is immutable after construction
//! except for two monotone side tables: the compression cache and the set of
//! peer nodes known to hold a copy.
//!
//! # Field ordering
//!
//! `field_infos` is indexed by *mask order*: the `k`-th set bit of
//! `allocated_fields` describes the field stored at position `k`. Copy
//! descriptors emitted for the same mask on the source and destination
//! layouts therefore line up pairwise, which is what the DMA engine needs.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::debug;

use crate::error::Result;
use crate::forest::RegionNode;
use crate::layout::constraint::{ConstraintRegistry, InternedConstraints, LayoutConstraintSet};
use crate::memory::PhysicalInstance;
use crate::types::{AddressSpace, ConstraintId, FieldId, FieldMask, FieldSpaceId, SerdezId};

// ---------------------------------------------------------------------------
// FieldInfo / CopySrcDstField
// ---------------------------------------------------------------------------

/// Placement of one field inside an allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldInfo {
    /// The logical field.
    pub field_id: FieldId,
    /// Byte offset of the field within one element block.
    pub offset: usize,
    /// Byte size of the field.
    pub size: usize,
    /// Custom serialize/deserialize functor; zero means none.
    pub serdez_id: SerdezId,
}

/// One source or destination descriptor of a copy request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CopySrcDstField {
    /// The backing allocation.
    pub instance: PhysicalInstance,
    /// The logical field.
    pub field_id: FieldId,
    /// Byte offset within an element block.
    pub offset: usize,
    /// Byte size.
    pub size: usize,
    /// Custom serialize/deserialize functor; zero means none.
    pub serdez_id: SerdezId,
}

/// The cross-node form of a layout: enough to find or rebuild it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayoutPayload {
    /// True if the target is already known to hold this layout.
    pub has_local: bool,
    /// The interned constraint set.
    pub constraint_id: ConstraintId,
    /// The allocated fields in the sender's numbering.
    pub allocated_fields: FieldMask,
}

// ---------------------------------------------------------------------------
// LayoutDescription
// ---------------------------------------------------------------------------

/// A field-major packing plan for one allocation shape.
pub struct LayoutDescription {
    allocated_fields: FieldMask,
    constraints: Arc<InternedConstraints>,
    owner_field_space: FieldSpaceId,
    /// Indexed by mask order, not field-id order.
    field_infos: Vec<FieldInfo>,
    field_indexes: BTreeMap<FieldId, usize>,
    /// Chaining cache from mask hash to (mask, compressed) pairs.
    comp_cache: RwLock<HashMap<u64, Vec<(FieldMask, FieldMask)>>>,
    known_nodes: Mutex<BTreeSet<AddressSpace>>,
}

impl LayoutDescription {
    /// Builds a description from field-space creation output.
    ///
    /// `field_sizes` and `serdez` are in field-set (declaration) order;
    /// `mask_index_map[k]` names the field-set position stored at mask
    /// position `k`. Offsets are prefix sums of the sizes in field-set
    /// order.
    ///
    /// # Panics
    ///
    /// Panics if the map length disagrees with the mask population.
    #[must_use]
    pub fn new(
        owner_field_space: FieldSpaceId,
        mask: FieldMask,
        constraints: Arc<InternedConstraints>,
        mask_index_map: &[usize],
        serdez: &[SerdezId],
        field_sizes: &[(FieldId, usize)],
    ) -> Self {
        assert_eq!(
            mask_index_map.len(),
            mask.pop_count(),
            "mask index map does not cover the allocated fields"
        );
        let mut offsets = vec![0usize; field_sizes.len()];
        for idx in 1..field_sizes.len() {
            offsets[idx] = offsets[idx - 1] + field_sizes[idx - 1].1;
        }
        let mut field_infos = Vec::with_capacity(mask_index_map.len());
        let mut field_indexes = BTreeMap::new();
        for (mask_position, &index) in mask_index_map.iter().enumerate() {
            let (field_id, size) = field_sizes[index];
            field_indexes.insert(field_id, mask_position);
            field_infos.push(FieldInfo {
                field_id,
                offset: offsets[index],
                size,
                serdez_id: serdez[index],
            });
        }
        Self {
            allocated_fields: mask,
            constraints,
            owner_field_space,
            field_infos,
            field_indexes,
            comp_cache: RwLock::new(HashMap::new()),
            known_nodes: Mutex::new(BTreeSet::new()),
        }
    }

    /// The fields this layout allocates.
    #[must_use]
    pub const fn allocated_fields(&self) -> FieldMask {
        self.allocated_fields
    }

    /// The interned constraint set this layout materializes.
    #[must_use]
    pub fn constraints(&self) -> &Arc<InternedConstraints> {
        &self.constraints
    }

    /// The field space that owns this layout.
    #[must_use]
    pub const fn owner_field_space(&self) -> FieldSpaceId {
        self.owner_field_space
    }

    /// Appends copy descriptors for every allocated field in `copy_mask`.
    ///
    /// Descriptors are appended in mask order so that source and destination
    /// layouts with equal allocated fields emit pairwise-matching lists.
    /// Bits of `copy_mask` outside the allocated fields are silently
    /// dropped, letting callers pass a superset mask.
    pub fn compute_copy_offsets(
        &self,
        copy_mask: &FieldMask,
        instance: PhysicalInstance,
        fields: &mut Vec<CopySrcDstField>,
    ) {
        let hash_key = copy_mask.hash_key();
        let mut compressed = None;
        {
            let cache = self.comp_cache.read();
            if let Some(entries) = cache.get(&hash_key) {
                for (mask, packed) in entries {
                    if mask == copy_mask {
                        compressed = Some(*packed);
                        break;
                    }
                }
            }
        }
        let compressed = match compressed {
            Some(packed) => packed,
            None => {
                let packed = FieldMask::compress(*copy_mask, self.allocated_fields);
                // Duplicate insertions from racing writers are benign; a
                // reader matches whichever pair it sees first.
                self.comp_cache
                    .write()
                    .entry(hash_key)
                    .or_default()
                    .push((*copy_mask, packed));
                packed
            }
        };
        let count = compressed.pop_count();
        fields.reserve(count);
        for position in 0..count {
            let index = compressed
                .find_index_set(position)
                .expect("compressed mask population");
            let info = &self.field_infos[index];
            fields.push(CopySrcDstField {
                instance,
                field_id: info.field_id,
                offset: info.offset,
                size: info.size,
                serdez_id: info.serdez_id,
            });
        }
    }

    /// Appends the copy descriptor for a single field.
    ///
    /// # Panics
    ///
    /// Panics if the field is not allocated by this layout; that is a caller
    /// bug, not a recoverable condition.
    pub fn compute_copy_offsets_for_field(
        &self,
        field_id: FieldId,
        instance: PhysicalInstance,
        fields: &mut Vec<CopySrcDstField>,
    ) {
        let info = self.find_field_info(field_id);
        fields.push(CopySrcDstField {
            instance,
            field_id: info.field_id,
            offset: info.offset,
            size: info.size,
            serdez_id: info.serdez_id,
        });
    }

    /// Appends copy descriptors for the given fields in the given order.
    ///
    /// # Panics
    ///
    /// Panics if any field is not allocated by this layout.
    pub fn compute_copy_offsets_for_fields(
        &self,
        copy_fields: &[FieldId],
        instance: PhysicalInstance,
        fields: &mut Vec<CopySrcDstField>,
    ) {
        fields.reserve(copy_fields.len());
        for &field_id in copy_fields {
            self.compute_copy_offsets_for_field(field_id, instance, fields);
        }
    }

    /// Returns true if the field is allocated by this layout.
    #[must_use]
    pub fn has_field(&self, field_id: FieldId) -> bool {
        self.field_indexes.contains_key(&field_id)
    }

    /// Fills `to_test` with per-field membership.
    pub fn has_fields(&self, to_test: &mut BTreeMap<FieldId, bool>) {
        for (field_id, present) in to_test.iter_mut() {
            *present = self.field_indexes.contains_key(field_id);
        }
    }

    /// Removes from `filter` every field this layout allocates.
    pub fn remove_space_fields(&self, filter: &mut BTreeSet<FieldId>) {
        filter.retain(|field_id| !self.field_indexes.contains_key(field_id));
    }

    /// Placement of one allocated field.
    ///
    /// # Panics
    ///
    /// Panics if the field is not allocated by this layout.
    #[must_use]
    pub fn find_field_info(&self, field_id: FieldId) -> &FieldInfo {
        let index = self.field_indexes.get(&field_id).unwrap_or_else(|| {
            panic!(
                "unknown field {field_id} in layout of field space {}",
                self.owner_field_space
            )
        });
        &self.field_infos[*index]
    }

    /// Sum of the allocated field sizes.
    #[must_use]
    pub fn total_field_size(&self) -> usize {
        self.field_infos.iter().map(|info| info.size).sum()
    }

    /// The allocated fields ordered by their offsets.
    #[must_use]
    pub fn fields(&self) -> Vec<FieldId> {
        let mut by_offset: Vec<_> = self
            .field_infos
            .iter()
            .map(|info| (info.offset, info.field_id))
            .collect();
        by_offset.sort_unstable();
        by_offset.into_iter().map(|(_, field_id)| field_id).collect()
    }

    /// Structural equality with another layout.
    #[must_use]
    pub fn match_layout(&self, other: &Self) -> bool {
        self.allocated_fields == other.allocated_fields
            && self.constraints.set() == other.constraints.set()
    }

    /// Structural equality against a candidate constraint set.
    #[must_use]
    pub fn match_constraints(&self, candidate: &LayoutConstraintSet) -> bool {
        self.constraints.set() == candidate
    }

    /// Builds the wire payload for a transfer to `target`.
    ///
    /// If `target` already holds the layout only the identifying pair is
    /// meaningful on the far side. Losing a known-nodes race sends the
    /// layout twice; the receive path is idempotent.
    #[must_use]
    pub fn pack(&self, target: AddressSpace) -> LayoutPayload {
        LayoutPayload {
            has_local: self.known_nodes.lock().contains(&target),
            constraint_id: self.constraints.id(),
            allocated_fields: self.allocated_fields,
        }
    }

    /// Records that `target` holds this layout.
    ///
    /// Callers update only after the transfer message is on the wire.
    pub fn update_known_nodes(&self, target: AddressSpace) {
        self.known_nodes.lock().insert(target);
    }

    /// Resolves a received payload into the local layout for `region_node`.
    ///
    /// The constraint id is resolved locally, the field mask is renumbered
    /// through the local field space, and the layout is found or rebuilt
    /// from the constraint's field set. The sender is recorded as a known
    /// holder afterwards.
    pub fn handle_unpack(
        payload: &LayoutPayload,
        source: AddressSpace,
        region_node: &RegionNode,
        constraints: &ConstraintRegistry,
    ) -> Result<Arc<Self>> {
        let entry = constraints.find(payload.constraint_id)?;
        let field_space = region_node.column_source();
        let field_set = &entry.set().fields.field_set;
        let mask = field_space.transform_field_mask(field_set)?;
        let result = match field_space.find_layout_description(mask, &entry) {
            Some(layout) => layout,
            None => {
                if payload.has_local {
                    debug!(
                        constraint = %payload.constraint_id,
                        "layout flagged as local was not found; rebuilding"
                    );
                }
                let created = field_space.compute_create_offsets(field_set)?;
                field_space.create_layout_description(
                    created.mask,
                    Arc::clone(&entry),
                    &created.mask_index_map,
                    &created.serdez,
                    &created.field_sizes,
                )
            }
        };
        result.update_known_nodes(source);
        Ok(result)
    }

    /// Number of distinct copy masks memoized so far.
    #[must_use]
    pub fn compression_cache_len(&self) -> usize {
        self.comp_cache.read().values().map(Vec::len).sum()
    }
}

impl std::fmt::Debug for LayoutDescription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LayoutDescription")
            .field("field_space", &self.owner_field_space)
            .field("allocated_fields", &self.allocated_fields)
            .field("constraints", &self.constraints.id())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::constraint::{DimensionKind, LayoutConstraintSet};
    use crate::types::{InstanceId, MemoryId};

    fn test_instance() -> PhysicalInstance {
        PhysicalInstance {
            id: InstanceId(7),
            memory: MemoryId(1),
            size: 192,
        }
    }

    /// Two fields, A (8 bytes) at bit 0 and B (4 bytes) at bit 1.
    fn test_layout() -> LayoutDescription {
        let registry = ConstraintRegistry::new();
        let entry = registry.intern(LayoutConstraintSet::normal(
            vec![FieldId(1), FieldId(2)],
            vec![DimensionKind::X, DimensionKind::Field],
        ));
        LayoutDescription::new(
            FieldSpaceId(1),
            FieldMask::from_indexes([0, 1]),
            entry,
            &[0, 1],
            &[SerdezId(0), SerdezId(0)],
            &[(FieldId(1), 8), (FieldId(2), 4)],
        )
    }

    #[test]
    fn copy_offsets_for_single_field() {
        let layout = test_layout();
        let mut fields = Vec::new();
        layout.compute_copy_offsets(&FieldMask::with_bit(0), test_instance(), &mut fields);
        assert_eq!(fields.len(), 1);
        assert_eq!(fields[0].field_id, FieldId(1));
        assert_eq!(fields[0].offset, 0);
        assert_eq!(fields[0].size, 8);
    }

    #[test]
    fn copy_offsets_follow_mask_order() {
        let layout = test_layout();
        let mut fields = Vec::new();
        layout.compute_copy_offsets(&FieldMask::from_indexes([0, 1]), test_instance(), &mut fields);
        assert_eq!(fields.len(), 2);
        assert_eq!(fields[0].field_id, FieldId(1));
        assert_eq!(fields[1].field_id, FieldId(2));
        assert_eq!(fields[1].offset, 8);
        assert_eq!(fields[1].size, 4);
    }

    #[test]
    fn superset_mask_bits_are_dropped() {
        let layout = test_layout();
        let mut fields = Vec::new();
        layout.compute_copy_offsets(
            &FieldMask::from_indexes([0, 1, 5, 200]),
            test_instance(),
            &mut fields,
        );
        assert_eq!(fields.len(), 2);
    }

    #[test]
    fn second_lookup_hits_the_cache_with_identical_output() {
        let layout = test_layout();
        let mask = FieldMask::from_indexes([0, 1]);
        let mut first = Vec::new();
        layout.compute_copy_offsets(&mask, test_instance(), &mut first);
        assert_eq!(layout.compression_cache_len(), 1);
        let mut second = Vec::new();
        layout.compute_copy_offsets(&mask, test_instance(), &mut second);
        assert_eq!(layout.compression_cache_len(), 1);
        assert_eq!(first, second);
    }

    #[test]
    #[should_panic(expected = "unknown field")]
    fn unknown_field_aborts() {
        let layout = test_layout();
        let mut fields = Vec::new();
        layout.compute_copy_offsets_for_field(FieldId(99), test_instance(), &mut fields);
    }

    #[test]
    fn explicit_field_list_keeps_caller_order() {
        let layout = test_layout();
        let mut fields = Vec::new();
        layout.compute_copy_offsets_for_fields(
            &[FieldId(2), FieldId(1)],
            test_instance(),
            &mut fields,
        );
        assert_eq!(fields[0].field_id, FieldId(2));
        assert_eq!(fields[1].field_id, FieldId(1));
    }

    #[test]
    fn field_queries() {
        let layout = test_layout();
        assert!(layout.has_field(FieldId(1)));
        assert!(!layout.has_field(FieldId(3)));
        assert_eq!(layout.total_field_size(), 12);
        assert_eq!(layout.fields(), vec![FieldId(1), FieldId(2)]);

        let mut filter: BTreeSet<FieldId> = [FieldId(1), FieldId(3)].into();
        layout.remove_space_fields(&mut filter);
        assert_eq!(filter.into_iter().collect::<Vec<_>>(), vec![FieldId(3)]);
    }

    #[test]
    fn pack_reflects_known_nodes() {
        let layout = test_layout();
        let target = AddressSpace(2);
        assert!(!layout.pack(target).has_local);
        layout.update_known_nodes(target);
        let payload = layout.pack(target);
        assert!(payload.has_local);
        assert_eq!(payload.allocated_fields, layout.allocated_fields());
    }

    #[test]
    fn match_layout_requires_equal_fields_and_constraints() {
        let a = test_layout();
        let b = test_layout();
        assert!(a.match_layout(&b));
        let registry = ConstraintRegistry::new();
        let other = registry.intern(LayoutConstraintSet::normal(
            vec![FieldId(1)],
            vec![DimensionKind::Field, DimensionKind::X],
        ));
        let c = LayoutDescription::new(
            FieldSpaceId(1),
            FieldMask::with_bit(0),
            other,
            &[0],
            &[SerdezId(0)],
            &[(FieldId(1), 8)],
        );
        assert!(!a.match_layout(&c));
    }
}
