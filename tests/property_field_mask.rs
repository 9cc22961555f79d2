//! Property tests for mask compression and copy-descriptor ordering.

use proptest::prelude::*;

use regolith::layout::{ConstraintRegistry, DimensionKind, LayoutConstraintSet, LayoutDescription};
use regolith::types::{FieldId, FieldMask, FieldSpaceId, InstanceId, MemoryId, SerdezId};
use regolith::PhysicalInstance;

fn arb_bit_set(max_bits: usize) -> impl Strategy<Value = Vec<usize>> {
    prop::collection::btree_set(0..max_bits, 0..24).prop_map(|set| set.into_iter().collect())
}

proptest! {
    /// Compression preserves the population of the masked bits.
    #[test]
    fn compress_preserves_masked_population(
        x_bits in arb_bit_set(256),
        m_bits in arb_bit_set(256),
    ) {
        let x = FieldMask::from_indexes(x_bits.iter().copied());
        let m = FieldMask::from_indexes(m_bits.iter().copied());
        let compressed = FieldMask::compress(x, m);
        prop_assert_eq!(compressed.pop_count(), (x & m).pop_count());
    }

    /// The k-th set bit of the compressed mask corresponds to the k-th set
    /// bit of `x & m` under the numbering induced by `m`.
    #[test]
    fn compress_respects_mask_numbering(
        x_bits in arb_bit_set(256),
        m_bits in arb_bit_set(256),
    ) {
        let x = FieldMask::from_indexes(x_bits.iter().copied());
        let m = FieldMask::from_indexes(m_bits.iter().copied());
        let compressed = FieldMask::compress(x, m);
        for (numbering, position) in m.iter().enumerate() {
            prop_assert_eq!(
                compressed.contains(numbering),
                x.contains(position),
                "mask bit {} (numbering {})", position, numbering
            );
        }
    }

    /// Compressing under a full mask is the identity on the masked range.
    #[test]
    fn compress_under_full_mask_is_identity(x_bits in arb_bit_set(256)) {
        let x = FieldMask::from_indexes(x_bits.iter().copied());
        let full = !FieldMask::new();
        prop_assert_eq!(FieldMask::compress(x, full), x);
    }
}

/// Builds a layout whose field-set order is `fields`, with bit indexes
/// assigned by `bit_of` (field id order here, independent of set order).
fn layout_for(fields: &[(FieldId, usize)]) -> LayoutDescription {
    let mut sorted: Vec<FieldId> = fields.iter().map(|(field, _)| *field).collect();
    sorted.sort_unstable();
    let bit_of = |field: FieldId| sorted.iter().position(|&f| f == field).unwrap();

    let mut mask = FieldMask::new();
    let mut positions: Vec<(usize, usize)> = Vec::new();
    for (set_position, (field, _)) in fields.iter().enumerate() {
        let bit = bit_of(*field);
        mask.set(bit);
        positions.push((bit, set_position));
    }
    positions.sort_unstable();
    let mask_index_map: Vec<usize> = positions.into_iter().map(|(_, pos)| pos).collect();
    let serdez = vec![SerdezId(0); fields.len()];

    let registry = ConstraintRegistry::new();
    let entry = registry.intern(LayoutConstraintSet::normal(
        fields.iter().map(|(field, _)| *field).collect(),
        vec![DimensionKind::X, DimensionKind::Field],
    ));
    LayoutDescription::new(FieldSpaceId(1), mask, entry, &mask_index_map, &serdez, fields)
}

proptest! {
    /// Two layouts with equal allocated fields emit pairwise-matching field
    /// ids for the same copy mask, regardless of their field-set order.
    #[test]
    fn copy_descriptors_pair_up_across_layouts(
        permutation in Just(
            (0u32..6)
                .map(|i| (FieldId(i), 4 + 4 * (i as usize % 3)))
                .collect::<Vec<(FieldId, usize)>>(),
        )
        .prop_shuffle(),
        mask_bits in arb_bit_set(6),
    ) {
        let canonical: Vec<(FieldId, usize)> =
            (0..6).map(|i| (FieldId(i), 4 + 4 * (i as usize % 3))).collect();
        let src_layout = layout_for(&canonical);
        let dst_layout = layout_for(&permutation);
        prop_assert_eq!(src_layout.allocated_fields(), dst_layout.allocated_fields());

        let mask = FieldMask::from_indexes(mask_bits.iter().copied());
        let instance = PhysicalInstance {
            id: InstanceId(1),
            memory: MemoryId(1),
            size: 0,
        };
        let mut src = Vec::new();
        src_layout.compute_copy_offsets(&mask, instance, &mut src);
        let mut dst = Vec::new();
        dst_layout.compute_copy_offsets(&mask, instance, &mut dst);

        prop_assert_eq!(src.len(), dst.len());
        for (ours, theirs) in src.iter().zip(&dst) {
            prop_assert_eq!(ours.field_id, theirs.field_id);
        }
    }
}
