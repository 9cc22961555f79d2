//! Layout constraint sets and the content-addressed registry.
//!
//! A [`LayoutConstraintSet`] is the caller's full statement of intent for an
//! allocation. Sets are interned: the registry hashes a canonical byte
//! encoding into a [`ConstraintId`] that is identical on every node for
//! identical content, so wire payloads carry the id instead of the set. The
//! registry also remembers which peers have seen each set, driving the
//! send-the-set-before-first-reference discipline.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::error::{Error, ErrorKind, Result};
use crate::types::{AddressSpace, ConstraintId, FieldId, ReductionOpId};

/// FNV-1a offset basis (64-bit).
const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
/// FNV-1a prime (64-bit).
const FNV_PRIME: u64 = 0x0100_0000_01b3;

// ---------------------------------------------------------------------------
// SpecializationKind
// ---------------------------------------------------------------------------

/// What flavor of instance a constraint set asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SpecializationKind {
    /// An ordinary field-major allocation.
    Normal,
    /// A fold-reduction buffer: one rhs slot per point, reduced in place.
    ReductionFold,
    /// A list-reduction buffer: appended `(pointer, rhs)` records.
    ReductionList,
    /// A virtual instance; never materialized by the builder.
    Virtual,
}

impl SpecializationKind {
    pub(crate) const fn as_u8(self) -> u8 {
        match self {
            Self::Normal => 0,
            Self::ReductionFold => 1,
            Self::ReductionList => 2,
            Self::Virtual => 3,
        }
    }

    pub(crate) const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Normal),
            1 => Some(Self::ReductionFold),
            2 => Some(Self::ReductionList),
            3 => Some(Self::Virtual),
            _ => None,
        }
    }

    /// Returns true for either reduction flavor.
    #[must_use]
    pub const fn is_reduction(self) -> bool {
        matches!(self, Self::ReductionFold | Self::ReductionList)
    }
}

impl std::fmt::Display for SpecializationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Normal => "normal",
            Self::ReductionFold => "reduction-fold",
            Self::ReductionList => "reduction-list",
            Self::Virtual => "virtual",
        };
        write!(f, "{s}")
    }
}

// ---------------------------------------------------------------------------
// DimensionKind / OrderingConstraint
// ---------------------------------------------------------------------------

/// One axis of an allocation's traversal order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DimensionKind {
    /// The first spatial dimension.
    X,
    /// The second spatial dimension.
    Y,
    /// The third spatial dimension.
    Z,
    /// The field axis.
    Field,
}

impl DimensionKind {
    pub(crate) const fn as_u8(self) -> u8 {
        match self {
            Self::X => 0,
            Self::Y => 1,
            Self::Z => 2,
            Self::Field => 3,
        }
    }

    pub(crate) const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::X),
            1 => Some(Self::Y),
            2 => Some(Self::Z),
            3 => Some(Self::Field),
            _ => None,
        }
    }
}

/// Where the field axis sits in an ordering constraint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldPlacement {
    /// Field axis leads: array-of-structs.
    Leading,
    /// Field axis trails: struct-of-arrays.
    Trailing,
    /// No field axis named; treated as struct-of-arrays.
    Absent,
    /// Field axis between spatial axes; not supported.
    Interior,
}

/// The dimension traversal order of an allocation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct OrderingConstraint {
    /// Axes from fastest-varying to slowest.
    pub ordering: Vec<DimensionKind>,
}

impl OrderingConstraint {
    /// Creates an ordering constraint.
    #[must_use]
    pub fn new(ordering: Vec<DimensionKind>) -> Self {
        Self { ordering }
    }

    /// Classifies where the field axis sits.
    #[must_use]
    pub fn field_placement(&self) -> FieldPlacement {
        match self.ordering.first() {
            None => FieldPlacement::Absent,
            Some(DimensionKind::Field) => FieldPlacement::Leading,
            Some(_) => match self.ordering.last() {
                Some(DimensionKind::Field) => FieldPlacement::Trailing,
                _ if self.ordering.contains(&DimensionKind::Field) => FieldPlacement::Interior,
                _ => FieldPlacement::Absent,
            },
        }
    }
}

// ---------------------------------------------------------------------------
// FieldConstraint / LayoutConstraintSet
// ---------------------------------------------------------------------------

/// The ordered set of fields an allocation covers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct FieldConstraint {
    /// Fields in the caller's declared order.
    pub field_set: Vec<FieldId>,
}

impl FieldConstraint {
    /// Creates a field constraint.
    #[must_use]
    pub fn new(field_set: Vec<FieldId>) -> Self {
        Self { field_set }
    }
}

/// A full constraint set: specialization, reduction binding, fields, order.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LayoutConstraintSet {
    /// The requested instance flavor.
    pub specialization: SpecializationKind,
    /// Bound reduction operator; meaningful only for reduction flavors.
    pub reduction_op: ReductionOpId,
    /// The fields to allocate.
    pub fields: FieldConstraint,
    /// The traversal order.
    pub ordering: OrderingConstraint,
}

impl LayoutConstraintSet {
    /// Creates a normal (non-reduction) constraint set.
    #[must_use]
    pub fn normal(field_set: Vec<FieldId>, ordering: Vec<DimensionKind>) -> Self {
        Self {
            specialization: SpecializationKind::Normal,
            reduction_op: ReductionOpId(0),
            fields: FieldConstraint::new(field_set),
            ordering: OrderingConstraint::new(ordering),
        }
    }

    /// Creates a reduction constraint set of the given flavor.
    #[must_use]
    pub fn reduction(
        specialization: SpecializationKind,
        reduction_op: ReductionOpId,
        field: FieldId,
    ) -> Self {
        Self {
            specialization,
            reduction_op,
            fields: FieldConstraint::new(vec![field]),
            ordering: OrderingConstraint::default(),
        }
    }

    /// Canonical byte encoding used for content addressing and the wire.
    #[must_use]
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(8 + self.fields.field_set.len() * 4);
        buf.push(self.specialization.as_u8());
        buf.extend_from_slice(&self.reduction_op.0.to_le_bytes());
        buf.extend_from_slice(&(self.fields.field_set.len() as u32).to_le_bytes());
        for field in &self.fields.field_set {
            buf.extend_from_slice(&field.0.to_le_bytes());
        }
        buf.extend_from_slice(&(self.ordering.ordering.len() as u32).to_le_bytes());
        for dim in &self.ordering.ordering {
            buf.push(dim.as_u8());
        }
        buf
    }

    /// FNV-1a hash of the canonical encoding; the basis of [`ConstraintId`].
    #[must_use]
    pub fn content_hash(&self) -> u64 {
        let mut hash = FNV_OFFSET;
        for &byte in &self.canonical_bytes() {
            hash ^= u64::from(byte);
            hash = hash.wrapping_mul(FNV_PRIME);
        }
        hash
    }
}

// ---------------------------------------------------------------------------
// ConstraintRegistry
// ---------------------------------------------------------------------------

/// An interned constraint set with its cluster-stable id.
pub struct InternedConstraints {
    id: ConstraintId,
    set: LayoutConstraintSet,
    known_nodes: Mutex<BTreeSet<AddressSpace>>,
}

impl InternedConstraints {
    /// The cluster-stable id.
    #[must_use]
    pub const fn id(&self) -> ConstraintId {
        self.id
    }

    /// The interned set.
    #[must_use]
    pub const fn set(&self) -> &LayoutConstraintSet {
        &self.set
    }

    /// Structural equality against another set.
    #[must_use]
    pub fn equals(&self, other: &LayoutConstraintSet) -> bool {
        self.set == *other
    }

    /// Atomically records `target` as having seen this set.
    ///
    /// Returns true the first time a target is recorded, in which case the
    /// caller must ship the full set ahead of any reference to its id. A
    /// racing duplicate send is benign on the receiver.
    pub fn record_send(&self, target: AddressSpace) -> bool {
        self.known_nodes.lock().insert(target)
    }
}

impl std::fmt::Debug for InternedConstraints {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InternedConstraints")
            .field("id", &self.id)
            .field("specialization", &self.set.specialization)
            .finish_non_exhaustive()
    }
}

/// Content-addressed store of constraint sets.
///
/// Interning the same content on any node produces the same id, so ids can
/// travel the wire bare. Hash collisions between distinct sets are resolved
/// by salted reprobing, which keeps ids stable because every node probes in
/// the same order over the same content.
#[derive(Default)]
pub struct ConstraintRegistry {
    entries: RwLock<HashMap<ConstraintId, Arc<InternedConstraints>>>,
}

impl ConstraintRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Interns a set, returning the existing entry for equal content.
    pub fn intern(&self, set: LayoutConstraintSet) -> Arc<InternedConstraints> {
        let mut id = ConstraintId(set.content_hash());
        loop {
            {
                let entries = self.entries.read();
                match entries.get(&id) {
                    Some(entry) if entry.equals(&set) => return Arc::clone(entry),
                    Some(_) => {
                        id = ConstraintId(id.0.wrapping_add(1));
                        continue;
                    }
                    None => {}
                }
            }
            let mut entries = self.entries.write();
            // Re-check under the write lock; an interleaved intern of the
            // same content must yield its entry, not a duplicate.
            if let Some(entry) = entries.get(&id) {
                if entry.equals(&set) {
                    return Arc::clone(entry);
                }
                id = ConstraintId(id.0.wrapping_add(1));
                continue;
            }
            let entry = Arc::new(InternedConstraints {
                id,
                set,
                known_nodes: Mutex::new(BTreeSet::new()),
            });
            entries.insert(id, Arc::clone(&entry));
            return entry;
        }
    }

    /// Records a set received from a peer under the peer's id.
    ///
    /// The id is trusted: content addressing makes it equal to what local
    /// interning would produce except across collision-probe divergence,
    /// which the sender resolved first.
    pub fn record_remote(&self, id: ConstraintId, set: LayoutConstraintSet) -> Arc<InternedConstraints> {
        let mut entries = self.entries.write();
        if let Some(existing) = entries.get(&id) {
            return Arc::clone(existing);
        }
        let entry = Arc::new(InternedConstraints {
            id,
            set,
            known_nodes: Mutex::new(BTreeSet::new()),
        });
        entries.insert(id, Arc::clone(&entry));
        entry
    }

    /// Resolves an id to its interned entry.
    pub fn find(&self, id: ConstraintId) -> Result<Arc<InternedConstraints>> {
        self.entries
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::new(ErrorKind::UnknownConstraint).with_context(format!("{id}")))
    }
}
