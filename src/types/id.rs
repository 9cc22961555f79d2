//! Identifier types for runtime entities.
//!
//! These types provide type-safe identifiers for the entities the instance
//! core deals in: nodes, fields, memories, contexts, and distributed objects.
//! All of them are plain `Copy` newtypes; none of them carry liveness.

use core::fmt;

/// Number of low bits of a [`DistributedId`] reserved for the owner node.
pub const DISTRIBUTED_ID_SPACE_BITS: u32 = 16;

/// A node in the cluster (one runtime process).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct AddressSpace(pub u32);

impl fmt::Debug for AddressSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AddressSpace({})", self.0)
    }
}

impl fmt::Display for AddressSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "N{}", self.0)
    }
}

/// A globally unique identifier for a distributed object.
///
/// The low [`DISTRIBUTED_ID_SPACE_BITS`] bits encode the owner node, so any
/// node can route a reference-count delta without a directory lookup.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DistributedId(pub u64);

impl DistributedId {
    /// Packs a per-node sequence number and the owner node into one id.
    #[must_use]
    pub const fn new(sequence: u64, owner: AddressSpace) -> Self {
        Self((sequence << DISTRIBUTED_ID_SPACE_BITS) | owner.0 as u64)
    }

    /// The node that owns the identified object.
    #[must_use]
    pub const fn owner_space(self) -> AddressSpace {
        AddressSpace((self.0 & ((1 << DISTRIBUTED_ID_SPACE_BITS) - 1)) as u32)
    }

    /// The owner-local sequence number.
    #[must_use]
    pub const fn sequence(self) -> u64 {
        self.0 >> DISTRIBUTED_ID_SPACE_BITS
    }
}

impl fmt::Debug for DistributedId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DistributedId({}@{})", self.sequence(), self.owner_space())
    }
}

impl fmt::Display for DistributedId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "D{}@{}", self.sequence(), self.owner_space())
    }
}

macro_rules! plain_id {
    ($(#[$doc:meta])* $name:ident($inner:ty), $prefix:literal) => {
        $(#[$doc])*
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
        pub struct $name(pub $inner);

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "({})"), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "{}"), self.0)
            }
        }
    };
}

plain_id!(
    /// A logical field within a field space.
    FieldId(u32),
    "F"
);
plain_id!(
    /// A custom serialize/deserialize functor id; zero means none.
    SerdezId(u32),
    "S"
);
plain_id!(
    /// A task context, the scope under which top views are registered.
    ContextUid(u64),
    "C"
);
plain_id!(
    /// An opaque reference to a logical view held by the view layer.
    ViewId(u64),
    "V"
);
plain_id!(
    /// A memory in the machine model.
    MemoryId(u32),
    "M"
);
plain_id!(
    /// A mapper making placement decisions.
    MapperId(u32),
    "MP"
);
plain_id!(
    /// A processor in the machine model.
    ProcessorId(u64),
    "P"
);
plain_id!(
    /// A registered reduction operator.
    ReductionOpId(u32),
    "R"
);
plain_id!(
    /// A region tree.
    TreeId(u32),
    "T"
);
plain_id!(
    /// An index space node.
    IndexSpaceId(u64),
    "IS"
);
plain_id!(
    /// A field space node.
    FieldSpaceId(u32),
    "FS"
);
plain_id!(
    /// A backing allocation inside one memory.
    InstanceId(u64),
    "I"
);
plain_id!(
    /// A content-addressed layout constraint set.
    ConstraintId(u64),
    "LC"
);

/// Garbage-collection priority hint for an instance.
///
/// Lower values are collected first; [`GcPriority::NEVER`] pins an instance.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct GcPriority(pub i64);

impl GcPriority {
    /// The instance must never be collected.
    pub const NEVER: Self = Self(i64::MAX);
}

impl fmt::Debug for GcPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GcPriority({})", self.0)
    }
}

impl fmt::Display for GcPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Self::NEVER {
            write!(f, "never")
        } else {
            write!(f, "{}", self.0)
        }
    }
}
