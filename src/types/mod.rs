//! Core types: identifiers, field masks, and index domains.

pub mod domain;
pub mod field_mask;
pub mod id;

pub use domain::{Domain, ElementMask, Rect};
pub use field_mask::{FieldMask, LOG2_MAX_FIELDS, MAX_FIELDS};
pub use id::{
    AddressSpace, ConstraintId, ContextUid, DistributedId, FieldId, FieldSpaceId, GcPriority,
    IndexSpaceId, InstanceId, MapperId, MemoryId, ProcessorId, ReductionOpId, SerdezId, TreeId,
    ViewId,
};
