//! Binary message codec for cross-node transfer.
//!
//! Every payload starts with the magic bytes and a version, followed by a
//! message tag and tag-specific fields, all little-endian. The format is
//! stable across versions: receivers reject unknown versions and tags but
//! tolerate unknown instance-flag bits, which ride through untouched.

use crate::event::Event;
use crate::forest::LogicalRegion;
use crate::gc::{GcUpdate, ReferenceKind};
use crate::layout::constraint::{DimensionKind, LayoutConstraintSet, SpecializationKind};
use crate::layout::description::LayoutPayload;
use crate::memory::{InstanceFlags, PhysicalInstance};
use crate::types::{
    AddressSpace, ConstraintId, DistributedId, Domain, ElementMask, FieldId, FieldMask,
    FieldSpaceId, IndexSpaceId, InstanceId, MemoryId, Rect, ReductionOpId, TreeId,
};

/// Magic bytes of every message.
const WIRE_MAGIC: &[u8; 4] = b"RGLT";

/// Current wire format version.
const WIRE_VERSION: u8 = 1;

const TAG_GC_UPDATE: u8 = 1;
const TAG_REMOVE_REMOTE_DID: u8 = 2;
const TAG_CONSTRAINTS: u8 = 3;
const TAG_INSTANCE_MANAGER: u8 = 4;
const TAG_REDUCTION_MANAGER: u8 = 5;

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// A cross-node message of the instance core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// A reference-count delta from a proxy to the owner.
    GcUpdate {
        /// The targeted collectable.
        did: DistributedId,
        /// The delta.
        update: GcUpdate,
    },
    /// Owner-side revocation of a proxy's remote-did reference.
    RemoveRemoteDid {
        /// The collectable being torn down.
        did: DistributedId,
    },
    /// First-contact distribution of an interned constraint set.
    Constraints {
        /// The cluster-stable id.
        id: ConstraintId,
        /// The full set.
        set: LayoutConstraintSet,
    },
    /// Transfer of a normal instance manager.
    InstanceManager {
        /// The manager's id.
        did: DistributedId,
        /// The owning node.
        owner_space: AddressSpace,
        /// The memory holding the allocation.
        memory: MemoryId,
        /// The allocation handle.
        instance: PhysicalInstance,
        /// The covered index domain.
        instance_domain: Domain,
        /// The manager's region.
        region: LogicalRegion,
        /// The allocation's ready event.
        use_event: Event,
        /// Attachment flags; unknown bits are preserved.
        flags: InstanceFlags,
        /// The layout in transferable form.
        layout: LayoutPayload,
    },
    /// Transfer of a fold- or list-reduction manager.
    ReductionManager {
        /// The manager's id.
        did: DistributedId,
        /// The owning node.
        owner_space: AddressSpace,
        /// The memory holding the allocation.
        memory: MemoryId,
        /// The allocation handle.
        instance: PhysicalInstance,
        /// The covered index domain.
        instance_domain: Domain,
        /// The manager's region.
        region: LogicalRegion,
        /// The bound reduction operator.
        redop: ReductionOpId,
        /// The reduced field.
        logical_field: FieldId,
        /// True for fold, false for list.
        foldable: bool,
        /// The pointer space of a list manager.
        ptr_space: Option<Domain>,
        /// The allocation's ready event.
        use_event: Event,
    },
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Error during message decoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    /// Invalid magic bytes.
    InvalidMagic,
    /// Unsupported format version.
    UnsupportedVersion(u8),
    /// Unknown message tag.
    UnknownMessage(u8),
    /// A field tag byte was out of range.
    InvalidTag(u8),
    /// Unexpected end of data.
    UnexpectedEof,
}

impl std::fmt::Display for WireError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidMagic => write!(f, "invalid message magic"),
            Self::UnsupportedVersion(version) => {
                write!(f, "unsupported wire version: {version}")
            }
            Self::UnknownMessage(tag) => write!(f, "unknown message tag: {tag}"),
            Self::InvalidTag(tag) => write!(f, "invalid field tag: {tag}"),
            Self::UnexpectedEof => write!(f, "unexpected end of message"),
        }
    }
}

impl std::error::Error for WireError {}

impl From<WireError> for crate::error::Error {
    fn from(err: WireError) -> Self {
        Self::new(crate::error::ErrorKind::Wire).with_context(err.to_string())
    }
}

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

impl Message {
    /// Serializes the message.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(64);
        buf.extend_from_slice(WIRE_MAGIC);
        buf.push(WIRE_VERSION);
        match self {
            Self::GcUpdate { did, update } => {
                buf.push(TAG_GC_UPDATE);
                write_u64(&mut buf, did.0);
                buf.push(update.kind.as_u8());
                buf.push(u8::from(update.add));
                write_u32(&mut buf, update.count);
            }
            Self::RemoveRemoteDid { did } => {
                buf.push(TAG_REMOVE_REMOTE_DID);
                write_u64(&mut buf, did.0);
            }
            Self::Constraints { id, set } => {
                buf.push(TAG_CONSTRAINTS);
                write_u64(&mut buf, id.0);
                write_constraints(&mut buf, set);
            }
            Self::InstanceManager {
                did,
                owner_space,
                memory,
                instance,
                instance_domain,
                region,
                use_event,
                flags,
                layout,
            } => {
                buf.push(TAG_INSTANCE_MANAGER);
                write_u64(&mut buf, did.0);
                write_u32(&mut buf, owner_space.0);
                write_u32(&mut buf, memory.0);
                write_instance(&mut buf, *instance);
                write_domain(&mut buf, instance_domain);
                write_region(&mut buf, *region);
                write_u64(&mut buf, use_event.0);
                write_u32(&mut buf, flags.0);
                buf.push(u8::from(layout.has_local));
                write_u64(&mut buf, layout.constraint_id.0);
                write_field_mask(&mut buf, layout.allocated_fields);
            }
            Self::ReductionManager {
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
            } => {
                buf.push(TAG_REDUCTION_MANAGER);
                write_u64(&mut buf, did.0);
                write_u32(&mut buf, owner_space.0);
                write_u32(&mut buf, memory.0);
                write_instance(&mut buf, *instance);
                write_domain(&mut buf, instance_domain);
                write_region(&mut buf, *region);
                write_u32(&mut buf, redop.0);
                write_u32(&mut buf, logical_field.0);
                buf.push(u8::from(*foldable));
                match ptr_space {
                    Some(domain) => {
                        buf.push(1);
                        write_domain(&mut buf, domain);
                    }
                    None => buf.push(0),
                }
                write_u64(&mut buf, use_event.0);
            }
        }
        buf
    }

    /// Deserializes a message.
    ///
    /// # Errors
    ///
    /// Returns an error for malformed payloads, unknown versions, and
    /// unknown message tags.
    pub fn decode(data: &[u8]) -> Result<Self, WireError> {
        let mut cursor = Cursor::new(data);
        if cursor.read_exact(4)? != WIRE_MAGIC {
            return Err(WireError::InvalidMagic);
        }
        let version = cursor.read_u8()?;
        if version != WIRE_VERSION {
            return Err(WireError::UnsupportedVersion(version));
        }
        let tag = cursor.read_u8()?;
        match tag {
            TAG_GC_UPDATE => {
                let did = DistributedId(cursor.read_u64()?);
                let kind_byte = cursor.read_u8()?;
                let kind =
                    ReferenceKind::from_u8(kind_byte).ok_or(WireError::InvalidTag(kind_byte))?;
                let add = cursor.read_u8()? == 1;
                let count = cursor.read_u32()?;
                Ok(Self::GcUpdate {
                    did,
                    update: GcUpdate { kind, add, count },
                })
            }
            TAG_REMOVE_REMOTE_DID => Ok(Self::RemoveRemoteDid {
                did: DistributedId(cursor.read_u64()?),
            }),
            TAG_CONSTRAINTS => {
                let id = ConstraintId(cursor.read_u64()?);
                let set = read_constraints(&mut cursor)?;
                Ok(Self::Constraints { id, set })
            }
            TAG_INSTANCE_MANAGER => {
                let did = DistributedId(cursor.read_u64()?);
                let owner_space = AddressSpace(cursor.read_u32()?);
                let memory = MemoryId(cursor.read_u32()?);
                let instance = read_instance(&mut cursor)?;
                let instance_domain = read_domain(&mut cursor)?;
                let region = read_region(&mut cursor)?;
                let use_event = Event(cursor.read_u64()?);
                let flags = InstanceFlags(cursor.read_u32()?);
                let has_local = cursor.read_u8()? == 1;
                let constraint_id = ConstraintId(cursor.read_u64()?);
                let allocated_fields = read_field_mask(&mut cursor)?;
                Ok(Self::InstanceManager {
                    did,
                    owner_space,
                    memory,
                    instance,
                    instance_domain,
                    region,
                    use_event,
                    flags,
                    layout: LayoutPayload {
                        has_local,
                        constraint_id,
                        allocated_fields,
                    },
                })
            }
            TAG_REDUCTION_MANAGER => {
                let did = DistributedId(cursor.read_u64()?);
                let owner_space = AddressSpace(cursor.read_u32()?);
                let memory = MemoryId(cursor.read_u32()?);
                let instance = read_instance(&mut cursor)?;
                let instance_domain = read_domain(&mut cursor)?;
                let region = read_region(&mut cursor)?;
                let redop = ReductionOpId(cursor.read_u32()?);
                let logical_field = FieldId(cursor.read_u32()?);
                let foldable = cursor.read_u8()? == 1;
                let ptr_space = if cursor.read_u8()? == 1 {
                    Some(read_domain(&mut cursor)?)
                } else {
                    None
                };
                let use_event = Event(cursor.read_u64()?);
                Ok(Self::ReductionManager {
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
                })
            }
            other => Err(WireError::UnknownMessage(other)),
        }
    }
}

// ---------------------------------------------------------------------------
// Serialization helpers
// ---------------------------------------------------------------------------

fn write_u32(buf: &mut Vec<u8>, value: u32) {
    buf.extend_from_slice(&value.to_le_bytes());
}

fn write_u64(buf: &mut Vec<u8>, value: u64) {
    buf.extend_from_slice(&value.to_le_bytes());
}

fn write_i64(buf: &mut Vec<u8>, value: i64) {
    buf.extend_from_slice(&value.to_le_bytes());
}

fn write_field_mask(buf: &mut Vec<u8>, mask: FieldMask) {
    for word in mask.to_words() {
        write_u64(buf, word);
    }
}

fn write_instance(buf: &mut Vec<u8>, instance: PhysicalInstance) {
    write_u64(buf, instance.id.0);
    write_u32(buf, instance.memory.0);
    write_u64(buf, instance.size as u64);
}

fn write_region(buf: &mut Vec<u8>, region: LogicalRegion) {
    write_u32(buf, region.tree_id.0);
    write_u64(buf, region.index_space.0);
    write_u32(buf, region.field_space.0);
}

fn write_rect<const DIM: usize>(buf: &mut Vec<u8>, rect: &Rect<DIM>) {
    for d in 0..DIM {
        write_i64(buf, rect.lo[d]);
    }
    for d in 0..DIM {
        write_i64(buf, rect.hi[d]);
    }
}

fn write_domain(buf: &mut Vec<u8>, domain: &Domain) {
    buf.push(domain.dim());
    match domain {
        Domain::Unstructured(mask) => {
            write_u64(buf, mask.span() as u64);
            write_u32(buf, mask.words().len() as u32);
            for &word in mask.words() {
                write_u64(buf, word);
            }
        }
        Domain::Rect1(rect) => write_rect(buf, rect),
        Domain::Rect2(rect) => write_rect(buf, rect),
        Domain::Rect3(rect) => write_rect(buf, rect),
    }
}

fn write_constraints(buf: &mut Vec<u8>, set: &LayoutConstraintSet) {
    buf.push(set.specialization.as_u8());
    write_u32(buf, set.reduction_op.0);
    write_u32(buf, set.fields.field_set.len() as u32);
    for field in &set.fields.field_set {
        write_u32(buf, field.0);
    }
    write_u32(buf, set.ordering.ordering.len() as u32);
    for dim in &set.ordering.ordering {
        buf.push(dim.as_u8());
    }
}

// ---------------------------------------------------------------------------
// Deserialization cursor
// ---------------------------------------------------------------------------

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn read_exact(&mut self, n: usize) -> Result<&'a [u8], WireError> {
        if self.pos + n > self.data.len() {
            return Err(WireError::UnexpectedEof);
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn read_u8(&mut self) -> Result<u8, WireError> {
        Ok(self.read_exact(1)?[0])
    }

    fn read_u32(&mut self) -> Result<u32, WireError> {
        let bytes = self.read_exact(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn read_u64(&mut self) -> Result<u64, WireError> {
        let bytes = self.read_exact(8)?;
        Ok(u64::from_le_bytes([
            bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
        ]))
    }

    fn read_i64(&mut self) -> Result<i64, WireError> {
        Ok(self.read_u64()? as i64)
    }
}

fn read_field_mask(cursor: &mut Cursor<'_>) -> Result<FieldMask, WireError> {
    let mut words = [0u64; crate::types::MAX_FIELDS / 64];
    for word in &mut words {
        *word = cursor.read_u64()?;
    }
    Ok(FieldMask::from_words(words))
}

fn read_instance(cursor: &mut Cursor<'_>) -> Result<PhysicalInstance, WireError> {
    Ok(PhysicalInstance {
        id: InstanceId(cursor.read_u64()?),
        memory: MemoryId(cursor.read_u32()?),
        size: cursor.read_u64()? as usize,
    })
}

fn read_region(cursor: &mut Cursor<'_>) -> Result<LogicalRegion, WireError> {
    Ok(LogicalRegion {
        tree_id: TreeId(cursor.read_u32()?),
        index_space: IndexSpaceId(cursor.read_u64()?),
        field_space: FieldSpaceId(cursor.read_u32()?),
    })
}

fn read_rect<const DIM: usize>(cursor: &mut Cursor<'_>) -> Result<Rect<DIM>, WireError> {
    let mut lo = [0i64; DIM];
    let mut hi = [0i64; DIM];
    for value in &mut lo {
        *value = cursor.read_i64()?;
    }
    for value in &mut hi {
        *value = cursor.read_i64()?;
    }
    Ok(Rect::new(lo, hi))
}

fn read_domain(cursor: &mut Cursor<'_>) -> Result<Domain, WireError> {
    let dim = cursor.read_u8()?;
    match dim {
        0 => {
            let span = cursor.read_u64()? as usize;
            let word_count = cursor.read_u32()? as usize;
            let mut words = Vec::with_capacity(word_count);
            for _ in 0..word_count {
                words.push(cursor.read_u64()?);
            }
            Ok(Domain::Unstructured(ElementMask::from_words(span, words)))
        }
        1 => Ok(Domain::Rect1(read_rect(cursor)?)),
        2 => Ok(Domain::Rect2(read_rect(cursor)?)),
        3 => Ok(Domain::Rect3(read_rect(cursor)?)),
        other => Err(WireError::InvalidTag(other)),
    }
}

fn read_constraints(cursor: &mut Cursor<'_>) -> Result<LayoutConstraintSet, WireError> {
    let specialization_byte = cursor.read_u8()?;
    let specialization = SpecializationKind::from_u8(specialization_byte)
        .ok_or(WireError::InvalidTag(specialization_byte))?;
    let reduction_op = ReductionOpId(cursor.read_u32()?);
    let field_count = cursor.read_u32()? as usize;
    let mut field_set = Vec::with_capacity(field_count);
    for _ in 0..field_count {
        field_set.push(FieldId(cursor.read_u32()?));
    }
    let ordering_count = cursor.read_u32()? as usize;
    let mut ordering = Vec::with_capacity(ordering_count);
    for _ in 0..ordering_count {
        let dim_byte = cursor.read_u8()?;
        ordering.push(DimensionKind::from_u8(dim_byte).ok_or(WireError::InvalidTag(dim_byte))?);
    }
    Ok(LayoutConstraintSet {
        specialization,
        reduction_op,
        fields: crate::layout::constraint::FieldConstraint::new(field_set),
        ordering: crate::layout::constraint::OrderingConstraint::new(ordering),
    })
}
