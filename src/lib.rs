//! Regolith: distributed physical-instance management for region-based task
//! parallelism.
//!
//! # Overview
//!
//! Tasks in the enclosing runtime declare access to logical regions; before
//! a task runs, those regions must exist as concrete allocations in specific
//! memories. Regolith is that layer: it decides how fields pack into an
//! allocation, tracks which copies are reachable from which node, and keeps
//! every allocation alive exactly as long as some view of it is reachable
//! anywhere in the cluster.
//!
//! # Core Guarantees
//!
//! - **Deterministic copy ordering**: copy descriptors for the same mask are
//!   emitted in mask-bit order on every node, so source and destination
//!   lists always pair up
//! - **Two-color lifecycles**: reachability and validity are independent
//!   counters; an allocation is destroyed exactly once, the first time both
//!   return to zero after having been positive
//! - **Owner-anchored distribution**: every manager has one owning node;
//!   proxies forward aggregate reference edges and are revoked by the owner
//!   at destruction
//! - **Content-addressed metadata**: constraint sets intern to ids that are
//!   equal on every node for equal content, so layouts travel as ids
//! - **No blocking in the core**: anything asynchronous returns an event
//!   token for the external event graph
//!
//! # Module Structure
//!
//! - [`types`]: identifiers, field masks, index domains
//! - [`event`]: opaque readiness tokens
//! - [`layout`]: constraint sets, interning, layout descriptions
//! - [`forest`]: the region-tree slice the instance core consumes
//! - [`gc`]: the distributed reference-counting core
//! - [`memory`]: memories, allocation handles, instance bookkeeping
//! - [`manager`]: physical managers and the instance builder
//! - [`reduction`]: reduction operators and their table
//! - [`wire`]: the cross-node message codec
//! - [`runtime`]: the explicitly threaded runtime handle
//! - [`config`]: runtime configuration
//! - [`error`]: error types

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_possible_wrap)]
#![allow(clippy::cast_sign_loss)]

pub mod config;
pub mod error;
pub mod event;
pub mod forest;
pub mod gc;
pub mod layout;
pub mod manager;
pub mod memory;
pub mod reduction;
pub mod runtime;
pub mod types;
pub mod wire;

pub use config::RuntimeConfig;
pub use error::{Error, ErrorKind, Result, ResultExt};
pub use event::Event;
pub use forest::{LogicalRegion, RegionTreeForest};
pub use layout::{
    ConstraintRegistry, CopySrcDstField, DimensionKind, LayoutConstraintSet, LayoutDescription,
    SpecializationKind,
};
pub use manager::builder::InstanceBuilder;
pub use manager::{ManagerKind, PhysicalManager};
pub use memory::{InstanceFlags, MemoryManager, PhysicalInstance};
pub use reduction::{ReductionOp, ReductionOpTable, SumReductionI64};
pub use runtime::{NullTransport, Runtime, Transport};
pub use types::{
    AddressSpace, ContextUid, DistributedId, Domain, FieldId, FieldMask, GcPriority, MemoryId,
    Rect, ReductionOpId, ViewId,
};
pub use wire::Message;
