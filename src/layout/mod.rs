//! Layout constraints and layout descriptions.
//!
//! A layout constraint set says *what* an allocation should look like (which
//! fields, in what dimension order, with what specialization); a layout
//! description says *where* each field landed once an allocation exists.
//! Constraint sets are interned content-addressed so peers can name them by
//! id; descriptions are shared per field space and cached per copy mask.

pub mod constraint;
pub mod description;

pub use constraint::{
    ConstraintRegistry, DimensionKind, FieldConstraint, FieldPlacement, InternedConstraints,
    LayoutConstraintSet, OrderingConstraint, SpecializationKind,
};
pub use description::{CopySrcDstField, FieldInfo, LayoutDescription, LayoutPayload};
