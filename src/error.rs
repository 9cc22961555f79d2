//! Error types and error handling strategy for Regolith.
//!
//! Fallible operations at the crate boundary return typed errors; internal
//! contract violations (a caller handing a layout a field it never allocated,
//! counter underflow on a manager) are bugs in the caller and abort with a
//! diagnostic naming the offending object. Errors never cross the wire: the
//! codec has its own error type and receive paths convert at the edge.

use core::fmt;
use std::sync::Arc;

/// The kind of error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    // === Layouts / field spaces ===
    /// A field id is not present in the layout or field space.
    UnknownField,
    /// A constraint id could not be resolved locally.
    UnknownConstraint,

    // === Region tree ===
    /// A logical region handle has no node in the forest.
    UnknownRegion,
    /// Two region nodes share no ancestor.
    NoCommonAncestor,

    // === Memories / allocation ===
    /// A memory id has no registered memory manager.
    UnknownMemory,
    /// The target memory could not satisfy an allocation request.
    InstanceExhausted,

    // === Reductions ===
    /// A reduction op id has no entry in the reduction-op table.
    UnknownReductionOp,

    // === Protocol ===
    /// A message payload failed to decode.
    Wire,
    /// A distributed id has no collectable registered locally.
    UnknownCollectable,

    // === Internal / state machine ===
    /// A code path that exists in the protocol but is not implemented.
    Unimplemented,
    /// Invalid lifecycle transition.
    InvalidStateTransition,
    /// Internal invariant violation (bug).
    Internal,
}

/// The main error type for Regolith operations.
#[derive(Debug, Clone)]
pub struct Error {
    kind: ErrorKind,
    context: Option<String>,
    source: Option<Arc<dyn std::error::Error + Send + Sync>>,
}

impl Error {
    /// Creates a new error with the given kind.
    #[must_use]
    pub const fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            context: None,
            source: None,
        }
    }

    /// Returns the error kind.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Adds deterministic context text to the error.
    #[must_use]
    pub fn with_context(mut self, ctx: impl Into<String>) -> Self {
        self.context = Some(ctx.into());
        self
    }

    /// Adds a source error to the chain.
    #[must_use]
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Arc::new(source));
        self
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.kind)?;
        if let Some(ctx) = &self.context {
            write!(f, ": {ctx}")?;
        }
        Ok(())
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.as_ref().map(|e| e.as_ref() as _)
    }
}

/// Extension trait for adding context to Results.
pub trait ResultExt<T> {
    /// Attach a context string on error.
    fn context(self, ctx: impl Into<String>) -> Result<T>;
    /// Attach context computed lazily on error.
    fn with_context<F: FnOnce() -> String>(self, f: F) -> Result<T>;
}

impl<T, E: Into<Error>> ResultExt<T> for core::result::Result<T, E> {
    fn context(self, ctx: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.into().with_context(ctx))
    }

    fn with_context<F: FnOnce() -> String>(self, f: F) -> Result<T> {
        self.map_err(|e| e.into().with_context(f()))
    }
}

/// A specialized Result type for Regolith operations.
pub type Result<T> = core::result::Result<T, Error>;
