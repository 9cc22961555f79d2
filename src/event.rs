//! Opaque readiness tokens.
//!
//! The instance core never blocks: any operation with an asynchronous
//! completion hands back an [`Event`] minted by the runtime, and the caller
//! composes events through the external event graph. Inside this crate an
//! event is purely a token to thread through copy requests and deferred
//! deletions.

use core::fmt;

/// An opaque readiness token.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Event(pub u64);

impl Event {
    /// The absent event: already triggered, conditions nothing.
    pub const NONE: Self = Self(0);

    /// Returns true if this is a real event rather than [`Event::NONE`].
    #[must_use]
    pub const fn exists(self) -> bool {
        self.0 != 0
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.exists() {
            write!(f, "Event({})", self.0)
        } else {
            write!(f, "Event(none)")
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.exists() {
            write!(f, "E{}", self.0)
        } else {
            write!(f, "E-")
        }
    }
}
