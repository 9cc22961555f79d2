//! Distributed two-color reference counting.
//!
//! Every distributed collectable carries two unsigned counters. The
//! *resource* counter tracks reachability: it is positive while any local
//! user or remote node holds the object active. The *valid* counter tracks
//! whether any holder needs the backing contents to stay readable. Each
//! remote node aggregates its own share into a single unit and forwards only
//! its 0→1 and →0 edges to the owner, so the owner's counters count nodes,
//! not references.
//!
//! # State Transitions
//!
//! ```text
//!  inactive/invalid ──(add resource)──> active/invalid
//!  active/invalid ───(add valid)─────> active/valid
//!  active/valid ─────(remove valid)──> active/invalid
//!  active/invalid ───(remove resource)> inactive/invalid (dropped)
//! ```
//!
//! Transitions are reported to the caller as [`ResourceTransition`] /
//! [`ValidTransition`] values; the manager layer turns them into memory
//! hints, owner destruction, and peer deltas. The counters themselves are
//! pure state: serialization is the caller's single mutex.

use core::fmt;

// ---------------------------------------------------------------------------
// ReferenceKind / GcUpdate
// ---------------------------------------------------------------------------

/// Which counter a reference delta targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReferenceKind {
    /// Reachability references.
    Resource,
    /// Readable-contents references.
    Valid,
}

impl ReferenceKind {
    pub(crate) const fn as_u8(self) -> u8 {
        match self {
            Self::Resource => 0,
            Self::Valid => 1,
        }
    }

    pub(crate) const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Resource),
            1 => Some(Self::Valid),
            _ => None,
        }
    }
}

/// A reference-count delta forwarded from a remote node to the owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GcUpdate {
    /// The targeted counter.
    pub kind: ReferenceKind,
    /// True for an add, false for a remove.
    pub add: bool,
    /// Number of references; remote aggregation makes this 1 in practice.
    pub count: u32,
}

// ---------------------------------------------------------------------------
// Lifecycle state
// ---------------------------------------------------------------------------

/// The externally visible lifecycle state of a collectable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleState {
    /// No holders anywhere; eligible for destruction once it has been active.
    InactiveInvalid,
    /// Reachable, contents not promised readable.
    ActiveInvalid,
    /// Reachable with readable contents.
    ActiveValid,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::InactiveInvalid => "inactive/invalid",
            Self::ActiveInvalid => "active/invalid",
            Self::ActiveValid => "active/valid",
        };
        write!(f, "{s}")
    }
}

/// Outcome of a resource-counter mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceTransition {
    /// The counter stayed positive (or stayed zero-add coalesced).
    None,
    /// The counter went 0 → positive.
    Activated,
    /// The counter returned to zero.
    Deactivated,
}

/// Outcome of a valid-counter mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidTransition {
    /// The counter stayed positive.
    None,
    /// The counter went 0 → positive.
    Validated,
    /// The counter returned to zero.
    Invalidated,
}

/// A violated counting contract; the caller turns this into an abort.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcViolation {
    /// Remove exceeded the counter.
    Underflow(ReferenceKind),
    /// A mutation arrived after destruction.
    AfterDestruction,
    /// A valid reference was added while the object was inactive.
    ValidWhileInactive,
    /// The last resource reference was released while valid references
    /// remained; holders must drop validity first.
    ReleasedWhileValid,
}

impl fmt::Display for GcViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Underflow(ReferenceKind::Resource) => write!(f, "resource reference underflow"),
            Self::Underflow(ReferenceKind::Valid) => write!(f, "valid reference underflow"),
            Self::AfterDestruction => write!(f, "reference update after destruction"),
            Self::ValidWhileInactive => write!(f, "valid reference added while inactive"),
            Self::ReleasedWhileValid => write!(f, "resource references released while still valid"),
        }
    }
}

// ---------------------------------------------------------------------------
// RefCounts
// ---------------------------------------------------------------------------

/// The two counters of one collectable, plus destruction latching.
#[derive(Debug, Clone, Copy, Default)]
pub struct RefCounts {
    resource: u64,
    valid: u64,
    ever_active: bool,
    destroyed: bool,
}

impl RefCounts {
    /// Fresh counters in the inactive/invalid state.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            resource: 0,
            valid: 0,
            ever_active: false,
            destroyed: false,
        }
    }

    /// Current lifecycle state.
    #[must_use]
    pub const fn state(&self) -> LifecycleState {
        if self.resource == 0 {
            LifecycleState::InactiveInvalid
        } else if self.valid == 0 {
            LifecycleState::ActiveInvalid
        } else {
            LifecycleState::ActiveValid
        }
    }

    /// The resource counter.
    #[must_use]
    pub const fn resource(&self) -> u64 {
        self.resource
    }

    /// The valid counter.
    #[must_use]
    pub const fn valid(&self) -> u64 {
        self.valid
    }

    /// True once destruction has latched.
    #[must_use]
    pub const fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    /// Adds resource references.
    pub fn add_resource(&mut self, count: u32) -> Result<ResourceTransition, GcViolation> {
        if self.destroyed {
            return Err(GcViolation::AfterDestruction);
        }
        let was_zero = self.resource == 0;
        self.resource += u64::from(count);
        if was_zero && count > 0 {
            self.ever_active = true;
            Ok(ResourceTransition::Activated)
        } else {
            Ok(ResourceTransition::None)
        }
    }

    /// Removes resource references.
    pub fn remove_resource(&mut self, count: u32) -> Result<ResourceTransition, GcViolation> {
        if self.destroyed {
            return Err(GcViolation::AfterDestruction);
        }
        let count = u64::from(count);
        if count > self.resource {
            return Err(GcViolation::Underflow(ReferenceKind::Resource));
        }
        if self.resource == count && self.valid > 0 {
            return Err(GcViolation::ReleasedWhileValid);
        }
        let was_positive = self.resource > 0;
        self.resource -= count;
        if was_positive && self.resource == 0 {
            Ok(ResourceTransition::Deactivated)
        } else {
            Ok(ResourceTransition::None)
        }
    }

    /// Adds valid references; requires the object to be active.
    pub fn add_valid(&mut self, count: u32) -> Result<ValidTransition, GcViolation> {
        if self.destroyed {
            return Err(GcViolation::AfterDestruction);
        }
        if self.resource == 0 {
            return Err(GcViolation::ValidWhileInactive);
        }
        let was_zero = self.valid == 0;
        self.valid += u64::from(count);
        if was_zero && count > 0 {
            Ok(ValidTransition::Validated)
        } else {
            Ok(ValidTransition::None)
        }
    }

    /// Removes valid references.
    pub fn remove_valid(&mut self, count: u32) -> Result<ValidTransition, GcViolation> {
        if self.destroyed {
            return Err(GcViolation::AfterDestruction);
        }
        let count = u64::from(count);
        if count > self.valid {
            return Err(GcViolation::Underflow(ReferenceKind::Valid));
        }
        let was_positive = self.valid > 0;
        self.valid -= count;
        if was_positive && self.valid == 0 {
            Ok(ValidTransition::Invalidated)
        } else {
            Ok(ValidTransition::None)
        }
    }

    /// True when the owner should destroy: both counters back to zero after
    /// having been positive, destruction not yet latched.
    #[must_use]
    pub const fn ready_to_destroy(&self) -> bool {
        self.resource == 0 && self.valid == 0 && self.ever_active && !self.destroyed
    }

    /// Latches destruction; later mutations are violations.
    pub fn mark_destroyed(&mut self) {
        self.destroyed = true;
    }
}
