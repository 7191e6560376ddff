//! Core type definitions for DocMap.

use std::fmt;

/// Session-local identity of a document instance.
///
/// Derived from the address of the shared document allocation, so two
/// handles have the same `Oid` exactly when they point at the same
/// instance. Only meaningful while the instance is alive; the unit of
/// work keeps every tracked instance alive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Oid(usize);

impl Oid {
    /// Creates an `Oid` from a raw value.
    #[must_use]
    pub const fn from_raw(raw: usize) -> Self {
        Self(raw)
    }

    /// Returns the raw value.
    #[must_use]
    pub const fn as_raw(self) -> usize {
        self.0
    }
}

impl fmt::Display for Oid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "oid:{:x}", self.0)
    }
}

/// Lifecycle state of a document relative to one unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DocumentState {
    /// Not known to the unit of work.
    New,
    /// Tracked, with an identity once written.
    Managed,
    /// Scheduled for deletion; still in the identity map until the delete
    /// succeeds.
    Removed,
    /// Was managed, no longer tracked.
    Detached,
}

impl fmt::Display for DocumentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::New => "new",
            Self::Managed => "managed",
            Self::Removed => "removed",
            Self::Detached => "detached",
        })
    }
}
