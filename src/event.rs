//! Event types delivered to watch keys.

use enumflags2::{bitflags, BitFlags};
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// The logical kind of one directory change.
///
/// The operating system reports a wider vocabulary of action codes; they are
/// collapsed into this closed set. A rename is reported as a `Deleted` for
/// the old name followed by a `Created` for the new name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum EventKind {
    /// An entry appeared in the watched directory.
    Created,
    /// An entry disappeared from the watched directory.
    Deleted,
    /// An entry's contents or metadata changed.
    Modified,
    /// The change buffer filled before it was drained, so some changes were
    /// not reported individually. Treat the directory as dirty and rescan.
    Overflow,
}

impl EventKind {
    /// Whether an event of this kind passes the given interest mask.
    /// Overflow is always delivered.
    pub(crate) fn matches(self, interest: BitFlags<Interest>) -> bool {
        match self {
            EventKind::Created => interest.contains(Interest::Create),
            EventKind::Deleted => interest.contains(Interest::Delete),
            EventKind::Modified => interest.contains(Interest::Modify),
            EventKind::Overflow => true,
        }
    }
}

/// The change kinds a caller wants delivered for one registration.
#[bitflags]
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Interest {
    /// Deliver [`EventKind::Created`] events.
    Create = 0b001,
    /// Deliver [`EventKind::Deleted`] events.
    Delete = 0b010,
    /// Deliver [`EventKind::Modified`] events.
    Modify = 0b100,
}

/// One decoded directory change, delivered through a [`WatchKey`](crate::WatchKey).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    /// What happened.
    pub kind: EventKind,
    /// The changed entry, resolved against the watched directory's path.
    /// `None` for [`EventKind::Overflow`], which carries no name payload.
    pub path: Option<PathBuf>,
}

impl Event {
    pub(crate) fn new(kind: EventKind, path: PathBuf) -> Self {
        Event {
            kind,
            path: Some(path),
        }
    }

    pub(crate) fn overflow() -> Self {
        Event {
            kind: EventKind::Overflow,
            path: None,
        }
    }
}
