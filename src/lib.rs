//! Asynchronous directory change notification.
//!
//! A [`WatchService`] owns one background worker thread that multiplexes any
//! number of watched directories over a single OS completion queue. Callers
//! register a directory and get back a [`WatchKey`] from which they poll or
//! block for [`Event`]s.
//!
//! # Example
//!
//! ```no_run
//! # fn run() -> dirwatch::Result<()> {
//! use dirwatch::{Interest, WatchService};
//!
//! # #[cfg(windows)]
//! # {
//! let service = WatchService::new()?;
//! let key = service.register(r"C:\projects", Interest::Create | Interest::Delete, true)?;
//! while let Ok(event) = key.take() {
//!     println!("{:?}: {:?}", event.kind, event.path);
//! }
//! # }
//! # Ok(())
//! # }
//! ```
//!
//! # Semantics
//!
//! - Registering a directory that is already watched (under any path
//!   spelling) updates the existing registration and returns the same key.
//! - Events for one directory are delivered in the order the OS reported
//!   them. A rename appears as a delete of the old name followed by a
//!   create of the new name.
//! - When the OS drops changes because a batch buffer filled up, the key
//!   receives a single [`EventKind::Overflow`] event and watching resumes.
//! - Cancelling a key and closing the service are idempotent. A thread
//!   blocked in [`WatchKey::take`] observes termination as an error once
//!   the key's queue is drained.

#![deny(missing_docs)]

pub use crate::error::{Error, ErrorKind, Result};
pub use crate::event::{Event, EventKind, Interest};
pub use crate::service::{WatchKey, WatchService};
pub use crate::source::{
    BatchBuffer, Completion, CompletionKind, DirectoryIdentity, NotificationSource, Token,
};
#[cfg(windows)]
pub use crate::windows::{DirHandle, WindowsSource};

pub use enumflags2::BitFlags;

mod decoder;
mod error;
mod event;
mod service;
mod source;
mod table;
#[cfg(test)]
mod test;
#[cfg(windows)]
mod windows;
