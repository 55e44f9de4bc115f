//! The seam between the watch engine and the operating system's
//! asynchronous notification facility.
//!
//! Exactly one implementation talks to a real kernel per target OS (see
//! [`WindowsSource`](crate::WindowsSource)); everything above this trait is
//! portable. The trait is deliberately narrow: open and fingerprint a
//! directory, start or cancel one asynchronous read on it, and block for the
//! next completion from the shared queue.

use crate::error::Result;
use crate::event::Interest;
use enumflags2::BitFlags;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

/// Completion token identifying one outstanding asynchronous read.
///
/// `Token::WAKEUP` is reserved for the control-request wakeup signal and is
/// never assigned to a registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Token(pub u64);

impl Token {
    /// The reserved token posted to interrupt the worker's wait so that it
    /// drains pending control requests.
    pub const WAKEUP: Token = Token(0);
}

/// Stable identity of an open directory, independent of the path string used
/// to reach it.
///
/// Two registrations of the same directory via different spellings (a
/// symlink and its target, say) produce equal identities and share one
/// native registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct DirectoryIdentity {
    /// Serial number of the volume holding the directory.
    pub volume_serial: u64,
    /// The volume-relative file identifier.
    pub file_id: u128,
}

impl DirectoryIdentity {
    /// Creates an identity from its raw parts.
    pub fn new(volume_serial: u64, file_id: u128) -> Self {
        DirectoryIdentity {
            volume_serial,
            file_id,
        }
    }

    /// Creates an identity from the split file-index representation reported
    /// by the OS handle-information query.
    pub fn from_index_parts(volume_serial: u32, index_high: u32, index_low: u32) -> Self {
        let index = (u64::from(index_high) << 32) | u64::from(index_low);
        DirectoryIdentity {
            volume_serial: volume_serial.into(),
            file_id: index.into(),
        }
    }
}

/// What one dequeued completion means.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionKind {
    /// The read completed and left `len` bytes of change records in the
    /// registration's buffer. `len == 0` is an OS quirk meaning the buffer
    /// overflowed even though no error was reported.
    Events {
        /// Valid byte count in the registration's buffer.
        len: usize,
    },
    /// The change buffer filled before it was drained.
    Overflow,
    /// The read failed with a native error code.
    Failure(u32),
}

/// One completion pulled from the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion {
    /// The token the completed operation was associated under.
    pub token: Token,
    /// The outcome.
    pub kind: CompletionKind,
}

impl Completion {
    /// The completion posted by [`NotificationSource::wakeup`].
    pub fn wakeup() -> Self {
        Completion {
            token: Token::WAKEUP,
            kind: CompletionKind::Events { len: 0 },
        }
    }
}

/// Default capacity of a registration's batch buffer.
pub const BATCH_BUFFER_SIZE: usize = 16 * 1024;

/// A registration's reusable change-record buffer.
///
/// Clones share one underlying allocation: the source keeps a clone while a
/// read is outstanding and fills it, the worker reads it after the matching
/// completion arrives. The arm-after-decode discipline of the worker loop
/// guarantees the two never touch the bytes at the same time.
#[derive(Clone)]
pub struct BatchBuffer {
    inner: Arc<Mutex<Box<[u8]>>>,
}

impl BatchBuffer {
    /// Creates a buffer with the default capacity.
    pub fn new() -> Self {
        Self::with_capacity(BATCH_BUFFER_SIZE)
    }

    /// Creates a buffer with the given capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        BatchBuffer {
            inner: Arc::new(Mutex::new(vec![0u8; capacity].into_boxed_slice())),
        }
    }

    /// Total capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Overwrites the buffer with `bytes`, truncating to capacity.
    /// Returns the number of bytes copied.
    pub fn fill(&self, bytes: &[u8]) -> usize {
        let mut data = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let len = bytes.len().min(data.len());
        data[..len].copy_from_slice(&bytes[..len]);
        len
    }

    /// Reads the first `len` valid bytes. `len` is clamped to capacity.
    pub fn read<R>(&self, len: usize, f: impl FnOnce(&[u8]) -> R) -> R {
        let data = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let len = len.min(data.len());
        f(&data[..len])
    }

    /// Base pointer and capacity for handing the storage to the OS. The
    /// allocation is stable for the life of the buffer; the caller must
    /// guarantee no concurrent access while a read is outstanding.
    #[cfg(windows)]
    pub(crate) fn raw_parts(&self) -> (*mut u8, usize) {
        let mut data = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        (data.as_mut_ptr(), data.len())
    }
}

impl Default for BatchBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for BatchBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchBuffer")
            .field("capacity", &self.capacity())
            .finish()
    }
}

/// A directory-change notification facility.
///
/// The worker thread is the only caller of every method except
/// [`wakeup`](NotificationSource::wakeup), which other threads use to
/// interrupt [`wait`](NotificationSource::wait).
pub trait NotificationSource: Send + Sync + 'static {
    /// An open directory handle.
    type Handle: Send;

    /// Opens `dir` for change notification, requesting backup semantics and
    /// asynchronous mode, and verifies that the opened object really is a
    /// directory.
    fn open(&self, dir: &Path) -> Result<Self::Handle>;

    /// Reports the stable identity of an open directory.
    fn identity(&self, handle: &Self::Handle) -> Result<DirectoryIdentity>;

    /// Associates `handle` with the completion queue under `token`, so that
    /// completions for reads on it are attributed to that token.
    fn associate(&self, handle: &Self::Handle, token: Token) -> Result<()>;

    /// Starts one asynchronous read of change records into `buffer`.
    ///
    /// On failure no completion will ever arrive for this attempt; the
    /// caller must record that so a later disarm is skipped.
    fn arm(
        &self,
        handle: &Self::Handle,
        buffer: &BatchBuffer,
        interest: BitFlags<Interest>,
        watch_subtree: bool,
    ) -> Result<()>;

    /// Cancels the outstanding read on `handle` and blocks briefly until the
    /// cancellation is confirmed. Must not be called for a registration
    /// whose arm failed.
    fn disarm(&self, handle: &Self::Handle);

    /// Releases the directory handle. Always safe after `disarm`.
    fn close(&self, handle: Self::Handle);

    /// Blocks until the next completion is available. An `Err` is fatal to
    /// the worker loop.
    fn wait(&self) -> Result<Completion>;

    /// Posts the reserved wakeup token to the completion queue. Callable
    /// from any thread.
    fn wakeup(&self) -> Result<()>;

    /// Releases the completion queue. Called once, by the worker, on
    /// shutdown.
    fn shutdown(&self);
}
