//! Decoding of raw change-record batches.
//!
//! A completed asynchronous read leaves the registration's buffer holding a
//! singly-linked chain of variable-length records. Each record starts with
//! three little-endian `u32` fields: the offset from this record to the next
//! one (0 marks the last record), the native action code, and the length of
//! the entry name in bytes. The name follows immediately as UTF-16LE code
//! units with no terminator. The layout is produced by the operating system,
//! not by this crate, so it is decoded field by field rather than through a
//! struct cast.

use crate::event::EventKind;
use std::ffi::OsString;
use std::fmt;

pub(crate) const FILE_ACTION_ADDED: u32 = 1;
pub(crate) const FILE_ACTION_REMOVED: u32 = 2;
pub(crate) const FILE_ACTION_MODIFIED: u32 = 3;
pub(crate) const FILE_ACTION_RENAMED_OLD_NAME: u32 = 4;
pub(crate) const FILE_ACTION_RENAMED_NEW_NAME: u32 = 5;

const RECORD_HEADER_LEN: usize = 12;

/// Maps a native action code to the crate's event vocabulary.
///
/// Both halves of a rename map onto create/delete. Codes outside the known
/// set yield `None` and are dropped by the caller; the OS defines more codes
/// than the public event vocabulary covers.
pub(crate) fn action_kind(action: u32) -> Option<EventKind> {
    match action {
        FILE_ACTION_ADDED | FILE_ACTION_RENAMED_NEW_NAME => Some(EventKind::Created),
        FILE_ACTION_REMOVED | FILE_ACTION_RENAMED_OLD_NAME => Some(EventKind::Deleted),
        FILE_ACTION_MODIFIED => Some(EventKind::Modified),
        _ => None,
    }
}

/// Converts the UTF-16 code units of an entry name into an `OsString`.
#[cfg(windows)]
pub(crate) fn name_to_os(units: &[u16]) -> OsString {
    use std::os::windows::ffi::OsStringExt;
    OsString::from_wide(units)
}

#[cfg(not(windows))]
pub(crate) fn name_to_os(units: &[u16]) -> OsString {
    OsString::from(String::from_utf16_lossy(units))
}

/// One raw record pulled out of a batch.
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct RawRecord {
    pub action: u32,
    pub name: Vec<u16>,
}

/// A structurally invalid batch. Fatal for the current batch only; the
/// worker logs it and keeps the registration running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct DecodeError {
    offset: usize,
    reason: &'static str,
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} at offset {}", self.reason, self.offset)
    }
}

/// Returns a lazy, finite, one-shot iterator over the records in `buf`.
///
/// The iterator ends after the record whose next-entry offset is 0, or after
/// yielding a single `Err` for a malformed batch.
pub(crate) fn records(buf: &[u8]) -> Records<'_> {
    Records {
        buf,
        next: 0,
        done: buf.is_empty(),
    }
}

pub(crate) struct Records<'a> {
    buf: &'a [u8],
    next: usize,
    done: bool,
}

impl Records<'_> {
    fn fail(&mut self, offset: usize, reason: &'static str) -> Option<Result<RawRecord, DecodeError>> {
        self.done = true;
        Some(Err(DecodeError { offset, reason }))
    }
}

impl Iterator for Records<'_> {
    type Item = Result<RawRecord, DecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let at = self.next;
        if at + RECORD_HEADER_LEN > self.buf.len() {
            return self.fail(at, "record header out of bounds");
        }
        let next_offset = read_u32(self.buf, at) as usize;
        let action = read_u32(self.buf, at + 4);
        let name_len = read_u32(self.buf, at + 8) as usize;
        if name_len % 2 != 0 {
            return self.fail(at, "odd name length");
        }
        let name_end = at + RECORD_HEADER_LEN + name_len;
        if name_end > self.buf.len() {
            return self.fail(at, "entry name out of bounds");
        }
        let name = self.buf[at + RECORD_HEADER_LEN..name_end]
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        if next_offset == 0 {
            self.done = true;
        } else if next_offset < RECORD_HEADER_LEN {
            // a forward offset into this record's own header cannot be valid
            return self.fail(at, "non-advancing next-entry offset");
        } else {
            self.next = at + next_offset;
        }
        Some(Ok(RawRecord { action, name }))
    }
}

fn read_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}
