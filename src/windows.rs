//! Windows backend: directory handles opened for overlapped reads of change
//! records, all completing on one I/O completion port.
//!
//! Each armed read hands the OS a heap-allocated overlapped block holding a
//! clone of the registration's buffer, so the storage stays alive for
//! however long the read is outstanding. The block is reclaimed when its
//! completion is dequeued, either by `wait` or by the drain `shutdown` runs
//! before closing the port. Cancellation blocks until the kernel has
//! retired the read, so a disarmed handle never has a write in flight.

use crate::error::{Error, Result};
use crate::event::Interest;
use crate::service::WatchService;
use crate::source::{BatchBuffer, Completion, CompletionKind, DirectoryIdentity, NotificationSource, Token};
use enumflags2::BitFlags;
use std::cell::Cell;
use std::io;
use std::os::windows::ffi::OsStrExt;
use std::path::Path;
use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use windows_sys::Win32::Foundation::{
    CloseHandle, GetLastError, ERROR_NOTIFY_ENUM_DIR, ERROR_OPERATION_ABORTED, HANDLE,
    INVALID_HANDLE_VALUE,
};
use windows_sys::Win32::Storage::FileSystem::{
    CreateFileW, GetFileInformationByHandle, ReadDirectoryChangesW, BY_HANDLE_FILE_INFORMATION,
    FILE_ATTRIBUTE_DIRECTORY, FILE_FLAG_BACKUP_SEMANTICS, FILE_FLAG_OVERLAPPED,
    FILE_LIST_DIRECTORY, FILE_NOTIFY_CHANGE_ATTRIBUTES, FILE_NOTIFY_CHANGE_CREATION,
    FILE_NOTIFY_CHANGE_DIR_NAME, FILE_NOTIFY_CHANGE_FILE_NAME, FILE_NOTIFY_CHANGE_LAST_WRITE,
    FILE_NOTIFY_CHANGE_SECURITY, FILE_NOTIFY_CHANGE_SIZE, FILE_SHARE_DELETE, FILE_SHARE_READ,
    FILE_SHARE_WRITE, OPEN_EXISTING,
};
use windows_sys::Win32::System::Threading::INFINITE;
use windows_sys::Win32::System::IO::{
    CancelIo, CreateIoCompletionPort, GetOverlappedResult, GetQueuedCompletionStatus,
    PostQueuedCompletionStatus, OVERLAPPED,
};

// every change category the OS can report; interest masks filter at
// dispatch, so a later interest change needs no new native read
const ALL_NOTIFY_FLAGS: u32 = FILE_NOTIFY_CHANGE_FILE_NAME
    | FILE_NOTIFY_CHANGE_DIR_NAME
    | FILE_NOTIFY_CHANGE_ATTRIBUTES
    | FILE_NOTIFY_CHANGE_SIZE
    | FILE_NOTIFY_CHANGE_LAST_WRITE
    | FILE_NOTIFY_CHANGE_CREATION
    | FILE_NOTIFY_CHANGE_SECURITY;

/// An open directory handle.
pub struct DirHandle {
    raw: HANDLE,
    // block of the outstanding read, if any; used by disarm to await the
    // cancellation result. The block itself is freed on packet dequeue.
    pending: Cell<*mut PendingRead>,
}

// the raw handle is only a kernel object reference; the worker thread is
// its sole user
unsafe impl Send for DirHandle {}

/// Overlapped block for one outstanding read. The buffer clone pins the
/// storage the OS writes into.
#[repr(C)]
struct PendingRead {
    overlapped: OVERLAPPED,
    _buffer: BatchBuffer,
}

/// Notification source backed by `ReadDirectoryChangesW` and an I/O
/// completion port.
pub struct WindowsSource {
    port: isize,
    closed: AtomicBool,
}

// holds only a kernel object reference and an atomic flag
unsafe impl Send for WindowsSource {}
unsafe impl Sync for WindowsSource {}

impl WindowsSource {
    /// Creates the shared completion port.
    pub fn new() -> Result<Self> {
        let port = unsafe { CreateIoCompletionPort(INVALID_HANDLE_VALUE, ptr::null_mut(), 0, 1) };
        if port.is_null() {
            return Err(Error::io(io::Error::last_os_error()));
        }
        Ok(WindowsSource {
            port: port as isize,
            closed: AtomicBool::new(false),
        })
    }

    fn port(&self) -> HANDLE {
        self.port as HANDLE
    }
}

impl NotificationSource for WindowsSource {
    type Handle = DirHandle;

    fn open(&self, dir: &Path) -> Result<DirHandle> {
        let mut wide: Vec<u16> = dir.as_os_str().encode_wide().collect();
        wide.push(0);
        let handle = unsafe {
            CreateFileW(
                wide.as_ptr(),
                FILE_LIST_DIRECTORY,
                FILE_SHARE_READ | FILE_SHARE_WRITE | FILE_SHARE_DELETE,
                ptr::null(),
                OPEN_EXISTING,
                FILE_FLAG_BACKUP_SEMANTICS | FILE_FLAG_OVERLAPPED,
                ptr::null_mut(),
            )
        };
        if handle == INVALID_HANDLE_VALUE {
            return Err(Error::io(io::Error::last_os_error()).add_path(dir.to_path_buf()));
        }
        let info = match handle_information(handle) {
            Ok(info) => info,
            Err(err) => {
                unsafe { CloseHandle(handle) };
                return Err(err.add_path(dir.to_path_buf()));
            }
        };
        if info.dwFileAttributes & FILE_ATTRIBUTE_DIRECTORY == 0 {
            unsafe { CloseHandle(handle) };
            return Err(Error::not_a_directory().add_path(dir.to_path_buf()));
        }
        Ok(DirHandle {
            raw: handle,
            pending: Cell::new(ptr::null_mut()),
        })
    }

    fn identity(&self, handle: &DirHandle) -> Result<DirectoryIdentity> {
        let info = handle_information(handle.raw)?;
        Ok(DirectoryIdentity::from_index_parts(
            info.dwVolumeSerialNumber,
            info.nFileIndexHigh,
            info.nFileIndexLow,
        ))
    }

    fn associate(&self, handle: &DirHandle, token: Token) -> Result<()> {
        let port =
            unsafe { CreateIoCompletionPort(handle.raw, self.port(), token.0 as usize, 0) };
        if port.is_null() {
            return Err(Error::io(io::Error::last_os_error()));
        }
        Ok(())
    }

    fn arm(
        &self,
        handle: &DirHandle,
        buffer: &BatchBuffer,
        _interest: BitFlags<Interest>,
        watch_subtree: bool,
    ) -> Result<()> {
        let (data, capacity) = buffer.raw_parts();
        let pending = Box::new(PendingRead {
            overlapped: unsafe { std::mem::zeroed() },
            _buffer: buffer.clone(),
        });
        let raw = Box::into_raw(pending);
        let ok = unsafe {
            ReadDirectoryChangesW(
                handle.raw,
                data.cast(),
                capacity as u32,
                i32::from(watch_subtree),
                ALL_NOTIFY_FLAGS,
                ptr::null_mut(),
                &mut (*raw).overlapped,
                None,
            )
        };
        if ok == 0 {
            // the read never started; no completion will reclaim the block
            drop(unsafe { Box::from_raw(raw) });
            handle.pending.set(ptr::null_mut());
            return Err(Error::io(io::Error::last_os_error()));
        }
        handle.pending.set(raw);
        Ok(())
    }

    fn disarm(&self, handle: &DirHandle) {
        let pending = handle.pending.get();
        if pending.is_null() {
            return;
        }
        unsafe { CancelIo(handle.raw) };
        // block until the kernel retires the read. The completion packet
        // stays queued on the port, where wait() or the shutdown drain
        // reclaims the pending block and the worker drops the stale token.
        let mut bytes: u32 = 0;
        let ok =
            unsafe { GetOverlappedResult(handle.raw, &(*pending).overlapped, &mut bytes, 1) };
        if ok == 0 {
            let code = unsafe { GetLastError() };
            if code != ERROR_OPERATION_ABORTED {
                log::warn!(
                    "cancelling an outstanding directory read failed with error code {}",
                    code
                );
            }
        }
        handle.pending.set(ptr::null_mut());
    }

    fn close(&self, handle: DirHandle) {
        unsafe { CloseHandle(handle.raw) };
    }

    fn wait(&self) -> Result<Completion> {
        let mut bytes: u32 = 0;
        let mut key: usize = 0;
        let mut overlapped: *mut OVERLAPPED = ptr::null_mut();
        let ok = unsafe {
            GetQueuedCompletionStatus(self.port(), &mut bytes, &mut key, &mut overlapped, INFINITE)
        };
        // read the error before any deallocation can clobber it
        let code = if ok == 0 { unsafe { GetLastError() } } else { 0 };
        if overlapped.is_null() {
            // no dequeued packet means the wait itself failed
            if ok == 0 {
                return Err(Error::io(io::Error::from_raw_os_error(code as i32)));
            }
            return Ok(Completion::wakeup());
        }
        drop(unsafe { Box::from_raw(overlapped.cast::<PendingRead>()) });
        let kind = if ok == 0 {
            if code == ERROR_NOTIFY_ENUM_DIR {
                CompletionKind::Overflow
            } else {
                CompletionKind::Failure(code)
            }
        } else {
            CompletionKind::Events {
                len: bytes as usize,
            }
        };
        Ok(Completion {
            token: Token(key as u64),
            kind,
        })
    }

    fn wakeup(&self) -> Result<()> {
        let ok = unsafe {
            PostQueuedCompletionStatus(self.port(), 0, Token::WAKEUP.0 as usize, ptr::null_mut())
        };
        if ok == 0 {
            return Err(Error::io(io::Error::last_os_error()));
        }
        Ok(())
    }

    fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        // drain whatever packets are still queued so their pending blocks
        // are freed before the port goes away; teardown has already retired
        // every read, so nothing new can arrive
        loop {
            let mut bytes: u32 = 0;
            let mut key: usize = 0;
            let mut overlapped: *mut OVERLAPPED = ptr::null_mut();
            let ok = unsafe {
                GetQueuedCompletionStatus(self.port(), &mut bytes, &mut key, &mut overlapped, 0)
            };
            if !overlapped.is_null() {
                drop(unsafe { Box::from_raw(overlapped.cast::<PendingRead>()) });
                continue;
            }
            if ok != 0 {
                // a queued wakeup packet; keep draining
                continue;
            }
            break;
        }
        unsafe { CloseHandle(self.port()) };
    }
}

impl Drop for WindowsSource {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn handle_information(handle: HANDLE) -> Result<BY_HANDLE_FILE_INFORMATION> {
    let mut info: BY_HANDLE_FILE_INFORMATION = unsafe { std::mem::zeroed() };
    if unsafe { GetFileInformationByHandle(handle, &mut info) } == 0 {
        return Err(Error::io(io::Error::last_os_error()));
    }
    Ok(info)
}

impl WatchService<WindowsSource> {
    /// Creates a watch service over the operating system's notification
    /// facility.
    pub fn new() -> Result<Self> {
        WatchService::with_source(Arc::new(WindowsSource::new()?))
    }
}
