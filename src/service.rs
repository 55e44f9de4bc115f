//! The watch service: the caller-facing registration surface plus the
//! worker loop that drains the completion queue.
//!
//! All native resources (directory handles, batch buffers) are touched by
//! exactly one dedicated thread. Caller threads never lock shared state;
//! they submit a control request on a channel, post the wakeup token, and —
//! for registration and close — block on a private reply channel until the
//! worker has processed the request.

use crate::decoder;
use crate::error::{Error, Result};
use crate::event::{Event, Interest};
use crate::source::{BatchBuffer, Completion, CompletionKind, NotificationSource, Token};
use crate::table::RegistrationTable;
use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use enumflags2::BitFlags;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;

/// Caller-facing handle for one active (or formerly active) registration.
///
/// Clones refer to the same registration. A key stays usable after its
/// registration is gone: `poll` drains any events delivered before the
/// teardown and then reports the disconnect.
#[derive(Clone)]
pub struct WatchKey {
    state: Arc<KeyState>,
}

struct KeyState {
    valid: AtomicBool,
    // completion token of the current native registration; rewritten when a
    // subtree-flag change replaces the native resources under the same key
    token: AtomicU64,
    events: Receiver<Event>,
}

impl WatchKey {
    /// Whether the registration behind this key is still active. Transitions
    /// to `false` exactly once, on cancellation, per-registration failure,
    /// or service close.
    pub fn is_valid(&self) -> bool {
        self.state.valid.load(Ordering::SeqCst)
    }

    /// Takes the next pending event without blocking.
    pub fn poll(&self) -> Option<Event> {
        self.state.events.try_recv().ok()
    }

    /// Blocks until an event is available. Once the key is invalid and its
    /// queue is drained this returns `Err(ErrorKind::KeyInvalid)`, which is
    /// how a blocked `take` observes termination.
    pub fn take(&self) -> Result<Event> {
        self.state.events.recv().map_err(|_| Error::key_invalid())
    }
}

impl PartialEq for WatchKey {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.state, &other.state)
    }
}

impl Eq for WatchKey {}

impl fmt::Debug for WatchKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WatchKey")
            .field("valid", &self.is_valid())
            .finish()
    }
}

enum Request {
    Register {
        dir: PathBuf,
        interest: BitFlags<Interest>,
        subtree: bool,
        reply: Sender<Result<WatchKey>>,
    },
    Cancel {
        key: WatchKey,
    },
    Close {
        reply: Sender<()>,
    },
}

/// A directory-change notification service.
///
/// One background worker thread serves every registration for the life of
/// the service. Dropping the service requests close without blocking.
pub struct WatchService<S: NotificationSource> {
    requests: Sender<Request>,
    source: Arc<S>,
    closed: AtomicBool,
}

impl<S: NotificationSource> WatchService<S> {
    /// Spawns the worker thread over the given notification source.
    pub fn with_source(source: Arc<S>) -> Result<Self> {
        let (requests, request_rx) = unbounded();
        let worker = Worker {
            source: Arc::clone(&source),
            requests: request_rx,
            table: RegistrationTable::new(),
        };
        thread::Builder::new()
            .name("dirwatch worker".to_string())
            .spawn(move || worker.run())
            .map_err(Error::io)?;
        Ok(WatchService {
            requests,
            source,
            closed: AtomicBool::new(false),
        })
    }

    /// Registers interest in changes under `dir`, optionally covering its
    /// whole subtree.
    ///
    /// Registering a directory that is already watched (under any path
    /// spelling reaching the same directory) updates the existing
    /// registration's interest mask and returns the same key. If the
    /// subtree flag differs from the existing registration the native
    /// resources are replaced, still under the same key.
    ///
    /// Blocks until the worker has opened the directory and armed the first
    /// asynchronous read.
    pub fn register(
        &self,
        dir: impl AsRef<Path>,
        interest: impl Into<BitFlags<Interest>>,
        watch_subtree: bool,
    ) -> Result<WatchKey> {
        let dir = dir.as_ref().to_path_buf();
        let interest = interest.into();
        if interest.is_empty() {
            return Err(Error::generic("no interest flags given").add_path(dir));
        }
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::service_closed());
        }
        let (reply, response) = bounded(1);
        self.requests
            .send(Request::Register {
                dir,
                interest,
                subtree: watch_subtree,
                reply,
            })
            .map_err(|_| Error::service_closed())?;
        let _ = self.source.wakeup();
        response.recv().map_err(|_| Error::service_closed())?
    }

    /// Requests cancellation of one key. Fire-and-forget: the key's `valid`
    /// flag flips once the worker processes the request. Idempotent.
    pub fn cancel(&self, key: &WatchKey) {
        if !key.is_valid() {
            return;
        }
        if self
            .requests
            .send(Request::Cancel { key: key.clone() })
            .is_ok()
        {
            let _ = self.source.wakeup();
        }
    }

    /// Closes the service: invalidates every key, releases all native
    /// resources and the completion queue, and stops the worker. No events
    /// are delivered after this returns. Idempotent.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let (reply, done) = bounded(1);
        if self.requests.send(Request::Close { reply }).is_err() {
            // worker already terminated
            return Ok(());
        }
        let _ = self.source.wakeup();
        let _ = done.recv();
        Ok(())
    }
}

impl<S: NotificationSource> Drop for WatchService<S> {
    fn drop(&mut self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let (reply, _done) = bounded(1);
            if self.requests.send(Request::Close { reply }).is_ok() {
                let _ = self.source.wakeup();
            }
        }
    }
}

/// Internal record tying one watched directory's handle, buffer, interest
/// mask, and key together. Owned by the worker's table; never touched by
/// any other thread.
struct Registration<S: NotificationSource> {
    handle: Option<S::Handle>,
    buffer: BatchBuffer,
    dir: PathBuf,
    interest: BitFlags<Interest>,
    subtree: bool,
    // the last arm attempt failed, so there is no outstanding read to cancel
    start_failed: bool,
    key: Arc<KeyState>,
    events: Sender<Event>,
}

struct Worker<S: NotificationSource> {
    source: Arc<S>,
    requests: Receiver<Request>,
    table: RegistrationTable<Registration<S>>,
}

impl<S: NotificationSource> Worker<S> {
    fn run(mut self) {
        loop {
            let completion = match self.source.wait() {
                Ok(completion) => completion,
                Err(err) => {
                    log::error!(
                        "failed to obtain the next completion, stopping the watch service: {}",
                        err
                    );
                    self.teardown_all();
                    self.source.shutdown();
                    break;
                }
            };
            // the wakeup token is checked before anything else so control
            // requests are served ahead of ordinary change completions
            if completion.token == Token::WAKEUP {
                if self.drain_requests() {
                    break;
                }
                continue;
            }
            self.dispatch(completion);
        }
    }

    /// Drains and executes queued control requests. Returns true when a
    /// close request terminated the service.
    fn drain_requests(&mut self) -> bool {
        while let Ok(request) = self.requests.try_recv() {
            match request {
                Request::Register {
                    dir,
                    interest,
                    subtree,
                    reply,
                } => {
                    let result = self.register(dir, interest, subtree);
                    let _ = reply.send(result);
                }
                Request::Cancel { key } => self.cancel(&key),
                Request::Close { reply } => {
                    self.teardown_all();
                    self.source.shutdown();
                    let _ = reply.send(());
                    return true;
                }
            }
        }
        false
    }

    fn register(
        &mut self,
        dir: PathBuf,
        interest: BitFlags<Interest>,
        subtree: bool,
    ) -> Result<WatchKey> {
        let handle = self.source.open(&dir)?;
        let identity = match self.source.identity(&handle) {
            Ok(identity) => identity,
            Err(err) => {
                self.source.close(handle);
                return Err(err);
            }
        };

        // a surviving key/queue pair from a replaced registration
        let mut preserved: Option<(Arc<KeyState>, Sender<Event>)> = None;
        if let Some(token) = self.table.token_for(&identity) {
            let same_subtree = self.table.get(token).map_or(false, |reg| reg.subtree == subtree);
            if same_subtree {
                // already watched: refresh the interest mask, hand back the
                // existing key, and drop the probe handle
                self.source.close(handle);
                if let Some(reg) = self.table.get_mut(token) {
                    reg.interest = interest;
                    return Ok(WatchKey {
                        state: Arc::clone(&reg.key),
                    });
                }
                return Err(Error::generic("registration table out of sync").add_path(dir));
            }
            // the subtree flag changed: tear down the old native resources
            // first so a stale completion can never reach the new read, but
            // keep the caller's key object alive across the swap
            if let Some(mut old) = self.table.remove(token) {
                self.release_native(&mut old);
                preserved = Some((old.key, old.events));
            }
        }

        let token = self.table.allocate_token();
        if let Err(err) = self.source.associate(&handle, token) {
            self.source.close(handle);
            self.invalidate_preserved(&preserved);
            return Err(err);
        }
        let buffer = BatchBuffer::new();
        if let Err(err) = self.source.arm(&handle, &buffer, interest, subtree) {
            self.source.close(handle);
            self.invalidate_preserved(&preserved);
            return Err(err);
        }

        let (key, events) = match preserved {
            Some((key, events)) => {
                key.token.store(token.0, Ordering::SeqCst);
                (key, events)
            }
            None => {
                let (events, queue) = unbounded();
                let key = Arc::new(KeyState {
                    valid: AtomicBool::new(true),
                    token: AtomicU64::new(token.0),
                    events: queue,
                });
                (key, events)
            }
        };
        let registration = Registration {
            handle: Some(handle),
            buffer,
            dir,
            interest,
            subtree,
            start_failed: false,
            key: Arc::clone(&key),
            events,
        };
        self.table.insert(token, identity, registration);
        Ok(WatchKey { state: key })
    }

    /// A replacement registration failed part way: the old watch is already
    /// gone, so the key the caller still holds must stop reporting valid.
    fn invalidate_preserved(&self, preserved: &Option<(Arc<KeyState>, Sender<Event>)>) {
        if let Some((key, _)) = preserved {
            key.valid.store(false, Ordering::SeqCst);
        }
    }

    fn cancel(&mut self, key: &WatchKey) {
        let token = Token(key.state.token.load(Ordering::SeqCst));
        let matches = self
            .table
            .get(token)
            .map_or(false, |reg| Arc::ptr_eq(&reg.key, &key.state));
        if !matches {
            // already cancelled, replaced, or never registered
            return;
        }
        if let Some(mut registration) = self.table.remove(token) {
            self.release_native(&mut registration);
            registration.key.valid.store(false, Ordering::SeqCst);
        }
    }

    fn teardown_all(&mut self) {
        for mut registration in self.table.drain() {
            self.release_native(&mut registration);
            registration.key.valid.store(false, Ordering::SeqCst);
        }
    }

    /// Cancels the outstanding read (unless arming it failed, in which case
    /// there is nothing to cancel) and releases the directory handle.
    fn release_native(&self, registration: &mut Registration<S>) {
        if let Some(handle) = registration.handle.take() {
            if !registration.start_failed {
                self.source.disarm(&handle);
            }
            self.source.close(handle);
        }
    }

    fn dispatch(&mut self, completion: Completion) {
        let token = completion.token;
        if !self.table.contains(token) {
            // the registration was cancelled or replaced while this
            // completion was in flight; its resources are already gone
            log::trace!("ignoring completion for stale token {:?}", token);
            return;
        }
        match completion.kind {
            CompletionKind::Overflow | CompletionKind::Events { len: 0 } => {
                self.signal_overflow(token);
                self.rearm(token);
            }
            CompletionKind::Events { len } => {
                self.forward_batch(token, len);
                self.rearm(token);
            }
            CompletionKind::Failure(code) => {
                if let Some(reg) = self.table.get(token) {
                    log::warn!(
                        "asynchronous read for {} completed with error code {}",
                        reg.dir.display(),
                        code
                    );
                }
                // some changes may have been dropped with the failed read
                self.signal_overflow(token);
                self.rearm(token);
            }
        }
    }

    fn signal_overflow(&self, token: Token) {
        if let Some(reg) = self.table.get(token) {
            let _ = reg.events.send(Event::overflow());
        }
    }

    /// Decodes a completed batch and forwards every event passing the
    /// registration's interest mask, in the order the OS reported them.
    fn forward_batch(&mut self, token: Token, len: usize) {
        let Some(reg) = self.table.get(token) else {
            return;
        };
        let mut batch = Vec::new();
        reg.buffer.read(len, |bytes| {
            for record in decoder::records(bytes) {
                let record = match record {
                    Ok(record) => record,
                    Err(err) => {
                        log::warn!(
                            "malformed change record batch for {}: {}",
                            reg.dir.display(),
                            err
                        );
                        break;
                    }
                };
                let kind = match decoder::action_kind(record.action) {
                    Some(kind) => kind,
                    None => continue,
                };
                if !kind.matches(reg.interest) {
                    continue;
                }
                let path = reg.dir.join(decoder::name_to_os(&record.name));
                log::trace!("event: path = `{}`, kind = {:?}", path.display(), kind);
                batch.push(Event::new(kind, path));
            }
        });
        for event in batch {
            let _ = reg.events.send(event);
        }
    }

    /// Issues the next asynchronous read for a registration. A failure here
    /// is fatal for this one registration only: its resources are released,
    /// its key invalidated, and its queue disconnected so blocked `take`
    /// calls observe the termination. The worker loop itself continues.
    fn rearm(&mut self, token: Token) {
        let failure = match self.table.get(token) {
            Some(reg) => match &reg.handle {
                Some(handle) => self
                    .source
                    .arm(handle, &reg.buffer, reg.interest, reg.subtree)
                    .err(),
                None => None,
            },
            None => None,
        };
        if let Some(err) = failure {
            if let Some(mut registration) = self.table.remove(token) {
                log::warn!(
                    "failed to re-arm watch for {}: {}",
                    registration.dir.display(),
                    err
                );
                registration.start_failed = true;
                self.release_native(&mut registration);
                registration.key.valid.store(false, Ordering::SeqCst);
            }
        }
    }
}
