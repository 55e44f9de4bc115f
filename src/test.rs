//! Shared test support.
//!
//! `MockSource` is a fully scripted, in-memory notification source: tests
//! register directories against it, inject encoded change batches or
//! synthetic completion outcomes, and interrogate per-path call counters.
//! `encode_batch` builds the same variable-length record chains a real
//! kernel would leave in a registration's buffer.

use crate::error::{Error, Result};
use crate::event::Interest;
use crate::service::WatchService;
use crate::source::{
    BatchBuffer, Completion, CompletionKind, DirectoryIdentity, NotificationSource, Token,
};
use crossbeam_channel::{unbounded, Receiver, Sender};
use enumflags2::BitFlags;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Spawns a watch service over a fresh mock source.
pub(crate) fn mock_service() -> (WatchService<MockSource>, Arc<MockSource>) {
    let source = Arc::new(MockSource::new());
    let service = WatchService::with_source(Arc::clone(&source)).expect("spawn worker");
    (service, source)
}

pub(crate) fn all_interest() -> BitFlags<Interest> {
    BitFlags::all()
}

/// Encodes `(action, name)` pairs as a chained record batch. Every record
/// except the last carries a 4-byte-aligned next-entry offset, matching the
/// alignment real batches use.
pub(crate) fn encode_batch(records: &[(u32, &str)]) -> Vec<u8> {
    let mut out = Vec::new();
    for (i, (action, name)) in records.iter().enumerate() {
        let start = out.len();
        let units: Vec<u16> = name.encode_utf16().collect();
        let name_bytes = units.len() * 2;
        let last = i + 1 == records.len();
        let mut record_len = 12 + name_bytes;
        if !last {
            record_len = (record_len + 3) & !3;
        }
        let next = if last { 0 } else { record_len as u32 };
        out.extend_from_slice(&next.to_le_bytes());
        out.extend_from_slice(&action.to_le_bytes());
        out.extend_from_slice(&(name_bytes as u32).to_le_bytes());
        for unit in units {
            out.extend_from_slice(&unit.to_le_bytes());
        }
        out.resize(start + record_len, 0);
    }
    out
}

enum Queued {
    Completion(Completion),
    Fatal,
}

pub(crate) struct MockHandle {
    path: PathBuf,
}

#[derive(Default)]
struct Counters {
    arm: usize,
    disarm: usize,
    close: usize,
}

#[derive(Default)]
struct MockState {
    next_file_id: u128,
    identities: HashMap<PathBuf, DirectoryIdentity>,
    aliases: HashMap<PathBuf, PathBuf>,
    not_directories: HashSet<PathBuf>,
    failing_arms: HashSet<PathBuf>,
    counters: HashMap<PathBuf, Counters>,
    // survive close() on purpose, so tests can model completions that were
    // already queued when their registration was torn down
    tokens: HashMap<PathBuf, Token>,
    buffers: HashMap<PathBuf, BatchBuffer>,
    last_subtree: HashMap<PathBuf, bool>,
    shutdown: bool,
}

pub(crate) struct MockSource {
    queue_tx: Sender<Queued>,
    queue_rx: Receiver<Queued>,
    state: Mutex<MockState>,
}

impl MockSource {
    fn new() -> Self {
        let (queue_tx, queue_rx) = unbounded();
        MockSource {
            queue_tx,
            queue_rx,
            state: Mutex::new(MockState::default()),
        }
    }

    /// Makes `link` resolve to the same directory identity as `target`.
    pub(crate) fn alias(&self, link: &Path, target: &Path) {
        let mut state = self.state.lock().unwrap();
        state.aliases.insert(link.to_path_buf(), target.to_path_buf());
    }

    /// Makes `open` of `path` fail as not-a-directory.
    pub(crate) fn mark_not_a_directory(&self, path: &Path) {
        let mut state = self.state.lock().unwrap();
        state.not_directories.insert(path.to_path_buf());
    }

    /// Makes every subsequent `arm` of `path` fail.
    pub(crate) fn fail_arm(&self, path: &Path) {
        let mut state = self.state.lock().unwrap();
        state.failing_arms.insert(path.to_path_buf());
    }

    /// Completes the outstanding read for `path` with `bytes` as the batch.
    pub(crate) fn inject(&self, path: &Path, bytes: &[u8]) {
        let (token, buffer) = self.read_target(path);
        let len = buffer.fill(bytes);
        self.send(Completion {
            token,
            kind: CompletionKind::Events { len },
        });
    }

    /// Like `inject`, without assuming the bytes form valid records.
    pub(crate) fn inject_raw(&self, path: &Path, bytes: &[u8]) {
        self.inject(path, bytes);
    }

    /// Completes the outstanding read for `path` as an overflow.
    pub(crate) fn inject_overflow(&self, path: &Path) {
        let (token, _) = self.read_target(path);
        self.send(Completion {
            token,
            kind: CompletionKind::Overflow,
        });
    }

    /// Completes the outstanding read for `path` with a native error code.
    pub(crate) fn inject_failure(&self, path: &Path, code: u32) {
        let (token, _) = self.read_target(path);
        self.send(Completion {
            token,
            kind: CompletionKind::Failure(code),
        });
    }

    /// Makes the worker's next `wait` fail, which is fatal to the loop.
    pub(crate) fn inject_fatal(&self) {
        let _ = self.queue_tx.send(Queued::Fatal);
    }

    pub(crate) fn arm_calls(&self, path: &Path) -> usize {
        self.counter(path, |c| c.arm)
    }

    pub(crate) fn disarm_calls(&self, path: &Path) -> usize {
        self.counter(path, |c| c.disarm)
    }

    pub(crate) fn close_calls(&self, path: &Path) -> usize {
        self.counter(path, |c| c.close)
    }

    /// The subtree flag of the most recent `arm` for `path`.
    pub(crate) fn last_arm_subtree(&self, path: &Path) -> Option<bool> {
        let state = self.state.lock().unwrap();
        state.last_subtree.get(path).copied()
    }

    pub(crate) fn shutdown_called(&self) -> bool {
        self.state.lock().unwrap().shutdown
    }

    fn counter(&self, path: &Path, pick: impl Fn(&Counters) -> usize) -> usize {
        let state = self.state.lock().unwrap();
        state.counters.get(path).map_or(0, pick)
    }

    fn read_target(&self, path: &Path) -> (Token, BatchBuffer) {
        let state = self.state.lock().unwrap();
        let token = *state.tokens.get(path).expect("path was never associated");
        let buffer = state.buffers.get(path).expect("path was never armed").clone();
        (token, buffer)
    }

    fn send(&self, completion: Completion) {
        let _ = self.queue_tx.send(Queued::Completion(completion));
    }
}

impl NotificationSource for MockSource {
    type Handle = MockHandle;

    fn open(&self, dir: &Path) -> Result<Self::Handle> {
        let state = self.state.lock().unwrap();
        if state.not_directories.contains(dir) {
            return Err(Error::not_a_directory().add_path(dir.to_path_buf()));
        }
        Ok(MockHandle {
            path: dir.to_path_buf(),
        })
    }

    fn identity(&self, handle: &Self::Handle) -> Result<DirectoryIdentity> {
        let mut state = self.state.lock().unwrap();
        let canonical = state
            .aliases
            .get(&handle.path)
            .cloned()
            .unwrap_or_else(|| handle.path.clone());
        state.next_file_id += 1;
        let fallback = DirectoryIdentity::new(1, state.next_file_id);
        Ok(*state.identities.entry(canonical).or_insert(fallback))
    }

    fn associate(&self, handle: &Self::Handle, token: Token) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.tokens.insert(handle.path.clone(), token);
        Ok(())
    }

    fn arm(
        &self,
        handle: &Self::Handle,
        buffer: &BatchBuffer,
        _interest: BitFlags<Interest>,
        watch_subtree: bool,
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.failing_arms.contains(&handle.path) {
            return Err(Error::generic("simulated arm failure").add_path(handle.path.clone()));
        }
        state.counters.entry(handle.path.clone()).or_default().arm += 1;
        state.buffers.insert(handle.path.clone(), buffer.clone());
        state.last_subtree.insert(handle.path.clone(), watch_subtree);
        Ok(())
    }

    fn disarm(&self, handle: &Self::Handle) {
        let mut state = self.state.lock().unwrap();
        state.counters.entry(handle.path.clone()).or_default().disarm += 1;
    }

    fn close(&self, handle: Self::Handle) {
        let mut state = self.state.lock().unwrap();
        state.counters.entry(handle.path).or_default().close += 1;
    }

    fn wait(&self) -> Result<Completion> {
        match self.queue_rx.recv() {
            Ok(Queued::Completion(completion)) => Ok(completion),
            Ok(Queued::Fatal) => Err(Error::generic("simulated completion queue failure")),
            Err(_) => Err(Error::service_closed()),
        }
    }

    fn wakeup(&self) -> Result<()> {
        self.queue_tx
            .send(Queued::Completion(Completion::wakeup()))
            .map_err(|_| Error::service_closed())
    }

    fn shutdown(&self) {
        self.state.lock().unwrap().shutdown = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::{FILE_ACTION_ADDED, FILE_ACTION_REMOVED};

    #[test]
    fn encode_batch_chains_records() {
        let batch = encode_batch(&[(FILE_ACTION_ADDED, "ok"), (FILE_ACTION_REMOVED, "gone")]);
        let next = u32::from_le_bytes([batch[0], batch[1], batch[2], batch[3]]);
        assert_eq!(next % 4, 0, "intermediate offsets are aligned");
        let last = next as usize;
        let tail = u32::from_le_bytes([
            batch[last],
            batch[last + 1],
            batch[last + 2],
            batch[last + 3],
        ]);
        assert_eq!(tail, 0, "the final record terminates the chain");
    }
}
