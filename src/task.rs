//! One-shot background tasks for the operations that block: address
//! lookup, connect and TLS handshake.
//!
//! The task writes its payload exactly once and then flips the state flag.
//! The scheduler only polls the flag and takes the payload after it has
//! seen a done state. Tasks are never cancelled; dropping the handle just
//! discards whatever the task produces.

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;

const PENDING: u8 = 0;
const DONE_OK: u8 = 1;
const DONE_ERR: u8 = 2;

/// Which part of the stack a failure belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureKind {
    Resolve,
    Socket,
    Tls,
    System,
}

/// Failure reported by a background task. Plain data only.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TaskFailure {
    pub kind: FailureKind,
    pub op: &'static str,
    pub code: Option<i32>,
    pub message: String,
}

impl TaskFailure {
    pub fn new(kind: FailureKind, op: &'static str, message: impl Into<String>) -> Self {
        Self { kind, op, code: None, message: message.into() }
    }

    pub fn io(kind: FailureKind, op: &'static str, err: &io::Error) -> Self {
        Self { kind, op, code: err.raw_os_error(), message: err.to_string() }
    }
}

impl fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "{}: {} (os error {})", self.op, self.message, code),
            None => write!(f, "{}: {}", self.op, self.message),
        }
    }
}

struct Slot<T> {
    state: AtomicU8,
    payload: Mutex<Option<Result<T, TaskFailure>>>,
}

/// Observed state of a handoff.
#[derive(Debug, PartialEq, Eq)]
pub enum Poll<T> {
    Pending,
    Ready(T),
    Failed(TaskFailure),
}

pub struct Handoff<T> {
    slot: Arc<Slot<T>>,
    taken: bool,
}

impl<T> fmt::Debug for Handoff<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handoff")
            .field("state", &self.slot.state.load(Ordering::Acquire))
            .field("taken", &self.taken)
            .finish()
    }
}

impl<T: Send + 'static> Handoff<T> {
    pub fn spawn<F>(name: &str, work: F) -> Self
    where
        F: FnOnce() -> Result<T, TaskFailure> + Send + 'static,
    {
        let slot = Arc::new(Slot { state: AtomicU8::new(PENDING), payload: Mutex::new(None) });
        let writer = Arc::clone(&slot);
        let spawned = thread::Builder::new().name(name.to_string()).spawn(move || {
            let result = work();
            let flag = if result.is_ok() { DONE_OK } else { DONE_ERR };
            *writer.payload.lock() = Some(result);
            writer.state.store(flag, Ordering::Release);
        });
        if let Err(e) = spawned {
            *slot.payload.lock() = Some(Err(TaskFailure::io(FailureKind::System, "spawn", &e)));
            slot.state.store(DONE_ERR, Ordering::Release);
        }
        Self { slot, taken: false }
    }
}

impl<T> Handoff<T> {
    /// Non-blocking check. A done result is handed out once; later polls
    /// after that keep reporting `Pending`.
    pub fn poll(&mut self) -> Poll<T> {
        if self.taken || self.slot.state.load(Ordering::Acquire) == PENDING {
            return Poll::Pending;
        }
        self.taken = true;
        match self.slot.payload.lock().take() {
            Some(Ok(v)) => Poll::Ready(v),
            Some(Err(f)) => Poll::Failed(f),
            None => Poll::Failed(TaskFailure::new(FailureKind::System, "task", "result missing")),
        }
    }

    pub fn is_done(&self) -> bool {
        self.slot.state.load(Ordering::Acquire) != PENDING
    }
}

#[cfg(test)]
pub(crate) fn wait<T>(h: &mut Handoff<T>) -> Poll<T> {
    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(10);
    while std::time::Instant::now() < deadline {
        match h.poll() {
            Poll::Pending => thread::sleep(std::time::Duration::from_millis(2)),
            done => return done,
        }
    }
    Poll::Pending
}
