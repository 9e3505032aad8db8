//! Narrow interface between the engine and whatever presents it.
//!
//! The engine calls these synchronously from inside the tick. Every method
//! has a no-op default, so a front-end only implements what it shows.

use std::fmt;

use chrono::{DateTime, Local};

use crate::connection::ConnectionState;
use crate::logger::TextLogger;
use crate::peer::PeerId;
use crate::progress::{format_bytes, Progress, TransferBars};
use crate::server::{ServerId, ServerState};
use crate::task::{FailureKind, TaskFailure};
use crate::transfer::{AcceptOptions, Direction, Method, PauseState, TransferKey, TransferState, Verdict};

#[derive(Clone, Debug)]
pub struct Notice {
    pub at: DateTime<Local>,
    pub message: String,
}

impl Notice {
    pub fn new(message: impl Into<String>) -> Self {
        Self { at: Local::now(), message: message.into() }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    System,
    Socket,
    Resolve,
    Tls,
    Protocol,
    File,
}

impl From<FailureKind> for ErrorKind {
    fn from(k: FailureKind) -> Self {
        match k {
            FailureKind::Resolve => ErrorKind::Resolve,
            FailureKind::Socket => ErrorKind::Socket,
            FailureKind::Tls => ErrorKind::Tls,
            FailureKind::System => ErrorKind::System,
        }
    }
}

#[derive(Clone, Debug)]
pub struct ErrorReport {
    pub at: DateTime<Local>,
    pub kind: ErrorKind,
    pub op: Option<&'static str>,
    pub code: Option<i32>,
    pub message: String,
}

impl ErrorReport {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self { at: Local::now(), kind, op: None, code: None, message: message.into() }
    }

    pub fn with_op(mut self, op: &'static str, code: Option<i32>) -> Self {
        self.op = Some(op);
        self.code = code;
        self
    }

    pub fn from_failure(context: &str, f: &TaskFailure) -> Self {
        Self::new(f.kind.into(), format!("{}: {}", context, f.message)).with_op(f.op, f.code)
    }
}

impl fmt::Display for ErrorReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} error", self.kind)?;
        if let Some(op) = self.op {
            write!(f, " in {}", op)?;
        }
        if let Some(code) = self.code {
            write!(f, " (code {})", code)?;
        }
        write!(f, ": {}", self.message)
    }
}

/// Snapshot of one transfer handed to the front-end.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransferView {
    pub key: TransferKey,
    pub direction: Direction,
    pub state: TransferState,
    pub verdict: Verdict,
    pub pause: PauseState,
    pub method: Option<Method>,
    pub name: String,
    pub size: u64,
    pub position: u64,
    pub transferred: u64,
    pub peer_tls: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransferChange {
    Added,
    Updated,
    Removed,
}

/// Decision returned for a freshly suggested incoming file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VerdictRequest {
    /// Decide later through the engine API.
    Defer,
    Accept(AcceptOptions),
    Decline,
}

pub trait Frontend {
    fn notify(&mut self, _notice: &Notice) {}
    fn error(&mut self, _report: &ErrorReport) {}
    fn transfer(&mut self, _view: &TransferView, _change: TransferChange) {}
    fn progress(&mut self, _view: &TransferView, _progress: &Progress) {}
    fn peer_state(&mut self, _peer: PeerId, _state: ConnectionState) {}
    fn server_state(&mut self, _server: ServerId, _state: ServerState) {}
    fn request_verdict(&mut self, _view: &TransferView) -> VerdictRequest {
        VerdictRequest::Defer
    }
}

pub struct NoopFrontend;
impl Frontend for NoopFrontend {}

impl<F: Frontend + ?Sized> Frontend for Box<F> {
    fn notify(&mut self, notice: &Notice) {
        (**self).notify(notice)
    }
    fn error(&mut self, report: &ErrorReport) {
        (**self).error(report)
    }
    fn transfer(&mut self, view: &TransferView, change: TransferChange) {
        (**self).transfer(view, change)
    }
    fn progress(&mut self, view: &TransferView, progress: &Progress) {
        (**self).progress(view, progress)
    }
    fn peer_state(&mut self, peer: PeerId, state: ConnectionState) {
        (**self).peer_state(peer, state)
    }
    fn server_state(&mut self, server: ServerId, state: ServerState) {
        (**self).server_state(server, state)
    }
    fn request_verdict(&mut self, view: &TransferView) -> VerdictRequest {
        (**self).request_verdict(view)
    }
}

/// Keeps everything it is told, for assertions in tests.
#[cfg(any(test, feature = "test-support"))]
#[derive(Debug, Default)]
pub struct Recorder {
    pub notices: Vec<Notice>,
    pub errors: Vec<ErrorReport>,
    pub transfers: Vec<(TransferView, TransferChange)>,
    pub progress: Vec<(TransferKey, Progress)>,
    pub peer_states: Vec<(PeerId, ConnectionState)>,
    pub server_states: Vec<(ServerId, ServerState)>,
    pub verdicts: Vec<TransferView>,
    /// Answer given to every verdict request.
    pub answer: Option<VerdictRequest>,
}

#[cfg(any(test, feature = "test-support"))]
impl Recorder {
    pub fn answering(answer: VerdictRequest) -> Self {
        Self { answer: Some(answer), ..Default::default() }
    }

    pub fn saw_notice(&self, needle: &str) -> bool {
        self.notices.iter().any(|n| n.message.contains(needle))
    }

    pub fn saw_error(&self, needle: &str) -> bool {
        self.errors.iter().any(|e| e.message.contains(needle))
    }
}

#[cfg(any(test, feature = "test-support"))]
impl Frontend for Recorder {
    fn notify(&mut self, notice: &Notice) {
        self.notices.push(notice.clone());
    }
    fn error(&mut self, report: &ErrorReport) {
        self.errors.push(report.clone());
    }
    fn transfer(&mut self, view: &TransferView, change: TransferChange) {
        self.transfers.push((view.clone(), change));
    }
    fn progress(&mut self, view: &TransferView, progress: &Progress) {
        self.progress.push((view.key, progress.clone()));
    }
    fn peer_state(&mut self, peer: PeerId, state: ConnectionState) {
        self.peer_states.push((peer, state));
    }
    fn server_state(&mut self, server: ServerId, state: ServerState) {
        self.server_states.push((server, state));
    }
    fn request_verdict(&mut self, view: &TransferView) -> VerdictRequest {
        self.verdicts.push(view.clone());
        self.answer.clone().unwrap_or(VerdictRequest::Defer)
    }
}

/// Terminal front-end for the daemon: notices on stderr, optional log file,
/// progress bars, and a fixed verdict policy.
pub struct Headless {
    log: Option<TextLogger>,
    bars: TransferBars,
    policy: VerdictRequest,
    verbose: bool,
}

impl Headless {
    pub fn new(log: Option<TextLogger>, policy: VerdictRequest, verbose: bool) -> Self {
        Self { log, bars: TransferBars::new(), policy, verbose }
    }

    fn emit(&self, at: &DateTime<Local>, text: &str, always: bool) {
        if let Some(log) = &self.log {
            log.line(text);
        }
        if always || self.verbose {
            self.bars.println(&format!("[{}] {}", at.format("%H:%M:%S"), text));
        }
    }
}

impl Frontend for Headless {
    fn notify(&mut self, notice: &Notice) {
        let chatty = notice.message.starts_with("Protocol ");
        self.emit(&notice.at, &notice.message, !chatty);
    }

    fn error(&mut self, report: &ErrorReport) {
        self.emit(&report.at, &report.to_string(), true);
    }

    fn transfer(&mut self, view: &TransferView, change: TransferChange) {
        match (change, view.state) {
            (TransferChange::Added, _) => {
                let at = Local::now();
                let text = format!(
                    "{} {} {} ({})",
                    view.key,
                    view.direction,
                    view.name,
                    format_bytes(view.size as f64)
                );
                self.emit(&at, &text, true);
            }
            (_, TransferState::Completed) => self.bars.finish(view.key, "done"),
            (_, TransferState::Aborted) => self.bars.abandon(view.key, "aborted"),
            _ => {}
        }
    }

    fn progress(&mut self, view: &TransferView, progress: &Progress) {
        self.bars.update(view.key, &view.name, progress);
    }

    fn request_verdict(&mut self, _view: &TransferView) -> VerdictRequest {
        self.policy.clone()
    }
}
