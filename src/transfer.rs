//! Per-file transfer state machine: verdict negotiation, data channel setup
//! and the buffered pump that moves the bytes.

use std::fmt;
use std::io;
use std::net::{SocketAddr, TcpStream};
use std::path::PathBuf;
use std::time::Instant;

use crate::config::Settings;
use crate::connection::{ConnEvent, Connection, ConnectionKind, ConnectionState, TlsSetup};
use crate::context::Ctx;
use crate::error::{EngineError, FileError};
use crate::file::{self, FileInfo, OpenFile};
use crate::frontend::{ErrorKind, ErrorReport, TransferChange, TransferView};
use crate::peer::PeerId;
use crate::progress::IoSampler;
use crate::protocol::{limits::DATA_BUFFER_LEN, value, NULL_FIELD};
use crate::protocol_core::Command;
use crate::resolve::ResolveRequest;
use crate::server::{AcceptState, AcceptTicket, ServerId, ServerKind, ServerRegistry};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Direction {
    Incoming,
    Outgoing,
}

impl Direction {
    pub fn wire(self) -> &'static str {
        match self {
            Direction::Incoming => value::INCOMING,
            Direction::Outgoing => value::OUTGOING,
        }
    }

    pub fn flip(self) -> Self {
        match self {
            Direction::Incoming => Direction::Outgoing,
            Direction::Outgoing => Direction::Incoming,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Direction::Incoming => "incoming",
            Direction::Outgoing => "outgoing",
        })
    }
}

/// Who dials the data channel. The two ends always hold opposite methods.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Method {
    Active,
    Passive,
}

impl Method {
    pub fn wire(self) -> &'static str {
        match self {
            Method::Active => value::ACTIVE,
            Method::Passive => value::PASSIVE,
        }
    }

    pub fn inverse(self) -> Self {
        match self {
            Method::Active => Method::Passive,
            Method::Passive => Method::Active,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verdict {
    Pending,
    Accepted,
    Declined,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TransferState {
    SetupPending,
    ActiveResolveSrc,
    PassiveResolveAccept,
    VerdictPending,
    PreparationPending,
    Transferring,
    Completed,
    Aborted,
}

impl TransferState {
    pub fn is_finished(self) -> bool {
        matches!(self, TransferState::Completed | TransferState::Aborted)
    }

    fn may_become(self, next: TransferState) -> bool {
        use TransferState::*;
        match (self, next) {
            (Completed | Aborted, _) => false,
            (_, Aborted) => true,
            (SetupPending, ActiveResolveSrc | PassiveResolveAccept | VerdictPending | PreparationPending) => true,
            (ActiveResolveSrc, VerdictPending | PreparationPending) => true,
            (VerdictPending, PassiveResolveAccept | PreparationPending) => true,
            (PassiveResolveAccept, PreparationPending) => true,
            (PreparationPending, Transferring) => true,
            (Transferring, Completed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for TransferState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TransferState::SetupPending => "Setup pending",
            TransferState::ActiveResolveSrc => "Resolving source",
            TransferState::PassiveResolveAccept => "Resolving accept address",
            TransferState::VerdictPending => "Verdict pending",
            TransferState::PreparationPending => "Preparation pending",
            TransferState::Transferring => "Transferring",
            TransferState::Completed => "Completed",
            TransferState::Aborted => "Aborted",
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PauseState {
    Pending,
    Paused,
    Resumed,
}

/// Stable handle for a transfer: unique per peer and direction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TransferKey {
    pub peer: PeerId,
    pub direction: Direction,
    pub id: u64,
}

impl fmt::Display for TransferKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let dir = match self.direction {
            Direction::Incoming => "in",
            Direction::Outgoing => "out",
        };
        write!(f, "{}/{}#{}", self.peer, dir, self.id)
    }
}

/// Operator choices for a new outgoing suggestion.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SuggestOptions {
    pub method: Method,
    /// Local address to bind when dialing; defaults to `data_local_address`.
    pub source: Option<String>,
    /// Data server that will take the inbound connection (passive only).
    pub server: Option<ServerId>,
    pub any_port: bool,
    pub advertise_address: Option<String>,
    pub advertise_service: Option<String>,
    /// Wrap the data channel in TLS when dialing.
    pub tls: bool,
}

impl Default for SuggestOptions {
    fn default() -> Self {
        Self {
            method: Method::Active,
            source: None,
            server: None,
            any_port: false,
            advertise_address: None,
            advertise_service: None,
            tls: false,
        }
    }
}

/// Operator choices when accepting an incoming suggestion.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AcceptOptions {
    pub directory: Option<PathBuf>,
    /// Resume offset; 0 writes a fresh file.
    pub position: u64,
    pub source: Option<String>,
    pub server: Option<ServerId>,
    pub any_port: bool,
    pub advertise_address: Option<String>,
    pub advertise_service: Option<String>,
    /// TLS when we end up dialing; defaults to what the peer announced and
    /// must agree with it.
    pub tls: Option<bool>,
}

/// Fixed-capacity window over the data buffer.
#[derive(Debug)]
struct DataBuffer {
    bytes: Vec<u8>,
    offset: usize,
    window: usize,
}

impl DataBuffer {
    fn new(capacity: usize) -> Self {
        Self { bytes: vec![0; capacity], offset: 0, window: 0 }
    }

    fn capacity(&self) -> usize {
        self.bytes.len()
    }

    fn pending(&self) -> &[u8] {
        &self.bytes[self.offset..self.offset + self.window]
    }

    fn consume(&mut self, n: usize) {
        debug_assert!(n <= self.window);
        self.offset += n;
        self.window -= n;
    }
}

fn or_null(s: &str) -> String {
    if s.trim().is_empty() {
        NULL_FIELD.to_string()
    } else {
        s.to_string()
    }
}

enum Pump {
    Idle,
    Done,
    Failed,
}

pub struct Transfer {
    key: TransferKey,
    verdict: Verdict,
    state: TransferState,
    pause: PauseState,
    method: Method,
    file: FileInfo,
    handle: Option<OpenFile>,
    data: Connection,
    buffer: DataBuffer,
    advertise_address: String,
    advertise_service: String,
    source: String,
    passive_server: Option<ServerId>,
    any_port: bool,
    ticket: Option<AcceptTicket>,
    peer_prepared: bool,
    peer_tls: bool,
    tls: bool,
    io: IoSampler,
    refills: u64,
    history: Vec<TransferState>,
}

impl fmt::Debug for Transfer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transfer")
            .field("key", &self.key)
            .field("state", &self.state)
            .field("verdict", &self.verdict)
            .field("method", &self.method)
            .field("file", &self.file.name)
            .finish()
    }
}

fn check_data_server(servers: &ServerRegistry, id: Option<ServerId>) -> Result<(), EngineError> {
    match id {
        None => Ok(()),
        Some(id) => match servers.get(id) {
            None => Err(EngineError::UnknownServer(id)),
            Some(s) if s.kind() != ServerKind::Data => Err(EngineError::NotDataServer(id)),
            Some(_) => Ok(()),
        },
    }
}

impl Transfer {
    fn base(key: TransferKey, method: Method, file: FileInfo, settings: &Settings) -> Self {
        let start = file.position;
        Self {
            key,
            verdict: Verdict::Pending,
            state: TransferState::SetupPending,
            pause: PauseState::Pending,
            method,
            file,
            handle: None,
            data: Connection::new(ConnectionKind::Data),
            buffer: DataBuffer::new(DATA_BUFFER_LEN),
            advertise_address: settings.data_wide_address.clone(),
            advertise_service: settings.data_wide_service.clone(),
            source: settings.data_local_address.clone(),
            passive_server: None,
            any_port: false,
            ticket: None,
            peer_prepared: false,
            peer_tls: false,
            tls: false,
            io: IoSampler::new(start),
            refills: 0,
            history: vec![TransferState::SetupPending],
        }
    }

    /// New transfer for a local file we are about to suggest.
    pub fn outgoing(
        key: TransferKey,
        file: FileInfo,
        opts: &SuggestOptions,
        servers: &ServerRegistry,
        settings: &Settings,
    ) -> Result<Self, EngineError> {
        check_data_server(servers, opts.server)?;
        let mut t = Self::base(key, opts.method, file, settings);
        t.apply_endpoints(
            opts.source.as_deref(),
            opts.server,
            opts.any_port,
            opts.advertise_address.as_deref(),
            opts.advertise_service.as_deref(),
            servers,
        );
        t.tls = opts.tls;
        Ok(t)
    }

    /// New transfer created from a peer's FILE-SUGGEST. The peer's method is
    /// inverted into ours.
    #[allow(clippy::too_many_arguments)]
    pub fn incoming(
        key: TransferKey,
        filename: &str,
        size: u64,
        mtime: &str,
        peer_tls: bool,
        peer_method: Method,
        address: &str,
        service: &str,
        settings: &Settings,
    ) -> Result<Self, FileError> {
        let file = FileInfo::announced(settings.data_output_path.clone(), filename, size, mtime)?;
        let mut t = Self::base(key, peer_method.inverse(), file, settings);
        t.peer_tls = peer_tls;
        t.tls = peer_tls;
        t.data.set_destination(ResolveRequest::new(address, service));
        Ok(t)
    }

    fn apply_endpoints(
        &mut self,
        source: Option<&str>,
        server: Option<ServerId>,
        any_port: bool,
        advertise_address: Option<&str>,
        advertise_service: Option<&str>,
        servers: &ServerRegistry,
    ) {
        if let Some(s) = source {
            self.source = s.to_string();
        }
        if let Some(a) = advertise_address {
            self.advertise_address = a.to_string();
        }
        if self.method == Method::Passive {
            self.passive_server = server;
            self.any_port = any_port;
            match (advertise_service, server.and_then(|id| servers.get(id)).and_then(|s| s.local_addr())) {
                (Some(s), _) => self.advertise_service = s.to_string(),
                (None, Some(local)) => self.advertise_service = local.port().to_string(),
                (None, None) => {}
            }
        }
    }

    pub fn key(&self) -> TransferKey {
        self.key
    }

    pub fn id(&self) -> u64 {
        self.key.id
    }

    pub fn direction(&self) -> Direction {
        self.key.direction
    }

    pub fn state(&self) -> TransferState {
        self.state
    }

    pub fn verdict(&self) -> Verdict {
        self.verdict
    }

    pub fn pause_state(&self) -> PauseState {
        self.pause
    }

    pub fn method(&self) -> Method {
        self.method
    }

    pub fn file(&self) -> &FileInfo {
        &self.file
    }

    pub fn data_state(&self) -> ConnectionState {
        self.data.state()
    }

    pub fn data_local_addr(&self) -> Option<SocketAddr> {
        self.data.local_addr()
    }

    pub fn peer_prepared(&self) -> bool {
        self.peer_prepared
    }

    pub fn transferred(&self) -> u64 {
        self.io.total()
    }

    pub fn refills(&self) -> u64 {
        self.refills
    }

    /// Every state this transfer has been in, in order.
    pub fn history(&self) -> &[TransferState] {
        &self.history
    }

    pub fn view(&self) -> TransferView {
        TransferView {
            key: self.key,
            direction: self.key.direction,
            state: self.state,
            verdict: self.verdict,
            pause: self.pause,
            method: Some(self.method),
            name: self.file.name.clone(),
            size: self.file.size,
            position: self.file.position,
            transferred: self.io.total(),
            peer_tls: self.peer_tls,
        }
    }

    fn set_state(&mut self, next: TransferState, ctx: &mut Ctx<'_>) {
        assert!(
            self.state.may_become(next),
            "transfer {} cannot move from {:?} to {:?}",
            self.key,
            self.state,
            next
        );
        self.state = next;
        self.history.push(next);
        ctx.frontend.transfer(&self.view(), TransferChange::Updated);
    }

    fn advertised_tls(&self, servers: &ServerRegistry) -> bool {
        match (self.method, self.passive_server) {
            (Method::Active, _) => self.tls,
            (Method::Passive, Some(id)) => servers.get(id).map_or(false, |s| s.tls().is_some()),
            (Method::Passive, None) => false,
        }
    }

    fn suggestion(&self, service: String, servers: &ServerRegistry) -> Command {
        Command::FileSuggest {
            id: self.key.id,
            filename: self.file.name.clone(),
            size: self.file.size,
            mtime: or_null(&self.file.modtime),
            tls: self.advertised_tls(servers),
            method: self.method,
            address: or_null(&self.advertise_address),
            service: or_null(&service),
        }
    }

    fn accepting_verdict(&self, service: String) -> Command {
        Command::FileVerdict {
            id: self.key.id,
            accept: true,
            address: or_null(&self.advertise_address),
            service: or_null(&service),
            position: self.file.position,
        }
    }

    fn bound_port(&self) -> String {
        self.data.local_addr().map(|a| a.port().to_string()).unwrap_or_default()
    }

    fn enter_preparation(&mut self, ctx: &mut Ctx<'_>, out: &mut Vec<Command>) {
        self.set_state(TransferState::PreparationPending, ctx);
        out.push(Command::FilePrepared { id: self.key.id, direction: self.key.direction });
    }

    fn register_accept(&mut self, servers: &mut ServerRegistry, ctx: &mut Ctx<'_>) -> bool {
        let Some(id) = self.passive_server else { return false };
        let expected = self.data.destination().cloned();
        match (servers.get_mut(id), expected) {
            (Some(server), Some(req)) => {
                let entry = server.add_entry(req, self.any_port, self.key);
                self.ticket = Some(AcceptTicket { server: id, entry });
                self.set_state(TransferState::PassiveResolveAccept, ctx);
                true
            }
            _ => false,
        }
    }

    /// Send FILE-SUGGEST for an outgoing transfer; Active binds its source first.
    pub fn suggest(
        &mut self,
        ctx: &mut Ctx<'_>,
        servers: &mut ServerRegistry,
        out: &mut Vec<Command>,
    ) -> Result<(), EngineError> {
        if self.key.direction != Direction::Outgoing || self.state != TransferState::SetupPending {
            return Err(self.invalid("suggest"));
        }
        match self.method {
            Method::Active => {
                self.data.set_source(ResolveRequest::any_port(self.source.clone()));
                self.data.bind_source(ctx);
                self.set_state(TransferState::ActiveResolveSrc, ctx);
            }
            Method::Passive => {
                out.push(self.suggestion(self.advertise_service.clone(), servers));
                self.set_state(TransferState::VerdictPending, ctx);
            }
        }
        Ok(())
    }

    /// Peer's answer to our suggestion.
    #[allow(clippy::too_many_arguments)]
    pub fn on_verdict(
        &mut self,
        accept: bool,
        address: &str,
        service: &str,
        position: u64,
        ctx: &mut Ctx<'_>,
        servers: &mut ServerRegistry,
        out: &mut Vec<Command>,
    ) {
        if self.state != TransferState::VerdictPending {
            ctx.info(format!(
                "Ignoring verdict for transfer {} while {}.",
                self.key, self.state
            ));
            return;
        }
        if !accept {
            self.verdict = Verdict::Declined;
            ctx.info(format!("Transfer {} ({}) was declined.", self.key, self.file.name));
            self.abort(ctx, servers);
            return;
        }
        self.verdict = Verdict::Accepted;
        if position > self.file.size {
            ctx.frontend.error(
                &ErrorReport::new(ErrorKind::Protocol, format!("Peer asked to resume {} at {}.", self.key, position)),
            );
            self.abort(ctx, servers);
            return;
        }
        self.file.position = position;
        self.io = IoSampler::new(position);
        self.data.set_destination(ResolveRequest::new(address, service));
        if self.method == Method::Passive && self.register_accept(servers, ctx) {
            return;
        }
        self.enter_preparation(ctx, out);
    }

    /// Local verdict: accept an incoming suggestion.
    pub fn accept(
        &mut self,
        opts: &AcceptOptions,
        ctx: &mut Ctx<'_>,
        servers: &mut ServerRegistry,
        out: &mut Vec<Command>,
    ) -> Result<(), EngineError> {
        if self.key.direction != Direction::Incoming
            || self.state != TransferState::SetupPending
            || self.verdict != Verdict::Pending
        {
            return Err(self.invalid("accept"));
        }
        if self.method == Method::Passive {
            check_data_server(servers, opts.server)?;
        }
        let ours = match self.method {
            Method::Passive => opts.server.and_then(|id| servers.get(id)).map(|s| s.tls().is_some()),
            Method::Active => opts.tls,
        };
        if let Some(ours) = ours.filter(|ours| *ours != self.peer_tls) {
            return Err(EngineError::TlsMismatch { ours, theirs: self.peer_tls });
        }
        if opts.position > self.file.size {
            return Err(FileError::InvalidPosition { requested: opts.position, size: self.file.size }.into());
        }
        if let Some(dir) = &opts.directory {
            self.file.directory = dir.clone();
        }
        self.file.position = opts.position;
        self.io = IoSampler::new(opts.position);
        if let Some(tls) = opts.tls {
            self.tls = tls;
        }
        self.apply_endpoints(
            opts.source.as_deref(),
            opts.server,
            opts.any_port,
            opts.advertise_address.as_deref(),
            opts.advertise_service.as_deref(),
            servers,
        );
        self.verdict = Verdict::Accepted;

        match self.method {
            Method::Active => {
                self.data.set_source(ResolveRequest::any_port(self.source.clone()));
                self.data.bind_source(ctx);
                self.set_state(TransferState::ActiveResolveSrc, ctx);
            }
            Method::Passive => {
                if !self.register_accept(servers, ctx) {
                    // No listening server: announce readiness before the verdict
                    self.enter_preparation(ctx, out);
                    out.push(self.accepting_verdict(self.advertise_service.clone()));
                }
            }
        }
        Ok(())
    }

    /// Local verdict: decline an incoming suggestion.
    pub fn decline(
        &mut self,
        ctx: &mut Ctx<'_>,
        servers: &mut ServerRegistry,
        out: &mut Vec<Command>,
    ) -> Result<(), EngineError> {
        if self.key.direction != Direction::Incoming || self.verdict != Verdict::Pending {
            return Err(self.invalid("decline"));
        }
        out.push(Command::FileVerdict {
            id: self.key.id,
            accept: false,
            address: NULL_FIELD.to_string(),
            service: NULL_FIELD.to_string(),
            position: self.file.position,
        });
        self.verdict = Verdict::Declined;
        self.abort(ctx, servers);
        Ok(())
    }

    /// Peer reported FILE-PREPARED. False if it already had.
    pub fn mark_peer_prepared(&mut self) -> bool {
        !std::mem::replace(&mut self.peer_prepared, true)
    }

    pub fn pause(&mut self, ctx: &mut Ctx<'_>) -> Result<(), EngineError> {
        if self.state != TransferState::Transferring {
            return Err(self.invalid("pause"));
        }
        self.pause = PauseState::Paused;
        ctx.frontend.transfer(&self.view(), TransferChange::Updated);
        Ok(())
    }

    pub fn resume(&mut self, ctx: &mut Ctx<'_>) -> Result<(), EngineError> {
        if self.state != TransferState::Transferring {
            return Err(self.invalid("resume"));
        }
        self.pause = PauseState::Resumed;
        ctx.frontend.transfer(&self.view(), TransferChange::Updated);
        Ok(())
    }

    fn invalid(&self, what: &'static str) -> EngineError {
        EngineError::InvalidState { what, state: format!("{} is {}", self.key, self.state) }
    }

    /// A data server handed us the inbound connection we were waiting for.
    pub fn adopt_data(&mut self, stream: TcpStream, remote: SocketAddr, tls: Option<TlsSetup>, ctx: &mut Ctx<'_>) {
        self.ticket = None;
        if self.state.is_finished() {
            let _ = stream.shutdown(std::net::Shutdown::Both);
            return;
        }
        if self.data.adopt(stream, remote, tls, ctx) == Some(ConnEvent::Failed) {
            self.abort_with(ctx, None);
        }
    }

    /// Close whatever was opened and move to `Aborted`. No-op once finished.
    pub fn abort(&mut self, ctx: &mut Ctx<'_>, servers: &mut ServerRegistry) -> bool {
        if self.state.is_finished() {
            return false;
        }
        self.abort_with(ctx, Some(servers));
        true
    }

    fn abort_with(&mut self, ctx: &mut Ctx<'_>, servers: Option<&mut ServerRegistry>) {
        if self.state.is_finished() {
            return;
        }
        if let (Some(t), Some(servers)) = (self.ticket.take(), servers) {
            servers.release(t);
        }
        if self.data.is_open() {
            self.data.close(ctx);
        }
        self.handle = None;
        self.set_state(TransferState::Aborted, ctx);
        ctx.info(format!("Transfer {} was aborted.", self.key));
    }

    fn complete(&mut self, ctx: &mut Ctx<'_>) {
        self.data.close(ctx);
        if let Some(h) = self.handle.take() {
            if let Err(e) = h.finish() {
                self.file_error(ctx, &e);
            }
        }
        self.file.position = self.io.total();
        if self.key.direction == Direction::Incoming {
            file::apply_mtime(&self.file);
        }
        self.set_state(TransferState::Completed, ctx);
        ctx.info(format!(
            "Data transfer {} ({}) with {} successfully completed!",
            self.key,
            self.file.name,
            self.data.peer_label()
        ));
    }

    fn file_error(&self, ctx: &mut Ctx<'_>, e: &FileError) {
        ctx.frontend.error(
            &ErrorReport::new(ErrorKind::File, format!("{}: {}", self.key, e)).with_op(e.op(), e.code()),
        );
    }

    fn socket_error(&self, ctx: &mut Ctx<'_>, op: &'static str, e: &io::Error) {
        ctx.frontend.error(
            &ErrorReport::new(ErrorKind::Socket, format!("{}: {}", self.key, e)).with_op(op, e.raw_os_error()),
        );
    }

    fn dial_tls(&self, ctx: &Ctx<'_>) -> Option<TlsSetup> {
        self.tls.then(|| TlsSetup::client(ctx.settings.tls.clone()))
    }

    /// Advance this transfer by one scheduler tick.
    pub fn tick(&mut self, ctx: &mut Ctx<'_>, servers: &mut ServerRegistry, out: &mut Vec<Command>) {
        let event = self.data.advance(ctx);
        if event == Some(ConnEvent::Failed) {
            self.abort(ctx, servers);
            return;
        }
        match self.state {
            TransferState::ActiveResolveSrc => {
                if event == Some(ConnEvent::SourceBound) {
                    let port = self.bound_port();
                    match self.key.direction {
                        Direction::Outgoing => {
                            out.push(self.suggestion(port, servers));
                            self.set_state(TransferState::VerdictPending, ctx);
                        }
                        Direction::Incoming => {
                            out.push(self.accepting_verdict(port));
                            self.enter_preparation(ctx, out);
                        }
                    }
                }
            }
            TransferState::PassiveResolveAccept => {
                let resolved = match self.ticket {
                    // The entry matched and was consumed before this tick saw it resolve
                    None if self.data.is_open() => true,
                    None => false,
                    Some(ticket) => match servers.entry_state(ticket) {
                        Some(AcceptState::ResolvingIp) => return,
                        Some(AcceptState::Resolved) => true,
                        Some(AcceptState::Error) => false,
                        Some(AcceptState::Deleted) | None => {
                            ctx.error(ErrorKind::Socket, format!("Listening server for {} went away.", self.key));
                            self.abort(ctx, servers);
                            return;
                        }
                    },
                };
                if !resolved {
                    self.abort(ctx, servers);
                    return;
                }
                if self.key.direction == Direction::Incoming {
                    out.push(self.accepting_verdict(self.advertise_service.clone()));
                }
                self.enter_preparation(ctx, out);
            }
            TransferState::PreparationPending => {
                if self.peer_prepared {
                    self.start_transferring(ctx);
                }
            }
            TransferState::Transferring => self.transferring(ctx, servers),
            _ => {}
        }
    }

    fn start_transferring(&mut self, ctx: &mut Ctx<'_>) {
        self.set_state(TransferState::Transferring, ctx);
        self.pause = PauseState::Resumed;
        self.io = IoSampler::new(self.file.position);
        if self.method == Method::Active {
            let tls = self.dial_tls(ctx);
            self.data.set_tls(tls);
            self.data.connect(ctx);
        }
    }

    fn transferring(&mut self, ctx: &mut Ctx<'_>, servers: &mut ServerRegistry) {
        if self.method == Method::Passive && self.data.state() == ConnectionState::Closed {
            // Still waiting for the inbound connection; give up if its entry vanished
            if let Some(t) = self.ticket {
                if servers.entry_state(t).is_none() {
                    ctx.error(ErrorKind::Socket, format!("Listening server for {} went away.", self.key));
                    self.abort(ctx, servers);
                }
            }
            return;
        }
        if self.data.state() != ConnectionState::Established {
            return;
        }
        if self.handle.is_none() {
            let opened = match self.key.direction {
                Direction::Outgoing => OpenFile::for_read(&self.file),
                Direction::Incoming => OpenFile::for_write(&self.file),
            };
            match opened {
                Ok(h) => self.handle = Some(h),
                Err(e) => {
                    self.file_error(ctx, &e);
                    self.abort(ctx, servers);
                    return;
                }
            }
        }

        if self.pause == PauseState::Resumed {
            let result = match self.key.direction {
                Direction::Outgoing => self.pump_send(ctx),
                Direction::Incoming => self.pump_recv(ctx),
            };
            match result {
                Pump::Idle => {}
                Pump::Done => {
                    self.complete(ctx);
                    return;
                }
                Pump::Failed => {
                    self.abort(ctx, servers);
                    return;
                }
            }
        }

        if let Some(p) = self.io.sample(self.file.size, Instant::now()) {
            ctx.frontend.progress(&self.view(), &p);
        }
    }

    fn pump_send(&mut self, ctx: &mut Ctx<'_>) -> Pump {
        if self.buffer.window == 0 {
            self.buffer.offset = 0;
            if self.io.total() >= self.file.size {
                return self.drain(ctx);
            }
            let want = (self.file.size - self.io.total()).min(self.buffer.capacity() as u64) as usize;
            let Some(handle) = self.handle.as_mut() else { return Pump::Failed };
            if let Err(e) = handle.read_exact_at_position(&mut self.buffer.bytes[..want]) {
                self.file_error(ctx, &e);
                return Pump::Failed;
            }
            self.buffer.window = want;
            self.refills += 1;
        }

        match self.data.send_some(self.buffer.pending()) {
            Ok(n) => {
                self.buffer.consume(n);
                self.io.add(n as u64);
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => {
                self.socket_error(ctx, "send", &e);
                return Pump::Failed;
            }
        }

        if self.buffer.window == 0 && self.io.total() >= self.file.size {
            return self.drain(ctx);
        }
        Pump::Idle
    }

    fn drain(&mut self, ctx: &mut Ctx<'_>) -> Pump {
        match self.data.drain() {
            Ok(true) => Pump::Done,
            Ok(false) => Pump::Idle,
            Err(e) => {
                self.socket_error(ctx, "send", &e);
                Pump::Failed
            }
        }
    }

    fn pump_recv(&mut self, ctx: &mut Ctx<'_>) -> Pump {
        let remaining = self.file.size.saturating_sub(self.io.total());
        if remaining == 0 {
            return Pump::Done;
        }
        if !self.data.readable(ctx) {
            return Pump::Idle;
        }
        let want = remaining.min(self.buffer.capacity() as u64) as usize;
        self.buffer.offset = 0;
        match self.data.recv(&mut self.buffer.bytes[..want]) {
            Ok(0) => {
                ctx.error(
                    ErrorKind::Socket,
                    format!(
                        "{}: peer closed the data connection after {} of {} bytes.",
                        self.key,
                        self.io.total(),
                        self.file.size
                    ),
                );
                Pump::Failed
            }
            Ok(n) => {
                self.buffer.window = n;
                let Some(handle) = self.handle.as_mut() else { return Pump::Failed };
                if let Err(e) = handle.write_all(self.buffer.pending()) {
                    self.file_error(ctx, &e);
                    return Pump::Failed;
                }
                self.buffer.consume(n);
                self.io.add(n as u64);
                if self.io.total() >= self.file.size {
                    Pump::Done
                } else {
                    Pump::Idle
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::Interrupted => Pump::Idle,
            Err(e) => {
                self.socket_error(ctx, "recv", &e);
                Pump::Failed
            }
        }
    }

    /// Called when the peer's control connection goes away.
    pub fn on_peer_closed(&mut self, ctx: &mut Ctx<'_>, servers: &mut ServerRegistry) {
        if self.data.state() != ConnectionState::Established {
            self.abort(ctx, servers);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::tests::Harness;
    use crate::tls::TlsSettings;
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::time::Duration;
    use tempfile::TempDir;

    fn key(direction: Direction, id: u64) -> TransferKey {
        TransferKey { peer: PeerId(1), direction, id }
    }

    fn pair() -> (TcpStream, TcpStream, SocketAddr) {
        let l = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(l.local_addr().unwrap()).unwrap();
        let (server, remote) = l.accept().unwrap();
        (client, server, remote)
    }

    /// Put a transfer straight into Transferring over an adopted socket.
    fn transferring(t: &mut Transfer, h: &mut Harness, sock: TcpStream, remote: SocketAddr) {
        t.state = TransferState::Transferring;
        t.verdict = Verdict::Accepted;
        t.pause = PauseState::Resumed;
        t.method = Method::Passive;
        h.with(|ctx| t.adopt_data(sock, remote, None, ctx));
        assert_eq!(t.data_state(), ConnectionState::Established);
    }

    fn pattern(n: usize) -> Vec<u8> {
        (0..n).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn outgoing_pump_refills_and_completes() {
        let dir = TempDir::new().unwrap();
        let content = pattern(250_000);
        std::fs::write(dir.path().join("big.bin"), &content).unwrap();

        let mut h = Harness::new();
        let servers = ServerRegistry::new();
        let fi = FileInfo::from_path(&dir.path().join("big.bin")).unwrap();
        let mut t = Transfer::outgoing(
            key(Direction::Outgoing, 1),
            fi,
            &SuggestOptions::default(),
            &servers,
            &h.settings,
        )
        .unwrap();
        t.buffer = DataBuffer::new(100_000);

        let (mut client, server, remote) = pair();
        transferring(&mut t, &mut h, server, remote);
        client.set_nonblocking(true).unwrap();

        let mut servers = servers;
        let mut out = Vec::new();
        let mut received = Vec::new();
        let deadline = Instant::now() + Duration::from_secs(20);
        while t.state() != TransferState::Completed {
            assert!(Instant::now() < deadline, "stuck at {} bytes", t.transferred());
            h.with(|ctx| t.tick(ctx, &mut servers, &mut out));
            let mut buf = [0u8; 65536];
            while let Ok(n) = client.read(&mut buf) {
                if n == 0 {
                    break;
                }
                received.extend_from_slice(&buf[..n]);
            }
        }
        client.set_nonblocking(false).unwrap();
        client.read_to_end(&mut received).unwrap();

        assert_eq!(t.refills(), 3);
        assert_eq!(t.transferred(), 250_000);
        assert_eq!(received, content);
        assert!(out.is_empty());
        // Completed transfers ignore abort
        assert!(!h.with(|ctx| t.abort(ctx, &mut servers)));
        assert_eq!(t.state(), TransferState::Completed);
    }

    #[test]
    fn empty_file_needs_no_refill() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("empty"), b"").unwrap();
        let mut h = Harness::new();
        let mut servers = ServerRegistry::new();
        let fi = FileInfo::from_path(&dir.path().join("empty")).unwrap();
        let mut t =
            Transfer::outgoing(key(Direction::Outgoing, 1), fi, &SuggestOptions::default(), &servers, &h.settings)
                .unwrap();
        let (_client, server, remote) = pair();
        transferring(&mut t, &mut h, server, remote);
        h.with(|ctx| t.tick(ctx, &mut servers, &mut Vec::new()));
        assert_eq!(t.state(), TransferState::Completed);
        assert_eq!(t.refills(), 0);
    }

    fn incoming(h: &Harness, dir: &TempDir, size: u64) -> Transfer {
        let mut t = Transfer::incoming(
            key(Direction::Incoming, 4),
            "dest.bin",
            size,
            "NULL",
            false,
            Method::Active,
            "127.0.0.1",
            "1500",
            &h.settings,
        )
        .unwrap();
        t.file.directory = dir.path().to_path_buf();
        t
    }

    #[test]
    fn incoming_pump_writes_file() {
        let dir = TempDir::new().unwrap();
        let mut h = Harness::new();
        let mut servers = ServerRegistry::new();
        let mut t = incoming(&h, &dir, 3000);
        assert_eq!(t.method(), Method::Passive);
        let (mut client, server, remote) = pair();
        transferring(&mut t, &mut h, server, remote);

        let content = pattern(3000);
        client.write_all(&content).unwrap();
        let deadline = Instant::now() + Duration::from_secs(10);
        while t.state() != TransferState::Completed {
            assert!(Instant::now() < deadline);
            h.with(|ctx| t.tick(ctx, &mut servers, &mut Vec::new()));
        }
        assert_eq!(std::fs::read(dir.path().join("dest.bin")).unwrap(), content);
        assert_eq!(t.file().position, 3000);
    }

    #[test]
    fn early_close_aborts_incoming() {
        let dir = TempDir::new().unwrap();
        let mut h = Harness::new();
        let mut servers = ServerRegistry::new();
        let mut t = incoming(&h, &dir, 1000);
        let (mut client, server, remote) = pair();
        transferring(&mut t, &mut h, server, remote);

        client.write_all(&pattern(400)).unwrap();
        drop(client);
        let deadline = Instant::now() + Duration::from_secs(10);
        while !t.state().is_finished() {
            assert!(Instant::now() < deadline);
            h.with(|ctx| t.tick(ctx, &mut servers, &mut Vec::new()));
        }
        assert_eq!(t.state(), TransferState::Aborted);
        assert_eq!(t.transferred(), 400);
        assert_eq!(std::fs::metadata(dir.path().join("dest.bin")).unwrap().len(), 400);
        assert!(h.frontend.saw_error("after 400 of 1000 bytes"));
    }

    #[test]
    fn abort_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let mut h = Harness::new();
        let mut servers = ServerRegistry::new();
        let mut t = incoming(&h, &dir, 10);
        assert!(h.with(|ctx| t.abort(ctx, &mut servers)));
        let notices = h.frontend.notices.len();
        assert!(!h.with(|ctx| t.abort(ctx, &mut servers)));
        assert_eq!(t.state(), TransferState::Aborted);
        assert_eq!(h.frontend.notices.len(), notices);
        // Nothing was opened, so nothing was closed
        assert!(h.readiness.is_empty());
    }

    #[test]
    fn decline_sends_null_endpoint() {
        let dir = TempDir::new().unwrap();
        let mut h = Harness::new();
        let mut servers = ServerRegistry::new();
        let mut t = incoming(&h, &dir, 10);
        let mut out = Vec::new();
        h.with(|ctx| t.decline(ctx, &mut servers, &mut out)).unwrap();
        assert_eq!(
            out,
            vec![Command::FileVerdict {
                id: 4,
                accept: false,
                address: "NULL".into(),
                service: "NULL".into(),
                position: 0
            }]
        );
        assert_eq!(t.verdict(), Verdict::Declined);
        assert_eq!(t.state(), TransferState::Aborted);
        assert!(h.with(|ctx| t.decline(ctx, &mut servers, &mut out)).is_err());
    }

    #[test]
    fn passive_accept_without_server_prepares_first() {
        let dir = TempDir::new().unwrap();
        let mut h = Harness::new();
        h.settings.data_wide_address = "203.0.113.9".into();
        h.settings.data_wide_service = "7000".into();
        let mut servers = ServerRegistry::new();
        let mut t = incoming(&h, &dir, 10);
        let mut out = Vec::new();
        h.with(|ctx| t.accept(&AcceptOptions::default(), ctx, &mut servers, &mut out)).unwrap();
        assert_eq!(t.state(), TransferState::PreparationPending);
        assert_eq!(
            out,
            vec![
                Command::FilePrepared { id: 4, direction: Direction::Incoming },
                Command::FileVerdict {
                    id: 4,
                    accept: true,
                    address: "203.0.113.9".into(),
                    service: "7000".into(),
                    position: 0
                },
            ]
        );
    }

    #[test]
    fn accept_rejects_position_past_size() {
        let dir = TempDir::new().unwrap();
        let mut h = Harness::new();
        let mut servers = ServerRegistry::new();
        let mut t = incoming(&h, &dir, 10);
        let opts = AcceptOptions { position: 11, ..Default::default() };
        let r = h.with(|ctx| t.accept(&opts, ctx, &mut servers, &mut Vec::new()));
        assert!(matches!(r, Err(EngineError::File(FileError::InvalidPosition { .. }))));
        assert_eq!(t.state(), TransferState::SetupPending);
    }

    #[test]
    fn illegal_transitions_are_refused() {
        use TransferState::*;
        assert!(SetupPending.may_become(VerdictPending));
        assert!(VerdictPending.may_become(PassiveResolveAccept));
        assert!(!SetupPending.may_become(Transferring));
        assert!(!VerdictPending.may_become(Transferring));
        assert!(!Completed.may_become(Aborted));
        assert!(!Aborted.may_become(Aborted));
    }

    #[test]
    fn peer_prepared_once() {
        let dir = TempDir::new().unwrap();
        let h = Harness::new();
        let mut t = incoming(&h, &dir, 10);
        assert!(t.mark_peer_prepared());
        assert!(!t.mark_peer_prepared());
    }

    /// Incoming passive transfer waiting on an accept entry.
    fn waiting_on_entry(h: &Harness, dir: &TempDir, ticket: AcceptTicket) -> Transfer {
        let mut t = incoming(h, dir, 10);
        t.verdict = Verdict::Accepted;
        t.state = TransferState::PassiveResolveAccept;
        t.history.push(TransferState::PassiveResolveAccept);
        t.ticket = Some(ticket);
        t
    }

    #[test]
    fn data_adopted_before_entry_resolution_is_seen() {
        let dir = TempDir::new().unwrap();
        let mut h = Harness::new();
        let mut servers = ServerRegistry::new();
        let mut t = waiting_on_entry(&h, &dir, AcceptTicket { server: ServerId(9), entry: 0 });

        // The server matched the connection earlier in the same tick
        let (_client, server, remote) = pair();
        h.with(|ctx| t.adopt_data(server, remote, None, ctx));
        let mut out = Vec::new();
        h.with(|ctx| t.tick(ctx, &mut servers, &mut out));

        assert_eq!(t.state(), TransferState::PreparationPending);
        assert_eq!(t.data_state(), ConnectionState::Established);
        assert!(matches!(
            out.as_slice(),
            [Command::FileVerdict { accept: true, .. }, Command::FilePrepared { id: 4, .. }]
        ));
        assert!(h.frontend.errors.is_empty());
    }

    #[test]
    fn vanished_accept_entry_aborts() {
        let dir = TempDir::new().unwrap();
        let mut h = Harness::new();
        let mut servers = ServerRegistry::new();
        let mut t = waiting_on_entry(&h, &dir, AcceptTicket { server: ServerId(9), entry: 0 });
        let mut out = Vec::new();
        h.with(|ctx| t.tick(ctx, &mut servers, &mut out));
        assert_eq!(t.state(), TransferState::Aborted);
        assert!(out.is_empty());
        assert!(h.frontend.saw_error("went away"));
    }

    #[test]
    fn accept_refuses_tls_mismatch() {
        let dir = TempDir::new().unwrap();
        let mut h = Harness::new();
        let mut servers = ServerRegistry::new();
        let plain = servers.create(ServerKind::Data, ResolveRequest::new("127.0.0.1", "0"), None);
        let secure =
            servers.create(ServerKind::Data, ResolveRequest::new("127.0.0.1", "0"), Some(TlsSettings::default()));

        // Peer dials with TLS into a plain server
        let mut t = Transfer::incoming(
            key(Direction::Incoming, 5),
            "secret.bin",
            10,
            "NULL",
            true,
            Method::Active,
            "127.0.0.1",
            "1500",
            &h.settings,
        )
        .unwrap();
        t.file.directory = dir.path().to_path_buf();
        let opts = AcceptOptions { server: Some(plain), ..Default::default() };
        let r = h.with(|ctx| t.accept(&opts, ctx, &mut servers, &mut Vec::new()));
        assert!(matches!(r, Err(EngineError::TlsMismatch { ours: false, theirs: true })));
        assert_eq!(t.state(), TransferState::SetupPending);
        assert_eq!(t.verdict(), Verdict::Pending);

        let opts = AcceptOptions { server: Some(secure), ..Default::default() };
        h.with(|ctx| t.accept(&opts, ctx, &mut servers, &mut Vec::new())).unwrap();
        assert_eq!(t.state(), TransferState::PassiveResolveAccept);

        // We dial a plain passive peer but asked for TLS
        let mut u = Transfer::incoming(
            key(Direction::Incoming, 6),
            "other.bin",
            10,
            "NULL",
            false,
            Method::Passive,
            "127.0.0.1",
            "1500",
            &h.settings,
        )
        .unwrap();
        let opts = AcceptOptions { tls: Some(true), ..Default::default() };
        let r = h.with(|ctx| u.accept(&opts, ctx, &mut servers, &mut Vec::new()));
        assert!(matches!(r, Err(EngineError::TlsMismatch { ours: true, theirs: false })));
        assert_eq!(u.state(), TransferState::SetupPending);
    }
}
