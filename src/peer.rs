//! A remote peer: one control connection, the command backlog fed by it,
//! and every transfer negotiated over it.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::io;
use std::net::{SocketAddr, TcpStream};
use std::path::Path;

use crate::connection::{ConnEvent, Connection, ConnectionKind, ConnectionState, TlsSetup};
use crate::context::Ctx;
use crate::error::{CodecError, EngineError};
use crate::file::FileInfo;
use crate::frontend::{ErrorKind, TransferChange, VerdictRequest};
use crate::protocol::{limits::CONTROL_BUFFER_LEN, NULL_FIELD, VERSION};
use crate::protocol_core::{Command, LineBuffer};
use crate::resolve::ResolveRequest;
use crate::server::ServerRegistry;
use crate::transfer::{AcceptOptions, Direction, SuggestOptions, Transfer, TransferKey};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PeerId(pub u64);

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer#{}", self.0)
    }
}

/// One received line, decoded or not. Decode failures are kept so the
/// version gate also covers garbage sent before VERSION.
#[derive(Debug)]
enum Inbound {
    Command(Command),
    Malformed { line: String, error: CodecError },
}

pub struct Peer {
    id: PeerId,
    control: Connection,
    inbox: LineBuffer,
    backlog: VecDeque<Inbound>,
    /// The other side finished sending; close once the backlog is handled.
    remote_done: bool,
    remote_version: Option<String>,
    reported: Option<ConnectionState>,
    next_outgoing: u64,
    transfers: BTreeMap<(Direction, u64), Transfer>,
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer")
            .field("id", &self.id)
            .field("control", &self.control)
            .field("remote_version", &self.remote_version)
            .field("transfers", &self.transfers.len())
            .finish()
    }
}

impl Peer {
    fn new(id: PeerId) -> Self {
        Self {
            id,
            control: Connection::new(ConnectionKind::Control),
            inbox: LineBuffer::new(CONTROL_BUFFER_LEN),
            backlog: VecDeque::new(),
            remote_done: false,
            remote_version: None,
            reported: None,
            next_outgoing: 1,
            transfers: BTreeMap::new(),
        }
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    pub fn state(&self) -> ConnectionState {
        self.control.state()
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.control.remote_addr()
    }

    pub fn label(&self) -> String {
        self.control.peer_label()
    }

    /// Version announced by the other side, once received.
    pub fn remote_version(&self) -> Option<&str> {
        self.remote_version.as_deref()
    }

    pub fn is_verified(&self) -> bool {
        self.remote_version.is_some()
    }

    pub fn transfers(&self) -> impl Iterator<Item = &Transfer> {
        self.transfers.values()
    }

    pub fn transfer(&self, direction: Direction, id: u64) -> Option<&Transfer> {
        self.transfers.get(&(direction, id))
    }

    pub fn backlog_len(&self) -> usize {
        self.backlog.len()
    }

    fn key(&self, direction: Direction, id: u64) -> TransferKey {
        TransferKey { peer: self.id, direction, id }
    }

    fn transfer_mut(&mut self, key: TransferKey) -> Result<&mut Transfer, EngineError> {
        self.transfers
            .get_mut(&(key.direction, key.id))
            .ok_or(EngineError::UnknownTransfer(key))
    }

    /// A peer that announces no data address is reached where its control
    /// connection comes from.
    fn or_remote_ip(&self, address: String) -> String {
        match self.control.remote_addr() {
            Some(r) if address.eq_ignore_ascii_case(NULL_FIELD) => r.ip().to_string(),
            _ => address,
        }
    }

    fn report_state(&mut self, ctx: &mut Ctx<'_>) {
        let now = self.control.state();
        if self.reported != Some(now) {
            self.reported = Some(now);
            ctx.frontend.peer_state(self.id, now);
        }
    }

    /// Dial the peer's control server. A configured client address is bound first.
    fn start_outbound(&mut self, ctx: &mut Ctx<'_>) {
        let settings = ctx.settings;
        if !settings.control_client_address.is_empty() || !settings.control_client_service.is_empty() {
            let source = if settings.control_client_service.is_empty() {
                ResolveRequest::any_port(settings.control_client_address.clone())
            } else {
                ResolveRequest::new(
                    settings.control_client_address.clone(),
                    settings.control_client_service.clone(),
                )
            };
            self.control.set_source(source);
            self.control.bind_source(ctx);
        } else {
            self.control.connect(ctx);
        }
        self.report_state(ctx);
    }

    fn on_event(&mut self, event: Option<ConnEvent>, ctx: &mut Ctx<'_>, servers: &mut ServerRegistry) {
        match event {
            Some(ConnEvent::SourceBound) => self.control.connect(ctx),
            Some(ConnEvent::Established) => {
                self.send(&Command::Version { version: VERSION.to_string() }, ctx, servers);
            }
            Some(ConnEvent::Failed) => self.teardown(ctx, servers),
            None => {}
        }
        self.report_state(ctx);
    }

    /// Move the control connection along its background steps.
    pub fn advance(&mut self, ctx: &mut Ctx<'_>, servers: &mut ServerRegistry) {
        let event = self.control.advance(ctx);
        self.on_event(event, ctx, servers);
    }

    /// Tick every transfer and flush the commands they produced.
    pub fn tick_transfers(&mut self, ctx: &mut Ctx<'_>, servers: &mut ServerRegistry) {
        let mut out = Vec::new();
        for t in self.transfers.values_mut() {
            t.tick(ctx, servers, &mut out);
        }
        self.flush(out, ctx, servers);
    }

    fn flush(&mut self, out: Vec<Command>, ctx: &mut Ctx<'_>, servers: &mut ServerRegistry) {
        for cmd in out {
            self.send(&cmd, ctx, servers);
        }
    }

    /// Encode and write one command. Any write failure other than
    /// would-block kills the control connection.
    pub fn send(&mut self, cmd: &Command, ctx: &mut Ctx<'_>, servers: &mut ServerRegistry) {
        if self.control.state() != ConnectionState::Established {
            ctx.info(format!("Not sending {} to {}: not connected.", cmd.name(), self.label()));
            return;
        }
        let line = match cmd.encode() {
            Ok(l) => l,
            Err(e) => {
                ctx.error(ErrorKind::Protocol, format!("Could not encode {}: {}", cmd.name(), e));
                return;
            }
        };
        ctx.info(format!("Protocol --> {} \"{}\"", self.label(), line.trim_end()));
        if let Err(e) = self.control.send_all(line.as_bytes()) {
            ctx.io_error(ErrorKind::Socket, "send", &e);
            self.close(ctx, servers);
        }
    }

    /// Pull whatever the control socket has and queue decoded lines.
    pub fn receive(&mut self, ctx: &mut Ctx<'_>, servers: &mut ServerRegistry) {
        if self.remote_done
            || self.control.state() != ConnectionState::Established
            || !self.control.readable(ctx)
        {
            return;
        }
        let mut chunk = vec![0u8; CONTROL_BUFFER_LEN];
        loop {
            let room = self.inbox.spare();
            if room == 0 {
                break;
            }
            match self.control.recv(&mut chunk[..room]) {
                Ok(0) => {
                    self.remote_done = true;
                    break;
                }
                Ok(n) => self.inbox.extend(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    ctx.io_error(ErrorKind::Socket, "recv", &e);
                    self.close(ctx, servers);
                    return;
                }
            }
            self.queue_lines();
        }
        self.queue_lines();
        if self.remote_done && !self.inbox.residue().is_empty() {
            ctx.error(
                ErrorKind::Protocol,
                format!(
                    "{} closed the connection in the middle of a line, {} bytes discarded.",
                    self.label(),
                    self.inbox.residue().len()
                ),
            );
        }
        if self.inbox.overflowed() {
            ctx.error(
                ErrorKind::Protocol,
                format!("{} sent a line longer than {} bytes, closing.", self.label(), CONTROL_BUFFER_LEN),
            );
            self.close(ctx, servers);
        }
    }

    fn queue_lines(&mut self) {
        while let Some(line) = self.inbox.next_line() {
            if line.is_empty() {
                continue;
            }
            let item = match Command::decode(&line) {
                Ok(cmd) => Inbound::Command(cmd),
                Err(error) => Inbound::Malformed { line: String::from_utf8_lossy(&line).into_owned(), error },
            };
            self.backlog.push_back(item);
        }
    }

    /// Drain the backlog in arrival order.
    pub fn dispatch(&mut self, ctx: &mut Ctx<'_>, servers: &mut ServerRegistry) {
        while let Some(item) = self.backlog.pop_front() {
            if self.control.state() != ConnectionState::Established {
                self.backlog.clear();
                return;
            }
            let verified = self.is_verified();
            match item {
                Inbound::Command(Command::Version { version }) => self.on_version(version, ctx),
                Inbound::Command(cmd) if !verified => {
                    ctx.error(
                        ErrorKind::Protocol,
                        format!("{} sent {} before VERSION, closing.", self.label(), cmd.name()),
                    );
                    self.close(ctx, servers);
                }
                Inbound::Malformed { line, error } if !verified => {
                    ctx.error(
                        ErrorKind::Protocol,
                        format!("{} sent \"{}\" before VERSION ({}), closing.", self.label(), line, error),
                    );
                    self.close(ctx, servers);
                }
                Inbound::Malformed { line, error } => {
                    ctx.error(
                        ErrorKind::Protocol,
                        format!("Dropping line \"{}\" from {}: {}", line, self.label(), error),
                    );
                }
                Inbound::Command(cmd) => {
                    ctx.info(format!("Protocol <-- {} \"{}\"", self.label(), cmd));
                    self.handle(cmd, ctx, servers);
                }
            }
        }
        if self.remote_done && self.control.state() == ConnectionState::Established {
            ctx.info(format!("Connection closed by {}.", self.label()));
            self.close(ctx, servers);
        }
    }

    fn on_version(&mut self, version: String, ctx: &mut Ctx<'_>) {
        if self.remote_version.is_some() {
            ctx.info(format!("Ignoring repeated VERSION from {}.", self.label()));
            return;
        }
        if version != VERSION {
            ctx.error(
                ErrorKind::Protocol,
                format!("{} runs {}, we run {}.", self.label(), version, VERSION),
            );
        } else {
            ctx.info(format!("{} runs {}.", self.label(), version));
        }
        self.remote_version = Some(version);
    }

    fn handle(&mut self, cmd: Command, ctx: &mut Ctx<'_>, servers: &mut ServerRegistry) {
        let mut out = Vec::new();
        match cmd {
            Command::Version { .. } => {}
            Command::Talk { message } => {
                ctx.info(format!("Message from {}: {}", self.label(), message));
            }
            Command::FileSuggest { id, filename, size, mtime, tls, method, address, service } => {
                if self.transfers.contains_key(&(Direction::Incoming, id)) {
                    ctx.info(format!(
                        "{} reused incoming transfer id {}, suggestion ignored.",
                        self.label(),
                        id
                    ));
                    return;
                }
                let key = self.key(Direction::Incoming, id);
                let address = self.or_remote_ip(address);
                let t = match Transfer::incoming(
                    key,
                    &filename,
                    size,
                    &mtime,
                    tls,
                    method,
                    &address,
                    &service,
                    ctx.settings,
                ) {
                    Ok(t) => t,
                    Err(e) => {
                        ctx.error(ErrorKind::File, format!("Rejecting suggestion from {}: {}", self.label(), e));
                        return;
                    }
                };
                let view = t.view();
                self.transfers.insert((Direction::Incoming, id), t);
                ctx.frontend.transfer(&view, TransferChange::Added);
                ctx.info(format!("{} suggests {} ({} bytes).", self.label(), filename, size));

                let decision = ctx.frontend.request_verdict(&view);
                let Some(t) = self.transfers.get_mut(&(Direction::Incoming, id)) else { return };
                let result = match decision {
                    VerdictRequest::Defer => Ok(()),
                    VerdictRequest::Accept(opts) => t.accept(&opts, ctx, servers, &mut out),
                    VerdictRequest::Decline => t.decline(ctx, servers, &mut out),
                };
                if let Err(e) = result {
                    ctx.error(ErrorKind::System, format!("Verdict for {} failed: {}", key, e));
                }
            }
            Command::FileVerdict { id, accept, address, service, position } => {
                let address = self.or_remote_ip(address);
                match self.transfers.get_mut(&(Direction::Outgoing, id)) {
                    Some(t) => t.on_verdict(accept, &address, &service, position, ctx, servers, &mut out),
                    None => ctx.info(format!("Verdict for unknown transfer {} from {}.", id, self.label())),
                }
            }
            Command::FilePrepared { id, direction } => {
                // The sender names its own side
                match self.transfers.get_mut(&(direction.flip(), id)) {
                    Some(t) => {
                        if !t.mark_peer_prepared() {
                            ctx.info(format!("Duplicate FILE-PREPARED for {}.", t.key()));
                        }
                    }
                    None => ctx.info(format!(
                        "FILE-PREPARED for unknown {} transfer {} from {}.",
                        direction.flip(),
                        id,
                        self.label()
                    )),
                }
            }
        }
        self.flush(out, ctx, servers);
    }

    /// Suggest a local file to this peer. Returns the new transfer's key.
    pub fn suggest_file(
        &mut self,
        path: &Path,
        opts: &SuggestOptions,
        ctx: &mut Ctx<'_>,
        servers: &mut ServerRegistry,
    ) -> Result<TransferKey, EngineError> {
        if self.control.state() != ConnectionState::Established || !self.is_verified() {
            return Err(EngineError::InvalidState {
                what: "suggest file",
                state: format!("{} is {}", self.id, self.control.state()),
            });
        }
        let info = FileInfo::from_path(path)?;
        let max_used = self
            .transfers
            .keys()
            .filter(|(d, _)| *d == Direction::Outgoing)
            .map(|(_, id)| *id)
            .max()
            .unwrap_or(0);
        let id = self.next_outgoing.max(max_used + 1);
        let key = self.key(Direction::Outgoing, id);
        let mut t = Transfer::outgoing(key, info, opts, servers, ctx.settings)?;
        self.next_outgoing = id + 1;

        ctx.frontend.transfer(&t.view(), TransferChange::Added);
        let mut out = Vec::new();
        t.suggest(ctx, servers, &mut out)?;
        self.transfers.insert((Direction::Outgoing, id), t);
        self.flush(out, ctx, servers);
        Ok(key)
    }

    pub fn accept_transfer(
        &mut self,
        id: u64,
        opts: &AcceptOptions,
        ctx: &mut Ctx<'_>,
        servers: &mut ServerRegistry,
    ) -> Result<(), EngineError> {
        let key = self.key(Direction::Incoming, id);
        let mut out = Vec::new();
        self.transfer_mut(key)?.accept(opts, ctx, servers, &mut out)?;
        self.flush(out, ctx, servers);
        Ok(())
    }

    pub fn decline_transfer(
        &mut self,
        id: u64,
        ctx: &mut Ctx<'_>,
        servers: &mut ServerRegistry,
    ) -> Result<(), EngineError> {
        let key = self.key(Direction::Incoming, id);
        let mut out = Vec::new();
        self.transfer_mut(key)?.decline(ctx, servers, &mut out)?;
        self.flush(out, ctx, servers);
        Ok(())
    }

    pub fn pause(&mut self, key: TransferKey, ctx: &mut Ctx<'_>) -> Result<(), EngineError> {
        self.transfer_mut(key)?.pause(ctx)
    }

    pub fn resume(&mut self, key: TransferKey, ctx: &mut Ctx<'_>) -> Result<(), EngineError> {
        self.transfer_mut(key)?.resume(ctx)
    }

    pub fn abort(&mut self, key: TransferKey, ctx: &mut Ctx<'_>, servers: &mut ServerRegistry) -> Result<bool, EngineError> {
        Ok(self.transfer_mut(key)?.abort(ctx, servers))
    }

    pub fn talk(&mut self, message: &str, ctx: &mut Ctx<'_>, servers: &mut ServerRegistry) -> Result<(), EngineError> {
        if !self.is_verified() {
            return Err(EngineError::InvalidState {
                what: "talk",
                state: format!("{} is {}", self.id, self.control.state()),
            });
        }
        self.send(&Command::Talk { message: message.to_string() }, ctx, servers);
        Ok(())
    }

    /// A data server matched an inbound connection to one of our transfers.
    pub fn adopt_data(
        &mut self,
        key: TransferKey,
        stream: TcpStream,
        remote: SocketAddr,
        tls: Option<TlsSetup>,
        ctx: &mut Ctx<'_>,
    ) {
        match self.transfers.get_mut(&(key.direction, key.id)) {
            Some(t) => t.adopt_data(stream, remote, tls, ctx),
            None => {
                ctx.info(format!("Transfer {} is gone, dropping its data connection.", key));
                let _ = stream.shutdown(std::net::Shutdown::Both);
            }
        }
    }

    /// Close the control connection; transfers without an established
    /// data channel go down with it.
    pub fn close(&mut self, ctx: &mut Ctx<'_>, servers: &mut ServerRegistry) {
        self.control.close(ctx);
        self.inbox.clear();
        self.teardown(ctx, servers);
        self.report_state(ctx);
    }

    fn teardown(&mut self, ctx: &mut Ctx<'_>, servers: &mut ServerRegistry) {
        self.backlog.clear();
        for t in self.transfers.values_mut() {
            t.on_peer_closed(ctx, servers);
        }
    }

    /// Mark for removal; the registry reaps it on the next tick.
    pub fn remove(&mut self, ctx: &mut Ctx<'_>, servers: &mut ServerRegistry) {
        self.close(ctx, servers);
        self.control.delete(ctx);
        self.report_state(ctx);
    }

    fn reap(&mut self, ctx: &mut Ctx<'_>, servers: &mut ServerRegistry) {
        for t in self.transfers.values_mut() {
            t.abort(ctx, servers);
            ctx.frontend.transfer(&t.view(), TransferChange::Removed);
        }
        self.transfers.clear();
    }
}

/// Every known peer, keyed by a stable id.
#[derive(Debug, Default)]
pub struct PeerRegistry {
    peers: BTreeMap<PeerId, Peer>,
    next_id: u64,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn allocate(&mut self) -> PeerId {
        self.next_id += 1;
        PeerId(self.next_id)
    }

    /// Start dialing a control server.
    pub fn connect(&mut self, destination: ResolveRequest, tls: Option<TlsSetup>, ctx: &mut Ctx<'_>) -> PeerId {
        let id = self.allocate();
        let mut peer = Peer::new(id);
        peer.control.set_destination(destination);
        peer.control.set_tls(tls);
        peer.start_outbound(ctx);
        self.peers.insert(id, peer);
        id
    }

    /// Wrap a connection accepted by a control server.
    pub fn adopt(
        &mut self,
        stream: TcpStream,
        remote: SocketAddr,
        tls: Option<TlsSetup>,
        ctx: &mut Ctx<'_>,
        servers: &mut ServerRegistry,
    ) -> PeerId {
        let id = self.allocate();
        let mut peer = Peer::new(id);
        let event = peer.control.adopt(stream, remote, tls, ctx);
        peer.on_event(event, ctx, servers);
        self.peers.insert(id, peer);
        id
    }

    pub fn get(&self, id: PeerId) -> Option<&Peer> {
        self.peers.get(&id)
    }

    pub fn get_mut(&mut self, id: PeerId) -> Option<&mut Peer> {
        self.peers.get_mut(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Peer> {
        self.peers.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Peer> {
        self.peers.values_mut()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Drop every peer whose control connection is `Deleted`.
    pub fn collect_garbage(&mut self, ctx: &mut Ctx<'_>, servers: &mut ServerRegistry) -> Vec<PeerId> {
        let mut gone = Vec::new();
        self.peers.retain(|id, peer| {
            if peer.state() != ConnectionState::Deleted {
                return true;
            }
            peer.reap(ctx, servers);
            gone.push(*id);
            false
        });
        gone
    }
}
