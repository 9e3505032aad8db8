//! Listening sockets for control and data channels.
//!
//! Data servers only hand out connections whose remote address was announced
//! beforehand through an accept entry; each entry is good for one accept.

use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};

use socket2::{Domain, Protocol, Socket, Type};

use crate::connection::TlsSetup;
use crate::context::Ctx;
use crate::frontend::ErrorKind;
use crate::protocol::limits::LISTEN_BACKLOG;
use crate::readiness::{descriptor_of, Descriptor};
use crate::resolve::{describe, same_endpoint, ResolveRequest};
use crate::task::{Handoff, Poll};
use crate::tls::TlsSettings;
use crate::transfer::TransferKey;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ServerId(pub u64);

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "server#{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServerKind {
    Control,
    Data,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum ServerState {
    Closed,
    ResolvingIp,
    Listening,
    Deleted,
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ServerState::Closed => "Closed",
            ServerState::ResolvingIp => "Resolving",
            ServerState::Listening => "Listening",
            ServerState::Deleted => "Deleted",
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AcceptState {
    ResolvingIp,
    Resolved,
    Error,
    Deleted,
}

/// Handle a transfer keeps for the entry it registered.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct AcceptTicket {
    pub server: ServerId,
    pub entry: u64,
}

struct AcceptEntry {
    id: u64,
    state: AcceptState,
    request: ResolveRequest,
    any_port: bool,
    target: TransferKey,
    candidates: Vec<SocketAddr>,
    task: Option<Handoff<Vec<SocketAddr>>>,
}

impl AcceptEntry {
    fn advance(&mut self, ctx: &mut Ctx<'_>) {
        if self.state != AcceptState::ResolvingIp {
            return;
        }
        let Some(task) = self.task.as_mut() else { return };
        match task.poll() {
            Poll::Pending => {}
            Poll::Ready(addrs) => {
                self.task = None;
                ctx.info(format!("Successfully resolved remote accept address {}.", self.request));
                self.candidates = addrs;
                self.state = AcceptState::Resolved;
            }
            Poll::Failed(f) => {
                self.task = None;
                ctx.failure("Could not resolve remote accept address", &f);
                self.state = AcceptState::Error;
            }
        }
    }

    fn matches(&self, remote: &SocketAddr) -> bool {
        self.state == AcceptState::Resolved
            && self.candidates.iter().any(|c| same_endpoint(remote, c, self.any_port))
    }
}

/// A connection handed out by `Server::accept`.
pub enum Accepted {
    Control {
        stream: TcpStream,
        remote: SocketAddr,
        tls: Option<TlsSetup>,
    },
    Data {
        target: TransferKey,
        stream: TcpStream,
        remote: SocketAddr,
        tls: Option<TlsSetup>,
    },
}

pub struct Server {
    id: ServerId,
    kind: ServerKind,
    state: ServerState,
    request: ResolveRequest,
    tls: Option<TlsSettings>,
    listener: Option<TcpListener>,
    descriptor: Option<Descriptor>,
    local: Option<SocketAddr>,
    resolve: Option<Handoff<Vec<SocketAddr>>>,
    entries: Vec<AcceptEntry>,
    next_entry: u64,
}

fn listen_on(candidates: &[SocketAddr]) -> Result<TcpListener, (&'static str, io::Error)> {
    let mut last = ("bind", io::Error::from(io::ErrorKind::AddrNotAvailable));
    for cand in candidates {
        let attempt = || -> Result<TcpListener, (&'static str, io::Error)> {
            let socket = Socket::new(Domain::for_address(*cand), Type::STREAM, Some(Protocol::TCP))
                .map_err(|e| ("socket", e))?;
            socket.set_reuse_address(true).map_err(|e| ("setsockopt", e))?;
            socket.bind(&(*cand).into()).map_err(|e| ("bind", e))?;
            socket.listen(LISTEN_BACKLOG).map_err(|e| ("listen", e))?;
            socket.set_nonblocking(true).map_err(|e| ("set_nonblocking", e))?;
            Ok(socket.into())
        };
        match attempt() {
            Ok(l) => return Ok(l),
            Err(e) => last = e,
        }
    }
    Err(last)
}

impl Server {
    pub fn new(id: ServerId, kind: ServerKind, request: ResolveRequest, tls: Option<TlsSettings>) -> Self {
        Self {
            id,
            kind,
            state: ServerState::Closed,
            request,
            tls,
            listener: None,
            descriptor: None,
            local: None,
            resolve: None,
            entries: Vec::new(),
            next_entry: 1,
        }
    }

    pub fn id(&self) -> ServerId {
        self.id
    }

    pub fn kind(&self) -> ServerKind {
        self.kind
    }

    pub fn state(&self) -> ServerState {
        self.state
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local
    }

    pub fn tls(&self) -> Option<&TlsSettings> {
        self.tls.as_ref()
    }

    pub fn request(&self) -> &ResolveRequest {
        &self.request
    }

    fn set_state(&mut self, next: ServerState, ctx: &mut Ctx<'_>) {
        if self.state != next {
            self.state = next;
            ctx.frontend.server_state(self.id, next);
        }
    }

    /// Begin resolving and binding. Only valid from `Closed`.
    pub fn start(&mut self, ctx: &mut Ctx<'_>) -> bool {
        if self.state != ServerState::Closed {
            return false;
        }
        ctx.info(format!("Attempting to resolve server address {}...", self.request));
        self.resolve = Some(self.request.spawn());
        self.set_state(ServerState::ResolvingIp, ctx);
        true
    }

    pub fn advance(&mut self, ctx: &mut Ctx<'_>) {
        for e in &mut self.entries {
            e.advance(ctx);
        }
        if self.state != ServerState::ResolvingIp {
            return;
        }
        let Some(task) = self.resolve.as_mut() else { return };
        match task.poll() {
            Poll::Pending => {}
            Poll::Failed(f) => {
                self.resolve = None;
                ctx.failure("Could not resolve server address", &f);
                self.delete(ctx);
            }
            Poll::Ready(addrs) => {
                self.resolve = None;
                match listen_on(&addrs) {
                    Ok(listener) => {
                        self.local = listener.local_addr().ok();
                        let fd = descriptor_of(&listener);
                        ctx.readiness.register(fd);
                        self.descriptor = Some(fd);
                        self.listener = Some(listener);
                        let shown = self.local.map(|l| describe(&l)).unwrap_or_default();
                        ctx.info(format!("Listening socket successfully bound to {}.", shown));
                        self.set_state(ServerState::Listening, ctx);
                    }
                    Err((op, e)) => {
                        ctx.io_error(ErrorKind::Socket, op, &e);
                        self.delete(ctx);
                    }
                }
            }
        }
    }

    /// Drain pending connections on the listening socket.
    pub fn accept(&mut self, ctx: &mut Ctx<'_>) -> Vec<Accepted> {
        let mut out = Vec::new();
        let (Some(listener), Some(fd)) = (self.listener.as_ref(), self.descriptor) else {
            return out;
        };
        if self.state != ServerState::Listening || !ctx.ready.is_readable(fd) {
            return out;
        }
        let mut accepted = Vec::new();
        loop {
            match listener.accept() {
                Ok(pair) => accepted.push(pair),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    ctx.io_error(ErrorKind::Socket, "accept", &e);
                    break;
                }
            }
        }
        let tls = self.tls.clone().map(TlsSetup::server);
        for (stream, remote) in accepted {
            match self.kind {
                ServerKind::Control => {
                    ctx.info(format!("Accepted control connection from {}.", describe(&remote)));
                    out.push(Accepted::Control { stream, remote, tls: tls.clone() });
                }
                ServerKind::Data => match self.entries.iter_mut().find(|e| e.matches(&remote)) {
                    Some(entry) => {
                        entry.state = AcceptState::Deleted;
                        ctx.info(format!("Accepted data connection from {}.", describe(&remote)));
                        out.push(Accepted::Data { target: entry.target, stream, remote, tls: tls.clone() });
                    }
                    None => {
                        ctx.info(format!(
                            "{} does not have permission to use this server, killing...",
                            describe(&remote)
                        ));
                        let _ = stream.shutdown(std::net::Shutdown::Both);
                    }
                },
            }
        }
        out
    }

    /// Register an expected peer; resolution starts right away.
    pub fn add_entry(&mut self, request: ResolveRequest, any_port: bool, target: TransferKey) -> u64 {
        let id = self.next_entry;
        self.next_entry += 1;
        let request = if any_port { ResolveRequest::any_port(request.address) } else { request };
        let task = Some(request.spawn());
        self.entries.push(AcceptEntry {
            id,
            state: AcceptState::ResolvingIp,
            request,
            any_port,
            target,
            candidates: Vec::new(),
            task,
        });
        id
    }

    pub fn entry_state(&self, id: u64) -> Option<AcceptState> {
        self.entries.iter().find(|e| e.id == id).map(|e| e.state)
    }

    pub fn release_entry(&mut self, id: u64) {
        if let Some(e) = self.entries.iter_mut().find(|e| e.id == id) {
            e.state = AcceptState::Deleted;
        }
    }

    pub fn entry_count(&self) -> usize {
        self.entries.iter().filter(|e| e.state != AcceptState::Deleted).count()
    }

    /// Close the listener and drop every allow-list entry.
    pub fn stop(&mut self, ctx: &mut Ctx<'_>) {
        if let Some(fd) = self.descriptor.take() {
            ctx.readiness.deregister(fd);
        }
        self.listener = None;
        self.resolve = None;
        self.entries.clear();
        if self.state != ServerState::Deleted {
            self.set_state(ServerState::Closed, ctx);
        }
    }

    pub fn delete(&mut self, ctx: &mut Ctx<'_>) {
        self.stop(ctx);
        self.set_state(ServerState::Deleted, ctx);
    }

    fn collect_garbage(&mut self) {
        self.entries.retain(|e| e.state != AcceptState::Deleted);
    }
}

/// All servers, keyed by id. Deleted servers stay until the next sweep.
#[derive(Default)]
pub struct ServerRegistry {
    servers: BTreeMap<ServerId, Server>,
    next: u64,
}

impl ServerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&mut self, kind: ServerKind, request: ResolveRequest, tls: Option<TlsSettings>) -> ServerId {
        self.next += 1;
        let id = ServerId(self.next);
        self.servers.insert(id, Server::new(id, kind, request, tls));
        id
    }

    pub fn get(&self, id: ServerId) -> Option<&Server> {
        self.servers.get(&id)
    }

    pub fn get_mut(&mut self, id: ServerId) -> Option<&mut Server> {
        self.servers.get_mut(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Server> {
        self.servers.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Server> {
        self.servers.values_mut()
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    pub fn entry_state(&self, ticket: AcceptTicket) -> Option<AcceptState> {
        self.get(ticket.server)?.entry_state(ticket.entry)
    }

    pub fn release(&mut self, ticket: AcceptTicket) {
        if let Some(s) = self.get_mut(ticket.server) {
            s.release_entry(ticket.entry);
        }
    }

    /// Entries first, then servers marked deleted.
    pub fn collect_garbage(&mut self) -> Vec<ServerId> {
        for s in self.servers.values_mut() {
            s.collect_garbage();
        }
        let gone: Vec<ServerId> = self
            .servers
            .values()
            .filter(|s| s.state == ServerState::Deleted)
            .map(|s| s.id)
            .collect();
        self.servers.retain(|_, s| s.state != ServerState::Deleted);
        gone
    }
}
