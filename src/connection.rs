//! TCP (and optionally TLS) connection state machine shared by control and
//! data channels.
//!
//! Resolve, connect and handshake run as background tasks; everything else
//! happens on the scheduler thread with the socket in non-blocking mode.

use std::fmt;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::thread;

use rustls::{ClientConnection, ServerConnection, StreamOwned};
use socket2::{Domain, Protocol, Socket, Type};

use crate::context::Ctx;
use crate::frontend::ErrorKind;
use crate::protocol::limits::{SOURCE_PORT_FIRST, SOURCE_PORT_LAST};
use crate::protocol::timing::{CONNECT_TIMEOUT, HANDSHAKE_TIMEOUT};
use crate::readiness::{descriptor_of, Descriptor};
use crate::resolve::{describe, ResolveRequest};
use crate::task::{FailureKind, Handoff, Poll, TaskFailure};
use crate::tls::{self, TlsSettings};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionKind {
    Control,
    Data,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ConnectionState {
    Closed,
    ResolvingSrc,
    ResolvedSrc,
    ResolvingDst,
    Connecting,
    Handshaking,
    Established,
    Deleted,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ConnectionState::Closed => "Closed",
            ConnectionState::ResolvingSrc => "Resolving source",
            ConnectionState::ResolvedSrc => "Source bound",
            ConnectionState::ResolvingDst => "Resolving destination",
            ConnectionState::Connecting => "Connecting",
            ConnectionState::Handshaking => "TLS handshake",
            ConnectionState::Established => "Established",
            ConnectionState::Deleted => "Deleted",
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TlsRole {
    Client,
    Server,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TlsSetup {
    pub role: TlsRole,
    pub settings: TlsSettings,
}

impl TlsSetup {
    pub fn client(settings: TlsSettings) -> Self {
        Self { role: TlsRole::Client, settings }
    }

    pub fn server(settings: TlsSettings) -> Self {
        Self { role: TlsRole::Server, settings }
    }
}

/// Something the owner has to react to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnEvent {
    SourceBound,
    Established,
    Failed,
}

pub enum Transport {
    Plain(TcpStream),
    Client(Box<StreamOwned<ClientConnection, TcpStream>>),
    Server(Box<StreamOwned<ServerConnection, TcpStream>>),
}

macro_rules! close_tls {
    ($t:expr) => {{
        $t.conn.send_close_notify();
        // A socket that is not ready for the alert gets one more try
        for _ in 0..2 {
            let mut blocked = false;
            while $t.conn.wants_write() {
                match $t.conn.write_tls(&mut $t.sock) {
                    Ok(_) => {}
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                        blocked = true;
                        break;
                    }
                    Err(_) => break,
                }
            }
            if !blocked {
                break;
            }
            thread::yield_now();
        }
        // Unread input would turn the close into a reset
        if $t.sock.set_nonblocking(true).is_ok() {
            let mut scratch = [0u8; 4096];
            while matches!($t.sock.read(&mut scratch), Ok(n) if n > 0) {}
        }
        let _ = $t.sock.shutdown(Shutdown::Both);
    }};
}

impl Transport {
    pub fn socket(&self) -> &TcpStream {
        match self {
            Transport::Plain(s) => s,
            Transport::Client(t) => &t.sock,
            Transport::Server(t) => &t.sock,
        }
    }

    pub fn is_tls(&self) -> bool {
        !matches!(self, Transport::Plain(_))
    }

    /// TLS records still waiting for the socket.
    fn wants_write(&self) -> bool {
        match self {
            Transport::Plain(_) => false,
            Transport::Client(t) => t.conn.wants_write(),
            Transport::Server(t) => t.conn.wants_write(),
        }
    }

    fn shutdown(self) {
        match self {
            Transport::Plain(s) => {
                let _ = s.shutdown(Shutdown::Both);
            }
            Transport::Client(mut t) => close_tls!(t),
            Transport::Server(mut t) => close_tls!(t),
        }
    }
}

impl Read for Transport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let r = match self {
            Transport::Plain(s) => s.read(buf),
            Transport::Client(t) => t.read(buf),
            Transport::Server(t) => t.read(buf),
        };
        match r {
            // Peers that skip close_notify still just closed the stream
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(0),
            other => other,
        }
    }
}

impl Write for Transport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Transport::Plain(s) => s.write(buf),
            Transport::Client(t) => t.write(buf),
            Transport::Server(t) => t.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Transport::Plain(s) => s.flush(),
            Transport::Client(t) => t.flush(),
            Transport::Server(t) => t.flush(),
        }
    }
}

enum Step {
    Source(Handoff<Vec<SocketAddr>>),
    Destination(Handoff<Vec<SocketAddr>>),
    Connect(Handoff<TcpStream>),
    Handshake(Handoff<Transport>),
}

pub struct Connection {
    kind: ConnectionKind,
    state: ConnectionState,
    source: Option<ResolveRequest>,
    destination: Option<ResolveRequest>,
    tls: Option<TlsSetup>,
    bound: Option<Socket>,
    transport: Option<Transport>,
    descriptor: Option<Descriptor>,
    local: Option<SocketAddr>,
    remote: Option<SocketAddr>,
    step: Option<Step>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("kind", &self.kind)
            .field("state", &self.state)
            .field("local", &self.local)
            .field("remote", &self.remote)
            .field("tls", &self.tls.as_ref().map(|t| t.role))
            .finish()
    }
}

fn bind_source(candidates: &[SocketAddr]) -> Result<(Socket, SocketAddr), TaskFailure> {
    let mut last = TaskFailure::new(FailureKind::Socket, "bind", "no source address candidates");
    for cand in candidates {
        let socket = Socket::new(Domain::for_address(*cand), Type::STREAM, Some(Protocol::TCP))
            .map_err(|e| TaskFailure::io(FailureKind::Socket, "socket", &e))?;
        for port in SOURCE_PORT_FIRST..=SOURCE_PORT_LAST {
            let addr = SocketAddr::new(cand.ip(), port);
            match socket.bind(&addr.into()) {
                Ok(()) => return Ok((socket, addr)),
                Err(e) if e.kind() == io::ErrorKind::AddrInUse => continue,
                Err(e) => {
                    last = TaskFailure::io(FailureKind::Socket, "bind", &e);
                    break;
                }
            }
        }
    }
    Err(last)
}

fn rebind(local: SocketAddr) -> io::Result<Socket> {
    let socket = Socket::new(Domain::for_address(local), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&local.into())?;
    Ok(socket)
}

/// Connect to the first reachable candidate. A pre-bound socket keeps its
/// source address across attempts.
fn connect_any(
    mut bound: Option<Socket>,
    local: Option<SocketAddr>,
    candidates: Vec<SocketAddr>,
) -> Result<TcpStream, TaskFailure> {
    let mut last = TaskFailure::new(FailureKind::Socket, "connect", "no usable destination address");
    for addr in candidates {
        if let Some(l) = local {
            if l.is_ipv4() != addr.is_ipv4() {
                continue;
            }
        }
        let socket = match (bound.take(), local) {
            (Some(s), _) => s,
            (None, Some(l)) => rebind(l).map_err(|e| TaskFailure::io(FailureKind::Socket, "bind", &e))?,
            (None, None) => Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
                .map_err(|e| TaskFailure::io(FailureKind::Socket, "socket", &e))?,
        };
        match socket.connect_timeout(&addr.into(), CONNECT_TIMEOUT) {
            Ok(()) => return Ok(socket.into()),
            Err(e) => last = TaskFailure::io(FailureKind::Socket, "connect", &e),
        }
    }
    Err(last)
}

/// Write out records queued after the handshake finished (session tickets).
fn flush_tls<D>(conn: &mut rustls::ConnectionCommon<D>, sock: &mut TcpStream) -> io::Result<()> {
    while conn.wants_write() {
        conn.write_tls(sock)?;
    }
    Ok(())
}

fn handshake(sock: TcpStream, setup: TlsSetup, host: String) -> Result<Transport, TaskFailure> {
    let sys = |op: &'static str| move |e: io::Error| TaskFailure::io(FailureKind::Socket, op, &e);
    let cfg_err = |e: anyhow::Error| TaskFailure::new(FailureKind::Tls, "tls-config", format!("{:#}", e));
    let tls_err = |e: rustls::Error| TaskFailure::new(FailureKind::Tls, "tls-new", e.to_string());
    let hs_err = |e: io::Error| TaskFailure::io(FailureKind::Tls, "tls-handshake", &e);

    sock.set_nonblocking(false).map_err(sys("set_nonblocking"))?;
    sock.set_read_timeout(Some(HANDSHAKE_TIMEOUT)).map_err(sys("set_read_timeout"))?;
    sock.set_write_timeout(Some(HANDSHAKE_TIMEOUT)).map_err(sys("set_write_timeout"))?;
    let mut sock = sock;

    let transport = match setup.role {
        TlsRole::Client => {
            let cfg = tls::client_config(&setup.settings).map_err(cfg_err)?;
            let name = tls::server_name_for(&host).map_err(cfg_err)?;
            let mut conn = ClientConnection::new(cfg, name).map_err(tls_err)?;
            while conn.is_handshaking() {
                conn.complete_io(&mut sock).map_err(hs_err)?;
            }
            flush_tls(&mut *conn, &mut sock).map_err(hs_err)?;
            Transport::Client(Box::new(StreamOwned::new(conn, sock)))
        }
        TlsRole::Server => {
            let cfg = tls::server_config(&setup.settings).map_err(cfg_err)?;
            let mut conn = ServerConnection::new(cfg).map_err(tls_err)?;
            while conn.is_handshaking() {
                conn.complete_io(&mut sock).map_err(hs_err)?;
            }
            flush_tls(&mut *conn, &mut sock).map_err(hs_err)?;
            Transport::Server(Box::new(StreamOwned::new(conn, sock)))
        }
    };
    let s = transport.socket();
    s.set_read_timeout(None).map_err(sys("set_read_timeout"))?;
    s.set_write_timeout(None).map_err(sys("set_write_timeout"))?;
    Ok(transport)
}

impl Connection {
    pub fn new(kind: ConnectionKind) -> Self {
        Self {
            kind,
            state: ConnectionState::Closed,
            source: None,
            destination: None,
            tls: None,
            bound: None,
            transport: None,
            descriptor: None,
            local: None,
            remote: None,
            step: None,
        }
    }

    pub fn kind(&self) -> ConnectionKind {
        self.kind
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote
    }

    pub fn destination(&self) -> Option<&ResolveRequest> {
        self.destination.as_ref()
    }

    pub fn tls(&self) -> Option<&TlsSetup> {
        self.tls.as_ref()
    }

    pub fn set_source(&mut self, req: ResolveRequest) {
        self.source = Some(req);
    }

    pub fn set_destination(&mut self, req: ResolveRequest) {
        self.destination = Some(req);
    }

    pub fn set_tls(&mut self, tls: Option<TlsSetup>) {
        self.tls = tls;
    }

    /// Whether a socket or pending step exists that `close` would tear down.
    pub fn is_open(&self) -> bool {
        self.bound.is_some() || self.transport.is_some() || self.step.is_some()
    }

    /// Peer endpoint for messages, falling back to what was asked for.
    pub fn peer_label(&self) -> String {
        match (&self.remote, &self.destination) {
            (Some(r), _) => describe(r),
            (None, Some(d)) => d.to_string(),
            (None, None) => "unknown peer".to_string(),
        }
    }

    fn set_state(&mut self, next: ConnectionState) {
        assert!(
            next > self.state || matches!(next, ConnectionState::Closed | ConnectionState::Deleted),
            "connection cannot move from {:?} to {:?}",
            self.state,
            next
        );
        self.state = next;
    }

    /// Resolve the source address in the background and bind it.
    pub fn bind_source(&mut self, ctx: &mut Ctx<'_>) {
        let req = self
            .source
            .clone()
            .unwrap_or_else(|| ResolveRequest::any_port(ctx.settings.data_local_address.clone()));
        ctx.info(format!("Attempting to resolve source address {}...", req));
        self.step = Some(Step::Source(req.spawn()));
        self.source = Some(req);
        self.set_state(ConnectionState::ResolvingSrc);
    }

    /// Resolve the destination and connect, from `Closed` or `ResolvedSrc`.
    pub fn connect(&mut self, ctx: &mut Ctx<'_>) {
        let Some(req) = self.destination.clone() else {
            ctx.error(ErrorKind::System, "No destination address configured.");
            self.fail(ctx);
            return;
        };
        ctx.info(format!("Trying to connect to {}...", req));
        self.step = Some(Step::Destination(req.spawn()));
        self.set_state(ConnectionState::ResolvingDst);
    }

    /// Take over a socket produced by a server accept.
    pub fn adopt(
        &mut self,
        stream: TcpStream,
        remote: SocketAddr,
        tls: Option<TlsSetup>,
        ctx: &mut Ctx<'_>,
    ) -> Option<ConnEvent> {
        self.remote = Some(remote);
        self.local = stream.local_addr().ok();
        self.tls = tls;
        self.bound = None;
        self.register(&stream, ctx);
        self.start_session(stream, ctx)
    }

    fn register(&mut self, stream: &TcpStream, ctx: &mut Ctx<'_>) {
        let fd = descriptor_of(stream);
        ctx.readiness.register(fd);
        self.descriptor = Some(fd);
    }

    fn start_session(&mut self, stream: TcpStream, ctx: &mut Ctx<'_>) -> Option<ConnEvent> {
        match self.tls.clone() {
            Some(setup) => {
                let host = self
                    .destination
                    .as_ref()
                    .map(|d| d.address.clone())
                    .or_else(|| self.remote.map(|r| r.ip().to_string()))
                    .unwrap_or_default();
                self.step = Some(Step::Handshake(Handoff::spawn("sd-handshake", move || {
                    handshake(stream, setup, host)
                })));
                self.set_state(ConnectionState::Handshaking);
                None
            }
            None => {
                if let Err(e) = stream.set_nonblocking(true) {
                    ctx.io_error(ErrorKind::Socket, "set_nonblocking", &e);
                    return Some(self.fail(ctx));
                }
                self.transport = Some(Transport::Plain(stream));
                self.set_state(ConnectionState::Established);
                Some(ConnEvent::Established)
            }
        }
    }

    /// Poll the pending background step, if any, and move the state along.
    pub fn advance(&mut self, ctx: &mut Ctx<'_>) -> Option<ConnEvent> {
        match self.step.as_mut()? {
            Step::Source(h) => match h.poll() {
                Poll::Pending => None,
                Poll::Failed(f) => {
                    self.step = None;
                    ctx.failure("Could not resolve source address", &f);
                    Some(self.fail(ctx))
                }
                Poll::Ready(addrs) => {
                    self.step = None;
                    match bind_source(&addrs) {
                        Ok((socket, local)) => {
                            ctx.info(format!("Successfully bound to {}.", describe(&local)));
                            self.bound = Some(socket);
                            self.local = Some(local);
                            self.set_state(ConnectionState::ResolvedSrc);
                            Some(ConnEvent::SourceBound)
                        }
                        Err(f) => {
                            ctx.failure("Could not bind source address", &f);
                            Some(self.fail(ctx))
                        }
                    }
                }
            },
            Step::Destination(h) => match h.poll() {
                Poll::Pending => None,
                Poll::Failed(f) => {
                    self.step = None;
                    ctx.failure("Could not resolve remote address", &f);
                    Some(self.fail(ctx))
                }
                Poll::Ready(addrs) => {
                    let bound = self.bound.take();
                    let local = self.local;
                    self.step = Some(Step::Connect(Handoff::spawn("sd-connect", move || {
                        connect_any(bound, local, addrs)
                    })));
                    self.set_state(ConnectionState::Connecting);
                    None
                }
            },
            Step::Connect(h) => match h.poll() {
                Poll::Pending => None,
                Poll::Failed(f) => {
                    self.step = None;
                    ctx.failure("Could not connect", &f);
                    Some(self.fail(ctx))
                }
                Poll::Ready(stream) => {
                    self.step = None;
                    self.remote = stream.peer_addr().ok();
                    self.local = stream.local_addr().ok().or(self.local);
                    ctx.info(format!("Connected to: {}.", self.peer_label()));
                    self.register(&stream, ctx);
                    self.start_session(stream, ctx)
                }
            },
            Step::Handshake(h) => match h.poll() {
                Poll::Pending => None,
                Poll::Failed(f) => {
                    self.step = None;
                    ctx.failure("TLS handshake failed", &f);
                    Some(self.fail(ctx))
                }
                Poll::Ready(transport) => {
                    self.step = None;
                    if let Err(e) = transport.socket().set_nonblocking(true) {
                        ctx.io_error(ErrorKind::Socket, "set_nonblocking", &e);
                        transport.shutdown();
                        return Some(self.fail(ctx));
                    }
                    ctx.info(format!("TLS handshake successful with {}.", self.peer_label()));
                    self.transport = Some(transport);
                    self.set_state(ConnectionState::Established);
                    Some(ConnEvent::Established)
                }
            },
        }
    }

    /// Control channels are deleted on failure, data channels fall back to closed.
    fn fail(&mut self, ctx: &mut Ctx<'_>) -> ConnEvent {
        self.close(ctx);
        if self.kind == ConnectionKind::Control {
            self.set_state(ConnectionState::Deleted);
        }
        ConnEvent::Failed
    }

    /// Plain sockets need the readiness snapshot; TLS may have buffered
    /// plaintext, so it is always tried.
    pub fn readable(&self, ctx: &Ctx<'_>) -> bool {
        match (&self.transport, self.descriptor) {
            (Some(t), _) if t.is_tls() => true,
            (Some(_), Some(fd)) => ctx.ready.is_readable(fd),
            _ => false,
        }
    }

    pub fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.transport.as_mut() {
            Some(t) => t.read(buf),
            None => Err(io::ErrorKind::NotConnected.into()),
        }
    }

    /// One non-blocking write. `WouldBlock` means nothing was taken.
    pub fn send_some(&mut self, buf: &[u8]) -> io::Result<usize> {
        let t = self.transport.as_mut().ok_or(io::ErrorKind::NotConnected)?;
        match t.write(buf) {
            Ok(0) if !buf.is_empty() => Err(io::ErrorKind::WouldBlock.into()),
            other => other,
        }
    }

    /// Push out anything TLS still holds. `Ok(false)` means try again later.
    pub fn drain(&mut self) -> io::Result<bool> {
        let t = self.transport.as_mut().ok_or(io::ErrorKind::NotConnected)?;
        match t.flush() {
            Ok(()) => Ok(!t.wants_write()),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Write everything, spinning on would-block. Any other failure is fatal
    /// to the connection and left for the caller to act on.
    pub fn send_all(&mut self, mut buf: &[u8]) -> io::Result<()> {
        while !buf.is_empty() {
            match self.send_some(buf) {
                Ok(n) => buf = &buf[n..],
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => thread::yield_now(),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        while !self.drain()? {
            thread::yield_now();
        }
        Ok(())
    }

    pub fn close(&mut self, ctx: &mut Ctx<'_>) {
        if let Some(fd) = self.descriptor.take() {
            ctx.readiness.deregister(fd);
        }
        self.step = None;
        self.bound = None;
        if let Some(t) = self.transport.take() {
            t.shutdown();
        }
        if self.state != ConnectionState::Deleted {
            self.state = ConnectionState::Closed;
        }
    }

    pub fn delete(&mut self, ctx: &mut Ctx<'_>) {
        self.close(ctx);
        self.set_state(ConnectionState::Deleted);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::frontend::Recorder;
    use crate::readiness::{ReadinessSet, Ready};
    use std::net::TcpListener;
    use std::time::{Duration, Instant};

    pub(crate) struct Harness {
        pub frontend: Recorder,
        pub readiness: ReadinessSet,
        pub settings: Settings,
    }

    impl Harness {
        pub fn new() -> Self {
            let mut settings = Settings::default();
            settings.data_local_address = "127.0.0.1".into();
            Self { frontend: Recorder::default(), readiness: ReadinessSet::new(), settings }
        }

        pub fn with<R>(&mut self, f: impl FnOnce(&mut Ctx<'_>) -> R) -> R {
            let ready = Ready::everything();
            let mut ctx = Ctx {
                frontend: &mut self.frontend,
                readiness: &mut self.readiness,
                ready: &ready,
                settings: &self.settings,
            };
            f(&mut ctx)
        }
    }

    fn drive(h: &mut Harness, c: &mut Connection, until: impl Fn(&Connection) -> bool) -> Vec<ConnEvent> {
        let deadline = Instant::now() + Duration::from_secs(10);
        let mut events = Vec::new();
        while !until(c) {
            assert!(Instant::now() < deadline, "stuck in {:?}", c.state());
            if let Some(ev) = h.with(|ctx| c.advance(ctx)) {
                events.push(ev);
            }
            thread::sleep(Duration::from_millis(2));
        }
        events
    }

    #[test]
    fn control_connects_plain() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let mut h = Harness::new();
        let mut c = Connection::new(ConnectionKind::Control);
        c.set_destination(ResolveRequest::new("127.0.0.1", port.to_string()));
        h.with(|ctx| c.connect(ctx));
        assert_eq!(c.state(), ConnectionState::ResolvingDst);

        let events = drive(&mut h, &mut c, |c| c.state() == ConnectionState::Established);
        assert_eq!(events, vec![ConnEvent::Established]);
        assert_eq!(h.readiness.len(), 1);
        assert!(h.frontend.saw_notice("Connected to: 127.0.0.1"));

        let (mut peer, _) = listener.accept().unwrap();
        c.send_all(b"VERSION x\r\n").unwrap();
        let mut buf = [0u8; 11];
        peer.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"VERSION x\r\n");

        h.with(|ctx| c.close(ctx));
        assert_eq!(c.state(), ConnectionState::Closed);
        assert!(h.readiness.is_empty());
        h.with(|ctx| c.close(ctx));
        assert_eq!(c.state(), ConnectionState::Closed);
    }

    #[test]
    fn refused_control_is_deleted() {
        // Grab a port nobody listens on
        let port = {
            let l = TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap().port()
        };
        let mut h = Harness::new();
        let mut c = Connection::new(ConnectionKind::Control);
        c.set_destination(ResolveRequest::new("127.0.0.1", port.to_string()));
        h.with(|ctx| c.connect(ctx));
        let events = drive(&mut h, &mut c, |c| c.state() == ConnectionState::Deleted);
        assert_eq!(events, vec![ConnEvent::Failed]);
        assert_eq!(h.frontend.errors.len(), 1);
        assert_eq!(h.frontend.errors[0].op, Some("connect"));
    }

    #[test]
    fn data_binds_then_connects_from_bound_port() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let mut h = Harness::new();
        let mut c = Connection::new(ConnectionKind::Data);
        c.set_source(ResolveRequest::any_port("127.0.0.1"));
        h.with(|ctx| c.bind_source(ctx));
        let events = drive(&mut h, &mut c, |c| c.state() == ConnectionState::ResolvedSrc);
        assert_eq!(events, vec![ConnEvent::SourceBound]);
        let local = c.local_addr().unwrap();
        assert!(local.port() >= SOURCE_PORT_FIRST);
        assert!(c.is_open());

        c.set_destination(ResolveRequest::new("127.0.0.1", port.to_string()));
        h.with(|ctx| c.connect(ctx));
        drive(&mut h, &mut c, |c| c.state() == ConnectionState::Established);
        let (_peer, from) = listener.accept().unwrap();
        assert_eq!(from, local);
    }

    #[test]
    fn failed_data_connection_only_closes() {
        let port = {
            let l = TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap().port()
        };
        let mut h = Harness::new();
        let mut c = Connection::new(ConnectionKind::Data);
        c.set_destination(ResolveRequest::new("127.0.0.1", port.to_string()));
        h.with(|ctx| c.connect(ctx));
        let events = drive(&mut h, &mut c, |c| !c.is_open());
        assert_eq!(events, vec![ConnEvent::Failed]);
        assert_eq!(c.state(), ConnectionState::Closed);
    }

    #[test]
    fn adopted_tls_session_talks_to_client() {
        let dir = tempfile::TempDir::new().unwrap();
        let settings = TlsSettings {
            cert_path: Some(dir.path().join("cert.pem")),
            key_path: Some(dir.path().join("key.pem")),
            ..Default::default()
        };
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = thread::spawn(move || {
            let sock = TcpStream::connect(addr).unwrap();
            let cfg = tls::client_config(&TlsSettings::default()).unwrap();
            let conn = ClientConnection::new(cfg, tls::server_name_for("127.0.0.1").unwrap()).unwrap();
            let mut s = StreamOwned::new(conn, sock);
            s.write_all(b"ping").unwrap();
            s.flush().unwrap();
            let mut buf = [0u8; 4];
            s.read_exact(&mut buf).unwrap();
            buf
        });

        let (stream, remote) = listener.accept().unwrap();
        let mut h = Harness::new();
        let mut c = Connection::new(ConnectionKind::Data);
        let ev = h.with(|ctx| c.adopt(stream, remote, Some(TlsSetup::server(settings)), ctx));
        assert_eq!(ev, None);
        assert_eq!(c.state(), ConnectionState::Handshaking);
        drive(&mut h, &mut c, |c| c.state() == ConnectionState::Established);

        let mut got = Vec::new();
        let deadline = Instant::now() + Duration::from_secs(10);
        while got.len() < 4 {
            assert!(Instant::now() < deadline);
            let mut buf = [0u8; 16];
            match c.recv(&mut buf) {
                Ok(n) => got.extend_from_slice(&buf[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => thread::sleep(Duration::from_millis(2)),
                Err(e) => panic!("recv: {}", e),
            }
        }
        assert_eq!(got, b"ping");
        c.send_all(b"pong").unwrap();
        assert_eq!(&client.join().unwrap(), b"pong");
        h.with(|ctx| c.close(ctx));
    }
}
