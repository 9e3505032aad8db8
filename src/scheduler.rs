//! The cooperative scheduler. One thread owns every peer, server and
//! transfer and advances them all once per tick; blocking work happens in
//! background handoffs that the tick only polls.
//!
//! Phase order inside a tick: reap deleted objects, poll readiness, server
//! accepts, control connection advancement, transfer pumps, protocol
//! receive, command dispatch. A command sent while dispatching is seen by
//! the other side on a later tick.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use crate::config::Settings;
use crate::connection::{ConnectionState, TlsSetup};
use crate::context::Ctx;
use crate::error::EngineError;
use crate::frontend::Frontend;
use crate::peer::{Peer, PeerId, PeerRegistry};
use crate::protocol::timing::MIN_TICK;
use crate::readiness::{ReadinessSet, Ready};
use crate::resolve::ResolveRequest;
use crate::server::{Accepted, Server, ServerId, ServerKind, ServerRegistry};
use crate::transfer::{AcceptOptions, SuggestOptions, Transfer, TransferKey};

pub struct Engine<F: Frontend> {
    settings: Settings,
    frontend: F,
    readiness: ReadinessSet,
    peers: PeerRegistry,
    servers: ServerRegistry,
    ticks: u64,
}

impl<F: Frontend> Engine<F> {
    pub fn new(settings: Settings, frontend: F) -> Self {
        Self {
            settings,
            frontend,
            readiness: ReadinessSet::new(),
            peers: PeerRegistry::new(),
            servers: ServerRegistry::new(),
            ticks: 0,
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn frontend(&self) -> &F {
        &self.frontend
    }

    pub fn frontend_mut(&mut self) -> &mut F {
        &mut self.frontend
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    /// Run `f` with a context for operator calls made between ticks.
    fn operate<R>(&mut self, f: impl FnOnce(&mut Ctx<'_>, &mut PeerRegistry, &mut ServerRegistry) -> R) -> R {
        let ready = Ready::default();
        let mut ctx = Ctx {
            frontend: &mut self.frontend,
            readiness: &mut self.readiness,
            ready: &ready,
            settings: &self.settings,
        };
        f(&mut ctx, &mut self.peers, &mut self.servers)
    }

    fn on_peer<R>(
        &mut self,
        id: PeerId,
        f: impl FnOnce(&mut Peer, &mut Ctx<'_>, &mut ServerRegistry) -> Result<R, EngineError>,
    ) -> Result<R, EngineError> {
        self.operate(|ctx, peers, servers| {
            let peer = peers.get_mut(id).ok_or(EngineError::UnknownPeer(id))?;
            f(peer, ctx, servers)
        })
    }

    fn dial_tls(&self, tls: bool) -> Option<TlsSetup> {
        tls.then(|| TlsSetup::client(self.settings.tls.clone()))
    }

    // Operator API

    /// Open a control connection to `address`/`service`.
    pub fn connect(&mut self, address: &str, service: &str, tls: bool) -> PeerId {
        let tls = self.dial_tls(tls);
        let dest = ResolveRequest::new(address, service);
        self.operate(|ctx, peers, _| peers.connect(dest, tls, ctx))
    }

    /// Create and start a listening server. Service `0` picks a free port.
    pub fn start_server(&mut self, kind: ServerKind, address: &str, service: &str, tls: bool) -> ServerId {
        let tls = tls.then(|| self.settings.tls.clone());
        let req = ResolveRequest::new(address, service);
        self.operate(|ctx, _, servers| {
            let id = servers.create(kind, req, tls);
            if let Some(s) = servers.get_mut(id) {
                s.start(ctx);
            }
            id
        })
    }

    /// Restart a stopped server.
    pub fn restart_server(&mut self, id: ServerId) -> Result<(), EngineError> {
        self.operate(|ctx, _, servers| {
            let s = servers.get_mut(id).ok_or(EngineError::UnknownServer(id))?;
            if s.start(ctx) {
                Ok(())
            } else {
                Err(EngineError::InvalidState { what: "start server", state: format!("{} is {}", id, s.state()) })
            }
        })
    }

    pub fn stop_server(&mut self, id: ServerId) -> Result<(), EngineError> {
        self.operate(|ctx, _, servers| {
            servers.get_mut(id).ok_or(EngineError::UnknownServer(id))?.stop(ctx);
            Ok(())
        })
    }

    /// Mark a server deleted; it disappears on the next tick.
    pub fn remove_server(&mut self, id: ServerId) -> Result<(), EngineError> {
        self.operate(|ctx, _, servers| {
            servers.get_mut(id).ok_or(EngineError::UnknownServer(id))?.delete(ctx);
            Ok(())
        })
    }

    pub fn suggest_file(&mut self, peer: PeerId, path: &Path, opts: &SuggestOptions) -> Result<TransferKey, EngineError> {
        self.on_peer(peer, |p, ctx, servers| p.suggest_file(path, opts, ctx, servers))
    }

    pub fn accept_transfer(&mut self, peer: PeerId, id: u64, opts: &AcceptOptions) -> Result<(), EngineError> {
        self.on_peer(peer, |p, ctx, servers| p.accept_transfer(id, opts, ctx, servers))
    }

    pub fn decline_transfer(&mut self, peer: PeerId, id: u64) -> Result<(), EngineError> {
        self.on_peer(peer, |p, ctx, servers| p.decline_transfer(id, ctx, servers))
    }

    pub fn pause(&mut self, key: TransferKey) -> Result<(), EngineError> {
        self.on_peer(key.peer, |p, ctx, _| p.pause(key, ctx))
    }

    pub fn resume(&mut self, key: TransferKey) -> Result<(), EngineError> {
        self.on_peer(key.peer, |p, ctx, _| p.resume(key, ctx))
    }

    /// Abort a transfer. `Ok(false)` if it had already finished.
    pub fn abort(&mut self, key: TransferKey) -> Result<bool, EngineError> {
        self.on_peer(key.peer, |p, ctx, servers| p.abort(key, ctx, servers))
    }

    pub fn talk(&mut self, peer: PeerId, message: &str) -> Result<(), EngineError> {
        self.on_peer(peer, |p, ctx, servers| p.talk(message, ctx, servers))
    }

    /// Close the control connection; the peer stays listed until removed.
    pub fn disconnect(&mut self, peer: PeerId) -> Result<(), EngineError> {
        self.on_peer(peer, |p, ctx, servers| {
            p.close(ctx, servers);
            Ok(())
        })
    }

    pub fn remove_peer(&mut self, peer: PeerId) -> Result<(), EngineError> {
        self.on_peer(peer, |p, ctx, servers| {
            p.remove(ctx, servers);
            Ok(())
        })
    }

    // Inspection

    pub fn peer(&self, id: PeerId) -> Option<&Peer> {
        self.peers.get(id)
    }

    pub fn peers(&self) -> impl Iterator<Item = &Peer> {
        self.peers.iter()
    }

    pub fn server(&self, id: ServerId) -> Option<&Server> {
        self.servers.get(id)
    }

    pub fn servers(&self) -> impl Iterator<Item = &Server> {
        self.servers.iter()
    }

    pub fn transfer(&self, key: TransferKey) -> Option<&Transfer> {
        self.peers.get(key.peer)?.transfer(key.direction, key.id)
    }

    /// Whether any peer is still connecting or connected.
    pub fn has_live_peers(&self) -> bool {
        self.peers
            .iter()
            .any(|p| !matches!(p.state(), ConnectionState::Closed | ConnectionState::Deleted))
    }

    /// One pass over everything. Never blocks on network I/O.
    pub fn tick(&mut self) {
        self.ticks += 1;
        let Engine { settings, frontend, readiness, peers, servers, .. } = self;

        {
            let ready = Ready::default();
            let mut ctx = Ctx { frontend: &mut *frontend, readiness: &mut *readiness, ready: &ready, settings: &*settings };
            peers.collect_garbage(&mut ctx, servers);
            servers.collect_garbage();
        }

        let ready = readiness.poll();
        let mut ctx = Ctx { frontend, readiness, ready: &ready, settings: &*settings };

        let mut accepted = Vec::new();
        for server in servers.iter_mut() {
            server.advance(&mut ctx);
            accepted.extend(server.accept(&mut ctx));
        }
        for a in accepted {
            match a {
                Accepted::Control { stream, remote, tls } => {
                    peers.adopt(stream, remote, tls, &mut ctx, servers);
                }
                Accepted::Data { target, stream, remote, tls } => match peers.get_mut(target.peer) {
                    Some(p) => p.adopt_data(target, stream, remote, tls, &mut ctx),
                    None => {
                        ctx.info(format!("Peer for {} is gone, dropping its data connection.", target));
                        let _ = stream.shutdown(std::net::Shutdown::Both);
                    }
                },
            }
        }

        for p in peers.iter_mut() {
            p.advance(&mut ctx, servers);
        }
        for p in peers.iter_mut() {
            p.tick_transfers(&mut ctx, servers);
        }
        for p in peers.iter_mut() {
            p.receive(&mut ctx, servers);
        }
        for p in peers.iter_mut() {
            p.dispatch(&mut ctx, servers);
        }
    }

    /// Tick until `stop` is set, sleeping out the rest of short ticks.
    pub fn run(&mut self, stop: &AtomicBool) {
        while !stop.load(Ordering::SeqCst) {
            let started = Instant::now();
            self.tick();
            let spent = started.elapsed();
            if spent < MIN_TICK {
                std::thread::sleep(MIN_TICK - spent);
            }
        }
    }

    /// Tick until `done` holds or `limit` ticks pass. Returns whether it held.
    pub fn run_until(&mut self, limit: u64, mut done: impl FnMut(&Self) -> bool) -> bool {
        for _ in 0..limit {
            if done(self) {
                return true;
            }
            let started = Instant::now();
            self.tick();
            let spent = started.elapsed();
            if spent < MIN_TICK {
                std::thread::sleep(MIN_TICK - spent);
            }
        }
        done(self)
    }
}
