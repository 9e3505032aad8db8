use anyhow::{Context, Result};
use std::io::{BufRead, BufReader, Write};
use std::net::TcpStream;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;

use sdispatch::connection::ConnectionState;
use sdispatch::protocol::VERSION;
use sdispatch::server::ServerState;
use sdispatch::transfer::Verdict;
use sdispatch::{
    AcceptOptions, Direction, Engine, EngineError, Method, PeerId, Recorder, ServerId, ServerKind, Settings,
    SuggestOptions, TransferKey, TransferState, VerdictRequest,
};

type Node = Engine<Recorder>;

fn settings(output: &Path) -> Settings {
    let mut s = Settings::default();
    s.data_local_address = "127.0.0.1".into();
    s.data_wide_address = "127.0.0.1".into();
    s.data_output_path = output.to_path_buf();
    s
}

fn node(output: &Path, answer: VerdictRequest) -> Node {
    Engine::new(settings(output), Recorder::answering(answer))
}

/// Node whose TLS identity lives under `identity` instead of the user's config dir.
fn secure_node(output: &Path, identity: &Path, answer: VerdictRequest) -> Node {
    let mut s = settings(output);
    s.tls.cert_path = Some(identity.join("cert.pem"));
    s.tls.key_path = Some(identity.join("key.pem"));
    Engine::new(s, Recorder::answering(answer))
}

/// Tick both nodes until `done` holds.
fn drive(a: &mut Node, b: &mut Node, secs: u64, done: impl Fn(&Node, &Node) -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(secs);
    while Instant::now() < deadline {
        if done(a, b) {
            return true;
        }
        a.tick();
        b.tick();
        thread::sleep(Duration::from_millis(2));
    }
    done(a, b)
}

fn tick_until(n: &mut Node, secs: u64, done: impl Fn(&Node) -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(secs);
    while Instant::now() < deadline {
        if done(n) {
            return true;
        }
        n.tick();
        thread::sleep(Duration::from_millis(2));
    }
    done(n)
}

fn listening(n: &mut Node, kind: ServerKind) -> Result<(ServerId, u16)> {
    serving(n, kind, false)
}

fn serving(n: &mut Node, kind: ServerKind, tls: bool) -> Result<(ServerId, u16)> {
    let id = n.start_server(kind, "127.0.0.1", "0", tls);
    let up = tick_until(n, 10, |n| n.server(id).map(|s| s.state()) == Some(ServerState::Listening));
    assert!(up, "server never listened");
    let port = n.server(id).and_then(|s| s.local_addr()).context("no local address")?.port();
    Ok((id, port))
}

/// A dials B's control server; both sides exchange VERSION.
fn connected(a: &mut Node, b: &mut Node) -> Result<PeerId> {
    let (_, port) = listening(b, ServerKind::Control)?;
    let peer = a.connect("127.0.0.1", &port.to_string(), false);
    let ok = drive(a, b, 10, |a, b| {
        a.peer(peer).is_some_and(|p| p.is_verified()) && b.peers().any(|p| p.is_verified())
    });
    assert!(ok, "control connection never verified");
    Ok(peer)
}

fn write_file(dir: &Path, name: &str, len: usize) -> Result<PathBuf> {
    let path = dir.join(name);
    let data: Vec<u8> = (0..len).map(|i| (i * 7 % 256) as u8).collect();
    std::fs::write(&path, data)?;
    Ok(path)
}

fn incoming_on(b: &Node, id: u64) -> Option<TransferKey> {
    b.peers()
        .find_map(|p| p.transfer(Direction::Incoming, id))
        .map(|t| t.key())
}

#[test]
fn declined_active_suggestion_aborts_without_dialing() -> Result<()> {
    let src = TempDir::new()?;
    let dst = TempDir::new()?;
    let mut a = node(src.path(), VerdictRequest::Defer);
    let mut b = node(dst.path(), VerdictRequest::Decline);
    let peer = connected(&mut a, &mut b)?;

    let file = write_file(src.path(), "five.bin", 5000)?;
    let key = a.suggest_file(peer, &file, &SuggestOptions::default())?;
    assert_eq!(key.id, 1);

    let done = drive(&mut a, &mut b, 10, |a, _| {
        a.transfer(key).is_some_and(|t| t.state() == TransferState::Aborted)
    });
    assert!(done, "transfer never aborted");

    let t = a.transfer(key).context("transfer vanished")?;
    assert_eq!(t.verdict(), Verdict::Declined);
    assert_eq!(
        t.history(),
        &[
            TransferState::SetupPending,
            TransferState::ActiveResolveSrc,
            TransferState::VerdictPending,
            TransferState::Aborted
        ]
    );
    assert_eq!(t.data_state(), ConnectionState::Closed);
    assert!(!dst.path().join("five.bin").exists());
    Ok(())
}

#[test]
fn active_sender_to_passive_receiver() -> Result<()> {
    let src = TempDir::new()?;
    let dst = TempDir::new()?;
    let mut a = node(src.path(), VerdictRequest::Defer);
    let mut b = node(dst.path(), VerdictRequest::Defer);
    let (data_server, _) = listening(&mut b, ServerKind::Data)?;
    b.frontend_mut().answer = Some(VerdictRequest::Accept(AcceptOptions {
        server: Some(data_server),
        ..Default::default()
    }));
    let peer = connected(&mut a, &mut b)?;

    let file = write_file(src.path(), "big.bin", 300_000)?;
    let key = a.suggest_file(peer, &file, &SuggestOptions::default())?;

    let done = drive(&mut a, &mut b, 30, |a, b| {
        let sent = a.transfer(key).is_some_and(|t| t.state().is_finished());
        let got = incoming_on(b, key.id)
            .and_then(|k| b.transfer(k))
            .is_some_and(|t| t.state().is_finished());
        sent && got
    });
    assert!(done, "transfer did not finish");

    let out = a.transfer(key).context("sender transfer")?;
    assert_eq!(out.state(), TransferState::Completed);
    assert_eq!(out.transferred(), 300_000);
    assert_eq!(out.refills(), 3);
    let seen = out.history();
    let pos = |s| seen.iter().position(|x| *x == s).unwrap_or(usize::MAX);
    assert!(pos(TransferState::VerdictPending) < pos(TransferState::PreparationPending));
    assert!(pos(TransferState::PreparationPending) < pos(TransferState::Transferring));

    let ik = incoming_on(&b, key.id).context("receiver transfer")?;
    let inc = b.transfer(ik).context("receiver transfer")?;
    assert_eq!(inc.state(), TransferState::Completed);
    assert_eq!(inc.method(), Method::Passive);
    assert_eq!(std::fs::read(dst.path().join("big.bin"))?, std::fs::read(&file)?);
    assert!(a.frontend().errors.is_empty(), "{:?}", a.frontend().errors);
    assert!(b.frontend().errors.is_empty(), "{:?}", b.frontend().errors);
    Ok(())
}

#[test]
fn passive_sender_to_active_receiver() -> Result<()> {
    let src = TempDir::new()?;
    let dst = TempDir::new()?;
    let mut a = node(src.path(), VerdictRequest::Defer);
    let mut b = node(dst.path(), VerdictRequest::Accept(AcceptOptions::default()));
    let (data_server, _) = listening(&mut a, ServerKind::Data)?;
    let peer = connected(&mut a, &mut b)?;

    let file = write_file(src.path(), "small.txt", 12_345)?;
    let opts = SuggestOptions { method: Method::Passive, server: Some(data_server), ..Default::default() };
    let key = a.suggest_file(peer, &file, &opts)?;

    let done = drive(&mut a, &mut b, 30, |a, b| {
        a.transfer(key).is_some_and(|t| t.state().is_finished())
            && incoming_on(b, key.id)
                .and_then(|k| b.transfer(k))
                .is_some_and(|t| t.state().is_finished())
    });
    assert!(done, "transfer did not finish");
    let out = a.transfer(key).context("sender transfer")?;
    assert_eq!(out.state(), TransferState::Completed);
    assert!(out.history().contains(&TransferState::PassiveResolveAccept));
    assert_eq!(std::fs::read(dst.path().join("small.txt"))?, std::fs::read(&file)?);
    Ok(())
}

fn both_finished(a: &Node, b: &Node, key: TransferKey) -> bool {
    a.transfer(key).is_some_and(|t| t.state().is_finished())
        && incoming_on(b, key.id)
            .and_then(|k| b.transfer(k))
            .is_some_and(|t| t.state().is_finished())
}

#[test]
fn resume_completes_partial_destination() -> Result<()> {
    let src = TempDir::new()?;
    let dst = TempDir::new()?;
    let file = write_file(src.path(), "resume.bin", 300_000)?;
    let full = std::fs::read(&file)?;
    std::fs::write(dst.path().join("resume.bin"), &full[..120_000])?;

    let mut a = node(src.path(), VerdictRequest::Defer);
    let mut b = node(
        dst.path(),
        VerdictRequest::Accept(AcceptOptions { position: 120_000, ..Default::default() }),
    );
    let (data_server, _) = listening(&mut a, ServerKind::Data)?;
    let peer = connected(&mut a, &mut b)?;

    let opts = SuggestOptions { method: Method::Passive, server: Some(data_server), ..Default::default() };
    let key = a.suggest_file(peer, &file, &opts)?;
    assert!(drive(&mut a, &mut b, 30, |a, b| both_finished(a, b, key)), "transfer did not finish");

    let out = a.transfer(key).context("sender transfer")?;
    assert_eq!(out.state(), TransferState::Completed);
    assert_eq!(out.transferred(), 300_000);
    // Only the 180000 missing bytes were read: two buffer fills
    assert_eq!(out.refills(), 2);

    let ik = incoming_on(&b, key.id).context("receiver transfer")?;
    let inc = b.transfer(ik).context("receiver transfer")?;
    assert_eq!(inc.state(), TransferState::Completed);
    assert_eq!(inc.file().position, 300_000);
    assert_eq!(std::fs::read(dst.path().join("resume.bin"))?, full);
    assert!(a.frontend().errors.is_empty(), "{:?}", a.frontend().errors);
    assert!(b.frontend().errors.is_empty(), "{:?}", b.frontend().errors);
    Ok(())
}

#[test]
fn data_channel_over_tls() -> Result<()> {
    let src = TempDir::new()?;
    let dst = TempDir::new()?;
    let identity = TempDir::new()?;
    let mut a = secure_node(src.path(), identity.path(), VerdictRequest::Defer);
    let mut b = secure_node(dst.path(), identity.path(), VerdictRequest::Defer);
    let (data_server, _) = serving(&mut b, ServerKind::Data, true)?;
    b.frontend_mut().answer = Some(VerdictRequest::Accept(AcceptOptions {
        server: Some(data_server),
        ..Default::default()
    }));
    let peer = connected(&mut a, &mut b)?;

    let file = write_file(src.path(), "sealed.bin", 150_000)?;
    let opts = SuggestOptions { tls: true, ..Default::default() };
    let key = a.suggest_file(peer, &file, &opts)?;
    assert!(drive(&mut a, &mut b, 30, |a, b| both_finished(a, b, key)), "transfer did not finish");

    assert_eq!(a.transfer(key).context("sender transfer")?.state(), TransferState::Completed);
    let ik = incoming_on(&b, key.id).context("receiver transfer")?;
    let inc = b.transfer(ik).context("receiver transfer")?;
    assert_eq!(inc.state(), TransferState::Completed);
    assert!(inc.view().peer_tls);
    assert!(a.frontend().saw_notice("TLS handshake successful"));
    assert!(b.frontend().saw_notice("TLS handshake successful"));
    assert_eq!(std::fs::read(dst.path().join("sealed.bin"))?, std::fs::read(&file)?);
    assert!(a.frontend().errors.is_empty(), "{:?}", a.frontend().errors);
    assert!(b.frontend().errors.is_empty(), "{:?}", b.frontend().errors);
    Ok(())
}

#[test]
fn outgoing_ids_increase() -> Result<()> {
    let src = TempDir::new()?;
    let dst = TempDir::new()?;
    let mut a = node(src.path(), VerdictRequest::Defer);
    let mut b = node(dst.path(), VerdictRequest::Defer);
    let peer = connected(&mut a, &mut b)?;
    let file = write_file(src.path(), "x.bin", 10)?;

    let ids: Vec<u64> = (0..3)
        .map(|_| a.suggest_file(peer, &file, &SuggestOptions::default()).map(|k| k.id))
        .collect::<Result<_, _>>()?;
    assert_eq!(ids, vec![1, 2, 3]);

    let key = TransferKey { peer, direction: Direction::Outgoing, id: 2 };
    assert!(matches!(a.pause(key), Err(EngineError::InvalidState { .. })));
    assert!(a.abort(key)?);
    assert!(!a.abort(key)?);
    let next = a.suggest_file(peer, &file, &SuggestOptions::default())?;
    assert_eq!(next.id, 4);
    Ok(())
}

fn raw_client(port: u16) -> Result<(TcpStream, BufReader<TcpStream>)> {
    let s = TcpStream::connect(("127.0.0.1", port))?;
    s.set_read_timeout(Some(Duration::from_secs(10)))?;
    let r = BufReader::new(s.try_clone()?);
    Ok((s, r))
}

#[test]
fn talk_before_version_closes_connection() -> Result<()> {
    let dir = TempDir::new()?;
    let mut b = node(dir.path(), VerdictRequest::Defer);
    let (_, port) = listening(&mut b, ServerKind::Control)?;
    let (mut raw, mut reader) = raw_client(port)?;

    assert!(tick_until(&mut b, 10, |b| b.peers().count() == 1));
    let mut line = String::new();
    reader.read_line(&mut line)?;
    assert_eq!(line.trim_end(), format!("VERSION {}", VERSION));

    raw.write_all(b"TALK hello\r\n")?;
    assert!(tick_until(&mut b, 10, |b| b.peers().all(|p| p.state() == ConnectionState::Closed)));
    assert!(b.frontend().saw_error("before VERSION"));

    line.clear();
    let n = reader.read_line(&mut line)?;
    assert_eq!(n, 0, "connection should be closed, got {:?}", line);
    Ok(())
}

#[test]
fn duplicate_suggestion_is_ignored() -> Result<()> {
    let dir = TempDir::new()?;
    let mut b = node(dir.path(), VerdictRequest::Defer);
    let (_, port) = listening(&mut b, ServerKind::Control)?;
    let (mut raw, _reader) = raw_client(port)?;

    raw.write_all(format!("VERSION {}\r\n", VERSION).as_bytes())?;
    raw.write_all(b"FILE-SUGGEST 7 first.bin 100 NULL FALSE ACTIVE 127.0.0.1 1600\r\n")?;
    raw.write_all(b"FILE-SUGGEST 7 second.bin 999 NULL FALSE PASSIVE 127.0.0.1 1601\n")?;

    assert!(tick_until(&mut b, 10, |b| b.frontend().saw_notice("reused incoming transfer id 7")));
    let peer = b.peers().next().context("no peer")?;
    let t = peer.transfer(Direction::Incoming, 7).context("no transfer")?;
    assert_eq!(t.file().name, "first.bin");
    assert_eq!(t.file().size, 100);
    assert_eq!(t.method(), Method::Passive);
    assert_eq!(t.state(), TransferState::SetupPending);
    assert_eq!(peer.transfers().count(), 1);
    assert_eq!(b.frontend().verdicts.len(), 1);
    Ok(())
}

#[test]
fn unreachable_host_is_reaped_with_one_error() -> Result<()> {
    let dir = TempDir::new()?;
    let mut a = node(dir.path(), VerdictRequest::Defer);
    let peer = a.connect("nonexistent.invalid", "5200", false);

    assert!(tick_until(&mut a, 60, |a| a
        .peer(peer)
        .map_or(true, |p| p.state() == ConnectionState::Deleted)));
    assert!(a.peer(peer).is_some(), "reaped too early");
    a.tick();
    assert!(a.peer(peer).is_none());
    assert_eq!(a.frontend().errors.len(), 1, "{:?}", a.frontend().errors);
    Ok(())
}
