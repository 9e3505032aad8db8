//! sdispatch daemon
//!
//! Runs the engine headless: optional control server, optional outbound
//! peer with files to suggest, and a fixed accept/decline policy for
//! whatever peers suggest back.

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use sdispatch::cli::{split_endpoint, Args};
use sdispatch::config::{self, Settings};
use sdispatch::logger::TextLogger;
use sdispatch::server::ServerState;
use sdispatch::{
    AcceptOptions, Engine, Headless, Method, PeerId, ServerId, ServerKind, SuggestOptions, TransferKey,
    VerdictRequest,
};

type Daemon = Engine<Headless>;

/// Tick until `done` holds; false if interrupted first.
fn wait(engine: &mut Daemon, stop: &AtomicBool, mut done: impl FnMut(&Daemon) -> bool) -> bool {
    engine.run_until(u64::MAX, |e| stop.load(Ordering::SeqCst) || done(e));
    !stop.load(Ordering::SeqCst)
}

fn start_data_server(engine: &mut Daemon, stop: &AtomicBool, endpoint: &str, tls: bool) -> Result<ServerId> {
    let (address, service) = split_endpoint(endpoint);
    let id = engine.start_server(ServerKind::Data, &address, &service, tls);
    let up = wait(engine, stop, |e| {
        e.server(id).map_or(true, |s| s.state() != ServerState::ResolvingIp)
    });
    match engine.server(id).map(|s| s.state()) {
        Some(ServerState::Listening) if up => Ok(id),
        _ => bail!("data server on {} did not come up", endpoint),
    }
}

fn suggest_all(engine: &mut Daemon, peer: PeerId, args: &Args, server: Option<ServerId>) -> Vec<TransferKey> {
    let opts = SuggestOptions {
        method: if args.passive { Method::Passive } else { Method::Active },
        server,
        any_port: args.any_port,
        tls: args.tls,
        ..Default::default()
    };
    let mut keys = Vec::new();
    for path in &args.send {
        match engine.suggest_file(peer, path, &opts) {
            Ok(key) => keys.push(key),
            Err(e) => eprintln!("Could not suggest {}: {}", path.display(), e),
        }
    }
    keys
}

fn main() -> Result<()> {
    let args = Args::parse();

    let config_path = args.config.clone().unwrap_or_else(config::default_path);
    let mut settings = Settings::load(&config_path)?;
    if let Some(out) = &args.output {
        settings.data_output_path = out.clone();
    }
    if args.save_config {
        settings.save(&config_path)?;
    }

    let log = if settings.logging_enabled {
        Some(TextLogger::new(&settings.logging_path).context("open log file")?)
    } else {
        None
    };
    let policy = if args.accept_all {
        VerdictRequest::Accept(AcceptOptions { directory: args.output.clone(), ..Default::default() })
    } else {
        VerdictRequest::Decline
    };

    let stop = Arc::new(AtomicBool::new(false));
    let flag = stop.clone();
    ctrlc::set_handler(move || {
        eprintln!("\nInterrupted, shutting down...");
        flag.store(true, Ordering::SeqCst);
    })
    .context("install Ctrl-C handler")?;

    let (server_address, server_service) =
        (settings.control_server_address.clone(), settings.control_server_service.clone());
    let mut engine = Engine::new(settings, Headless::new(log, policy, args.verbose));

    if let Some(listen) = &args.listen {
        let (address, service) = if listen == "default" {
            (server_address, server_service)
        } else {
            split_endpoint(listen)
        };
        engine.start_server(ServerKind::Control, &address, &service, args.tls);
    }

    let data_server = match (&args.data_server, args.passive) {
        (Some(endpoint), true) => Some(start_data_server(&mut engine, &stop, endpoint, args.tls)?),
        _ => None,
    };

    let mut pending = Vec::new();
    if let Some(target) = &args.connect {
        let (address, service) = split_endpoint(target);
        let peer = engine.connect(&address, &service, args.tls);
        let ready = wait(&mut engine, &stop, |e| {
            e.peer(peer).map_or(true, |p| p.is_verified() || !e.has_live_peers())
        });
        if !ready || !engine.peer(peer).is_some_and(|p| p.is_verified()) {
            bail!("could not reach {}", target);
        }
        if let Some(msg) = &args.message {
            engine.talk(peer, msg)?;
        }
        pending = suggest_all(&mut engine, peer, &args, data_server);
    }

    if args.exit_when_done && !pending.is_empty() {
        wait(&mut engine, &stop, |e| {
            pending
                .iter()
                .all(|k| e.transfer(*k).map_or(true, |t| t.state().is_finished()))
        });
        // Let the final notices go out
        engine.tick();
    } else {
        engine.run(&stop);
    }
    Ok(())
}
