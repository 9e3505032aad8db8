//! Command-line options for the `sdispatch` daemon

use clap::{ArgAction, Parser};
use std::path::PathBuf;

#[derive(Clone, Debug, Parser)]
#[command(author, version, about = "sdispatch - peer-to-peer file dispatch over a text control protocol")]
pub struct Args {
    /// Settings file (defaults to sdispatch.toml in the config directory)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Start a control server on host:port ("default" uses the configured endpoint)
    #[arg(long)]
    pub listen: Option<String>,

    /// Connect to a peer's control server at host:port
    #[arg(long)]
    pub connect: Option<String>,

    /// Suggest a file to the connected peer (repeatable)
    #[arg(long = "send", action = ArgAction::Append)]
    pub send: Vec<PathBuf>,

    /// Let the peer dial the data connection instead of dialing it ourselves
    #[arg(long)]
    pub passive: bool,

    /// Data server endpoint (host:port) used by passive transfers
    #[arg(long = "data-server")]
    pub data_server: Option<String>,

    /// Accept data connections from the expected host on any port
    #[arg(long = "any-port")]
    pub any_port: bool,

    /// Accept every suggested file (otherwise suggestions are declined)
    #[arg(long = "accept-all")]
    pub accept_all: bool,

    /// Directory for received files
    #[arg(long)]
    pub output: Option<PathBuf>,

    /// Use TLS for control and data connections
    #[arg(long)]
    pub tls: bool,

    /// Send a TALK message once connected
    #[arg(long)]
    pub message: Option<String>,

    /// Leave once every suggested file has finished
    #[arg(long = "exit-when-done")]
    pub exit_when_done: bool,

    /// Write the effective settings back to the settings file
    #[arg(long = "save-config")]
    pub save_config: bool,

    /// Show protocol traffic as well as notices
    #[arg(short, long)]
    pub verbose: bool,
}

/// Split `host:port`, `[v6]:port` or a bare `port` into address and service.
pub fn split_endpoint(s: &str) -> (String, String) {
    if let Some(rest) = s.strip_prefix('[') {
        if let Some((host, tail)) = rest.split_once(']') {
            return (host.to_string(), tail.trim_start_matches(':').to_string());
        }
    }
    match s.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') => (host.to_string(), port.to_string()),
        Some(_) => (s.to_string(), String::new()),
        None if s.chars().all(|c| c.is_ascii_digit()) => (String::new(), s.to_string()),
        None => (s.to_string(), String::new()),
    }
}
