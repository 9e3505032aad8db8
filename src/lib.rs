//! sdispatch library
//!
//! Peer-to-peer file dispatch: peers negotiate transfers over a line-based
//! control protocol, then move each file over its own data connection.

pub mod cli;
pub mod config;
pub mod connection;
pub mod context;
pub mod error;
pub mod file;
pub mod frontend;
pub mod logger;
pub mod peer;
pub mod progress;
pub mod protocol;
pub mod protocol_core;
pub mod readiness;
pub mod resolve;
pub mod scheduler;
pub mod server;
pub mod task;
pub mod tls;
pub mod transfer;

pub use config::Settings;
pub use error::{CodecError, EngineError, FileError};
pub use frontend::{Frontend, Headless, NoopFrontend, VerdictRequest};
#[cfg(any(test, feature = "test-support"))]
pub use frontend::Recorder;
pub use peer::PeerId;
pub use scheduler::Engine;
pub use server::{ServerId, ServerKind};
pub use transfer::{AcceptOptions, Direction, Method, SuggestOptions, TransferKey, TransferState};
