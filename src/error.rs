use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::peer::PeerId;
use crate::server::ServerId;
use crate::transfer::TransferKey;

/// Failures at the protocol decode/encode boundary. None of these close the
/// connection on their own.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("received an empty command")]
    Empty,

    #[error("unknown command: {0}")]
    UnknownCommand(String),

    #[error("{command} expects {expected} arguments, got {got}")]
    Arity {
        command: &'static str,
        expected: usize,
        got: usize,
    },

    #[error("malformed escape sequence in {field}")]
    BadEscape { field: &'static str },

    #[error("{field} is not valid UTF-8")]
    NotUtf8 { field: &'static str },

    #[error("{field} exceeds {limit} bytes")]
    FieldTooLong { field: &'static str, limit: usize },

    #[error("{field} is not an unsigned integer: {value}")]
    BadInteger { field: &'static str, value: String },

    #[error("{field} has unexpected value: {value}")]
    BadConstant { field: &'static str, value: String },

    #[error("{field} cannot be sent empty")]
    EmptyField { field: &'static str },

    #[error("{field} contains characters that cannot be sent unescaped")]
    Unprintable { field: &'static str },
}

/// File collaborator errors. Each aborts only the transfer that hit it.
#[derive(Debug, Error)]
pub enum FileError {
    #[error("{op} {path}: {source}")]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("{0} is not a regular file")]
    NotRegular(PathBuf),

    #[error("required an invalid file position: {requested} (size {size})")]
    InvalidPosition { requested: u64, size: u64 },

    #[error("file ended after {read} of {expected} bytes")]
    ShortRead { read: u64, expected: u64 },

    #[error("unsafe file name: {0}")]
    UnsafeName(String),
}

impl FileError {
    pub fn op(&self) -> &'static str {
        match self {
            FileError::Io { op, .. } => op,
            FileError::NotRegular(_) => "stat",
            FileError::InvalidPosition { .. } => "seek",
            FileError::ShortRead { .. } => "read",
            FileError::UnsafeName(_) => "open",
        }
    }

    pub fn code(&self) -> Option<i32> {
        match self {
            FileError::Io { source, .. } => source.raw_os_error(),
            _ => None,
        }
    }
}

/// Errors returned by the operator-facing engine API.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("no such peer: {0}")]
    UnknownPeer(PeerId),

    #[error("no such transfer: {0}")]
    UnknownTransfer(TransferKey),

    #[error("no such server: {0}")]
    UnknownServer(ServerId),

    #[error("{what} is not possible while {state}")]
    InvalidState { what: &'static str, state: String },

    #[error("server {0} is not a data server")]
    NotDataServer(ServerId),

    #[error("data channel TLS mismatch: we would use TLS={ours}, the peer announced TLS={theirs}")]
    TlsMismatch { ours: bool, theirs: bool },

    #[error(transparent)]
    File(#[from] FileError),

    #[error(transparent)]
    Codec(#[from] CodecError),
}
