//! Line-framed text codec for the control channel
//!
//! A command is `NAME arg arg ...` terminated by any run of CR/LF bytes.
//! Arguments are typed per command through a static schema table; one
//! generic encoder and decoder work over that table.

use std::fmt;

use crate::error::CodecError;
use crate::protocol::{command, limits, value, ESCAPE};
use crate::transfer::{Direction, Method};

/// How one argument is carried on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArgKind {
    /// Sent as-is; must already be printable and non-empty.
    Raw,
    /// Percent-escaped string.
    Escaped,
    /// Decimal unsigned integer.
    U64,
}

#[derive(Clone, Copy, Debug)]
pub struct ArgSpec {
    pub name: &'static str,
    pub kind: ArgKind,
    pub max_len: usize,
}

#[derive(Debug)]
pub struct CommandSpec {
    pub name: &'static str,
    pub args: &'static [ArgSpec],
}

const fn arg(name: &'static str, kind: ArgKind, max_len: usize) -> ArgSpec {
    ArgSpec { name, kind, max_len }
}

const U64_LEN: usize = 20;

pub static COMMANDS: [CommandSpec; 5] = [
    CommandSpec {
        name: command::VERSION,
        args: &[arg("version", ArgKind::Raw, limits::VERSION_LEN)],
    },
    CommandSpec {
        name: command::TALK,
        args: &[arg("message", ArgKind::Escaped, limits::TALK_LEN)],
    },
    CommandSpec {
        name: command::FILE_SUGGEST,
        args: &[
            arg("id", ArgKind::U64, U64_LEN),
            arg("filename", ArgKind::Escaped, limits::FILENAME_LEN),
            arg("size", ArgKind::U64, U64_LEN),
            arg("mtime", ArgKind::Escaped, limits::MTIME_LEN),
            arg("tls", ArgKind::Escaped, limits::CONST_LEN),
            arg("method", ArgKind::Escaped, limits::CONST_LEN),
            arg("address", ArgKind::Escaped, limits::ADDRESS_LEN),
            arg("service", ArgKind::Escaped, limits::SERVICE_LEN),
        ],
    },
    CommandSpec {
        name: command::FILE_VERDICT,
        args: &[
            arg("id", ArgKind::U64, U64_LEN),
            arg("verdict", ArgKind::Escaped, limits::CONST_LEN),
            arg("address", ArgKind::Escaped, limits::ADDRESS_LEN),
            arg("service", ArgKind::Escaped, limits::SERVICE_LEN),
            arg("position", ArgKind::U64, U64_LEN),
        ],
    },
    CommandSpec {
        name: command::FILE_PREPARED,
        args: &[
            arg("id", ArgKind::U64, U64_LEN),
            arg("direction", ArgKind::Escaped, limits::CONST_LEN),
        ],
    },
];

pub fn spec_for(name: &str) -> Option<&'static CommandSpec> {
    COMMANDS.iter().find(|c| c.name.eq_ignore_ascii_case(name))
}

/// A single argument value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Value {
    Str(String),
    U64(u64),
}

fn is_graph(b: u8) -> bool {
    (0x21..=0x7e).contains(&b)
}

pub fn escape(input: &[u8]) -> String {
    let mut out = String::with_capacity(input.len());
    for &b in input {
        if is_graph(b) && b != ESCAPE {
            out.push(b as char);
        } else {
            out.push(ESCAPE as char);
            out.push_str(&format!("{:02x}", b));
        }
    }
    out
}

pub fn unescape(input: &str, field: &'static str) -> Result<Vec<u8>, CodecError> {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == ESCAPE {
            let hex = bytes
                .get(i + 1..i + 3)
                .and_then(|h| std::str::from_utf8(h).ok())
                .and_then(|h| u8::from_str_radix(h, 16).ok())
                .ok_or(CodecError::BadEscape { field })?;
            out.push(hex);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    Ok(out)
}

/// Locate the first complete line in `buf`.
///
/// Returns the line length and the number of bytes it occupies including
/// the whole run of CR/LF bytes that terminates it.
pub fn scan_line(buf: &[u8]) -> Option<(usize, usize)> {
    let end = buf.iter().position(|&b| b == b'\r' || b == b'\n')?;
    let run = buf[end..]
        .iter()
        .take_while(|&&b| b == b'\r' || b == b'\n')
        .count();
    Some((end, end + run))
}

/// Bounded receive buffer for one control connection.
#[derive(Debug)]
pub struct LineBuffer {
    buf: Vec<u8>,
    limit: usize,
}

impl LineBuffer {
    pub fn new(limit: usize) -> Self {
        Self { buf: Vec::with_capacity(limit), limit }
    }

    /// Free space left before the buffer counts as overflowing.
    pub fn spare(&self) -> usize {
        self.limit - self.buf.len()
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        let take = bytes.len().min(self.spare());
        self.buf.extend_from_slice(&bytes[..take]);
    }

    /// Next complete line, with the residue shifted to the front.
    pub fn next_line(&mut self) -> Option<Vec<u8>> {
        let (len, consumed) = scan_line(&self.buf)?;
        let line = self.buf[..len].to_vec();
        self.buf.drain(..consumed);
        Some(line)
    }

    /// Full without a terminator anywhere in it.
    pub fn overflowed(&self) -> bool {
        self.buf.len() >= self.limit && scan_line(&self.buf).is_none()
    }

    pub fn residue(&self) -> &[u8] {
        &self.buf
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }
}

/// Encode one command line, terminator included.
pub fn encode(spec: &CommandSpec, values: &[Value]) -> Result<String, CodecError> {
    if values.len() != spec.args.len() {
        return Err(CodecError::Arity {
            command: spec.name,
            expected: spec.args.len(),
            got: values.len(),
        });
    }
    let mut line = String::from(spec.name);
    for (a, v) in spec.args.iter().zip(values) {
        line.push(' ');
        match (a.kind, v) {
            (ArgKind::U64, Value::U64(n)) => line.push_str(&n.to_string()),
            (ArgKind::Raw, Value::Str(s)) => {
                if s.is_empty() {
                    return Err(CodecError::EmptyField { field: a.name });
                }
                if !s.bytes().all(is_graph) {
                    return Err(CodecError::Unprintable { field: a.name });
                }
                line.push_str(s);
            }
            (ArgKind::Escaped, Value::Str(s)) => {
                if s.is_empty() {
                    return Err(CodecError::EmptyField { field: a.name });
                }
                line.push_str(&escape(s.as_bytes()));
            }
            (_, other) => {
                return Err(CodecError::BadConstant {
                    field: a.name,
                    value: format!("{:?}", other),
                })
            }
        }
    }
    line.push_str("\r\n");
    Ok(line)
}

/// Decode one line (without terminator) against the command table.
pub fn decode(line: &[u8]) -> Result<(&'static CommandSpec, Vec<Value>), CodecError> {
    // Every escaped field is ASCII on the wire, so anything else is junk
    let text = std::str::from_utf8(line).map_err(|_| CodecError::NotUtf8 { field: "line" })?;
    let mut parts = text.split_ascii_whitespace();
    let name = parts.next().ok_or(CodecError::Empty)?;
    let spec = spec_for(name).ok_or_else(|| CodecError::UnknownCommand(name.to_string()))?;
    let raw: Vec<&str> = parts.collect();
    if raw.len() != spec.args.len() {
        return Err(CodecError::Arity {
            command: spec.name,
            expected: spec.args.len(),
            got: raw.len(),
        });
    }

    let mut values = Vec::with_capacity(raw.len());
    for (a, r) in spec.args.iter().zip(raw) {
        let v = match a.kind {
            ArgKind::U64 => Value::U64(r.parse().map_err(|_| CodecError::BadInteger {
                field: a.name,
                value: r.to_string(),
            })?),
            ArgKind::Raw => Value::Str(r.to_string()),
            ArgKind::Escaped => {
                let bytes = unescape(r, a.name)?;
                Value::Str(String::from_utf8(bytes).map_err(|_| CodecError::NotUtf8 { field: a.name })?)
            }
        };
        if let Value::Str(s) = &v {
            if s.len() > a.max_len {
                return Err(CodecError::FieldTooLong { field: a.name, limit: a.max_len });
            }
        }
        values.push(v);
    }
    Ok((spec, values))
}

/// Decoded control command.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    Version {
        version: String,
    },
    Talk {
        message: String,
    },
    FileSuggest {
        id: u64,
        filename: String,
        size: u64,
        mtime: String,
        tls: bool,
        method: Method,
        address: String,
        service: String,
    },
    FileVerdict {
        id: u64,
        accept: bool,
        address: String,
        service: String,
        position: u64,
    },
    FilePrepared {
        id: u64,
        direction: Direction,
    },
}

fn constant<T: Copy>(field: &'static str, s: &str, table: &[(&str, T)]) -> Result<T, CodecError> {
    // Values are matched on their prefix, case-insensitively
    table
        .iter()
        .find(|(name, _)| {
            s.len() >= name.len() && s.as_bytes()[..name.len()].eq_ignore_ascii_case(name.as_bytes())
        })
        .map(|(_, v)| *v)
        .ok_or_else(|| CodecError::BadConstant { field, value: s.to_string() })
}

struct Args<'a> {
    spec: &'static CommandSpec,
    values: std::slice::Iter<'a, Value>,
    index: usize,
}

impl<'a> Args<'a> {
    fn field(&self) -> &'static str {
        self.spec.args.get(self.index).map(|a| a.name).unwrap_or("argument")
    }

    fn str(&mut self) -> Result<String, CodecError> {
        let field = self.field();
        self.index += 1;
        match self.values.next() {
            Some(Value::Str(s)) => Ok(s.clone()),
            other => Err(CodecError::BadConstant { field, value: format!("{:?}", other) }),
        }
    }

    fn u64(&mut self) -> Result<u64, CodecError> {
        let field = self.field();
        self.index += 1;
        match self.values.next() {
            Some(Value::U64(n)) => Ok(*n),
            other => Err(CodecError::BadInteger { field, value: format!("{:?}", other) }),
        }
    }

    fn constant<T: Copy>(&mut self, table: &[(&str, T)]) -> Result<T, CodecError> {
        let field = self.field();
        let s = self.str()?;
        constant(field, &s, table)
    }
}

const BOOLS: [(&str, bool); 2] = [(value::TRUE, true), (value::FALSE, false)];
const METHODS: [(&str, Method); 2] = [(value::ACTIVE, Method::Active), (value::PASSIVE, Method::Passive)];
const VERDICTS: [(&str, bool); 2] = [(value::ACCEPT, true), (value::DECLINE, false)];
const DIRECTIONS: [(&str, Direction); 2] = [
    (value::INCOMING, Direction::Incoming),
    (value::OUTGOING, Direction::Outgoing),
];

impl Command {
    pub fn name(&self) -> &'static str {
        self.spec().name
    }

    fn spec(&self) -> &'static CommandSpec {
        let idx = match self {
            Command::Version { .. } => 0,
            Command::Talk { .. } => 1,
            Command::FileSuggest { .. } => 2,
            Command::FileVerdict { .. } => 3,
            Command::FilePrepared { .. } => 4,
        };
        &COMMANDS[idx]
    }

    fn values(&self) -> Vec<Value> {
        let s = |v: &str| Value::Str(v.to_string());
        match self {
            Command::Version { version } => vec![s(version)],
            Command::Talk { message } => vec![s(message)],
            Command::FileSuggest { id, filename, size, mtime, tls, method, address, service } => vec![
                Value::U64(*id),
                s(filename),
                Value::U64(*size),
                s(mtime),
                s(if *tls { value::TRUE } else { value::FALSE }),
                s(method.wire()),
                s(address),
                s(service),
            ],
            Command::FileVerdict { id, accept, address, service, position } => vec![
                Value::U64(*id),
                s(if *accept { value::ACCEPT } else { value::DECLINE }),
                s(address),
                s(service),
                Value::U64(*position),
            ],
            Command::FilePrepared { id, direction } => vec![Value::U64(*id), s(direction.wire())],
        }
    }

    pub fn encode(&self) -> Result<String, CodecError> {
        encode(self.spec(), &self.values())
    }

    pub fn decode(line: &[u8]) -> Result<Command, CodecError> {
        let (spec, values) = decode(line)?;
        let mut a = Args { spec, values: values.iter(), index: 0 };
        let cmd = match spec.name {
            command::VERSION => Command::Version { version: a.str()? },
            command::TALK => Command::Talk { message: a.str()? },
            command::FILE_SUGGEST => Command::FileSuggest {
                id: a.u64()?,
                filename: a.str()?,
                size: a.u64()?,
                mtime: a.str()?,
                tls: a.constant(&BOOLS)?,
                method: a.constant(&METHODS)?,
                address: a.str()?,
                service: a.str()?,
            },
            command::FILE_VERDICT => Command::FileVerdict {
                id: a.u64()?,
                accept: a.constant(&VERDICTS)?,
                address: a.str()?,
                service: a.str()?,
                position: a.u64()?,
            },
            _ => Command::FilePrepared { id: a.u64()?, direction: a.constant(&DIRECTIONS)? },
        };
        Ok(cmd)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.encode() {
            Ok(line) => f.write_str(line.trim_end()),
            Err(_) => write!(f, "{}", self.name()),
        }
    }
}
