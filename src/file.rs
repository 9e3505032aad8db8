//! File collaborator for transfers: stat, open for read or write at a
//! position, sequential read and write with the position tracked here.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Component, Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, Local, NaiveDateTime, TimeZone};

use crate::error::FileError;

/// asctime(3) layout carried in FILE-SUGGEST.
const MTIME_FORMAT: &str = "%a %b %e %H:%M:%S %Y";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileInfo {
    pub directory: PathBuf,
    pub name: String,
    pub size: u64,
    pub position: u64,
    pub modtime: String,
}

fn io_err(op: &'static str, path: &Path) -> impl FnOnce(io::Error) -> FileError {
    let path = path.to_path_buf();
    move |source| FileError::Io { op, path, source }
}

pub fn format_mtime(t: SystemTime) -> String {
    DateTime::<Local>::from(t).format(MTIME_FORMAT).to_string()
}

pub fn parse_mtime(s: &str) -> Option<SystemTime> {
    let naive = NaiveDateTime::parse_from_str(s.trim(), MTIME_FORMAT).ok()?;
    let local = Local.from_local_datetime(&naive).earliest()?;
    Some(local.into())
}

/// Accept only a single normal path component as a remote file name.
pub fn safe_name(name: &str) -> Result<&str, FileError> {
    let unsafe_name = || FileError::UnsafeName(name.to_string());
    if name.is_empty() || name.contains('\0') || name.contains('/') || name.contains('\\') {
        return Err(unsafe_name());
    }
    let mut parts = Path::new(name).components();
    match (parts.next(), parts.next()) {
        (Some(Component::Normal(_)), None) => {}
        _ => return Err(unsafe_name()),
    }
    #[cfg(windows)]
    if name.contains(':') {
        return Err(unsafe_name());
    }
    Ok(name)
}

impl FileInfo {
    /// Describe a local file for an outgoing suggestion.
    pub fn from_path(path: &Path) -> Result<Self, FileError> {
        let md = fs::metadata(path).map_err(io_err("stat", path))?;
        if !md.is_file() {
            return Err(FileError::NotRegular(path.to_path_buf()));
        }
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| FileError::UnsafeName(path.display().to_string()))?;
        let directory = path.parent().map(Path::to_path_buf).unwrap_or_default();
        let modtime = md.modified().map(format_mtime).unwrap_or_default();
        Ok(Self { directory, name, size: md.len(), position: 0, modtime })
    }

    /// Describe an incoming file as announced by the peer.
    pub fn announced(directory: PathBuf, name: &str, size: u64, modtime: &str) -> Result<Self, FileError> {
        Ok(Self {
            directory,
            name: safe_name(name)?.to_string(),
            size,
            position: 0,
            modtime: modtime.to_string(),
        })
    }

    pub fn path(&self) -> PathBuf {
        self.directory.join(&self.name)
    }

    pub fn remaining(&self) -> u64 {
        self.size.saturating_sub(self.position)
    }
}

/// Open file handle with its current position.
#[derive(Debug)]
pub struct OpenFile {
    file: File,
    path: PathBuf,
    position: u64,
}

impl OpenFile {
    /// Source side: must exist, be regular, and hold at least `info.position` bytes.
    pub fn for_read(info: &FileInfo) -> Result<Self, FileError> {
        let path = info.path();
        let md = fs::metadata(&path).map_err(io_err("stat", &path))?;
        if !md.is_file() {
            return Err(FileError::NotRegular(path));
        }
        if info.position > md.len() {
            return Err(FileError::InvalidPosition { requested: info.position, size: md.len() });
        }
        let mut file = File::open(&path).map_err(io_err("open", &path))?;
        file.seek(SeekFrom::Start(info.position)).map_err(io_err("seek", &path))?;
        Ok(Self { file, path, position: info.position })
    }

    /// Destination side: position 0 starts a fresh file, anything else
    /// resumes an existing one.
    pub fn for_write(info: &FileInfo) -> Result<Self, FileError> {
        let path = info.path();
        if info.position == 0 {
            let file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&path)
                .map_err(io_err("open", &path))?;
            return Ok(Self { file, path, position: 0 });
        }
        let md = fs::metadata(&path).map_err(io_err("stat", &path))?;
        if !md.is_file() {
            return Err(FileError::NotRegular(path));
        }
        if info.position > md.len() {
            return Err(FileError::InvalidPosition { requested: info.position, size: md.len() });
        }
        let mut file = OpenOptions::new().write(true).open(&path).map_err(io_err("open", &path))?;
        file.seek(SeekFrom::Start(info.position)).map_err(io_err("seek", &path))?;
        Ok(Self { file, path, position: info.position })
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    /// Fill `buf` completely; a short file is an error.
    pub fn read_exact_at_position(&mut self, buf: &mut [u8]) -> Result<(), FileError> {
        let mut read = 0;
        while read < buf.len() {
            match self.file.read(&mut buf[read..]) {
                Ok(0) => {
                    return Err(FileError::ShortRead { read: read as u64, expected: buf.len() as u64 })
                }
                Ok(n) => read += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(io_err("read", &self.path)(e)),
            }
        }
        self.position += read as u64;
        Ok(())
    }

    pub fn write_all(&mut self, buf: &[u8]) -> Result<(), FileError> {
        self.file.write_all(buf).map_err(io_err("write", &self.path))?;
        self.position += buf.len() as u64;
        Ok(())
    }

    pub fn size(&self) -> Result<u64, FileError> {
        Ok(self.file.metadata().map_err(io_err("stat", &self.path))?.len())
    }

    pub fn finish(mut self) -> Result<(), FileError> {
        self.file.flush().map_err(io_err("flush", &self.path))
    }
}

/// Best effort: stamp the announced modification time on a received file.
pub fn apply_mtime(info: &FileInfo) -> bool {
    match parse_mtime(&info.modtime) {
        Some(t) => filetime::set_file_mtime(info.path(), filetime::FileTime::from_system_time(t)).is_ok(),
        None => false,
    }
}
