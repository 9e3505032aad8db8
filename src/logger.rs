use anyhow::{Context, Result};
use chrono::Local;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;

/// Append-only log of notices, one timestamped line each.
pub struct TextLogger {
    file: Mutex<File>,
}

impl TextLogger {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("open log file {}", path.display()))?;
        Ok(Self { file: Mutex::new(f) })
    }

    pub fn line(&self, s: &str) {
        let mut f = self.file.lock();
        let _ = writeln!(f, "[{}] {}", Local::now().to_rfc3339(), s);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn appends_timestamped_lines() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("logs/sdispatch.log");
        let log = TextLogger::new(&path).unwrap();
        log.line("first");
        log.line("second");
        drop(log);
        TextLogger::new(&path).unwrap().line("third");

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with('[') && lines[0].ends_with("] first"));
        assert!(lines[2].ends_with("] third"));
    }
}
