//! Transfer progress sampling and the terminal bars used by the daemon.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};

use crate::protocol::timing::PROGRESS_INTERVAL;
use crate::transfer::TransferKey;

/// One published sample.
#[derive(Clone, Debug, PartialEq)]
pub struct Progress {
    pub transferred: u64,
    pub size: u64,
    pub percent: f64,
    /// Bytes per second over the last interval.
    pub throughput: f64,
    pub eta: Option<Duration>,
    pub stalled: bool,
}

/// Tracks bytes moved and decides when a new sample is due.
#[derive(Debug)]
pub struct IoSampler {
    current: u64,
    last: u64,
    last_at: Instant,
    stalled: bool,
    interval: Duration,
}

impl IoSampler {
    pub fn new(start: u64) -> Self {
        Self {
            current: start,
            last: start,
            last_at: Instant::now(),
            stalled: false,
            interval: PROGRESS_INTERVAL,
        }
    }

    pub fn add(&mut self, n: u64) {
        self.current += n;
    }

    pub fn total(&self) -> u64 {
        self.current
    }

    pub fn stalled(&self) -> bool {
        self.stalled
    }

    /// A sample once at least one interval has elapsed since the previous one.
    pub fn sample(&mut self, size: u64, now: Instant) -> Option<Progress> {
        let elapsed = now.saturating_duration_since(self.last_at);
        if elapsed < self.interval {
            return None;
        }
        let delta = self.current.saturating_sub(self.last);
        let throughput = delta as f64 / elapsed.as_secs_f64();
        self.stalled = delta == 0;
        self.last = self.current;
        self.last_at = now;

        let remaining = size.saturating_sub(self.current);
        let eta = if throughput > 0.0 {
            Some(Duration::from_secs_f64(remaining as f64 / throughput))
        } else {
            None
        };
        let percent = if size == 0 { 100.0 } else { self.current as f64 * 100.0 / size as f64 };
        Some(Progress {
            transferred: self.current,
            size,
            percent,
            throughput,
            eta,
            stalled: self.stalled,
        })
    }
}

/// `1d 2h 3m 4s`, dropping leading zero units.
pub fn format_eta(d: Duration) -> String {
    let secs = d.as_secs();
    let (days, hours, mins, s) = (secs / 86_400, secs / 3600 % 24, secs / 60 % 60, secs % 60);
    if days > 0 {
        format!("{}d {}h {}m {}s", days, hours, mins, s)
    } else if hours > 0 {
        format!("{}h {}m {}s", hours, mins, s)
    } else if mins > 0 {
        format!("{}m {}s", mins, s)
    } else {
        format!("{}s", s)
    }
}

pub fn format_bytes(n: f64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut v = n;
    let mut unit = 0;
    while v >= 1024.0 && unit < UNITS.len() - 1 {
        v /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{:.0} {}", v, UNITS[unit])
    } else {
        format!("{:.1} {}", v, UNITS[unit])
    }
}

/// One progress bar per active transfer.
pub struct TransferBars {
    multi: MultiProgress,
    bars: HashMap<TransferKey, ProgressBar>,
}

impl TransferBars {
    pub fn new() -> Self {
        Self { multi: MultiProgress::new(), bars: HashMap::new() }
    }

    fn bar(&mut self, key: TransferKey, name: &str, size: u64) -> &ProgressBar {
        let multi = &self.multi;
        self.bars.entry(key).or_insert_with(|| {
            let pb = multi.add(ProgressBar::new(size));
            pb.set_style(
                ProgressStyle::with_template("{prefix:.bold} [{bar:30}] {bytes}/{total_bytes} {msg}")
                    .unwrap_or_else(|_| ProgressStyle::default_bar())
                    .progress_chars("=> "),
            );
            pb.set_prefix(format!("{} {}", key, name));
            pb
        })
    }

    pub fn update(&mut self, key: TransferKey, name: &str, p: &Progress) {
        let pb = self.bar(key, name, p.size);
        pb.set_position(p.transferred);
        let msg = match (p.stalled, p.eta) {
            (true, _) => "stalled".to_string(),
            (false, Some(eta)) => format!("{}/s, {} left", format_bytes(p.throughput), format_eta(eta)),
            (false, None) => String::new(),
        };
        pb.set_message(msg);
    }

    pub fn finish(&mut self, key: TransferKey, message: &str) {
        if let Some(pb) = self.bars.remove(&key) {
            pb.finish_with_message(message.to_string());
        }
    }

    pub fn abandon(&mut self, key: TransferKey, message: &str) {
        if let Some(pb) = self.bars.remove(&key) {
            pb.abandon_with_message(message.to_string());
        }
    }

    /// Print a line above the bars without tearing them.
    pub fn println(&self, line: &str) {
        if self.bars.is_empty() {
            eprintln!("{}", line);
        } else {
            let _ = self.multi.println(line);
        }
    }
}

impl Default for TransferBars {
    fn default() -> Self {
        Self::new()
    }
}
