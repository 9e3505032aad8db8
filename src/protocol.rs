//! Shared protocol constants for the sdispatch control and data channels

/// Version announced in VERSION. Peers with a different string are reported but still served.
pub const VERSION: &str = concat!("sdispatch-", env!("CARGO_PKG_VERSION"));

// Escape character for command arguments
pub const ESCAPE: u8 = b'%';

// Placeholder sent for an address/service that has no value (declined verdicts)
pub const NULL_FIELD: &str = "NULL";

// Command names as they appear on the wire
pub mod command {
    pub const VERSION: &str = "VERSION";
    pub const TALK: &str = "TALK";
    pub const FILE_SUGGEST: &str = "FILE-SUGGEST";
    pub const FILE_VERDICT: &str = "FILE-VERDICT";
    pub const FILE_PREPARED: &str = "FILE-PREPARED";
}

// Constant argument values
pub mod value {
    pub const TRUE: &str = "TRUE";
    pub const FALSE: &str = "FALSE";
    pub const ACTIVE: &str = "ACTIVE";
    pub const PASSIVE: &str = "PASSIVE";
    pub const ACCEPT: &str = "ACCEPT";
    pub const DECLINE: &str = "DECLINE";
    pub const INCOMING: &str = "INCOMING";
    pub const OUTGOING: &str = "OUTGOING";
}

// Per-field limits, checked after unescaping
pub mod limits {
    pub const VERSION_LEN: usize = 64;
    pub const TALK_LEN: usize = 1024;
    pub const CONST_LEN: usize = 128;
    pub const ADDRESS_LEN: usize = 512;
    pub const SERVICE_LEN: usize = 64;
    pub const FILENAME_LEN: usize = 256;
    pub const MTIME_LEN: usize = 128;

    /// Bytes a control connection may buffer without seeing a line terminator.
    pub const CONTROL_BUFFER_LEN: usize = 10240;

    /// Capacity of the per-transfer data window.
    pub const DATA_BUFFER_LEN: usize = 102400;

    pub const LISTEN_BACKLOG: i32 = 10;

    // Source ports tried in order when binding a data channel
    pub const SOURCE_PORT_FIRST: u16 = 1500;
    pub const SOURCE_PORT_LAST: u16 = 65535;
}

// Timing used by the scheduler and transfer pump
pub mod timing {
    use std::time::Duration;

    /// Ticks shorter than this are padded with a sleep.
    pub const MIN_TICK: Duration = Duration::from_millis(30);

    /// Minimum spacing between progress samples.
    pub const PROGRESS_INTERVAL: Duration = Duration::from_millis(700);

    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
    pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);
}
