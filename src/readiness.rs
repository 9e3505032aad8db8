//! Shared readiness set covering every registered socket.
//!
//! Only the scheduler thread touches this. Each tick polls it once with a
//! zero timeout and hands the snapshot to the accept and receive phases.

use std::collections::{BTreeSet, HashSet};

#[cfg(unix)]
pub type Descriptor = std::os::fd::RawFd;
#[cfg(windows)]
pub type Descriptor = std::os::windows::io::RawSocket;

#[cfg(unix)]
pub fn descriptor_of<S: std::os::fd::AsRawFd>(s: &S) -> Descriptor {
    s.as_raw_fd()
}
#[cfg(windows)]
pub fn descriptor_of<S: std::os::windows::io::AsRawSocket>(s: &S) -> Descriptor {
    s.as_raw_socket()
}

#[derive(Debug, Default)]
pub struct ReadinessSet {
    fds: BTreeSet<Descriptor>,
}

/// Result of one poll.
#[derive(Debug, Default)]
pub struct Ready {
    readable: HashSet<Descriptor>,
    all: bool,
}

impl Ready {
    /// Treat every descriptor as readable; used when no poll is available.
    pub fn everything() -> Self {
        Self { readable: HashSet::new(), all: true }
    }

    pub fn is_readable(&self, fd: Descriptor) -> bool {
        self.all || self.readable.contains(&fd)
    }
}

impl ReadinessSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, fd: Descriptor) {
        self.fds.insert(fd);
    }

    pub fn deregister(&mut self, fd: Descriptor) {
        self.fds.remove(&fd);
    }

    pub fn contains(&self, fd: Descriptor) -> bool {
        self.fds.contains(&fd)
    }

    pub fn highest(&self) -> Option<Descriptor> {
        self.fds.iter().next_back().copied()
    }

    pub fn len(&self) -> usize {
        self.fds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fds.is_empty()
    }

    #[cfg(unix)]
    pub fn poll(&self) -> Ready {
        if self.fds.is_empty() {
            return Ready::default();
        }
        let mut pfds: Vec<libc::pollfd> = self
            .fds
            .iter()
            .map(|&fd| libc::pollfd { fd, events: libc::POLLIN, revents: 0 })
            .collect();
        let rc = unsafe { libc::poll(pfds.as_mut_ptr(), pfds.len() as libc::nfds_t, 0) };
        if rc < 0 {
            // EINTR and friends: every socket is non-blocking, so just try them all
            return Ready::everything();
        }
        let readable = pfds
            .iter()
            .filter(|p| p.revents & (libc::POLLIN | libc::POLLHUP | libc::POLLERR) != 0)
            .map(|p| p.fd)
            .collect();
        Ready { readable, all: false }
    }

    #[cfg(not(unix))]
    pub fn poll(&self) -> Ready {
        Ready::everything()
    }
}
