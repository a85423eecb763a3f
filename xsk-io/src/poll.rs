//! # Socket Readiness
//!
//! Readiness probes on the socket descriptor. `poll_ready` asks the kernel, with a zero
//! timeout, whether the receive ring has packets (`POLLIN`) or the transmit ring has
//! room (`POLLOUT`). `poll_wait` blocks until one of them holds or the timeout expires.
//!
//! Neither touches the rings: probing any number of times leaves every index and
//! cached index as it was.

use crate::config::Readiness;
use crate::socket::XskSocket;
use std::io;
use std::time::Duration;

/// Direction a readiness probe asks about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    Receive,
    Transfer,
}

impl Interest {
    fn events(self) -> libc::c_short {
        match self {
            Interest::Receive => libc::POLLIN,
            Interest::Transfer => libc::POLLOUT,
        }
    }
}

impl XskSocket {
    /// Zero-timeout readiness check.
    pub fn poll_ready(&self, interest: Interest) -> io::Result<bool> {
        self.poll_once(interest.events(), 0)
    }

    /// Waits until the socket is ready for `interest`. `None` waits indefinitely.
    /// Returns `false` when the timeout expired first.
    pub fn poll_wait(&self, interest: Interest, timeout: Option<Duration>) -> io::Result<bool> {
        let timeout_ms = match timeout {
            Some(t) => i32::try_from(t.as_millis()).unwrap_or(i32::MAX),
            None => -1,
        };
        loop {
            match self.poll_once(interest.events(), timeout_ms) {
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                res => return res,
            }
        }
    }

    /// Readiness under `mode`: `Always` answers yes without a syscall.
    pub fn is_ready(&self, interest: Interest, mode: Readiness) -> io::Result<bool> {
        match mode {
            Readiness::Always => Ok(true),
            Readiness::Poll => self.poll_ready(interest),
        }
    }

    fn poll_once(&self, events: libc::c_short, timeout_ms: libc::c_int) -> io::Result<bool> {
        let mut fds = [libc::pollfd {
            fd: self.raw_fd,
            events,
            revents: 0,
        }];
        let ret = unsafe { libc::poll(fds.as_mut_ptr(), 1, timeout_ms) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(fds[0].revents & events != 0)
    }
}
