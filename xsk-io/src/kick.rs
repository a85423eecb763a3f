//! # Kernel Wakeup
//!
//! ## Purpose
//!
//! Tells the kernel to look at the rings. In copy mode, and whenever the socket was
//! bound with `XDP_USE_NEED_WAKEUP` and the kernel has raised a ring flag, descriptors
//! are not processed until the kernel is prompted.
//!
//! ## How it works
//!
//! The transmit side is woken with a zero-length, non-blocking `sendto`, the receive
//! side with a zero-length, non-blocking `recvfrom`. Neither moves data. Transient
//! refusals (`EAGAIN`, `EBUSY`, `ENOBUFS`) mean the kernel is already busy with the
//! ring and are ignored; `ENETDOWN` is logged and ignored.

use crate::socket::XskSocket;
use std::{io, ptr};

fn tolerate(ret: isize, fd: i32, what: &str) -> io::Result<()> {
    if ret >= 0 {
        return Ok(());
    }
    match io::Error::last_os_error().raw_os_error() {
        None | Some(libc::EBUSY | libc::ENOBUFS | libc::EAGAIN) => Ok(()),
        Some(libc::ENETDOWN) => {
            log::warn!("network interface is down, {what} on fd {fd} dropped");
            Ok(())
        }
        Some(e) => Err(io::Error::from_raw_os_error(e)),
    }
}

impl XskSocket {
    /// Prompts the kernel to process the transmit ring.
    pub fn kick(&self) -> io::Result<()> {
        let ret = unsafe {
            libc::sendto(
                self.raw_fd,
                ptr::null(),
                0,
                libc::MSG_DONTWAIT | libc::MSG_NOSIGNAL,
                ptr::null(),
                0,
            )
        };
        tolerate(ret, self.raw_fd, "transmit kick")
    }

    /// Whether a reclamation pass has to kick first: always without need-wakeup
    /// signalling, otherwise only when the kernel asks for it.
    pub fn tx_wakeup_needed(&self) -> bool {
        !self.need_wakeup || self.tx.needs_wakeup()
    }

    /// Wakes the receive side if the kernel raised the flag on the fill ring. Only
    /// sockets bound with need-wakeup ever do anything here.
    pub fn rx_wakeup(&mut self) -> io::Result<()> {
        if !self.need_wakeup || !self.pool.lock().fill_ring().needs_wakeup() {
            return Ok(());
        }
        let ret = unsafe {
            libc::recvfrom(
                self.raw_fd,
                ptr::null_mut(),
                0,
                libc::MSG_DONTWAIT,
                ptr::null_mut(),
                ptr::null_mut(),
            )
        };
        tolerate(ret, self.raw_fd, "receive wakeup")
    }
}
