//! # Packet I/O Context
//!
//! ## Purpose
//!
//! The public surface of the crate. `Context::open` runs the whole startup sequence
//! for one interface; afterwards `can_receive`, `can_transfer`, `receive` and
//! `transfer` are single, bounded, non-blocking attempts meant for a caller-driven
//! poll loop.
//!
//! ## How it works
//!
//! Startup is strictly sequential: resolve the interface, load and attach the redirect
//! program, create `socket_count` sockets on the configured queue (one private frame
//! pool, or one pool shared by all of them) and register each in the redirect table
//! under its slot index. The first failure aborts `open` with the step that failed.
//!
//! With several sockets, receive takes the next socket with pending packets, so a
//! socket the redirect program feeds is always drained; transfer goes out through the
//! first socket.
//!
//! Teardown runs in reverse: sockets (and with them the frame pool), redirect table,
//! program detach.
//!
//! ## Main components
//!
//! - `Context`: sockets, redirect table and the attached program.
//! - `if_index()`: interface name to index.

use crate::config::{Readiness, XskConfig};
use crate::error::{RingError, os_error, step_error};
use crate::loader::{self, XdpProgram};
use crate::poll::Interest;
use crate::recv::RxPacket;
use crate::redirect::RedirectTable;
use crate::socket::{BindFlags, SocketStats, UmemMode, XskSocket};
use std::ffi::CString;
use std::io;

/// Resolves an interface name to its index.
pub fn if_index(ifname: &str) -> io::Result<u32> {
    let c_name = CString::new(ifname)?;
    let index = unsafe { libc::if_nametoindex(c_name.as_ptr()) };
    if index == 0 {
        return Err(os_error(&format!("resolve interface {ifname}")));
    }
    Ok(index)
}

pub struct Context {
    // Field order is drop order.
    sockets: Vec<XskSocket>,
    redirect: Option<RedirectTable>,
    program: Option<XdpProgram>,
    readiness: Readiness,
    next_rx: usize,
}

impl Context {
    /// Opens `ifname` with the default configuration.
    pub fn open(ifname: &str) -> io::Result<Self> {
        Context::open_with(ifname, &XskConfig::default())
    }

    pub fn open_with(ifname: &str, config: &XskConfig) -> io::Result<Self> {
        config.validate()?;
        let if_index = if_index(ifname)?;
        let (program, mut redirect) = loader::load(config, if_index)?;

        let flags = BindFlags::from_config(config);
        let mut sockets: Vec<XskSocket> = Vec::with_capacity(config.socket_count as usize);
        for slot in 0..config.socket_count {
            let mode = if config.socket_count == 1 {
                UmemMode::Private
            } else if let Some(shared) = sockets.first().and_then(XskSocket::shared_umem) {
                UmemMode::Attach(shared)
            } else {
                UmemMode::SharedOwner
            };
            let socket = XskSocket::configure(mode, if_index, config.queue_id, flags, config)
                .map_err(|e| step_error(&format!("socket {slot}"), e))?;
            redirect.insert(slot, socket.raw_fd())?;
            sockets.push(socket);
        }
        log::info!(
            "{ifname}: {} socket(s) ready on queue {}",
            sockets.len(),
            config.queue_id
        );

        Ok(Context {
            sockets,
            redirect: Some(redirect),
            program: Some(program),
            readiness: config.readiness,
            next_rx: 0,
        })
    }

    /// A context over already configured sockets, with no program or redirect table.
    pub fn from_sockets(sockets: Vec<XskSocket>, readiness: Readiness) -> Self {
        Context {
            sockets,
            redirect: None,
            program: None,
            readiness,
            next_rx: 0,
        }
    }

    pub fn sockets(&self) -> &[XskSocket] {
        &self.sockets
    }

    pub fn sockets_mut(&mut self) -> &mut [XskSocket] {
        &mut self.sockets
    }

    pub fn redirect_table(&self) -> Option<&RedirectTable> {
        self.redirect.as_ref()
    }

    pub fn redirect_table_mut(&mut self) -> Option<&mut RedirectTable> {
        self.redirect.as_mut()
    }

    pub fn program(&self) -> Option<&XdpProgram> {
        self.program.as_ref()
    }

    /// Totals over all sockets.
    pub fn stats(&self) -> SocketStats {
        self.sockets
            .iter()
            .map(XskSocket::stats)
            .fold(SocketStats::default(), |acc, s| SocketStats {
                rx_packets: acc.rx_packets + s.rx_packets,
                tx_packets: acc.tx_packets + s.tx_packets,
            })
    }

    /// Transmits still waiting for completion, over all sockets.
    pub fn outstanding_tx(&self) -> u32 {
        self.sockets.iter().map(XskSocket::outstanding_tx).sum()
    }

    /// Whether any socket has received packets waiting. Leaves every ring untouched.
    pub fn can_receive(&self) -> bool {
        self.sockets
            .iter()
            .any(|socket| self.probe(socket, Interest::Receive))
    }

    /// Whether the transmitting socket can take a packet. Leaves every ring untouched.
    pub fn can_transfer(&self) -> bool {
        self.sockets
            .first()
            .is_some_and(|socket| self.probe(socket, Interest::Transfer))
    }

    fn probe(&self, socket: &XskSocket, interest: Interest) -> bool {
        match socket.is_ready(interest, self.readiness) {
            Ok(ready) => ready,
            Err(e) => {
                log::warn!("readiness poll on fd {} failed: {e}", socket.raw_fd());
                false
            }
        }
    }

    /// Claims one received packet, if any socket has one.
    pub fn receive(&mut self) -> Result<Option<RxPacket<'_>>, RingError> {
        let n = self.sockets.len();
        let start = self.next_rx;
        let Some(index) = (0..n)
            .map(|i| (start + i) % n)
            .find(|&i| self.sockets[i].rx_pending() > 0)
        else {
            for socket in &mut self.sockets {
                socket.rx_wakeup()?;
            }
            return Ok(None);
        };
        self.next_rx = (index + 1) % n;
        self.sockets[index].receive()
    }

    /// Copies one received packet into `buf`. Returns the bytes copied, 0 if none.
    pub fn receive_into(&mut self, buf: &mut [u8]) -> Result<usize, RingError> {
        match self.receive()? {
            Some(packet) => {
                let n = packet.len().min(buf.len());
                buf[..n].copy_from_slice(&packet[..n]);
                Ok(n)
            }
            None => Ok(0),
        }
    }

    /// Transmits `data` and returns how many earlier transmits were acknowledged.
    pub fn transfer(&mut self, data: &[u8]) -> Result<u32, RingError> {
        match self.sockets.first_mut() {
            Some(socket) => socket.transfer(data),
            None => Err(RingError::RingFull),
        }
    }

    /// Explicit teardown in reverse order of acquisition. Every step runs; the first
    /// error is reported.
    pub fn close(self) -> io::Result<()> {
        let Context {
            sockets,
            redirect,
            program,
            ..
        } = self;
        let mut result = Ok(());
        // shared pool: the founding socket goes last so attached sockets unbind first
        for socket in sockets.into_iter().rev() {
            let closed = socket.close();
            if result.is_ok() {
                result = closed;
            }
        }
        drop(redirect);
        if let Some(mut program) = program {
            let detached = program.detach();
            if result.is_ok() {
                result = detached;
            }
        }
        result
    }
}
