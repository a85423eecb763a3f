//! # AF_XDP Socket Binder
//!
//! ## Purpose
//!
//! Creates an AF_XDP socket bound to one interface queue, with its receive and transmit
//! rings mapped and a frame pool attached: either a private one created on this socket
//! or one shared with other sockets.
//!
//! ## How it works
//!
//! 1. Creates the raw `AF_XDP` socket.
//! 2. Private or founding socket: creates the frame pool on this socket's descriptor.
//!    Attaching socket: borrows the caller's pool and binds with `XDP_SHARED_UMEM`.
//! 3. Sizes the receive and transmit rings, reads the kernel offsets and maps both.
//! 4. A socket that created its pool lends the receive partition of frames to the
//!    kernel through the fill ring before binding, so traffic can land as soon as the
//!    bind succeeds.
//! 5. Binds to the interface and queue.
//!
//! ## Main components
//!
//! - `XskSocket`: rings, frame pool reference and transmit bookkeeping.
//! - `UmemMode`: private, founding a shared pool, or attaching to one.
//! - `BindFlags`: the `sxdp_flags` passed to `bind`.

use crate::config::XskConfig;
use crate::error::{os_error, step_error};
use crate::ring::{Ring, RingType, XdpDesc, ring_offsets};
use crate::umem::Umem;
use std::io;
use std::mem::size_of;
use std::os::fd::{AsRawFd as _, FromRawFd as _, OwnedFd, RawFd};
use std::sync::{Arc, Mutex, MutexGuard};

/// A frame pool used by several sockets. The mutex serialises their access to the
/// pool's fill and completion rings, which stay single-producer/single-consumer.
pub type SharedUmem = Arc<Mutex<Umem>>;

/// How a new socket gets its frame pool.
pub enum UmemMode {
    /// Creates a pool for this socket alone.
    Private,
    /// Creates a pool on this socket that other sockets will attach to.
    SharedOwner,
    /// Attaches to an existing shared pool.
    Attach(SharedUmem),
}

/// The frame pool a socket works on.
pub enum FramePool {
    Owned(Box<Umem>),
    Shared(SharedUmem),
}

impl FramePool {
    pub fn lock(&mut self) -> UmemGuard<'_> {
        match self {
            FramePool::Owned(umem) => UmemGuard::Owned(umem),
            FramePool::Shared(shared) => {
                UmemGuard::Shared(shared.lock().unwrap_or_else(|e| e.into_inner()))
            }
        }
    }

    pub fn shared(&self) -> Option<SharedUmem> {
        match self {
            FramePool::Owned(_) => None,
            FramePool::Shared(shared) => Some(shared.clone()),
        }
    }
}

/// Exclusive access to a socket's frame pool.
pub enum UmemGuard<'a> {
    Owned(&'a mut Umem),
    Shared(MutexGuard<'a, Umem>),
}

impl std::ops::Deref for UmemGuard<'_> {
    type Target = Umem;

    fn deref(&self) -> &Umem {
        match self {
            UmemGuard::Owned(umem) => umem,
            UmemGuard::Shared(guard) => guard,
        }
    }
}

impl std::ops::DerefMut for UmemGuard<'_> {
    fn deref_mut(&mut self) -> &mut Umem {
        match self {
            UmemGuard::Owned(umem) => umem,
            UmemGuard::Shared(guard) => guard,
        }
    }
}

/// `sxdp_flags` of the bind call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BindFlags(pub u16);

impl BindFlags {
    pub const SHARED_UMEM: BindFlags = BindFlags(libc::XDP_SHARED_UMEM);
    pub const COPY: BindFlags = BindFlags(libc::XDP_COPY);
    pub const ZERO_COPY: BindFlags = BindFlags(libc::XDP_ZEROCOPY);
    pub const NEED_WAKEUP: BindFlags = BindFlags(libc::XDP_USE_NEED_WAKEUP);

    /// Exclusive-pool flags requested by `config`.
    pub fn from_config(config: &XskConfig) -> Self {
        let zero_copy = match config.zero_copy {
            Some(true) => BindFlags::ZERO_COPY,
            Some(false) => BindFlags::COPY,
            None => BindFlags::default(),
        };
        let need_wakeup = if config.need_wakeup {
            BindFlags::NEED_WAKEUP
        } else {
            BindFlags::default()
        };
        zero_copy | need_wakeup
    }

    pub fn contains(&self, other: BindFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for BindFlags {
    type Output = BindFlags;

    fn bitor(self, rhs: BindFlags) -> BindFlags {
        BindFlags(self.0 | rhs.0)
    }
}

/// Received and transmitted packet totals of one socket.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SocketStats {
    pub rx_packets: u64,
    pub tx_packets: u64,
}

pub struct XskSocket {
    // Field order is drop order: rings, this socket's own descriptor, then the pool,
    // which may hold the descriptor the pool was registered on.
    pub(crate) rx: Ring<XdpDesc>,
    pub(crate) tx: Ring<XdpDesc>,
    own_fd: Option<OwnedFd>,
    pub(crate) pool: FramePool,
    pub(crate) raw_fd: RawFd,
    pub(crate) outstanding_tx: u32,
    pub(crate) need_wakeup: bool,
    pub(crate) batch_size: u32,
    pub(crate) stats: SocketStats,
}

impl XskSocket {
    /// Creates a socket on `if_index`/`queue_id`, attaches a frame pool as `mode` says
    /// and binds. Every failure is returned with the step that failed.
    ///
    /// `flags` applies to private and founding sockets; attaching sockets always bind
    /// with `XDP_SHARED_UMEM`.
    pub fn configure(
        mode: UmemMode,
        if_index: u32,
        queue_id: u32,
        flags: BindFlags,
        config: &XskConfig,
    ) -> io::Result<Self> {
        let fd = unsafe {
            let fd = libc::socket(libc::AF_XDP, libc::SOCK_RAW | libc::SOCK_CLOEXEC, 0);
            if fd < 0 {
                return Err(os_error("create AF_XDP socket"));
            }
            OwnedFd::from_raw_fd(fd)
        };
        let raw_fd = fd.as_raw_fd();

        let (own_fd, pool, shared_fd) = match mode {
            UmemMode::Private => (
                None,
                FramePool::Owned(Box::new(Umem::configure(fd, config)?)),
                None,
            ),
            UmemMode::SharedOwner => (
                None,
                FramePool::Shared(Arc::new(Mutex::new(Umem::configure(fd, config)?))),
                None,
            ),
            UmemMode::Attach(shared) => {
                let owner_fd = shared.lock().unwrap_or_else(|e| e.into_inner()).raw_fd();
                (Some(fd), FramePool::Shared(shared), Some(owner_fd))
            }
        };

        RingType::Rx.set_size(raw_fd, config.rx_size)?;
        RingType::Tx.set_size(raw_fd, config.tx_size)?;
        let offsets = ring_offsets(raw_fd)?;
        let rx = RingType::Rx.mmap(raw_fd, &offsets, config.rx_size)?;
        let tx = RingType::Tx.mmap(raw_fd, &offsets, config.tx_size)?;

        let mut socket = XskSocket::from_parts(own_fd, pool, raw_fd, rx, tx, flags, config);
        if shared_fd.is_none() {
            socket
                .pool
                .lock()
                .populate_fill(config.fill_size)
                .map_err(|e| step_error("populate fill ring", io::Error::other(e)))?;
        }

        let bind_flags = match shared_fd {
            Some(_) => BindFlags::SHARED_UMEM,
            None => flags,
        };
        let sxdp = libc::sockaddr_xdp {
            sxdp_family: libc::AF_XDP as libc::sa_family_t,
            sxdp_flags: bind_flags.0,
            sxdp_ifindex: if_index,
            sxdp_queue_id: queue_id,
            sxdp_shared_umem_fd: shared_fd.unwrap_or(0) as u32,
        };
        let ret = unsafe {
            libc::bind(
                raw_fd,
                &sxdp as *const _ as *const libc::sockaddr,
                size_of::<libc::sockaddr_xdp>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            return Err(os_error(&format!(
                "bind AF_XDP socket to ifindex {if_index} queue {queue_id}"
            )));
        }
        log::info!(
            "AF_XDP socket fd {raw_fd} bound to ifindex {if_index} queue {queue_id} (flags {:#x})",
            bind_flags.0
        );
        Ok(socket)
    }

    pub(crate) fn from_parts(
        own_fd: Option<OwnedFd>,
        pool: FramePool,
        raw_fd: RawFd,
        rx: Ring<XdpDesc>,
        tx: Ring<XdpDesc>,
        flags: BindFlags,
        config: &XskConfig,
    ) -> Self {
        XskSocket {
            rx,
            tx,
            own_fd,
            pool,
            raw_fd,
            outstanding_tx: 0,
            need_wakeup: flags.contains(BindFlags::NEED_WAKEUP),
            batch_size: config.batch_size,
            stats: SocketStats::default(),
        }
    }

    pub fn raw_fd(&self) -> RawFd {
        self.raw_fd
    }

    /// Transmits submitted and not yet reclaimed from the completion ring.
    pub fn outstanding_tx(&self) -> u32 {
        self.outstanding_tx
    }

    pub fn stats(&self) -> SocketStats {
        self.stats
    }

    pub fn umem(&mut self) -> UmemGuard<'_> {
        self.pool.lock()
    }

    /// The pool as a shareable handle, when the socket was created for sharing.
    pub fn shared_umem(&self) -> Option<SharedUmem> {
        self.pool.shared()
    }

    /// Releases the socket in reverse order of acquisition: rings, own descriptor, then
    /// its reference to the frame pool, tearing the pool down if it was the last one.
    pub fn close(self) -> io::Result<()> {
        let XskSocket {
            rx, tx, own_fd, pool, raw_fd, ..
        } = self;
        let rings = [
            rx.unmap().map_err(|e| step_error("unmap rx ring", e)),
            tx.unmap().map_err(|e| step_error("unmap tx ring", e)),
        ];
        drop(own_fd);
        let pool = match pool {
            FramePool::Owned(umem) => umem.close(),
            FramePool::Shared(shared) => match Arc::try_unwrap(shared) {
                Ok(umem) => umem.into_inner().unwrap_or_else(|e| e.into_inner()).close(),
                Err(_) => Ok(()),
            },
        };
        log::debug!("AF_XDP socket fd {raw_fd} closed");
        rings.into_iter().chain([pool]).collect()
    }
}
