//! # Frame Pool (UMEM)
//!
//! ## Purpose
//!
//! The frame pool is one pinned buffer sliced into fixed-size frames. Frames travel
//! between the application and the kernel by address only: the fill ring hands empty
//! frames to the kernel for incoming packets, the completion ring gives transmitted
//! frames back.
//!
//! ## How it works
//!
//! `configure` allocates a page-aligned buffer of `frame_count * frame_size` bytes,
//! registers it on a socket with `XDP_UMEM_REG`, sizes and maps the fill and completion
//! rings. The pool owns that socket descriptor: closing it is what unregisters the
//! buffer, so it is released after the rings and before the buffer.
//!
//! Frames are addressed by index through `frame_at`, bounds-checked against the frame
//! count. Frames not lent to the kernel for receive sit in a free list used by the
//! transmit path; completions return them there.
//!
//! ## Main components
//!
//! - `Umem`: the buffer, its two rings, the registering socket and the free list.

use crate::config::XskConfig;
use crate::error::{RingError, os_error, step_error};
use crate::mmap::OwnedMmap;
use crate::ring::{Ring, RingType, XdpDesc, ring_offsets};
use std::collections::VecDeque;
use std::mem::size_of;
use std::os::fd::{AsRawFd as _, OwnedFd, RawFd};
use std::{io, slice};

const COMPLETION_CHUNK: usize = 64;

/// Teardown steps of a frame pool, in the order `close` runs them.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ReleaseStep {
    Rings,
    Registration,
    Buffer,
}

pub struct Umem {
    // Field order is drop order: rings, the registering socket, then the buffer.
    fill: Ring<u64>,
    completion: Ring<u64>,
    owner: OwnedFd,
    frames: OwnedMmap,
    frame_size: u32,
    frame_count: u32,
    frame_shift: u32,
    headroom: u32,
    free: VecDeque<u32>,
}

impl Umem {
    /// Allocates the frame pool, registers it on `owner` and maps its fill and
    /// completion rings. Any failure leaves nothing allocated.
    pub fn configure(owner: OwnedFd, config: &XskConfig) -> io::Result<Self> {
        let raw_fd = owner.as_raw_fd();
        let len = config.pool_len().ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "frame pool size overflows")
        })?;
        let frames = OwnedMmap::mmap(len, config.huge_page)
            .map_err(|e| step_error("allocate frame pool", e))?;

        let reg = unsafe {
            libc::xdp_umem_reg {
                addr: frames.as_void_ptr() as u64,
                len: len as u64,
                chunk_size: config.frame_size,
                headroom: config.headroom,
                ..std::mem::zeroed()
            }
        };
        let ret = unsafe {
            libc::setsockopt(
                raw_fd,
                libc::SOL_XDP,
                libc::XDP_UMEM_REG,
                &reg as *const _ as *const libc::c_void,
                size_of::<libc::xdp_umem_reg>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            return Err(os_error("register frame pool"));
        }

        RingType::Fill.set_size(raw_fd, config.fill_size)?;
        RingType::Completion.set_size(raw_fd, config.completion_size)?;
        let offsets = ring_offsets(raw_fd)?;
        let fill = RingType::Fill.mmap(raw_fd, &offsets, config.fill_size)?;
        let completion = RingType::Completion.mmap(raw_fd, &offsets, config.completion_size)?;
        log::debug!(
            "frame pool registered on fd {raw_fd}: {} frames of {} bytes",
            config.frame_count,
            config.frame_size
        );
        Ok(Umem::from_parts(owner, frames, fill, completion, config))
    }

    /// A pool whose rings live in anonymous memory and whose buffer is not registered
    /// with any kernel socket.
    pub fn anonymous(owner: OwnedFd, config: &XskConfig) -> io::Result<Self> {
        let len = config.pool_len().ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "frame pool size overflows")
        })?;
        let frames = OwnedMmap::mmap(len, Some(false))?;
        let fill = Ring::anonymous(config.fill_size, RingType::Fill.role())?;
        let completion = Ring::anonymous(config.completion_size, RingType::Completion.role())?;
        Ok(Umem::from_parts(owner, frames, fill, completion, config))
    }

    fn from_parts(
        owner: OwnedFd,
        frames: OwnedMmap,
        fill: Ring<u64>,
        completion: Ring<u64>,
        config: &XskConfig,
    ) -> Self {
        Umem {
            fill,
            completion,
            owner,
            frames,
            frame_size: config.frame_size,
            frame_count: config.frame_count,
            frame_shift: config.frame_shift(),
            headroom: config.headroom,
            free: (0..config.frame_count).collect(),
        }
    }

    /// Descriptor of the socket the pool is registered on.
    pub fn raw_fd(&self) -> RawFd {
        self.owner.as_raw_fd()
    }

    pub fn frame_size(&self) -> u32 {
        self.frame_size
    }

    pub fn frame_count(&self) -> u32 {
        self.frame_count
    }

    pub fn frame_shift(&self) -> u32 {
        self.frame_shift
    }

    pub fn headroom(&self) -> u32 {
        self.headroom
    }

    /// Frames currently available to the transmit path.
    pub fn free_frames(&self) -> usize {
        self.free.len()
    }

    pub fn fill_ring(&mut self) -> &mut Ring<u64> {
        &mut self.fill
    }

    pub fn completion_ring(&mut self) -> &mut Ring<u64> {
        &mut self.completion
    }

    pub fn addr_of(&self, index: u32) -> u64 {
        (index as u64) << self.frame_shift
    }

    /// Index of the frame containing `addr`, if it is inside the pool.
    pub fn frame_index(&self, addr: u64) -> Option<u32> {
        let index = addr >> self.frame_shift;
        (index < self.frame_count as u64).then_some(index as u32)
    }

    /// Whether `addr` is the start of a frame of this pool.
    pub fn is_frame_addr(&self, addr: u64) -> bool {
        addr & (self.frame_size as u64 - 1) == 0 && self.frame_index(addr).is_some()
    }

    pub fn frame_at(&self, index: u32) -> Option<&[u8]> {
        if index >= self.frame_count {
            return None;
        }
        let start = self.addr_of(index) as usize;
        Some(unsafe {
            slice::from_raw_parts(self.frames.as_u8_ptr().add(start), self.frame_size as usize)
        })
    }

    pub fn frame_at_mut(&mut self, index: u32) -> Option<&mut [u8]> {
        if index >= self.frame_count {
            return None;
        }
        let start = self.addr_of(index) as usize;
        Some(unsafe {
            slice::from_raw_parts_mut(self.frames.as_u8_ptr().add(start), self.frame_size as usize)
        })
    }

    /// Packet bytes a descriptor points at. The address may carry an offset into its
    /// frame; the packet must not cross the frame end.
    pub fn packet(&self, desc: &XdpDesc) -> Result<&[u8], RingError> {
        let index = self
            .frame_index(desc.addr)
            .ok_or(RingError::InvalidAddress(desc.addr))?;
        let offset = (desc.addr & (self.frame_size as u64 - 1)) as usize;
        let end = offset + desc.len as usize;
        let frame = self.frame_at(index).ok_or(RingError::InvalidAddress(desc.addr))?;
        frame
            .get(offset..end)
            .ok_or(RingError::InvalidAddress(desc.addr))
    }

    /// Takes a frame for transmit.
    pub fn alloc_frame(&mut self) -> Option<u32> {
        self.free.pop_front()
    }

    /// Returns a frame to the transmit free list.
    pub fn release_frame(&mut self, index: u32) {
        debug_assert!(index < self.frame_count);
        self.free.push_back(index);
    }

    /// Lends up to `n` free frames to the kernel for receive. Returns how many.
    pub fn populate_fill(&mut self, n: u32) -> Result<u32, RingError> {
        let n = n.min(self.free.len() as u32);
        if self.fill.nb_free(n) < n {
            return Err(RingError::RingFull);
        }
        let frames: Vec<u32> = self.free.drain(..n as usize).collect();
        let shift = self.frame_shift;
        self.fill
            .produce(n, |i| (frames[i as usize] as u64) << shift)?;
        log::debug!("lent {n} frames to the kernel for receive");
        Ok(n)
    }

    /// Hands the frames of received descriptors back to the kernel.
    pub fn refill(&mut self, descs: &[XdpDesc]) -> Result<(), RingError> {
        let n = u32::try_from(descs.len()).map_err(|_| RingError::RingFull)?;
        let mask = !(self.frame_size as u64 - 1);
        self.fill.produce(n, |i| descs[i as usize].addr & mask)
    }

    /// Claims up to `max` completed transmit frames and puts them back on the free
    /// list. Returns how many were claimed.
    pub fn complete(&mut self, max: usize) -> usize {
        let mut addrs = [0u64; COMPLETION_CHUNK];
        let mut total = 0;
        while total < max {
            let want = (max - total).min(COMPLETION_CHUNK);
            let got = self.completion.dequeue(&mut addrs[..want]);
            for &addr in &addrs[..got] {
                match self.frame_index(addr) {
                    Some(index) => self.free.push_back(index),
                    None => log::warn!("completion for foreign address {addr:#x} dropped"),
                }
            }
            total += got;
            if got < want {
                break;
            }
        }
        total
    }

    /// Releases the pool in reverse order of acquisition: rings, registration (by
    /// closing the owning socket), buffer. Every step runs; the first error is reported.
    pub fn close(self) -> io::Result<()> {
        self.close_with(|_| {})
    }

    /// `close`, calling `after` once each step has run.
    pub(crate) fn close_with(self, mut after: impl FnMut(ReleaseStep)) -> io::Result<()> {
        let Umem {
            fill,
            completion,
            owner,
            frames,
            ..
        } = self;
        let rings = [
            fill.unmap().map_err(|e| step_error("unmap fill ring", e)),
            completion
                .unmap()
                .map_err(|e| step_error("unmap completion ring", e)),
        ];
        after(ReleaseStep::Rings);
        let raw_fd = owner.as_raw_fd();
        drop(owner);
        log::debug!("closed fd {raw_fd}, frame pool unregistered");
        after(ReleaseStep::Registration);
        let buffer = frames
            .unmap()
            .map_err(|e| step_error("unmap frame pool", e));
        after(ReleaseStep::Buffer);
        rings.into_iter().chain([buffer]).collect()
    }
}
