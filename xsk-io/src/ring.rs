//! # Kernel-Shared Descriptor Rings
//!
//! ## Purpose
//!
//! An AF_XDP socket talks to the kernel through four single-producer/single-consumer
//! rings: fill and completion (frame addresses only) and receive and transmit (full
//! descriptors). This module implements one ring type, generic over the slot type, used
//! for all four.
//!
//! ## How it works
//!
//! The ring memory holds a producer cell, a consumer cell, a flags cell and a power of
//! two array of slots. Each side writes only its own cell. The local side keeps cached
//! copies of both indices and touches the shared cells only when the cache says there
//! is not enough room (producer) or nothing to read (consumer). Indices run freely over
//! `u32` and wrap; the slot is `index & mask`.
//!
//! Producer side, `produce`: check free slots (`cached_cons - cached_prod`, the cached
//! consumer being kept one ring ahead), reload the consumer cell if short, write the
//! slots, write barrier, publish the producer index. Consumer side, `dequeue`: check
//! available entries, reload the producer cell if empty, read barrier, read the slots,
//! write barrier, publish the consumer index.
//!
//! ## Main components
//!
//! - `Ring<T>`: the ring, with `Role::Producer` or `Role::Consumer` semantics.
//! - `XdpDesc`: the receive/transmit descriptor, layout-checked against the kernel ABI.
//! - `RingType`: ring kinds with their socket option and mmap page offset.
//! - `ring_offsets()`: asks the kernel where the cells and slots live in each mapping.

use crate::barrier::{read_barrier, write_barrier};
use crate::error::{RingError, os_error, step_error};
use crate::mmap::OwnedMmap;
use static_assertions::{assert_eq_align, assert_eq_size};
use std::io;
use std::mem::size_of;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicU32, Ordering};

/// Receive/transmit descriptor: a frame address and the packet length in it.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct XdpDesc {
    pub addr: u64,
    pub len: u32,
    pub options: u32,
}

assert_eq_size!(XdpDesc, libc::xdp_desc);
assert_eq_align!(XdpDesc, libc::xdp_desc);

impl XdpDesc {
    pub fn new(addr: u64, len: u32) -> Self {
        XdpDesc {
            addr,
            len,
            options: 0,
        }
    }
}

/// Which index of the ring the local side owns.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Role {
    /// Writes slots and the producer index (fill and transmit rings).
    Producer,
    /// Reads slots and writes the consumer index (receive and completion rings).
    Consumer,
}

impl Role {
    fn reversed(self) -> Self {
        match self {
            Role::Producer => Role::Consumer,
            Role::Consumer => Role::Producer,
        }
    }
}

// Layout used for rings that live in anonymous memory instead of a socket mapping.
const ANON_OFFSETS: libc::xdp_ring_offset = libc::xdp_ring_offset {
    producer: 0,
    consumer: 64,
    flags: 128,
    desc: 192,
};

pub struct Ring<T> {
    mmap: OwnedMmap,
    producer: *const AtomicU32,
    consumer: *const AtomicU32,
    flags: *const AtomicU32,
    desc: *mut T,
    cached_prod: u32,
    cached_cons: u32,
    mask: u32,
    size: u32,
    role: Role,
}

// A ring is driven by one thread at a time; its mapping may move between threads.
unsafe impl<T: Send> Send for Ring<T> {}

impl<T: Copy> Ring<T> {
    /// Builds a ring over `mmap`, laid out as `offsets` describes.
    ///
    /// # Safety
    /// `base` must point at memory that stays valid for the life of the ring and covers
    /// the three cells and `size` slots at `offsets`.
    unsafe fn at(
        mmap: OwnedMmap,
        base: *mut u8,
        offsets: &libc::xdp_ring_offset,
        size: u32,
        role: Role,
    ) -> Self {
        debug_assert!(size.is_power_of_two());
        let mut ring = unsafe {
            Ring {
                mmap,
                producer: base.add(offsets.producer as usize) as *const AtomicU32,
                consumer: base.add(offsets.consumer as usize) as *const AtomicU32,
                flags: base.add(offsets.flags as usize) as *const AtomicU32,
                desc: base.add(offsets.desc as usize) as *mut T,
                cached_prod: 0,
                cached_cons: 0,
                mask: size - 1,
                size,
                role,
            }
        };
        ring.sync_cached();
        ring
    }

    /// Maps a kernel ring of `size` slots from socket `fd`.
    pub fn mmap(
        fd: RawFd,
        ring_type: RingType,
        size: u32,
        offsets: &libc::xdp_ring_offset,
    ) -> io::Result<Self> {
        if !size.is_power_of_two() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} ring size {size} is not a power of two", ring_type.name()),
            ));
        }
        let map_size = (offsets.desc as usize).saturating_add(size as usize * size_of::<T>());
        let mmap = OwnedMmap::mmap_shared(fd, map_size, ring_type.as_offset())
            .map_err(|e| step_error(&format!("mmap {} ring", ring_type.name()), e))?;
        let base = mmap.as_u8_ptr();
        log::debug!("mapped {} ring: {size} slots, {map_size} bytes", ring_type.name());
        Ok(unsafe { Ring::at(mmap, base, offsets, size, ring_type.role()) })
    }

    /// A ring over private anonymous memory, with nobody on the other side until a
    /// `mirror` is taken.
    pub fn anonymous(size: u32, role: Role) -> io::Result<Self> {
        if !size.is_power_of_two() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("ring size {size} is not a power of two"),
            ));
        }
        let map_size = ANON_OFFSETS.desc as usize + size as usize * size_of::<T>();
        let mmap = OwnedMmap::mmap(map_size, Some(false))?;
        let base = mmap.as_u8_ptr();
        Ok(unsafe { Ring::at(mmap, base, &ANON_OFFSETS, size, role) })
    }

    /// The opposite side of this ring over the same memory. It owns no mapping.
    ///
    /// # Safety
    /// The mirror must not outlive `self`, and each side must stay confined to one
    /// thread at a time.
    pub unsafe fn mirror(&self) -> Ring<T> {
        let mut ring = Ring {
            mmap: OwnedMmap::unowned(),
            producer: self.producer,
            consumer: self.consumer,
            flags: self.flags,
            desc: self.desc,
            cached_prod: 0,
            cached_cons: 0,
            mask: self.mask,
            size: self.size,
            role: self.role.reversed(),
        };
        ring.sync_cached();
        ring
    }

    fn sync_cached(&mut self) {
        self.cached_prod = self.producer();
        self.cached_cons = match self.role {
            // producer keeps its consumer cache one ring ahead, so that
            // `cached_cons - cached_prod` is the number of free slots
            Role::Producer => self.consumer().wrapping_add(self.size),
            Role::Consumer => self.consumer(),
        };
    }

    fn producer_cell(&self) -> &AtomicU32 {
        unsafe { &*self.producer }
    }

    fn consumer_cell(&self) -> &AtomicU32 {
        unsafe { &*self.consumer }
    }

    /// Published producer index.
    pub fn producer(&self) -> u32 {
        self.producer_cell().load(Ordering::Acquire)
    }

    /// Published consumer index.
    pub fn consumer(&self) -> u32 {
        self.consumer_cell().load(Ordering::Acquire)
    }

    pub fn flags(&self) -> u32 {
        unsafe { (*self.flags).load(Ordering::Acquire) }
    }

    pub fn needs_wakeup(&self) -> bool {
        self.flags() & libc::XDP_RING_NEED_WAKEUP != 0
    }

    /// Raises flags the way the kernel does on its side of the ring.
    #[cfg(test)]
    pub(crate) fn set_flags(&self, flags: u32) {
        unsafe { (*self.flags).store(flags, Ordering::Release) }
    }

    pub fn capacity(&self) -> u32 {
        self.size
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Descriptors published by the producer and not yet released by the consumer.
    pub fn in_flight(&self) -> u32 {
        self.producer().wrapping_sub(self.consumer())
    }

    /// Free slots for a batch of `n`; reloads the consumer cell only when the cached
    /// view is short.
    pub fn nb_free(&mut self, n: u32) -> u32 {
        let free = self.cached_cons.wrapping_sub(self.cached_prod);
        if free >= n {
            return free;
        }
        self.cached_cons = self.consumer().wrapping_add(self.size);
        self.cached_cons.wrapping_sub(self.cached_prod)
    }

    /// Entries ready to consume, at most `n`; reloads the producer cell only when the
    /// cached view is empty.
    pub fn nb_avail(&mut self, n: u32) -> u32 {
        let mut entries = self.cached_prod.wrapping_sub(self.cached_cons);
        if entries == 0 {
            self.cached_prod = self.producer();
            entries = self.cached_prod.wrapping_sub(self.cached_cons);
        }
        entries.min(n)
    }

    /// Publishes `n` slots whose values `slot(i)` yields for batch position `i`.
    /// Either all `n` are published or none is and the producer index is untouched.
    pub fn produce(&mut self, n: u32, mut slot: impl FnMut(u32) -> T) -> Result<(), RingError> {
        debug_assert_eq!(self.role, Role::Producer);
        if self.nb_free(n) < n {
            return Err(RingError::RingFull);
        }
        for i in 0..n {
            let idx = self.cached_prod & self.mask;
            unsafe { self.desc.add(idx as usize).write(slot(i)) };
            self.cached_prod = self.cached_prod.wrapping_add(1);
        }
        write_barrier();
        self.producer_cell().store(self.cached_prod, Ordering::Relaxed);
        Ok(())
    }

    /// Publishes all of `items` or nothing.
    pub fn enqueue(&mut self, items: &[T]) -> Result<(), RingError> {
        let n = u32::try_from(items.len()).map_err(|_| RingError::RingFull)?;
        self.produce(n, |i| items[i as usize])
    }

    /// Claims up to `out.len()` published entries into `out`. Never waits; returns
    /// how many were claimed.
    pub fn dequeue(&mut self, out: &mut [T]) -> usize {
        debug_assert_eq!(self.role, Role::Consumer);
        let max = u32::try_from(out.len()).unwrap_or(u32::MAX);
        let entries = self.nb_avail(max) as usize;
        read_barrier();
        for slot in &mut out[..entries] {
            let idx = self.cached_cons & self.mask;
            *slot = unsafe { self.desc.add(idx as usize).read() };
            self.cached_cons = self.cached_cons.wrapping_add(1);
        }
        if entries > 0 {
            write_barrier();
            self.consumer_cell().store(self.cached_cons, Ordering::Relaxed);
        }
        entries
    }

    /// Unmaps the ring now.
    pub fn unmap(self) -> io::Result<()> {
        self.mmap.unmap()
    }
}

impl Ring<XdpDesc> {
    /// Transmit fast path for frames used in strict rotation: slot `i` gets the frame
    /// `(base_id + i) << frame_shift` and length `len`, with no descriptor copy.
    pub fn enqueue_tx_only(
        &mut self,
        base_id: u32,
        n: u32,
        len: u32,
        frame_shift: u32,
    ) -> Result<(), RingError> {
        self.produce(n, |i| {
            XdpDesc::new((base_id.wrapping_add(i) as u64) << frame_shift, len)
        })
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RingType {
    Tx,
    Rx,
    Fill,
    Completion,
}

impl RingType {
    fn as_index(&self) -> libc::c_int {
        match self {
            RingType::Tx => libc::XDP_TX_RING,
            RingType::Rx => libc::XDP_RX_RING,
            RingType::Fill => libc::XDP_UMEM_FILL_RING,
            RingType::Completion => libc::XDP_UMEM_COMPLETION_RING,
        }
    }

    fn as_offset(&self) -> libc::off_t {
        match self {
            RingType::Tx => libc::XDP_PGOFF_TX_RING,
            RingType::Rx => libc::XDP_PGOFF_RX_RING,
            RingType::Fill => libc::XDP_UMEM_PGOFF_FILL_RING as libc::off_t,
            RingType::Completion => libc::XDP_UMEM_PGOFF_COMPLETION_RING as libc::off_t,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            RingType::Tx => "tx",
            RingType::Rx => "rx",
            RingType::Fill => "fill",
            RingType::Completion => "completion",
        }
    }

    /// The side the application plays on this ring.
    pub fn role(&self) -> Role {
        match self {
            RingType::Tx | RingType::Fill => Role::Producer,
            RingType::Rx | RingType::Completion => Role::Consumer,
        }
    }

    /// Where this ring sits inside the kernel-reported offsets.
    pub fn offsets<'a>(&self, offsets: &'a libc::xdp_mmap_offsets) -> &'a libc::xdp_ring_offset {
        match self {
            RingType::Tx => &offsets.tx,
            RingType::Rx => &offsets.rx,
            RingType::Fill => &offsets.fr,
            RingType::Completion => &offsets.cr,
        }
    }

    /// Asks the kernel for a ring of `ring_size` descriptors.
    pub fn set_size(self, raw_fd: RawFd, ring_size: u32) -> io::Result<()> {
        let ret = unsafe {
            libc::setsockopt(
                raw_fd,
                libc::SOL_XDP,
                self.as_index(),
                &ring_size as *const _ as *const libc::c_void,
                size_of::<u32>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            return Err(os_error(&format!("set {} ring size", self.name())));
        }
        Ok(())
    }

    /// Maps this ring of socket `raw_fd`.
    pub fn mmap<T: Copy>(
        self,
        raw_fd: RawFd,
        offsets: &libc::xdp_mmap_offsets,
        ring_size: u32,
    ) -> io::Result<Ring<T>> {
        Ring::mmap(raw_fd, self, ring_size, self.offsets(offsets))
    }
}

/// Retrieves the kernel's layout of all four rings with `XDP_MMAP_OFFSETS`.
pub fn ring_offsets(raw_fd: RawFd) -> io::Result<libc::xdp_mmap_offsets> {
    let mut offsets: libc::xdp_mmap_offsets = unsafe { std::mem::zeroed() };
    let mut optlen = size_of::<libc::xdp_mmap_offsets>() as libc::socklen_t;
    let ret = unsafe {
        libc::getsockopt(
            raw_fd,
            libc::SOL_XDP,
            libc::XDP_MMAP_OFFSETS,
            &mut offsets as *mut _ as *mut libc::c_void,
            &mut optlen,
        )
    };
    if ret < 0 {
        return Err(os_error("query ring offsets"));
    }
    Ok(offsets)
}
