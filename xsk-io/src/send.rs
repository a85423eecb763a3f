//! # Packet Transmit
//!
//! ## Purpose
//!
//! Copies caller bytes into a free frame, submits it on the transmit ring and reclaims
//! frames the kernel has finished sending.
//!
//! ## How it works
//!
//! `transfer` validates the length against the usable frame size, makes sure the
//! transmit ring has a slot and the pool has a free frame (running one reclamation
//! pass and retrying once if not), copies the payload behind the headroom and
//! publishes one descriptor. It then reclaims right away, so the kernel gets its kick
//! and completed frames flow back to the free list on every call. That last pass is
//! best-effort: once the descriptor is published the call succeeds.
//!
//! `complete_tx` kicks the kernel when needed and claims up to one batch of addresses
//! from the completion ring, returning their frames to the free list.
//!
//! ## Main components
//!
//! - `XskSocket::transfer()`: submit one packet.
//! - `XskSocket::complete_tx()`: one reclamation pass.

use crate::error::RingError;
use crate::ring::XdpDesc;
use crate::socket::XskSocket;

impl XskSocket {
    /// Transmits `data` as one packet and returns how many earlier transmits were
    /// acknowledged by the kernel during the call.
    ///
    /// # Errors
    ///
    /// - `InvalidLength`: `data` is empty or larger than a frame minus its headroom.
    /// - `RingFull`: no transmit slot even after reclaiming; nothing was submitted.
    /// - `NoFreeFrame`: every transmit frame is still in flight.
    /// - `Io`: the kick before a retry failed; nothing was submitted.
    pub fn transfer(&mut self, data: &[u8]) -> Result<u32, RingError> {
        let (frame_size, headroom) = {
            let umem = self.pool.lock();
            (umem.frame_size(), umem.headroom())
        };
        if data.is_empty() || data.len() > (frame_size - headroom) as usize {
            return Err(RingError::InvalidLength);
        }

        let mut acknowledged = 0;
        if self.tx.nb_free(1) < 1 {
            acknowledged += self.complete_tx()?;
            if self.tx.nb_free(1) < 1 {
                return Err(RingError::RingFull);
            }
        }

        let frame = self.pool.lock().alloc_frame();
        let index = match frame {
            Some(index) => index,
            None => {
                acknowledged += self.complete_tx()?;
                let frame = self.pool.lock().alloc_frame();
                frame.ok_or(RingError::NoFreeFrame)?
            }
        };

        let addr = {
            let mut umem = self.pool.lock();
            let addr = umem.addr_of(index) + headroom as u64;
            let Some(buf) = umem.frame_at_mut(index) else {
                return Err(RingError::InvalidAddress(addr));
            };
            let start = headroom as usize;
            buf[start..start + data.len()].copy_from_slice(data);
            addr
        };

        if let Err(e) = self.tx.enqueue(&[XdpDesc::new(addr, data.len() as u32)]) {
            self.pool.lock().release_frame(index);
            return Err(e);
        }
        self.outstanding_tx += 1;
        log::trace!("fd {}: queued {} bytes in frame {index}", self.raw_fd, data.len());

        // the packet is on the ring; a failed reclamation must not read as a failed send
        match self.complete_tx() {
            Ok(done) => acknowledged += done,
            Err(e) => log::warn!("fd {}: reclaim after transmit failed: {e}", self.raw_fd),
        }
        Ok(acknowledged)
    }

    /// One reclamation pass: kicks the kernel if it has to, then claims up to one batch
    /// of completed transmits. Returns how many were claimed; zero is not an error.
    pub fn complete_tx(&mut self) -> Result<u32, RingError> {
        if self.outstanding_tx == 0 {
            return Ok(0);
        }
        if self.tx_wakeup_needed() {
            self.kick()?;
        }
        let max = self.batch_size.min(self.outstanding_tx) as usize;
        let done = self.pool.lock().complete(max) as u32;
        // on a shared pool a completion may belong to a sibling socket
        self.outstanding_tx = self.outstanding_tx.saturating_sub(done);
        self.stats.tx_packets += done as u64;
        Ok(done)
    }
}
