//! # Packet Receive
//!
//! ## Purpose
//!
//! Claims received descriptors from the receive ring, exposes their bytes straight
//! from the frame pool and hands the frames back to the kernel on the fill ring.
//!
//! ## How it works
//!
//! Every claimed descriptor is checked against the pool before its bytes are exposed.
//! The frame goes back to the kernel once the application is done with it:
//!
//! - `receive` returns an `RxPacket` that recycles its frame when dropped.
//! - `receive_batch` lends each packet to a closure, then recycles the whole batch.
//! - `receive_into` copies the packet out and recycles at once.
//!
//! An empty receive ring on a need-wakeup socket wakes the kernel when it asks for it
//! on the fill ring, so the next call finds packets.
//!
//! ## Main components
//!
//! - `RxPacket`: zero-copy view of one received packet.

use crate::error::RingError;
use crate::ring::XdpDesc;
use crate::socket::{UmemGuard, XskSocket};
use std::ops::Deref;

/// A received packet, read in place from the frame pool. The frame returns to the
/// kernel's fill ring when this is dropped.
pub struct RxPacket<'a> {
    umem: UmemGuard<'a>,
    desc: XdpDesc,
}

impl RxPacket<'_> {
    /// Address and length of the packet inside the pool.
    pub fn desc(&self) -> XdpDesc {
        self.desc
    }
}

impl Deref for RxPacket<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.umem.packet(&self.desc).unwrap_or_default()
    }
}

impl Drop for RxPacket<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.umem.refill(&[self.desc]) {
            log::error!("Failed to recycle frame {:#x}: {e}", self.desc.addr);
        }
    }
}

impl XskSocket {
    /// Received descriptors waiting on the receive ring.
    pub fn rx_pending(&mut self) -> u32 {
        self.rx.nb_avail(u32::MAX)
    }

    /// Claims the next received packet, if any.
    pub fn receive(&mut self) -> Result<Option<RxPacket<'_>>, RingError> {
        let mut desc = [XdpDesc::default()];
        if self.rx.dequeue(&mut desc) == 0 {
            self.rx_wakeup()?;
            return Ok(None);
        }
        let desc = desc[0];
        let umem = self.pool.lock();
        umem.packet(&desc)?;
        self.stats.rx_packets += 1;
        Ok(Some(RxPacket { umem, desc }))
    }

    /// Claims up to `max` received packets (capped at the batch size), calls `f` on
    /// each and recycles all of them. Returns how many were surfaced.
    pub fn receive_batch(
        &mut self,
        max: usize,
        mut f: impl FnMut(&[u8]),
    ) -> Result<usize, RingError> {
        let max = max.min(self.batch_size as usize);
        let mut descs = vec![XdpDesc::default(); max];
        let got = self.rx.dequeue(&mut descs);
        if got == 0 {
            self.rx_wakeup()?;
            return Ok(0);
        }
        descs.truncate(got);

        let mut umem = self.pool.lock();
        let mut surfaced = 0;
        descs.retain(|desc| match umem.packet(desc) {
            Ok(bytes) => {
                f(bytes);
                surfaced += 1;
                true
            }
            Err(e) => {
                log::warn!("dropping received descriptor: {e}");
                false
            }
        });
        umem.refill(&descs)?;
        self.stats.rx_packets += surfaced as u64;
        Ok(surfaced)
    }

    /// Copies the next received packet into `buf`, truncated to its length. Returns
    /// the number of bytes copied, 0 when nothing was pending.
    pub fn receive_into(&mut self, buf: &mut [u8]) -> Result<usize, RingError> {
        let Some(packet) = self.receive()? else {
            return Ok(0);
        };
        let n = packet.len().min(buf.len());
        buf[..n].copy_from_slice(&packet[..n]);
        Ok(n)
    }
}
