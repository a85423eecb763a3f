//! Zero-copy packet I/O over AF_XDP sockets.
//!
//! `Context::open` loads and attaches the redirect program, binds the sockets and lends
//! the receive frames to the kernel. After that, `receive` and `transfer` move packets
//! through rings shared with the kernel without copying them through the network stack.

pub mod barrier;
pub mod config;
pub mod context;
pub mod error;
pub mod loader;
pub mod mmap;
pub mod redirect;
pub mod ring;
pub mod socket;
pub mod umem;

#[doc(hidden)]
pub mod kick;
pub mod poll;
pub mod recv;
#[doc(hidden)]
pub mod send;

pub use config::{AttachMode, ProgramSource, Readiness, XskConfig};
pub use context::{Context, if_index};
pub use error::RingError;
pub use loader::{XdpProgram, load, raise_memlock_limit};
pub use poll::Interest;
pub use recv::RxPacket;
pub use redirect::{BpfMap, RedirectTable};
pub use ring::{Ring, RingType, Role, XdpDesc};
pub use socket::{BindFlags, SharedUmem, SocketStats, UmemMode, XskSocket};
pub use umem::Umem;

#[cfg(test)]
mod tests;
