use std::io;
use thiserror::Error;

/// Steady-state I/O failures. None of these is fatal; the caller decides whether and
/// when to retry.
#[derive(Debug, Error)]
pub enum RingError {
    /// Not enough free slots for the whole batch; nothing was submitted.
    #[error("ring is full")]
    RingFull,
    /// Every transmit frame is in flight.
    #[error("no free frame in the pool")]
    NoFreeFrame,
    /// The payload does not fit into a frame.
    #[error("invalid packet length")]
    InvalidLength,
    /// A descriptor points outside the frame pool.
    #[error("descriptor address {0:#x} is outside the frame pool")]
    InvalidAddress(u64),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Wraps the last OS error with the name of the step that failed, keeping its kind.
pub(crate) fn os_error(step: &str) -> io::Error {
    step_error(step, io::Error::last_os_error())
}

pub(crate) fn step_error(step: &str, err: io::Error) -> io::Error {
    io::Error::new(err.kind(), format!("{step}: {err}"))
}

/// Turns a negative-errno libbpf return into an error naming `step`.
pub(crate) fn libbpf_result(step: &str, ret: libc::c_int) -> io::Result<()> {
    if ret < 0 {
        return Err(step_error(step, io::Error::from_raw_os_error(-ret)));
    }
    Ok(())
}
