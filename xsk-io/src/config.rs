use std::io;
use std::path::PathBuf;

pub const FRAME_SIZE: u32 = 2048;
pub const FRAME_COUNT: u32 = 131072;
pub const FRAME_HEADROOM: u32 = 0;
pub const RING_SIZE: u32 = 1024;
pub const BATCH_SIZE: u32 = 1;

/// Default location of the compiled redirect program.
pub const DEFAULT_PROGRAM_PATH: &str = "obj/xdpsock_kern.o";

/// Configuration of the frame pool, the sockets and the redirect program.
///
/// The defaults reproduce the reference deployment: 131072 frames of 2048 bytes, four
/// rings of 1024 descriptors, one socket on queue 0, batches of one.
#[derive(Debug, Clone)]
pub struct XskConfig {
    /// Bytes per frame. Must be a power of two; the kernel further requires
    /// 2048..=page size when the pool is registered.
    pub frame_size: u32,
    pub frame_count: u32,
    /// Bytes reserved at the front of every frame.
    pub headroom: u32,
    pub fill_size: u32,
    pub completion_size: u32,
    pub rx_size: u32,
    pub tx_size: u32,
    /// Most descriptors claimed by one receive or completion pass.
    pub batch_size: u32,
    pub queue_id: u32,
    /// Sockets bound to `queue_id`. More than one shares a single frame pool.
    pub socket_count: u32,
    /// Enables or disables zero-copy mode.
    ///
    /// - `Some(true)`: `XDP_ZEROCOPY`.
    /// - `Some(false)`: `XDP_COPY`.
    /// - `None`: the kernel picks.
    pub zero_copy: Option<bool>,
    /// Binds with `XDP_USE_NEED_WAKEUP`; transmit kicks are then issued only when the
    /// kernel raises the ring flag. Without it every reclamation kicks.
    pub need_wakeup: bool,
    /// Backs the frame pool with 2 MiB pages. `None` uses them when available.
    pub huge_page: Option<bool>,
    pub attach_mode: AttachMode,
    pub readiness: Readiness,
    pub program: ProgramSource,
    /// Program to attach inside the object; `None` takes the first one.
    pub program_name: Option<String>,
}

impl Default for XskConfig {
    fn default() -> Self {
        XskConfig {
            frame_size: FRAME_SIZE,
            frame_count: FRAME_COUNT,
            headroom: FRAME_HEADROOM,
            fill_size: RING_SIZE,
            completion_size: RING_SIZE,
            rx_size: RING_SIZE,
            tx_size: RING_SIZE,
            batch_size: BATCH_SIZE,
            queue_id: 0,
            socket_count: 1,
            zero_copy: None,
            need_wakeup: false,
            huge_page: Some(false),
            attach_mode: AttachMode::Auto,
            readiness: Readiness::Poll,
            program: ProgramSource::File(PathBuf::from(DEFAULT_PROGRAM_PATH)),
            program_name: None,
        }
    }
}

impl XskConfig {
    /// Shift turning a frame index into its address.
    pub fn frame_shift(&self) -> u32 {
        self.frame_size.trailing_zeros()
    }

    /// Size of the frame pool buffer in bytes.
    pub fn pool_len(&self) -> Option<usize> {
        (self.frame_count as usize).checked_mul(self.frame_size as usize)
    }

    pub fn validate(&self) -> io::Result<()> {
        let invalid = |msg: String| Err(io::Error::new(io::ErrorKind::InvalidInput, msg));
        if !self.frame_size.is_power_of_two() {
            return invalid(format!("frame size {} is not a power of two", self.frame_size));
        }
        for (name, size) in [
            ("fill", self.fill_size),
            ("completion", self.completion_size),
            ("rx", self.rx_size),
            ("tx", self.tx_size),
        ] {
            if !size.is_power_of_two() {
                return invalid(format!("{name} ring size {size} is not a power of two"));
            }
        }
        if self.frame_count <= self.fill_size {
            return invalid(format!(
                "{} frames leave none for transmit after {} fill slots",
                self.frame_count, self.fill_size
            ));
        }
        if self.headroom >= self.frame_size {
            return invalid(format!(
                "headroom {} does not fit a {} byte frame",
                self.headroom, self.frame_size
            ));
        }
        if self.batch_size == 0 {
            return invalid("batch size must be positive".into());
        }
        if self.socket_count == 0 {
            return invalid("at least one socket is required".into());
        }
        if self.pool_len().is_none() {
            return invalid("frame pool size overflows".into());
        }
        Ok(())
    }
}

/// XDP attach mode of the redirect program.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AttachMode {
    /// Let the kernel choose (driver mode when supported).
    #[default]
    Auto,
    /// Generic, driver independent mode.
    Skb,
    /// Native driver mode.
    Driver,
    /// Offloaded to the NIC.
    Hardware,
}

impl AttachMode {
    pub fn flags(&self) -> u32 {
        match self {
            AttachMode::Auto => 0,
            AttachMode::Skb => libbpf_sys::XDP_FLAGS_SKB_MODE,
            AttachMode::Driver => libbpf_sys::XDP_FLAGS_DRV_MODE,
            AttachMode::Hardware => libbpf_sys::XDP_FLAGS_HW_MODE,
        }
    }
}

/// How `can_receive`/`can_transfer` decide.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Readiness {
    /// Zero-timeout `poll` on the socket.
    #[default]
    Poll,
    /// Always ready. Hides backpressure; kept for parity with the reference build.
    Always,
}

/// Where the compiled redirect program comes from.
#[derive(Debug, Clone)]
pub enum ProgramSource {
    File(PathBuf),
    Memory(&'static [u8]),
}
