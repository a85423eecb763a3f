//! # Redirect Program Loader
//!
//! ## Purpose
//!
//! Control-plane setup: loads the compiled redirect program, tells it which queue it
//! serves, attaches it to the interface and hands back its socket table.
//!
//! ## How it works
//!
//! A thin wrapper around `libbpf-sys`. The memlock limit is lifted first so the rings
//! and the frame pool can be pinned. The object is opened from a file or from memory
//! and loaded; `qidconf_map[0]` receives the queue id; the program is attached with the
//! configured XDP mode; `xsks_map` becomes the `RedirectTable`. Every step fails with
//! its own error and nothing is retried. `XdpProgram` detaches and closes the object
//! when dropped.
//!
//! ## Main components
//!
//! - `raise_memlock_limit()`: `RLIMIT_MEMLOCK` to unlimited.
//! - `XdpProgram`: owner of the loaded object and of the interface attachment.
//! - `load()`: the whole sequence.

use crate::config::{AttachMode, ProgramSource, XskConfig};
use crate::error::{libbpf_result, os_error, step_error};
use crate::redirect::{BpfMap, QUEUE_TABLE, RedirectTable, SOCKET_TABLE};
use std::ffi::{CString, c_void};
use std::mem::size_of;
use std::os::fd::RawFd;
use std::os::unix::ffi::OsStrExt as _;
use std::{io, ptr};

/// Lifts the locked-memory limit so rings and frames can be pinned.
pub fn raise_memlock_limit() -> io::Result<()> {
    let rlim = libc::rlimit {
        rlim_cur: libc::RLIM_INFINITY,
        rlim_max: libc::RLIM_INFINITY,
    };
    if unsafe { libc::setrlimit(libc::RLIMIT_MEMLOCK, &rlim) } != 0 {
        return Err(os_error("raise memlock limit"));
    }
    Ok(())
}

fn warn_missing_capabilities() {
    for cap in [
        caps::Capability::CAP_NET_ADMIN,
        caps::Capability::CAP_NET_RAW,
        caps::Capability::CAP_BPF,
    ] {
        match caps::has_cap(None, caps::CapSet::Effective, cap) {
            Ok(true) => {}
            Ok(false) => {
                log::warn!("{cap} is not effective, loading the redirect program may fail")
            }
            Err(e) => log::warn!("cannot check {cap}: {e}"),
        }
    }
}

/// A loaded program object, attached to at most one interface.
pub struct XdpProgram {
    obj: *mut libbpf_sys::bpf_object,
    prog_fd: RawFd,
    attached: Option<(u32, u32)>,
}

// The object is only touched through &mut self or on drop.
unsafe impl Send for XdpProgram {}

impl XdpProgram {
    /// Opens and loads the object, and selects `program_name` in it (the first
    /// program when `None`).
    pub fn open(source: &ProgramSource, program_name: Option<&str>) -> io::Result<Self> {
        let obj = match source {
            ProgramSource::File(path) => {
                let path = CString::new(path.as_os_str().as_bytes())?;
                unsafe { libbpf_sys::bpf_object__open_file(path.as_ptr(), ptr::null()) }
            }
            ProgramSource::Memory(code) => unsafe {
                let mut opts: libbpf_sys::bpf_object_open_opts = std::mem::zeroed();
                opts.sz = size_of::<libbpf_sys::bpf_object_open_opts>() as libbpf_sys::size_t;
                libbpf_sys::bpf_object__open_mem(
                    code.as_ptr() as *const c_void,
                    code.len() as libbpf_sys::size_t,
                    &opts,
                )
            },
        };
        if obj.is_null() {
            return Err(os_error("open redirect program object"));
        }
        let mut program = XdpProgram {
            obj,
            prog_fd: -1,
            attached: None,
        };

        libbpf_result("load redirect program object", unsafe {
            libbpf_sys::bpf_object__load(program.obj)
        })?;

        let prog = match program_name {
            Some(name) => {
                let name = CString::new(name)?;
                unsafe { libbpf_sys::bpf_object__find_program_by_name(program.obj, name.as_ptr()) }
            }
            None => unsafe { libbpf_sys::bpf_object__next_program(program.obj, ptr::null_mut()) },
        };
        if prog.is_null() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!(
                    "find program {}: no such program in object",
                    program_name.unwrap_or("<first>")
                ),
            ));
        }
        program.prog_fd = unsafe { libbpf_sys::bpf_program__fd(prog) };
        libbpf_result("get program descriptor", program.prog_fd)?;
        log::debug!("redirect program loaded, fd {}", program.prog_fd);
        Ok(program)
    }

    pub fn program_fd(&self) -> RawFd {
        self.prog_fd
    }

    /// The interface the program is attached to, if any.
    pub fn if_index(&self) -> Option<u32> {
        self.attached.map(|(if_index, _)| if_index)
    }

    /// A map of the object by name.
    pub fn map(&self, name: &str) -> io::Result<BpfMap> {
        let c_name = CString::new(name)?;
        let map = unsafe { libbpf_sys::bpf_object__find_map_by_name(self.obj, c_name.as_ptr()) };
        if map.is_null() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("find map {name}: no such map in object"),
            ));
        }
        let fd = unsafe { libbpf_sys::bpf_map__fd(map) };
        libbpf_result(&format!("get {name} descriptor"), fd)?;
        Ok(BpfMap::new(fd, name))
    }

    pub fn attach(&mut self, if_index: u32, mode: AttachMode) -> io::Result<()> {
        if self.attached.is_some() {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "attach redirect program: already attached",
            ));
        }
        let flags = mode.flags();
        let ret = unsafe {
            libbpf_sys::bpf_xdp_attach(if_index as libc::c_int, self.prog_fd, flags, ptr::null())
        };
        libbpf_result(&format!("attach redirect program to ifindex {if_index}"), ret)?;
        self.attached = Some((if_index, flags));
        log::info!("redirect program attached to ifindex {if_index} ({mode:?})");
        Ok(())
    }

    pub fn detach(&mut self) -> io::Result<()> {
        let Some((if_index, flags)) = self.attached.take() else {
            return Ok(());
        };
        let ret =
            unsafe { libbpf_sys::bpf_xdp_detach(if_index as libc::c_int, flags, ptr::null()) };
        libbpf_result(&format!("detach redirect program from ifindex {if_index}"), ret)?;
        log::info!("redirect program detached from ifindex {if_index}");
        Ok(())
    }
}

impl Drop for XdpProgram {
    fn drop(&mut self) {
        if let Err(e) = self.detach() {
            log::error!("{e}");
        }
        if !self.obj.is_null() {
            unsafe { libbpf_sys::bpf_object__close(self.obj) };
        }
    }
}

/// Loads the redirect program from `config`, points it at `config.queue_id`, attaches
/// it to `if_index` and returns it with its socket table, still empty.
pub fn load(config: &XskConfig, if_index: u32) -> io::Result<(XdpProgram, RedirectTable)> {
    warn_missing_capabilities();
    raise_memlock_limit()?;
    let mut program = XdpProgram::open(&config.program, config.program_name.as_deref())
        .map_err(|e| step_error("redirect program", e))?;
    program.map(QUEUE_TABLE)?.update(0, config.queue_id)?;
    program.attach(if_index, config.attach_mode)?;
    let table = RedirectTable::new(program.map(SOCKET_TABLE)?);
    Ok((program, table))
}
