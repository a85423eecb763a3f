//! # Redirect Table
//!
//! ## Purpose
//!
//! The in-kernel redirect program picks the socket for each packet from an `XSKMAP`
//! lookup table. This module is the user-space side of that table: it registers and
//! unregisters socket descriptors under the keys the program looks up.
//!
//! ## How it works
//!
//! `BpfMap` is a borrowed map descriptor with typed `update`/`delete`/`lookup` calls.
//! The map belongs to the loaded program object and lives as long as it does.
//! `XSKMAP` entries cannot be read back from user space, so `RedirectTable` keeps a
//! shadow of what it wrote and answers `get` from it.
//!
//! ## Main components
//!
//! - `BpfMap`: a map descriptor of a loaded object.
//! - `RedirectTable`: socket slot keys to socket descriptors.

use crate::error::libbpf_result;
use std::collections::BTreeMap;
use std::ffi::c_void;
use std::io;
use std::os::fd::RawFd;

/// Name of the socket table in the redirect program.
pub const SOCKET_TABLE: &str = "xsks_map";
/// Name of the single-entry table holding the queue the program serves.
pub const QUEUE_TABLE: &str = "qidconf_map";

/// A map of a loaded program object, addressed by descriptor.
#[derive(Debug, Clone)]
pub struct BpfMap {
    fd: RawFd,
    name: String,
}

impl BpfMap {
    pub(crate) fn new(fd: RawFd, name: &str) -> Self {
        BpfMap {
            fd,
            name: name.to_string(),
        }
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Creates or replaces the entry under `key`.
    pub fn update(&self, key: u32, value: u32) -> io::Result<()> {
        let ret = unsafe {
            libbpf_sys::bpf_map_update_elem(
                self.fd,
                &key as *const u32 as *const c_void,
                &value as *const u32 as *const c_void,
                libbpf_sys::BPF_ANY as u64,
            )
        };
        libbpf_result(&format!("update {}[{key}]", self.name), ret)
    }

    pub fn delete(&self, key: u32) -> io::Result<()> {
        let ret = unsafe {
            libbpf_sys::bpf_map_delete_elem(self.fd, &key as *const u32 as *const c_void)
        };
        libbpf_result(&format!("delete {}[{key}]", self.name), ret)
    }

    /// Reads the entry under `key`. Not supported by every map type.
    pub fn lookup(&self, key: u32) -> io::Result<Option<u32>> {
        let mut value = 0u32;
        let ret = unsafe {
            libbpf_sys::bpf_map_lookup_elem(
                self.fd,
                &key as *const u32 as *const c_void,
                &mut value as *mut u32 as *mut c_void,
            )
        };
        if ret == -libc::ENOENT {
            return Ok(None);
        }
        libbpf_result(&format!("look up {}[{key}]", self.name), ret)?;
        Ok(Some(value))
    }
}

/// Socket slot keys to socket descriptors, as seen by the redirect program.
#[derive(Debug)]
pub struct RedirectTable {
    map: BpfMap,
    entries: BTreeMap<u32, RawFd>,
}

impl RedirectTable {
    pub fn new(map: BpfMap) -> Self {
        RedirectTable {
            map,
            entries: BTreeMap::new(),
        }
    }

    /// Routes packets the program redirects under `key` to socket `socket_fd`.
    pub fn insert(&mut self, key: u32, socket_fd: RawFd) -> io::Result<()> {
        self.map.update(key, socket_fd as u32)?;
        self.entries.insert(key, socket_fd);
        log::debug!("{}[{key}] = fd {socket_fd}", self.map.name());
        Ok(())
    }

    /// Stops redirecting under `key`. Returns the socket that was registered, if any.
    pub fn remove(&mut self, key: u32) -> io::Result<Option<RawFd>> {
        if !self.entries.contains_key(&key) {
            return Ok(None);
        }
        self.map.delete(key)?;
        Ok(self.entries.remove(&key))
    }

    pub fn get(&self, key: u32) -> Option<RawFd> {
        self.entries.get(&key).copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn map(&self) -> &BpfMap {
        &self.map
    }
}
