//! Privileged test harness: capability setup, sudo commands and a veth pair to run
//! packet I/O tests against.

pub mod command;
pub mod runner;
pub mod veth;

pub use runner::{DEV_PREFIX, Host, HostPair, IP_PREFIX, run_test_with_pair};
pub use veth::VethPair;
