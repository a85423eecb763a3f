//! A veth pair for AF_XDP tests. Both ends get an address in one /24, run
//! promiscuous so the receiving end's redirect program sees frames sent to any MAC,
//! and are only handed out once the kernel reports carrier on them.

use crate::command::execute_sudo_command;
use std::io::{Error, ErrorKind, Result};
use std::path::PathBuf;
use std::time::Duration;

const CARRIER_POLL: Duration = Duration::from_millis(20);

/// Names and addresses of the two ends: `<dev_prefix>0`/`<dev_prefix>1` with
/// `<ip_prefix>100`/`<ip_prefix>101`.
#[derive(Clone, Debug)]
pub struct VethPair {
    pub devs: [String; 2],
    pub ips: [String; 2],
}

impl VethPair {
    pub fn new(dev_prefix: &str, ip_prefix: &str) -> Self {
        VethPair {
            devs: [format!("{dev_prefix}0"), format!("{dev_prefix}1")],
            ips: [format!("{ip_prefix}100"), format!("{ip_prefix}101")],
        }
    }

    fn sysfs(dev: &str, attr: &str) -> PathBuf {
        PathBuf::from(format!("/sys/class/net/{dev}/{attr}"))
    }

    /// Whether the first end already exists.
    pub fn exists(&self) -> bool {
        VethPair::sysfs(&self.devs[0], "").exists()
    }

    /// Creates the pair, addresses both ends and brings them up.
    pub fn create(&self) -> Result<()> {
        let [dev0, dev1] = &self.devs;
        log::info!("creating veth pair {dev0} + {dev1}");
        execute_sudo_command(&format!("ip link add {dev0} type veth peer name {dev1}"))?;
        for (dev, ip) in self.devs.iter().zip(&self.ips) {
            execute_sudo_command(&format!("ip addr add {ip}/24 dev {dev}"))?;
            execute_sudo_command(&format!("ip link set {dev} promisc on"))?;
            execute_sudo_command(&format!("ip link set {dev} up"))?;
        }
        Ok(())
    }

    /// Deleting one end removes its peer too.
    pub fn destroy(&self) -> Result<()> {
        log::info!("deleting veth pair {}", self.devs[0]);
        execute_sudo_command(&format!("ip link del {}", self.devs[0]))
    }

    /// Whether the kernel reports carrier on `dev`. A link that is down has no
    /// readable carrier attribute and counts as no carrier.
    pub fn has_carrier(dev: &str) -> bool {
        std::fs::read_to_string(VethPair::sysfs(dev, "carrier"))
            .is_ok_and(|carrier| carrier.trim() == "1")
    }

    /// Waits until both ends report carrier, or fails with `TimedOut`.
    pub async fn wait_for_carrier(&self, timeout: Duration) -> Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        while !self.devs.iter().all(|dev| VethPair::has_carrier(dev)) {
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::new(
                    ErrorKind::TimedOut,
                    format!("no carrier on {} within {timeout:?}", self.devs.join("/")),
                ));
            }
            tokio::time::sleep(CARRIER_POLL).await;
        }
        log::debug!("carrier up on {}", self.devs.join("/"));
        Ok(())
    }
}
