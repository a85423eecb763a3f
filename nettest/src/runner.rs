use crate::veth::VethPair;
use std::future::Future;
use std::io::Result;
use std::time::Duration;

pub const DEV_PREFIX: &str = "xskVeth";
pub const IP_PREFIX: &str = "192.168.78.";

const CARRIER_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Clone, Debug)]
pub struct Host {
    pub if_dev: String,
    pub ip: String,
}

pub struct HostPair {
    pub host0: Host,
    pub host1: Host,
}

impl From<&VethPair> for HostPair {
    fn from(pair: &VethPair) -> Self {
        let [dev0, dev1] = pair.devs.clone();
        let [ip0, ip1] = pair.ips.clone();
        HostPair {
            host0: Host {
                if_dev: dev0,
                ip: ip0,
            },
            host1: Host {
                if_dev: dev1,
                ip: ip1,
            },
        }
    }
}

/// Runs `test` against the `xskVeth` pair, creating it if needed, and removes the
/// pair afterwards whatever the outcome.
pub async fn run_test_with_pair<F, Fut>(test: F) -> Result<()>
where
    F: FnOnce(HostPair) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let pair = VethPair::new(DEV_PREFIX, IP_PREFIX);
    if !pair.exists() {
        pair.create()?;
    }
    let result = match pair.wait_for_carrier(CARRIER_TIMEOUT).await {
        Ok(()) => test(HostPair::from(&pair)).await,
        Err(e) => Err(e),
    };
    let teardown = pair.destroy();
    result.and(teardown)
}
