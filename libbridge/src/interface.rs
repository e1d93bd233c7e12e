use ipnetwork::{IpNetwork, Ipv6Network};
use libnetlink::{IpFamily, KernelAdapter, LinkHandle};
use log::{debug, info};
use std::net::{Ipv4Addr, Ipv6Addr};

use crate::error::DriverError;

/// In-memory model of one kernel bridge device: the resolved link plus the
/// addresses and gateways this driver has programmed onto it.
#[derive(Debug, Clone, Default)]
pub struct BridgeInterface {
    pub name: String,
    pub handle: Option<LinkHandle>,
    pub address_v4: Option<ipnetwork::Ipv4Network>,
    pub address_v6: Option<Ipv6Network>,
    pub gateway_v4: Option<Ipv4Addr>,
    pub gateway_v6: Option<Ipv6Addr>,
}

impl BridgeInterface {
    pub fn new(name: &str) -> Self {
        BridgeInterface {
            name: name.to_string(),
            ..Default::default()
        }
    }

    /// True iff the link exists and is a bridge. A same-named link of
    /// another kind is a conflict, not a match.
    pub async fn exists(&mut self, kernel: &dyn KernelAdapter) -> Result<bool, DriverError> {
        match kernel.link_by_name(&self.name).await {
            Ok(link) if link.is_bridge() => {
                self.handle = Some(link);
                Ok(true)
            }
            Ok(link) => Err(DriverError::Conflict(format!(
                "link {} exists but is a {} device, not a bridge",
                self.name,
                link.kind.as_deref().unwrap_or("unknown")
            ))),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    pub fn link(&self) -> Result<&LinkHandle, DriverError> {
        self.handle
            .as_ref()
            .ok_or_else(|| DriverError::NotFound(format!("bridge {} link", self.name)))
    }

    pub async fn addresses(
        &self,
        kernel: &dyn KernelAdapter,
        family: IpFamily,
    ) -> Result<Vec<IpNetwork>, DriverError> {
        Ok(kernel.addr_list(self.link()?, family).await?)
    }

    /// Converge the bridge's IPv6 addresses on `desired`.
    ///
    /// Other global addresses are removed; the kernel's fe80::/64
    /// link-local address and multicast entries are left alone. The desired
    /// address goes in via replace-or-add so traffic on an already-correct
    /// bridge is not disturbed.
    pub async fn program_ipv6_addresses(
        &mut self,
        kernel: &dyn KernelAdapter,
        desired: Ipv6Network,
    ) -> Result<(), DriverError> {
        let link = self.link()?.clone();
        for addr in kernel.addr_list(&link, IpFamily::V6).await? {
            let IpNetwork::V6(addr) = addr else {
                continue;
            };
            if is_link_local(&addr.ip()) || addr.ip().is_multicast() {
                continue;
            }
            if addr == desired {
                continue;
            }
            info!("removing stale IPv6 address {addr} from {}", self.name);
            kernel.addr_del(&link, IpNetwork::V6(addr)).await?;
        }
        debug!("programming {desired} on {}", self.name);
        kernel.addr_replace(&link, IpNetwork::V6(desired)).await?;
        self.address_v6 = Some(desired);
        Ok(())
    }
}

fn is_link_local(addr: &Ipv6Addr) -> bool {
    addr.segments()[0] & 0xffc0 == 0xfe80
}

#[cfg(test)]
mod tests {
    use super::*;
    use libnetlink::{FakeKernel, LinkSpec};

    #[tokio::test]
    async fn test_exists_rejects_non_bridge_link() {
        let kernel = FakeKernel::new();
        kernel.seed_link("docker0", Some("dummy"));

        let mut bridge = BridgeInterface::new("docker0");
        assert!(matches!(
            bridge.exists(&kernel).await.unwrap_err(),
            DriverError::Conflict(_)
        ));
    }

    #[tokio::test]
    async fn test_exists_false_when_missing() {
        let kernel = FakeKernel::new();
        let mut bridge = BridgeInterface::new("docker0");
        assert!(!bridge.exists(&kernel).await.unwrap());
        assert!(bridge.handle.is_none());
    }

    #[tokio::test]
    async fn test_program_ipv6_keeps_link_local() {
        let kernel = FakeKernel::new();
        kernel
            .link_add(LinkSpec::Bridge {
                name: "docker0".to_string(),
                mtu: 0,
            })
            .await
            .unwrap();
        let mut bridge = BridgeInterface::new("docker0");
        assert!(bridge.exists(&kernel).await.unwrap());

        let link = bridge.link().unwrap().clone();
        kernel
            .addr_add(&link, "fe80::1/64".parse().unwrap())
            .await
            .unwrap();
        kernel
            .addr_add(&link, "fd00:aaaa::1/64".parse().unwrap())
            .await
            .unwrap();

        bridge
            .program_ipv6_addresses(&kernel, "fd00:bbbb::1/64".parse().unwrap())
            .await
            .unwrap();

        let addrs = kernel.addresses_of("docker0");
        assert!(addrs.contains(&"fe80::1/64".parse().unwrap()));
        assert!(addrs.contains(&"fd00:bbbb::1/64".parse().unwrap()));
        assert!(!addrs.contains(&"fd00:aaaa::1/64".parse().unwrap()));
    }

    #[tokio::test]
    async fn test_addresses_filter_by_family() {
        let kernel = FakeKernel::new();
        kernel
            .link_add(LinkSpec::Bridge {
                name: "docker0".to_string(),
                mtu: 0,
            })
            .await
            .unwrap();
        let mut bridge = BridgeInterface::new("docker0");
        bridge.exists(&kernel).await.unwrap();
        let link = bridge.link().unwrap().clone();
        kernel
            .addr_add(&link, "172.17.0.1/16".parse().unwrap())
            .await
            .unwrap();
        kernel
            .addr_add(&link, "fd00::1/64".parse().unwrap())
            .await
            .unwrap();

        let v4 = bridge.addresses(&kernel, IpFamily::V4).await.unwrap();
        assert_eq!(v4, vec!["172.17.0.1/16".parse::<IpNetwork>().unwrap()]);
        let v6 = bridge.addresses(&kernel, IpFamily::V6).await.unwrap();
        assert_eq!(v6, vec!["fd00::1/64".parse::<IpNetwork>().unwrap()]);
    }

    #[tokio::test]
    async fn test_program_ipv6_is_idempotent() {
        let kernel = FakeKernel::new();
        kernel
            .link_add(LinkSpec::Bridge {
                name: "docker0".to_string(),
                mtu: 0,
            })
            .await
            .unwrap();
        let mut bridge = BridgeInterface::new("docker0");
        bridge.exists(&kernel).await.unwrap();

        let desired: Ipv6Network = "fd00:bbbb::1/64".parse().unwrap();
        bridge.program_ipv6_addresses(&kernel, desired).await.unwrap();
        bridge.program_ipv6_addresses(&kernel, desired).await.unwrap();
        assert_eq!(kernel.addresses_of("docker0").len(), 1);
    }
}
