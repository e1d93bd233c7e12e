use ipnetwork::{Ipv4Network, Ipv6Network};
use libfirewall::PortBinding;
use libnetlink::KernelAdapter;
use macaddr::MacAddr6;
use std::net::{Ipv4Addr, Ipv6Addr};

use crate::config::TransportPort;
use crate::error::DriverError;

const IFNAME_PREFIX: &str = "veth";
const IFNAME_ATTEMPTS: usize = 3;

/// Driver-side record of one veth pair attached to one network.
#[derive(Debug, Clone, PartialEq)]
pub struct Endpoint {
    pub id: String,
    /// Host-side veth, enslaved to the bridge.
    pub src_name: String,
    /// Sandbox-side veth as created; the framework moves and renames it.
    pub dst_name: String,
    pub mac: MacAddr6,
    pub addr_v4: Ipv4Network,
    pub addr_v6: Option<Ipv6Network>,
    pub requested_ports: Vec<PortBinding>,
    /// Effective mappings after host-port allocation.
    pub port_mapping: Vec<PortBinding>,
    pub exposed_ports: Vec<TransportPort>,
}

/// Sandbox-side interface description handed back to the caller on
/// endpoint creation.
#[derive(Debug, Clone, PartialEq)]
pub struct InterfaceInfo {
    pub src_name: String,
    pub dst_name: String,
    pub mac: MacAddr6,
    pub addr_v4: Ipv4Network,
    pub addr_v6: Option<Ipv6Network>,
}

/// The caller's endpoint-info struct. Populated by the driver; a caller
/// that pre-populated the interface gets rejected.
#[derive(Debug, Clone, Default)]
pub struct EndpointInfo {
    pub iface: Option<InterfaceInfo>,
}

/// Gateway and naming data returned from `join`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JoinInfo {
    pub gateway_v4: Option<Ipv4Addr>,
    pub gateway_v6: Option<Ipv6Addr>,
    /// Prefix the sandbox names the interface after ("eth" -> eth0).
    pub iface_name_prefix: String,
}

/// A random locally-administered unicast MAC.
pub fn generate_mac() -> MacAddr6 {
    let mut bytes: [u8; 6] = rand::random();
    bytes[0] = (bytes[0] | 0x02) & 0xfe;
    MacAddr6::from(bytes)
}

/// A veth name nothing else on the host is using: `veth` plus seven random
/// hex characters, verified against existing links.
pub async fn generate_ifname(kernel: &dyn KernelAdapter) -> Result<String, DriverError> {
    for _ in 0..IFNAME_ATTEMPTS {
        let entropy = rand::random::<u32>() & 0x0fff_ffff;
        let name = format!("{IFNAME_PREFIX}{entropy:07x}");
        match kernel.link_by_name(&name).await {
            Ok(_) => continue,
            Err(e) if e.is_not_found() => return Ok(name),
            Err(e) => return Err(e.into()),
        }
    }
    Err(DriverError::Internal(anyhow::anyhow!(
        "could not find a free veth name in {IFNAME_ATTEMPTS} attempts"
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use libnetlink::FakeKernel;

    #[test]
    fn test_generated_mac_is_local_unicast() {
        for _ in 0..32 {
            let mac = generate_mac();
            let first = mac.into_array()[0];
            assert_eq!(first & 0x02, 0x02, "local bit must be set");
            assert_eq!(first & 0x01, 0x00, "multicast bit must be clear");
        }
    }

    #[tokio::test]
    async fn test_ifname_shape_and_uniqueness() {
        let kernel = FakeKernel::new();
        let name = generate_ifname(&kernel).await.unwrap();
        assert!(name.starts_with(IFNAME_PREFIX));
        assert_eq!(name.len(), IFNAME_PREFIX.len() + 7);
        assert!(name[IFNAME_PREFIX.len()..]
            .chars()
            .all(|c| c.is_ascii_hexdigit()));
    }
}
