//! In-memory [`KernelAdapter`] with kernel-like semantics (exists/not-found
//! behaviour, veth peers vanishing together). Backs the driver tests, which
//! must run without CAP_NET_ADMIN.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Mutex;

use async_trait::async_trait;
use ipnetwork::IpNetwork;
use macaddr::MacAddr6;

use crate::adapter::KernelAdapter;
use crate::error::KernelError;
use crate::types::{IpFamily, LinkHandle, LinkSpec};

#[derive(Debug, Clone)]
struct FakeLink {
    index: u32,
    name: String,
    kind: Option<String>,
    mac: Option<MacAddr6>,
    mtu: u32,
    tx_queue_len: u32,
    up: bool,
    master: Option<u32>,
    hairpin: bool,
    peer: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakeRoute {
    pub dst: IpNetwork,
    pub via: Option<IpAddr>,
    pub dev: Option<String>,
}

#[derive(Debug, Default)]
struct State {
    links: HashMap<String, FakeLink>,
    addrs: HashMap<u32, Vec<IpNetwork>>,
    routes: Vec<FakeRoute>,
    sysctls: HashMap<String, String>,
    next_index: u32,
}

#[derive(Debug, Default)]
pub struct FakeKernel {
    state: Mutex<State>,
}

impl FakeKernel {
    pub fn new() -> Self {
        FakeKernel {
            state: Mutex::new(State {
                next_index: 1,
                ..Default::default()
            }),
        }
    }

    /// Seed a pre-existing link, e.g. a leftover device from a previous run.
    pub fn seed_link(&self, name: &str, kind: Option<&str>) -> LinkHandle {
        let mut st = self.state.lock().unwrap();
        let index = st.next_index;
        st.next_index += 1;
        let link = FakeLink {
            index,
            name: name.to_string(),
            kind: kind.map(|k| k.to_string()),
            mac: None,
            mtu: 1500,
            tx_queue_len: 1000,
            up: false,
            master: None,
            hairpin: false,
            peer: None,
        };
        st.links.insert(name.to_string(), link);
        LinkHandle {
            index,
            name: name.to_string(),
            kind: kind.map(|k| k.to_string()),
            mac: None,
        }
    }

    pub fn seed_sysctl(&self, name: &str, value: &str) {
        let mut st = self.state.lock().unwrap();
        st.sysctls.insert(name.replace('.', "/"), value.to_string());
    }

    pub fn has_link(&self, name: &str) -> bool {
        self.state.lock().unwrap().links.contains_key(name)
    }

    pub fn link_names(&self) -> Vec<String> {
        let st = self.state.lock().unwrap();
        let mut names: Vec<_> = st.links.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn is_up(&self, name: &str) -> bool {
        let st = self.state.lock().unwrap();
        st.links.get(name).map(|l| l.up).unwrap_or(false)
    }

    pub fn mtu_of(&self, name: &str) -> Option<u32> {
        let st = self.state.lock().unwrap();
        st.links.get(name).map(|l| l.mtu)
    }

    pub fn master_of(&self, name: &str) -> Option<String> {
        let st = self.state.lock().unwrap();
        let master = st.links.get(name)?.master?;
        st.links
            .values()
            .find(|l| l.index == master)
            .map(|l| l.name.clone())
    }

    pub fn hairpin_of(&self, name: &str) -> bool {
        let st = self.state.lock().unwrap();
        st.links.get(name).map(|l| l.hairpin).unwrap_or(false)
    }

    pub fn addresses_of(&self, name: &str) -> Vec<IpNetwork> {
        let st = self.state.lock().unwrap();
        st.links
            .get(name)
            .and_then(|l| st.addrs.get(&l.index))
            .cloned()
            .unwrap_or_default()
    }

    pub fn routes(&self) -> Vec<FakeRoute> {
        self.state.lock().unwrap().routes.clone()
    }

    pub fn sysctl(&self, name: &str) -> Option<String> {
        let st = self.state.lock().unwrap();
        st.sysctls.get(&name.replace('.', "/")).cloned()
    }

    fn handle_of(link: &FakeLink) -> LinkHandle {
        LinkHandle {
            index: link.index,
            name: link.name.clone(),
            kind: link.kind.clone(),
            mac: link.mac,
        }
    }
}

#[async_trait]
impl KernelAdapter for FakeKernel {
    async fn link_by_name(&self, name: &str) -> Result<LinkHandle, KernelError> {
        let st = self.state.lock().unwrap();
        st.links
            .get(name)
            .map(Self::handle_of)
            .ok_or_else(|| KernelError::NotFound(name.to_string()))
    }

    async fn link_add(&self, spec: LinkSpec) -> Result<(), KernelError> {
        let mut st = self.state.lock().unwrap();
        match spec {
            LinkSpec::Bridge { name, mtu } => {
                if st.links.contains_key(&name) {
                    return Err(KernelError::Exists(name));
                }
                let index = st.next_index;
                st.next_index += 1;
                st.links.insert(
                    name.clone(),
                    FakeLink {
                        index,
                        name,
                        kind: Some("bridge".to_string()),
                        mac: None,
                        mtu: if mtu > 0 { mtu } else { 1500 },
                        tx_queue_len: 1000,
                        up: false,
                        master: None,
                        hairpin: false,
                        peer: None,
                    },
                );
                Ok(())
            }
            LinkSpec::VethPair {
                name,
                peer_name,
                mtu,
                tx_queue_len,
                mac,
            } => {
                if st.links.contains_key(&name) {
                    return Err(KernelError::Exists(name));
                }
                if st.links.contains_key(&peer_name) {
                    return Err(KernelError::Exists(peer_name));
                }
                let mtu = if mtu > 0 { mtu } else { 1500 };
                for (this, other, mac) in [
                    (name.clone(), peer_name.clone(), mac),
                    (peer_name.clone(), name.clone(), None),
                ] {
                    let index = st.next_index;
                    st.next_index += 1;
                    st.links.insert(
                        this.clone(),
                        FakeLink {
                            index,
                            name: this,
                            kind: Some("veth".to_string()),
                            mac,
                            mtu,
                            tx_queue_len,
                            up: false,
                            master: None,
                            hairpin: false,
                            peer: Some(other),
                        },
                    );
                }
                Ok(())
            }
        }
    }

    async fn link_del(&self, link: &LinkHandle) -> Result<(), KernelError> {
        let mut st = self.state.lock().unwrap();
        let removed = st
            .links
            .remove(&link.name)
            .ok_or_else(|| KernelError::NotFound(link.name.clone()))?;
        st.addrs.remove(&removed.index);
        if let Some(peer) = removed.peer
            && let Some(peer_link) = st.links.remove(&peer)
        {
            st.addrs.remove(&peer_link.index);
        }
        Ok(())
    }

    async fn link_set_up(&self, link: &LinkHandle) -> Result<(), KernelError> {
        let mut st = self.state.lock().unwrap();
        st.links
            .get_mut(&link.name)
            .ok_or_else(|| KernelError::NotFound(link.name.clone()))?
            .up = true;
        Ok(())
    }

    async fn link_set_master(
        &self,
        link: &LinkHandle,
        master: &LinkHandle,
    ) -> Result<(), KernelError> {
        let mut st = self.state.lock().unwrap();
        if !st.links.values().any(|l| l.index == master.index) {
            return Err(KernelError::NotFound(master.name.clone()));
        }
        st.links
            .get_mut(&link.name)
            .ok_or_else(|| KernelError::NotFound(link.name.clone()))?
            .master = Some(master.index);
        Ok(())
    }

    async fn link_set_mtu(&self, link: &LinkHandle, mtu: u32) -> Result<(), KernelError> {
        let mut st = self.state.lock().unwrap();
        st.links
            .get_mut(&link.name)
            .ok_or_else(|| KernelError::NotFound(link.name.clone()))?
            .mtu = mtu;
        Ok(())
    }

    async fn link_set_hwaddr(&self, link: &LinkHandle, mac: MacAddr6) -> Result<(), KernelError> {
        let mut st = self.state.lock().unwrap();
        st.links
            .get_mut(&link.name)
            .ok_or_else(|| KernelError::NotFound(link.name.clone()))?
            .mac = Some(mac);
        Ok(())
    }

    async fn link_set_hairpin(&self, link: &LinkHandle, enabled: bool) -> Result<(), KernelError> {
        let mut st = self.state.lock().unwrap();
        st.links
            .get_mut(&link.name)
            .ok_or_else(|| KernelError::NotFound(link.name.clone()))?
            .hairpin = enabled;
        Ok(())
    }

    async fn addr_list(
        &self,
        link: &LinkHandle,
        family: IpFamily,
    ) -> Result<Vec<IpNetwork>, KernelError> {
        let st = self.state.lock().unwrap();
        if !st.links.contains_key(&link.name) {
            return Err(KernelError::NotFound(link.name.clone()));
        }
        let addrs = st.addrs.get(&link.index).cloned().unwrap_or_default();
        Ok(addrs
            .into_iter()
            .filter(|a| match family {
                IpFamily::V4 => a.is_ipv4(),
                IpFamily::V6 => a.is_ipv6(),
            })
            .collect())
    }

    async fn addr_add(&self, link: &LinkHandle, addr: IpNetwork) -> Result<(), KernelError> {
        let mut st = self.state.lock().unwrap();
        if !st.links.contains_key(&link.name) {
            return Err(KernelError::NotFound(link.name.clone()));
        }
        let addrs = st.addrs.entry(link.index).or_default();
        if addrs.contains(&addr) {
            return Err(KernelError::Exists(addr.to_string()));
        }
        addrs.push(addr);
        Ok(())
    }

    async fn addr_replace(&self, link: &LinkHandle, addr: IpNetwork) -> Result<(), KernelError> {
        let mut st = self.state.lock().unwrap();
        if !st.links.contains_key(&link.name) {
            return Err(KernelError::NotFound(link.name.clone()));
        }
        let addrs = st.addrs.entry(link.index).or_default();
        if let Some(existing) = addrs.iter_mut().find(|a| a.ip() == addr.ip()) {
            *existing = addr;
        } else {
            addrs.push(addr);
        }
        Ok(())
    }

    async fn addr_del(&self, link: &LinkHandle, addr: IpNetwork) -> Result<(), KernelError> {
        let mut st = self.state.lock().unwrap();
        let addrs = st
            .addrs
            .get_mut(&link.index)
            .ok_or_else(|| KernelError::NotFound(addr.to_string()))?;
        let before = addrs.len();
        addrs.retain(|a| *a != addr);
        if addrs.len() == before {
            return Err(KernelError::NotFound(addr.to_string()));
        }
        Ok(())
    }

    async fn route_add(
        &self,
        dst: IpNetwork,
        via: Option<IpAddr>,
        dev: Option<&LinkHandle>,
    ) -> Result<(), KernelError> {
        let mut st = self.state.lock().unwrap();
        let route = FakeRoute {
            dst,
            via,
            dev: dev.map(|l| l.name.clone()),
        };
        if st.routes.contains(&route) {
            return Err(KernelError::Exists(dst.to_string()));
        }
        st.routes.push(route);
        Ok(())
    }

    fn sysctl_get(&self, name: &str) -> Result<String, KernelError> {
        let st = self.state.lock().unwrap();
        st.sysctls
            .get(&name.replace('.', "/"))
            .cloned()
            .ok_or_else(|| KernelError::NotFound(name.to_string()))
    }

    fn sysctl_set(&self, name: &str, value: &str) -> Result<(), KernelError> {
        let mut st = self.state.lock().unwrap();
        st.sysctls.insert(name.replace('.', "/"), value.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bridge_lifecycle() {
        let kernel = FakeKernel::new();
        kernel
            .link_add(LinkSpec::Bridge {
                name: "br-test".to_string(),
                mtu: 1500,
            })
            .await
            .unwrap();
        let link = kernel.link_by_name("br-test").await.unwrap();
        assert!(link.is_bridge());

        let dup = kernel
            .link_add(LinkSpec::Bridge {
                name: "br-test".to_string(),
                mtu: 1500,
            })
            .await
            .unwrap_err();
        assert!(dup.is_exists());

        kernel.link_set_up(&link).await.unwrap();
        assert!(kernel.is_up("br-test"));

        kernel.link_del(&link).await.unwrap();
        assert!(!kernel.has_link("br-test"));
    }

    #[tokio::test]
    async fn test_veth_peer_removed_together() {
        let kernel = FakeKernel::new();
        kernel
            .link_add(LinkSpec::VethPair {
                name: "veth0a".to_string(),
                peer_name: "veth0b".to_string(),
                mtu: 1500,
                tx_queue_len: 0,
                mac: None,
            })
            .await
            .unwrap();
        assert!(kernel.has_link("veth0a") && kernel.has_link("veth0b"));

        let host = kernel.link_by_name("veth0a").await.unwrap();
        kernel.link_del(&host).await.unwrap();
        assert!(!kernel.has_link("veth0b"));
    }

    #[tokio::test]
    async fn test_addr_replace_updates_in_place() {
        let kernel = FakeKernel::new();
        kernel
            .link_add(LinkSpec::Bridge {
                name: "br0".to_string(),
                mtu: 0,
            })
            .await
            .unwrap();
        let link = kernel.link_by_name("br0").await.unwrap();

        kernel
            .addr_add(&link, "172.17.0.1/16".parse().unwrap())
            .await
            .unwrap();
        kernel
            .addr_replace(&link, "172.17.0.1/24".parse().unwrap())
            .await
            .unwrap();
        assert_eq!(
            kernel.addresses_of("br0"),
            vec!["172.17.0.1/24".parse::<IpNetwork>().unwrap()]
        );
    }

    #[tokio::test]
    async fn test_link_attribute_updates() {
        let kernel = FakeKernel::new();
        kernel
            .link_add(LinkSpec::Bridge {
                name: "br0".to_string(),
                mtu: 0,
            })
            .await
            .unwrap();
        let link = kernel.link_by_name("br0").await.unwrap();

        kernel.link_set_mtu(&link, 9000).await.unwrap();
        assert_eq!(kernel.mtu_of("br0"), Some(9000));

        let mac = MacAddr6::new(0x02, 0x42, 0x00, 0x00, 0x00, 0x01);
        kernel.link_set_hwaddr(&link, mac).await.unwrap();
        assert_eq!(kernel.link_by_name("br0").await.unwrap().mac, Some(mac));
    }

    #[tokio::test]
    async fn test_route_add_dedupes() {
        let kernel = FakeKernel::new();
        kernel
            .link_add(LinkSpec::Bridge {
                name: "br0".to_string(),
                mtu: 0,
            })
            .await
            .unwrap();
        let link = kernel.link_by_name("br0").await.unwrap();
        let dst: IpNetwork = "10.0.0.0/24".parse().unwrap();

        kernel.route_add(dst, None, Some(&link)).await.unwrap();
        assert_eq!(kernel.routes().len(), 1);
        assert!(kernel
            .route_add(dst, None, Some(&link))
            .await
            .unwrap_err()
            .is_exists());
    }

    #[tokio::test]
    async fn test_sysctl_roundtrip() {
        let kernel = FakeKernel::new();
        assert!(kernel.sysctl_get("net.ipv4.ip_forward").is_err());
        kernel.sysctl_set("net.ipv4.ip_forward", "1").unwrap();
        assert_eq!(kernel.sysctl_get("net.ipv4.ip_forward").unwrap(), "1");
    }
}
