use std::net::IpAddr;

use async_trait::async_trait;
use futures::TryStreamExt;
use ipnetwork::IpNetwork;
use log::debug;
use macaddr::MacAddr6;
use netlink_packet_route::AddressFamily;
use netlink_packet_route::address::AddressAttribute;
use netlink_packet_route::link::{
    InfoBridgePort, InfoData, InfoKind, InfoPortData, InfoVeth, LinkAttribute, LinkInfo,
    LinkMessage,
};
use rtnetlink::{
    Handle, LinkBridge, LinkMessageBuilder, LinkUnspec, LinkVeth, RouteMessageBuilder,
    new_connection,
};

use crate::adapter::KernelAdapter;
use crate::error::KernelError;
use crate::sysctl;
use crate::types::{IpFamily, LinkHandle, LinkSpec};

/// rtnetlink-backed [`KernelAdapter`].
///
/// A fresh connection is opened per operation and driven on the tokio
/// runtime, the same way the CNI plumbing does it; the kernel serialises
/// the requests.
#[derive(Debug, Default)]
pub struct NetlinkAdapter;

impl NetlinkAdapter {
    pub fn new() -> Self {
        NetlinkAdapter
    }

    fn handle() -> Result<Handle, KernelError> {
        let (connection, handle, _) = new_connection()
            .map_err(|e| KernelError::Transient(format!("rtnetlink connection: {e}")))?;
        tokio::spawn(connection);
        Ok(handle)
    }
}

/// Map an rtnetlink failure onto the typed categories via its errno.
fn classify(what: &str, err: rtnetlink::Error) -> KernelError {
    match err {
        rtnetlink::Error::NetlinkError(msg) => {
            let errno = -msg.raw_code();
            match errno {
                libc::ENODEV | libc::ENOENT | libc::ESRCH => KernelError::NotFound(what.into()),
                libc::EEXIST => KernelError::Exists(what.into()),
                libc::EPERM | libc::EACCES => {
                    KernelError::Permission(format!("{what}: errno {errno}"))
                }
                libc::EINVAL | libc::ERANGE => {
                    KernelError::InvalidArgument(format!("{what}: errno {errno}"))
                }
                _ => KernelError::Transient(format!("{what}: errno {errno}")),
            }
        }
        other => KernelError::Transient(format!("{what}: {other}")),
    }
}

fn family_of(family: IpFamily) -> AddressFamily {
    match family {
        IpFamily::V4 => AddressFamily::Inet,
        IpFamily::V6 => AddressFamily::Inet6,
    }
}

/// Extracts name, kind and MAC from a link message.
fn to_handle(msg: &LinkMessage) -> LinkHandle {
    let mut name = String::new();
    let mut kind = None;
    let mut mac = None;
    for attr in &msg.attributes {
        match attr {
            LinkAttribute::IfName(n) => name = n.clone(),
            LinkAttribute::Address(bytes) if bytes.len() == 6 => {
                mac = Some(MacAddr6::new(
                    bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5],
                ));
            }
            LinkAttribute::LinkInfo(info) => {
                for item in info {
                    if let LinkInfo::Kind(k) = item {
                        kind = Some(k.to_string());
                    }
                }
            }
            _ => {}
        }
    }
    LinkHandle {
        index: msg.header.index,
        name,
        kind,
        mac,
    }
}

#[async_trait]
impl KernelAdapter for NetlinkAdapter {
    async fn link_by_name(&self, name: &str) -> Result<LinkHandle, KernelError> {
        let handle = Self::handle()?;
        let mut links = handle.link().get().match_name(name.to_string()).execute();
        let link = links
            .try_next()
            .await
            .map_err(|e| classify(name, e))?
            .ok_or_else(|| KernelError::NotFound(name.to_string()))?;
        Ok(to_handle(&link))
    }

    async fn link_add(&self, spec: LinkSpec) -> Result<(), KernelError> {
        let handle = Self::handle()?;
        let what = spec.name().to_string();
        let msg = match spec {
            LinkSpec::Bridge { name, mtu } => {
                let mut builder = LinkMessageBuilder::<LinkBridge>::new(&name);
                if mtu > 0 {
                    builder = builder.mtu(mtu);
                }
                builder.build()
            }
            LinkSpec::VethPair {
                name,
                peer_name,
                mtu,
                tx_queue_len,
                mac,
            } => {
                let mut peer = LinkMessageBuilder::<LinkUnspec>::new()
                    .name(peer_name)
                    .append_extra_attribute(LinkAttribute::TxQueueLen(tx_queue_len));
                if mtu > 0 {
                    peer = peer.mtu(mtu);
                }
                let mut builder = LinkMessageBuilder::<LinkVeth>::new_with_info_kind(InfoKind::Veth)
                    .name(name)
                    .append_extra_attribute(LinkAttribute::TxQueueLen(tx_queue_len));
                if mtu > 0 {
                    builder = builder.mtu(mtu);
                }
                if let Some(mac) = mac {
                    builder = builder.address(mac.into_array().to_vec());
                }
                builder
                    .set_info_data(InfoData::Veth(InfoVeth::Peer(peer.build())))
                    .build()
            }
        };
        handle
            .link()
            .add(msg)
            .execute()
            .await
            .map_err(|e| classify(&what, e))
    }

    async fn link_del(&self, link: &LinkHandle) -> Result<(), KernelError> {
        let handle = Self::handle()?;
        handle
            .link()
            .del(link.index)
            .execute()
            .await
            .map_err(|e| classify(&link.name, e))
    }

    async fn link_set_up(&self, link: &LinkHandle) -> Result<(), KernelError> {
        let handle = Self::handle()?;
        let msg = LinkUnspec::new_with_index(link.index).up().build();
        handle
            .link()
            .set(msg)
            .execute()
            .await
            .map_err(|e| classify(&link.name, e))
    }

    async fn link_set_master(
        &self,
        link: &LinkHandle,
        master: &LinkHandle,
    ) -> Result<(), KernelError> {
        let handle = Self::handle()?;
        let mut msg = LinkMessage::default();
        msg.header.index = link.index;
        msg.attributes.push(LinkAttribute::Controller(master.index));
        handle
            .link()
            .set(msg)
            .execute()
            .await
            .map_err(|e| classify(&link.name, e))
    }

    async fn link_set_mtu(&self, link: &LinkHandle, mtu: u32) -> Result<(), KernelError> {
        let handle = Self::handle()?;
        let mut msg = LinkMessage::default();
        msg.header.index = link.index;
        msg.attributes.push(LinkAttribute::Mtu(mtu));
        handle
            .link()
            .set(msg)
            .execute()
            .await
            .map_err(|e| classify(&link.name, e))
    }

    async fn link_set_hwaddr(&self, link: &LinkHandle, mac: MacAddr6) -> Result<(), KernelError> {
        let handle = Self::handle()?;
        let mut msg = LinkMessage::default();
        msg.header.index = link.index;
        msg.attributes
            .push(LinkAttribute::Address(mac.into_array().to_vec()));
        handle
            .link()
            .set(msg)
            .execute()
            .await
            .map_err(|e| classify(&link.name, e))
    }

    async fn link_set_hairpin(&self, link: &LinkHandle, enabled: bool) -> Result<(), KernelError> {
        let handle = Self::handle()?;
        let mut msg = LinkMessage::default();
        msg.header.index = link.index;
        msg.attributes
            .push(LinkAttribute::LinkInfo(vec![LinkInfo::PortData(
                InfoPortData::BridgePort(vec![InfoBridgePort::HairpinMode(enabled)]),
            )]));
        handle
            .link()
            .set_port(msg)
            .execute()
            .await
            .map_err(|e| classify(&link.name, e))
    }

    async fn addr_list(
        &self,
        link: &LinkHandle,
        family: IpFamily,
    ) -> Result<Vec<IpNetwork>, KernelError> {
        let handle = Self::handle()?;
        let family = family_of(family);
        let mut stream = handle
            .address()
            .get()
            .set_link_index_filter(link.index)
            .execute();
        let mut out = Vec::new();
        while let Some(msg) = stream
            .try_next()
            .await
            .map_err(|e| classify(&link.name, e))?
        {
            if msg.header.family != family {
                continue;
            }
            let prefix = msg.header.prefix_len;
            let mut local = None;
            let mut address = None;
            for attr in &msg.attributes {
                match attr {
                    AddressAttribute::Local(ip) => local = Some(*ip),
                    AddressAttribute::Address(ip) => address = Some(*ip),
                    _ => {}
                }
            }
            if let Some(ip) = local.or(address) {
                let net = IpNetwork::new(ip, prefix)
                    .map_err(|e| KernelError::Transient(format!("{ip}/{prefix}: {e}")))?;
                out.push(net);
            }
        }
        Ok(out)
    }

    async fn addr_add(&self, link: &LinkHandle, addr: IpNetwork) -> Result<(), KernelError> {
        let handle = Self::handle()?;
        debug!("addr add {addr} on {}", link.name);
        handle
            .address()
            .add(link.index, addr.ip(), addr.prefix())
            .execute()
            .await
            .map_err(|e| classify(&addr.to_string(), e))
    }

    async fn addr_replace(&self, link: &LinkHandle, addr: IpNetwork) -> Result<(), KernelError> {
        let handle = Self::handle()?;
        debug!("addr replace {addr} on {}", link.name);
        handle
            .address()
            .add(link.index, addr.ip(), addr.prefix())
            .replace()
            .execute()
            .await
            .map_err(|e| classify(&addr.to_string(), e))
    }

    async fn addr_del(&self, link: &LinkHandle, addr: IpNetwork) -> Result<(), KernelError> {
        let handle = Self::handle()?;
        let mut stream = handle
            .address()
            .get()
            .set_link_index_filter(link.index)
            .execute();
        while let Some(msg) = stream
            .try_next()
            .await
            .map_err(|e| classify(&link.name, e))?
        {
            if msg.header.prefix_len != addr.prefix() {
                continue;
            }
            let matches = msg.attributes.iter().any(|attr| {
                matches!(attr, AddressAttribute::Local(ip) if *ip == addr.ip())
                    || matches!(attr, AddressAttribute::Address(ip) if *ip == addr.ip())
            });
            if matches {
                return handle
                    .address()
                    .del(msg)
                    .execute()
                    .await
                    .map_err(|e| classify(&addr.to_string(), e));
            }
        }
        Err(KernelError::NotFound(addr.to_string()))
    }

    async fn route_add(
        &self,
        dst: IpNetwork,
        via: Option<IpAddr>,
        dev: Option<&LinkHandle>,
    ) -> Result<(), KernelError> {
        let handle = Self::handle()?;
        let mut builder = RouteMessageBuilder::<IpAddr>::new()
            .destination_prefix(dst.ip(), dst.prefix())
            .map_err(|e| KernelError::InvalidArgument(format!("route dst {dst}: {e}")))?;
        if let Some(gw) = via {
            builder = builder
                .gateway(gw)
                .map_err(|e| KernelError::InvalidArgument(format!("route gw {gw}: {e}")))?;
        }
        if let Some(link) = dev {
            builder = builder.output_interface(link.index);
        }
        handle
            .route()
            .add(builder.build())
            .execute()
            .await
            .map_err(|e| classify(&dst.to_string(), e))
    }

    fn sysctl_get(&self, name: &str) -> Result<String, KernelError> {
        sysctl::sysctl_get(name)
    }

    fn sysctl_set(&self, name: &str, value: &str) -> Result<(), KernelError> {
        sysctl::sysctl_set(name, value)
    }
}
