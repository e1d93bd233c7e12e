use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use ipnetwork::{IpNetwork, Ipv4Network, Ipv6Network};
use libfirewall::portmapper::{DOCKER_CHAIN, PortMapper};
use libfirewall::{FirewallError, Rule, RuleBackend, Table};
use libipam::{HostAllocator, eui64_address};
use libnetlink::{KernelAdapter, LinkSpec};
use log::{debug, warn};
use tokio::sync::Mutex;

use crate::config::{EndpointOption, GatewayMode, JoinOption, NetworkConfiguration, TransportPort};
use crate::endpoint::{Endpoint, EndpointInfo, InterfaceInfo, JoinInfo, generate_ifname, generate_mac};
use crate::error::DriverError;
use crate::interface::BridgeInterface;
use crate::rules;
use crate::setup::{UndoAction, UndoStack};
use crate::store::EndpointRecord;

/// One bridge network: immutable configuration plus runtime state. The
/// endpoint map has its own lock; `op_lock` serialises endpoint lifecycle
/// operations within the network so create/join/leave/delete observe each
/// other in order.
pub struct BridgeNetwork {
    pub config: NetworkConfiguration,
    kernel: Arc<dyn KernelAdapter>,
    firewall: Arc<dyn RuleBackend>,
    ipam: Arc<HostAllocator>,
    pub bridge: Mutex<BridgeInterface>,
    endpoints: Mutex<HashMap<String, Endpoint>>,
    op_lock: Mutex<()>,
    pub portmapper: PortMapper,
    fw_rules: StdMutex<Vec<Rule>>,
    link_rules: StdMutex<HashMap<String, Vec<Rule>>>,
    created_bridge: AtomicBool,
}

impl BridgeNetwork {
    pub fn new(
        config: NetworkConfiguration,
        kernel: Arc<dyn KernelAdapter>,
        firewall: Arc<dyn RuleBackend>,
        ipam: Arc<HostAllocator>,
        portmapper: PortMapper,
    ) -> Self {
        let bridge = BridgeInterface::new(&config.bridge_name);
        BridgeNetwork {
            config,
            kernel,
            firewall,
            ipam,
            bridge: Mutex::new(bridge),
            endpoints: Mutex::new(HashMap::new()),
            op_lock: Mutex::new(()),
            portmapper,
            fw_rules: StdMutex::new(Vec::new()),
            link_rules: StdMutex::new(HashMap::new()),
            created_bridge: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }

    fn v4_pool(&self) -> IpNetwork {
        IpNetwork::V4(self.config.v4_prefix())
    }

    fn v6_pool(&self) -> Option<IpNetwork> {
        self.config.v6_prefix().map(IpNetwork::V6)
    }

    pub fn set_fw_rules(&self, rules: Vec<Rule>) {
        *self.fw_rules.lock().unwrap() = rules;
    }

    pub fn fw_rules(&self) -> Vec<Rule> {
        self.fw_rules.lock().unwrap().clone()
    }

    pub fn mark_created_bridge(&self, created: bool) {
        self.created_bridge.store(created, Ordering::SeqCst);
    }

    pub fn created_bridge(&self) -> bool {
        self.created_bridge.load(Ordering::SeqCst)
    }

    pub async fn endpoint(&self, eid: &str) -> Option<Endpoint> {
        self.endpoints.lock().await.get(eid).cloned()
    }

    pub async fn endpoint_count(&self) -> usize {
        self.endpoints.lock().await.len()
    }

    /// Create the veth pair, allocate addresses, map ports and publish the
    /// sandbox interface. Every committed step has a matching undo; a
    /// failure leaves no veth, no allocations and no rules behind.
    pub async fn create_endpoint(
        &self,
        eid: &str,
        epinfo: &mut EndpointInfo,
        options: &[EndpointOption],
    ) -> Result<Endpoint, DriverError> {
        let _op = self.op_lock.lock().await;

        if epinfo.iface.is_some() {
            return Err(DriverError::InvalidArgument(
                "endpoint interface must not be pre-populated by the caller".to_string(),
            ));
        }
        if self.endpoints.lock().await.contains_key(eid) {
            return Err(DriverError::Exists(format!("endpoint {eid}")));
        }

        let mut requested_mac = None;
        let mut requested_ports = Vec::new();
        let mut exposed_ports = Vec::new();
        for option in options {
            match option {
                EndpointOption::MacAddress(mac) => requested_mac = Some(*mac),
                EndpointOption::PortMap(bindings) => requested_ports = bindings.clone(),
                EndpointOption::ExposedPorts(ports) => exposed_ports = ports.clone(),
            }
        }

        let mut undo = UndoStack::default();
        let result = self
            .provision_endpoint(eid, requested_mac, requested_ports, exposed_ports, &mut undo)
            .await;

        match result {
            Ok(endpoint) => {
                epinfo.iface = Some(InterfaceInfo {
                    src_name: endpoint.src_name.clone(),
                    dst_name: endpoint.dst_name.clone(),
                    mac: endpoint.mac,
                    addr_v4: endpoint.addr_v4,
                    addr_v6: endpoint.addr_v6,
                });
                self.endpoints
                    .lock()
                    .await
                    .insert(eid.to_string(), endpoint.clone());
                Ok(endpoint)
            }
            Err(e) => {
                undo.unwind(
                    self.kernel.as_ref(),
                    self.ipam.as_ref(),
                    self.firewall.as_ref(),
                    Some(&self.portmapper),
                )
                .await;
                Err(e)
            }
        }
    }

    async fn provision_endpoint(
        &self,
        eid: &str,
        requested_mac: Option<macaddr::MacAddr6>,
        requested_ports: Vec<libfirewall::PortBinding>,
        exposed_ports: Vec<TransportPort>,
        undo: &mut UndoStack,
    ) -> Result<Endpoint, DriverError> {
        let kernel = self.kernel.as_ref();
        let mac = requested_mac.unwrap_or_else(generate_mac);

        let host_name = generate_ifname(kernel).await?;
        let mut sandbox_name = generate_ifname(kernel).await?;
        while sandbox_name == host_name {
            sandbox_name = generate_ifname(kernel).await?;
        }

        kernel
            .link_add(LinkSpec::VethPair {
                name: sandbox_name.clone(),
                peer_name: host_name.clone(),
                mtu: self.config.mtu,
                tx_queue_len: 0,
                mac: Some(mac),
            })
            .await?;
        undo.push(UndoAction::DeleteLink {
            name: host_name.clone(),
        });

        let host_link = kernel.link_by_name(&host_name).await?;
        let bridge_link = { self.bridge.lock().await.link()?.clone() };
        kernel.link_set_master(&host_link, &bridge_link).await?;
        if !self.config.userland_proxy {
            kernel.link_set_hairpin(&host_link, true).await?;
        }

        let v4_pool = self.v4_pool();
        let addr = self.ipam.request(v4_pool, None)?;
        undo.push(UndoAction::ReleaseAddress {
            prefix: v4_pool,
            addr,
        });
        let IpAddr::V4(v4) = addr else {
            return Err(DriverError::Internal(anyhow::anyhow!(
                "v4 pool handed out {addr}"
            )));
        };
        let addr_v4 = Ipv4Network::new(v4, self.config.address_v4.prefix())
            .map_err(|e| DriverError::Internal(e.into()))?;

        let addr_v6 = if self.config.enable_ipv6 {
            let pool = self.v6_pool().ok_or_else(|| {
                DriverError::InvalidArgument("IPv6 enabled without an address".to_string())
            })?;
            let hint_prefix = self
                .config
                .fixed_cidr_v6
                .or(self.config.v6_prefix())
                .expect("v6 pool implies a v6 prefix");
            let hint = eui64_address(hint_prefix, mac).map(IpAddr::V6);
            let addr = self.ipam.request(pool, hint)?;
            undo.push(UndoAction::ReleaseAddress { prefix: pool, addr });
            let IpAddr::V6(v6) = addr else {
                return Err(DriverError::Internal(anyhow::anyhow!(
                    "v6 pool handed out {addr}"
                )));
            };
            let prefix_len = self
                .config
                .address_v6
                .expect("enable_ipv6 comes with an address")
                .prefix();
            Some(
                Ipv6Network::new(v6, prefix_len).map_err(|e| DriverError::Internal(e.into()))?,
            )
        } else {
            None
        };

        let port_mapping = if requested_ports.is_empty() {
            Vec::new()
        } else {
            let mapping = self.portmapper.map_ports(
                eid,
                &requested_ports,
                addr_v4.ip(),
                addr_v6.map(|a| a.ip()),
            )?;
            undo.push(UndoAction::UnmapPorts {
                endpoint: eid.to_string(),
            });
            mapping
        };

        debug!(
            "created endpoint {eid} on {}: {host_name}/{sandbox_name} {mac} {addr_v4}",
            self.config.bridge_name
        );
        Ok(Endpoint {
            id: eid.to_string(),
            src_name: host_name,
            dst_name: sandbox_name,
            mac,
            addr_v4,
            addr_v6,
            requested_ports,
            port_mapping,
            exposed_ports,
        })
    }

    /// Release ports and addresses, then best-effort delete the veth; the
    /// sandbox side usually vanished with the sandbox already.
    pub async fn delete_endpoint(&self, eid: &str) -> Result<Endpoint, DriverError> {
        let _op = self.op_lock.lock().await;

        let endpoint = self
            .endpoints
            .lock()
            .await
            .remove(eid)
            .ok_or_else(|| DriverError::NotFound(format!("endpoint {eid}")))?;

        self.portmapper.unmap_all(eid);
        self.remove_link_rules(eid);

        self.ipam
            .release(self.v4_pool(), IpAddr::V4(endpoint.addr_v4.ip()));
        if let (Some(pool), Some(addr)) = (self.v6_pool(), endpoint.addr_v6) {
            self.ipam.release(pool, IpAddr::V6(addr.ip()));
        }

        match self.kernel.link_by_name(&endpoint.src_name).await {
            Ok(link) => {
                if let Err(e) = self.kernel.link_del(&link).await {
                    warn!("could not delete veth {}: {e}", endpoint.src_name);
                }
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => warn!("could not look up veth {}: {e}", endpoint.src_name),
        }

        Ok(endpoint)
    }

    /// Hand gateway data to the joining sandbox and wire up legacy links.
    pub async fn join(
        &self,
        eid: &str,
        sandbox_key: &str,
        join_info: &mut JoinInfo,
        options: &[JoinOption],
    ) -> Result<(), DriverError> {
        let _op = self.op_lock.lock().await;

        let endpoint = self
            .endpoints
            .lock()
            .await
            .get(eid)
            .cloned()
            .ok_or_else(|| DriverError::NotFound(format!("endpoint {eid}")))?;
        debug!("joining sandbox {sandbox_key} to endpoint {eid}");

        {
            let bridge = self.bridge.lock().await;
            if self.config.gateway_mode_v4 != GatewayMode::Isolated {
                join_info.gateway_v4 = bridge.gateway_v4;
            }
            if self.config.gateway_mode_v6 != GatewayMode::Isolated {
                join_info.gateway_v6 = bridge.gateway_v6;
            }
        }
        join_info.iface_name_prefix = self.config.container_iface_prefix.clone();

        let mut new_rules: Vec<Rule> = Vec::new();
        for option in options {
            match option {
                JoinOption::ParentEndpoints(parents) => {
                    for pid in parents {
                        let parent = self.endpoints.lock().await.get(pid).cloned().ok_or_else(
                            || DriverError::NotFound(format!("parent endpoint {pid}")),
                        )?;
                        new_rules.extend(rules::link_rules(
                            &self.config.bridge_name,
                            IpAddr::V4(parent.addr_v4.ip()),
                            IpAddr::V4(endpoint.addr_v4.ip()),
                            &parent.exposed_ports,
                        ));
                    }
                }
                JoinOption::ChildEndpoints(children) => {
                    for cid in children {
                        let child = self.endpoints.lock().await.get(cid).cloned().ok_or_else(
                            || DriverError::NotFound(format!("child endpoint {cid}")),
                        )?;
                        new_rules.extend(rules::link_rules(
                            &self.config.bridge_name,
                            IpAddr::V4(endpoint.addr_v4.ip()),
                            IpAddr::V4(child.addr_v4.ip()),
                            &endpoint.exposed_ports,
                        ));
                    }
                }
            }
        }

        if !new_rules.is_empty() {
            self.firewall
                .ensure_chain(libfirewall::IpVersion::V4, Table::Filter, DOCKER_CHAIN)?;
            for rule in &new_rules {
                self.firewall.append(rule)?;
            }
            self.link_rules
                .lock()
                .unwrap()
                .entry(eid.to_string())
                .or_default()
                .extend(new_rules);
        }
        Ok(())
    }

    pub async fn leave(&self, eid: &str) -> Result<(), DriverError> {
        let _op = self.op_lock.lock().await;
        if !self.endpoints.lock().await.contains_key(eid) {
            return Err(DriverError::NotFound(format!("endpoint {eid}")));
        }
        self.remove_link_rules(eid);
        Ok(())
    }

    fn remove_link_rules(&self, eid: &str) {
        let Some(rules) = self.link_rules.lock().unwrap().remove(eid) else {
            return;
        };
        for rule in &rules {
            if let Err(e) = self.firewall.delete_if_exists(rule) {
                warn!("could not remove link rule {rule}: {e}");
            }
        }
    }

    pub async fn endpoint_oper_info(
        &self,
        eid: &str,
    ) -> Result<HashMap<String, String>, DriverError> {
        let endpoint = self
            .endpoint(eid)
            .await
            .ok_or_else(|| DriverError::NotFound(format!("endpoint {eid}")))?;

        let mut info = HashMap::new();
        info.insert("SrcName".to_string(), endpoint.src_name.clone());
        info.insert("MacAddress".to_string(), endpoint.mac.to_string());
        info.insert("Address".to_string(), endpoint.addr_v4.to_string());
        if let Some(v6) = endpoint.addr_v6 {
            info.insert("AddressIPv6".to_string(), v6.to_string());
        }
        if !endpoint.exposed_ports.is_empty() {
            let ports: Vec<String> = endpoint
                .exposed_ports
                .iter()
                .map(|tp| format!("{}/{}", tp.port, tp.proto))
                .collect();
            info.insert("ExposedPorts".to_string(), ports.join(", "));
        }
        let mapping = self.portmapper.mapped_ports(eid);
        if !mapping.is_empty() {
            let ports: Vec<String> = mapping
                .iter()
                .map(|b| {
                    format!(
                        "{}:{}->{}/{}",
                        b.host_ip
                            .map(|ip| ip.to_string())
                            .unwrap_or_else(|| "0.0.0.0".to_string()),
                        b.host_port,
                        b.port,
                        b.proto
                    )
                })
                .collect();
            info.insert("PortMapping".to_string(), ports.join(", "));
        }
        Ok(info)
    }

    /// Rebuild one persisted endpoint: reclaim its addresses and reinstall
    /// its rules with the recorded host ports. The veth is expected to
    /// still exist; live containers keep running across the restart.
    pub async fn restore_endpoint(&self, record: EndpointRecord) -> Result<(), DriverError> {
        let _op = self.op_lock.lock().await;
        let endpoint = record.into_endpoint()?;

        let v4_pool = self.v4_pool();
        let claimed = self
            .ipam
            .request(v4_pool, Some(IpAddr::V4(endpoint.addr_v4.ip())))?;
        if claimed != IpAddr::V4(endpoint.addr_v4.ip()) {
            self.ipam.release(v4_pool, claimed);
            return Err(DriverError::Conflict(format!(
                "address {} of endpoint {} is taken",
                endpoint.addr_v4,
                endpoint.id
            )));
        }
        if let (Some(pool), Some(addr)) = (self.v6_pool(), endpoint.addr_v6) {
            let claimed = self.ipam.request(pool, Some(IpAddr::V6(addr.ip())))?;
            if claimed != IpAddr::V6(addr.ip()) {
                self.ipam.release(pool, claimed);
                return Err(DriverError::Conflict(format!(
                    "address {addr} of endpoint {} is taken",
                    endpoint.id
                )));
            }
        }

        if !endpoint.port_mapping.is_empty() {
            self.portmapper.restore(
                &endpoint.id,
                &endpoint.port_mapping,
                endpoint.addr_v4.ip(),
                endpoint.addr_v6.map(|a| a.ip()),
            )?;
        }

        self.endpoints
            .lock()
            .await
            .insert(endpoint.id.clone(), endpoint);
        Ok(())
    }

    /// Re-apply the network's declarative rule set: skeleton, policies,
    /// legacy links and port mappings. This is the whole reload story; no
    /// per-rule bookkeeping survives a flush.
    pub fn reconcile(&self) -> Result<(), FirewallError> {
        if !self.config.enable_ip_tables {
            return Ok(());
        }
        let installed = rules::install_network_rules(self.firewall.as_ref(), &self.config)?;
        *self.fw_rules.lock().unwrap() = installed;

        let link_rules: Vec<Rule> = self
            .link_rules
            .lock()
            .unwrap()
            .values()
            .flatten()
            .cloned()
            .collect();
        for rule in link_rules.iter().chain(self.portmapper.active_rules().iter()) {
            self.firewall.ensure_chain(rule.ipv, rule.table, &rule.chain)?;
            self.firewall.append(rule)?;
        }
        Ok(())
    }

    /// Drop the network's allocator pools, releasing every address in them.
    pub fn release_pools(&self) {
        self.ipam.unregister(self.v4_pool());
        if let Some(pool) = self.v6_pool() {
            self.ipam.unregister(pool);
        }
    }

    /// Delete the kernel bridge, but only when this driver created it; a
    /// pre-existing bridge the user handed us stays.
    pub async fn delete_bridge_if_created(&self) {
        if !self.created_bridge() {
            return;
        }
        match self.kernel.link_by_name(&self.config.bridge_name).await {
            Ok(link) => {
                if let Err(e) = self.kernel.link_del(&link).await {
                    warn!("could not delete bridge {}: {e}", self.config.bridge_name);
                }
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => warn!("could not look up bridge {}: {e}", self.config.bridge_name),
        }
    }

    /// Tear down everything the network owns in the firewall.
    pub fn remove_firewall_state(&self) {
        let rules = std::mem::take(&mut *self.fw_rules.lock().unwrap());
        rules::remove_network_rules(self.firewall.as_ref(), &rules);
        let link_rules: Vec<String> = self.link_rules.lock().unwrap().keys().cloned().collect();
        for eid in link_rules {
            self.remove_link_rules(&eid);
        }
    }
}
