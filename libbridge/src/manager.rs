use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use futures::FutureExt;
use libfirewall::portmapper::{PortMapper, PortMapperConfig};
use libfirewall::{PortAllocator, ReloadHook, RuleBackend};
use libipam::HostAllocator;
use libnetlink::KernelAdapter;
use log::{error, info, warn};
use tokio::sync::Mutex;

use crate::config::{EndpointOption, JoinOption, NetworkConfiguration, NetworkOption};
use crate::endpoint::{EndpointInfo, JoinInfo};
use crate::env::detect_mirrored_loopback;
use crate::error::DriverError;
use crate::interface::BridgeInterface;
use crate::network::BridgeNetwork;
use crate::setup::{SetupContext, SetupQueue, UndoAction};
use crate::store::{
    Datastore, ENDPOINT_KEY_PREFIX, EndpointRecord, NETWORK_KEY_PREFIX, endpoint_key, network_key,
};

/// Process-level driver settings, set once through `configure`.
#[derive(Debug, Clone, Default)]
pub struct DriverConfig {
    /// Binary spawned per published port when a network enables the
    /// userland proxy.
    pub proxy_path: Option<PathBuf>,
    /// Overrides the mirrored-loopback probe; tests pin this.
    pub mirrored_loopback: Option<bool>,
}

/// The bridge driver: owns the set of bridge networks and enforces the
/// global invariants (unique bridge names, disjoint IPv4 subnets). The
/// manager lock guards only the network map; kernel and firewall work runs
/// with it released.
pub struct BridgeDriver {
    kernel: Arc<dyn KernelAdapter>,
    firewall: Arc<dyn RuleBackend>,
    ipam: Arc<HostAllocator>,
    ports: Arc<PortAllocator>,
    store: Arc<dyn Datastore>,
    reload: Arc<ReloadHook>,
    networks: Mutex<HashMap<String, Arc<BridgeNetwork>>>,
    driver_config: StdMutex<DriverConfig>,
    probed_mirrored_loopback: bool,
}

impl BridgeDriver {
    pub async fn new(
        kernel: Arc<dyn KernelAdapter>,
        firewall: Arc<dyn RuleBackend>,
        ipam: Arc<HostAllocator>,
        ports: Arc<PortAllocator>,
        store: Arc<dyn Datastore>,
    ) -> Arc<Self> {
        let probed = detect_mirrored_loopback(kernel.as_ref()).await;
        let driver = Arc::new(BridgeDriver {
            kernel,
            firewall,
            ipam,
            ports,
            store,
            reload: Arc::new(ReloadHook::new()),
            networks: Mutex::new(HashMap::new()),
            driver_config: StdMutex::new(DriverConfig::default()),
            probed_mirrored_loopback: probed,
        });

        // One process-wide reconciliation callback; it walks whatever
        // networks exist when an external flush hits.
        let weak = Arc::downgrade(&driver);
        driver.reload.register("bridge-driver", move || {
            let weak = weak.clone();
            async move {
                if let Some(driver) = weak.upgrade() {
                    driver.reconcile_all().await;
                }
                Ok(())
            }
            .boxed()
        });
        driver
    }

    pub fn driver_type(&self) -> &'static str {
        "bridge"
    }

    pub fn configure(&self, config: DriverConfig) {
        *self.driver_config.lock().unwrap() = config;
    }

    /// The hook the firewall integration fires after detecting an external
    /// flush.
    pub fn reload_hook(&self) -> Arc<ReloadHook> {
        self.reload.clone()
    }

    fn mirrored_loopback(&self) -> bool {
        self.driver_config
            .lock()
            .unwrap()
            .mirrored_loopback
            .unwrap_or(self.probed_mirrored_loopback)
    }

    fn build_network(&self, cfg: NetworkConfiguration) -> Arc<BridgeNetwork> {
        let mapper_cfg = PortMapperConfig {
            bridge_name: cfg.bridge_name.clone(),
            host_binding_v4: cfg.host_binding_ipv4,
            host_binding_v6: cfg.host_binding_ipv6,
            userland_proxy: cfg.userland_proxy,
            proxy_path: self.driver_config.lock().unwrap().proxy_path.clone(),
            mirrored_loopback: self.mirrored_loopback(),
        };
        let mapper = PortMapper::new(mapper_cfg, self.firewall.clone(), self.ports.clone());
        Arc::new(BridgeNetwork::new(
            cfg,
            self.kernel.clone(),
            self.firewall.clone(),
            self.ipam.clone(),
            mapper,
        ))
    }

    async fn network(&self, nid: &str) -> Result<Arc<BridgeNetwork>, DriverError> {
        self.networks
            .lock()
            .await
            .get(nid)
            .cloned()
            .ok_or_else(|| DriverError::NotFound(format!("network {nid}")))
    }

    /// Reserve the id and bridge name in the map, then run the setup
    /// pipeline with the lock released.
    async fn reserve_network(&self, network: Arc<BridgeNetwork>) -> Result<(), DriverError> {
        let mut networks = self.networks.lock().await;
        if networks.contains_key(network.id()) {
            return Err(DriverError::Exists(format!("network {}", network.id())));
        }
        for other in networks.values() {
            if let Some(reason) = network.config.conflict_with(&other.config) {
                return Err(DriverError::Conflict(reason));
            }
        }
        networks.insert(network.id().to_string(), network);
        Ok(())
    }

    /// Run the pipeline for a reserved network and commit its runtime state
    /// on success; on failure the skeleton is removed and every committed
    /// step is undone.
    async fn provision_network(&self, network: &Arc<BridgeNetwork>) -> Result<(), DriverError> {
        let ctx = SetupContext::new(
            self.kernel.clone(),
            self.firewall.clone(),
            self.ipam.clone(),
        );
        let mut bridge = BridgeInterface::new(&network.config.bridge_name);

        let result = SetupQueue::for_network()
            .apply(&ctx, &network.config, &mut bridge)
            .await;

        match result {
            Ok(()) => {
                let mut undo = std::mem::take(&mut *ctx.undo.lock().unwrap());
                let created = undo
                    .actions()
                    .iter()
                    .any(|a| matches!(a, UndoAction::DeleteLink { .. }));
                network.mark_created_bridge(created);
                network.set_fw_rules(std::mem::take(&mut *ctx.fw_rules.lock().unwrap()));
                *network.bridge.lock().await = bridge;
                undo.clear();
                Ok(())
            }
            Err(e) => {
                self.networks.lock().await.remove(network.id());
                let mut undo = std::mem::take(&mut *ctx.undo.lock().unwrap());
                undo.unwind(
                    self.kernel.as_ref(),
                    self.ipam.as_ref(),
                    self.firewall.as_ref(),
                    None,
                )
                .await;
                Err(e)
            }
        }
    }

    pub async fn create_network(
        &self,
        id: &str,
        options: &[NetworkOption],
    ) -> Result<(), DriverError> {
        let cfg = NetworkConfiguration::from_options(id, options)?;
        let network = self.build_network(cfg);
        self.reserve_network(network.clone()).await?;
        self.provision_network(&network).await?;

        let value = serde_json::to_value(&network.config)
            .map_err(|e| DriverError::Persistence(e.to_string()))?;
        if let Err(e) = self.store.put_atomic(&network_key(id), value, None).await {
            // A failed create must leave no record and no bridge we made.
            self.networks.lock().await.remove(id);
            network.remove_firewall_state();
            network.delete_bridge_if_created().await;
            network.release_pools();
            return Err(e.into());
        }
        info!("created network {id} on bridge {}", network.config.bridge_name);
        Ok(())
    }

    pub async fn delete_network(&self, id: &str) -> Result<(), DriverError> {
        let network = {
            let mut networks = self.networks.lock().await;
            let network = networks
                .get(id)
                .cloned()
                .ok_or_else(|| DriverError::NotFound(format!("network {id}")))?;
            if network.endpoint_count().await > 0 {
                return Err(DriverError::Conflict(format!(
                    "network {id} still has endpoints"
                )));
            }
            networks.remove(id);
            network
        };

        network.remove_firewall_state();
        network.delete_bridge_if_created().await;
        network.release_pools();

        if let Err(e) = self.store.delete(&network_key(id)).await {
            // Only restore the map entry if a concurrent create has not
            // taken the id over in the meantime.
            self.networks
                .lock()
                .await
                .entry(id.to_string())
                .or_insert(network);
            return Err(e.into());
        }
        info!("deleted network {id}");
        Ok(())
    }

    pub async fn create_endpoint(
        &self,
        nid: &str,
        eid: &str,
        epinfo: &mut EndpointInfo,
        options: &[EndpointOption],
    ) -> Result<(), DriverError> {
        let network = self.network(nid).await?;
        let endpoint = network.create_endpoint(eid, epinfo, options).await?;

        let record = EndpointRecord::from_endpoint(nid, &endpoint);
        let value =
            serde_json::to_value(&record).map_err(|e| DriverError::Persistence(e.to_string()))?;
        if let Err(e) = self.store.put_atomic(&endpoint_key(eid), value, None).await {
            let _ = network.delete_endpoint(eid).await;
            epinfo.iface = None;
            return Err(e.into());
        }
        Ok(())
    }

    pub async fn delete_endpoint(&self, nid: &str, eid: &str) -> Result<(), DriverError> {
        let network = self.network(nid).await?;
        network.delete_endpoint(eid).await?;
        self.store.delete(&endpoint_key(eid)).await?;
        Ok(())
    }

    pub async fn endpoint_oper_info(
        &self,
        nid: &str,
        eid: &str,
    ) -> Result<HashMap<String, String>, DriverError> {
        self.network(nid).await?.endpoint_oper_info(eid).await
    }

    pub async fn join(
        &self,
        nid: &str,
        eid: &str,
        sandbox_key: &str,
        join_info: &mut JoinInfo,
        options: &[JoinOption],
    ) -> Result<(), DriverError> {
        self.network(nid)
            .await?
            .join(eid, sandbox_key, join_info, options)
            .await
    }

    pub async fn leave(&self, nid: &str, eid: &str) -> Result<(), DriverError> {
        self.network(nid).await?.leave(eid).await
    }

    /// Live-restore: rebuild every persisted network and endpoint. Records
    /// that fail to restore are logged and dropped from the store rather
    /// than poisoning the rest.
    pub async fn restore(&self) -> Result<(), DriverError> {
        for (key, value) in self.store.list(NETWORK_KEY_PREFIX).await? {
            let cfg: NetworkConfiguration = match serde_json::from_value(value) {
                Ok(cfg) => cfg,
                Err(e) => {
                    warn!("dropping unreadable network record {key}: {e}");
                    let _ = self.store.delete(&key).await;
                    continue;
                }
            };
            let id = cfg.id.clone();
            let network = self.build_network(cfg);
            let restored = match self.reserve_network(network.clone()).await {
                Ok(()) => self.provision_network(&network).await,
                Err(e) => Err(e),
            };
            if let Err(e) = restored {
                warn!("dropping network record {key}: {e}");
                let _ = self.store.delete(&key).await;
            } else {
                info!("restored network {id}");
            }
        }

        for (key, value) in self.store.list(ENDPOINT_KEY_PREFIX).await? {
            let record: EndpointRecord = match serde_json::from_value(value) {
                Ok(record) => record,
                Err(e) => {
                    warn!("dropping unreadable endpoint record {key}: {e}");
                    let _ = self.store.delete(&key).await;
                    continue;
                }
            };
            let network = self.networks.lock().await.get(&record.network_id).cloned();
            let Some(network) = network else {
                warn!(
                    "endpoint {} references deleted network {}, dropping",
                    record.id, record.network_id
                );
                let _ = self.store.delete(&key).await;
                continue;
            };
            let id = record.id.clone();
            if let Err(e) = network.restore_endpoint(record).await {
                warn!("dropping endpoint record {key}: {e}");
                let _ = self.store.delete(&key).await;
            } else {
                info!("restored endpoint {id}");
            }
        }
        Ok(())
    }

    /// Re-apply every network's declarative rule set; one failing network
    /// does not stop the others.
    pub async fn reconcile_all(&self) {
        let networks: Vec<Arc<BridgeNetwork>> =
            self.networks.lock().await.values().cloned().collect();
        info!("reconciling firewall rules of {} networks", networks.len());
        for network in networks {
            if let Err(e) = network.reconcile() {
                error!("firewall reconcile of network {} failed: {e}", network.id());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{GatewayMode, OPT_EP_PORT_MAP};
    use ipnetwork::IpNetwork;
    use libfirewall::portmapper::DOCKER_CHAIN;
    use libfirewall::{IpVersion, MemoryBackend, PortBinding, Proto, Table};
    use libnetlink::FakeKernel;
    use crate::store::MemStore;
    use std::sync::Once;

    fn init_logging() {
        static INIT: Once = Once::new();
        INIT.call_once(|| {
            env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn"))
                .is_test(true)
                .init();
        });
    }

    struct Harness {
        kernel: Arc<FakeKernel>,
        backend: Arc<MemoryBackend>,
        store: Arc<MemStore>,
        driver: Arc<BridgeDriver>,
    }

    async fn harness() -> Harness {
        harness_with_store(Arc::new(MemStore::new())).await
    }

    async fn harness_with_store(store: Arc<MemStore>) -> Harness {
        init_logging();
        let kernel = Arc::new(FakeKernel::new());
        let backend = Arc::new(MemoryBackend::new());
        let driver = BridgeDriver::new(
            kernel.clone(),
            backend.clone(),
            Arc::new(HostAllocator::new()),
            Arc::new(PortAllocator::new()),
            store.clone(),
        )
        .await;
        Harness {
            kernel,
            backend,
            store,
            driver,
        }
    }

    fn net_options(name: &str, addr: &str, extra: Vec<NetworkOption>) -> Vec<NetworkOption> {
        let mut opts = vec![
            NetworkOption::BridgeName(name.to_string()),
            NetworkOption::AddressV4(addr.parse().unwrap()),
        ];
        opts.extend(extra);
        opts
    }

    fn port_map_option(range: (u16, u16), container_port: u16) -> EndpointOption {
        let value = serde_json::json!([{
            "Proto": "tcp",
            "Port": container_port,
            "HostPort": range.0,
            "HostPortEnd": range.1,
        }]);
        let parsed = EndpointOption::parse(OPT_EP_PORT_MAP, &value).unwrap();
        parsed.into_iter().next().unwrap()
    }

    #[tokio::test]
    async fn test_default_bridge_single_container() {
        let h = harness().await;
        h.driver
            .create_network("net1", &net_options("docker0", "172.17.0.1/16", vec![]))
            .await
            .unwrap();

        let mut epinfo = EndpointInfo::default();
        h.driver
            .create_endpoint("net1", "ep1", &mut epinfo, &[])
            .await
            .unwrap();

        assert!(h.kernel.is_up("docker0"));
        let iface = epinfo.iface.expect("interface must be published");
        // Both veth ends exist; the host end is enslaved to the bridge.
        assert!(h.kernel.has_link(&iface.src_name));
        assert!(h.kernel.has_link(&iface.dst_name));
        assert_eq!(h.kernel.master_of(&iface.src_name).as_deref(), Some("docker0"));

        let prefix: IpNetwork = "172.17.0.0/16".parse().unwrap();
        assert!(prefix.contains(iface.addr_v4.ip().into()));
        assert_ne!(iface.addr_v4.ip().to_string(), "172.17.0.1");

        // No masquerade was requested, none may appear.
        assert!(!h
            .backend
            .rules(IpVersion::V4, Table::Nat, "POSTROUTING")
            .iter()
            .any(|r| r.contains("MASQUERADE")));
    }

    #[tokio::test]
    async fn test_masqueraded_network_rule() {
        let h = harness().await;
        h.driver
            .create_network(
                "net1",
                &net_options(
                    "docker0",
                    "172.17.0.1/16",
                    vec![NetworkOption::EnableIpMasquerade(true)],
                ),
            )
            .await
            .unwrap();

        assert!(h
            .backend
            .rules(IpVersion::V4, Table::Nat, "POSTROUTING")
            .contains(&"-s 172.17.0.0/16 ! -o docker0 -j MASQUERADE".to_string()));
    }

    #[tokio::test]
    async fn test_snat_to_host_ip() {
        let h = harness().await;
        h.driver
            .create_network(
                "net1",
                &net_options(
                    "docker0",
                    "172.17.0.1/16",
                    vec![
                        NetworkOption::EnableIpMasquerade(true),
                        NetworkOption::HostBindingIpv4("192.0.2.2".parse().unwrap()),
                    ],
                ),
            )
            .await
            .unwrap();

        let rules = h.backend.rules(IpVersion::V4, Table::Nat, "POSTROUTING");
        assert!(rules
            .contains(&"-s 172.17.0.0/16 ! -o docker0 -j SNAT --to-source 192.0.2.2".to_string()));
        assert!(!rules.iter().any(|r| r.contains("MASQUERADE")));
    }

    #[tokio::test]
    async fn test_port_publish_and_restart_reinstalls_same_port() {
        let store = Arc::new(MemStore::new());
        let h = harness_with_store(store.clone()).await;
        h.driver
            .create_network("net1", &net_options("docker0", "172.17.0.1/16", vec![]))
            .await
            .unwrap();

        let mut epinfo = EndpointInfo::default();
        h.driver
            .create_endpoint(
                "net1",
                "ep1",
                &mut epinfo,
                &[port_map_option((8000, 8009), 80)],
            )
            .await
            .unwrap();

        let oper = h.driver.endpoint_oper_info("net1", "ep1").await.unwrap();
        let mapping = oper.get("PortMapping").expect("mapping must be reported");
        let host_port: u16 = mapping
            .split("->")
            .next()
            .and_then(|s| s.rsplit(':').next())
            .and_then(|s| s.parse().ok())
            .expect("mapping has the host port");
        assert!((8000..=8009).contains(&host_port));
        let rules_before = h.backend.rules(IpVersion::V4, Table::Nat, DOCKER_CHAIN);
        assert!(rules_before.iter().any(|r| r.contains(&format!("--dport {host_port} "))));

        // Fresh process: new kernel, new firewall, same store.
        let h2 = harness_with_store(store.clone()).await;
        h2.driver.restore().await.unwrap();

        let rules_after = h2.backend.rules(IpVersion::V4, Table::Nat, DOCKER_CHAIN);
        assert_eq!(rules_before, rules_after);
        let oper = h2.driver.endpoint_oper_info("net1", "ep1").await.unwrap();
        assert_eq!(oper.get("PortMapping"), Some(mapping));
    }

    #[tokio::test]
    async fn test_conflicting_bridge_name_rejected() {
        let h = harness().await;
        h.driver
            .create_network("net1", &net_options("br0", "172.18.0.1/16", vec![]))
            .await
            .unwrap();

        let err = h
            .driver
            .create_network("net2", &net_options("br0", "172.19.0.1/16", vec![]))
            .await
            .unwrap_err();
        assert!(matches!(err, DriverError::Conflict(_)));
        // The loser leaves no state at all.
        assert_eq!(h.store.keys(), vec!["bridge/net1".to_string()]);
        assert!(h.driver.network("net2").await.is_err());
    }

    #[tokio::test]
    async fn test_overlapping_subnet_rejected() {
        let h = harness().await;
        h.driver
            .create_network("net1", &net_options("br0", "10.10.0.1/16", vec![]))
            .await
            .unwrap();
        let err = h
            .driver
            .create_network("net2", &net_options("br1", "10.10.5.1/24", vec![]))
            .await
            .unwrap_err();
        assert!(matches!(err, DriverError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_concurrent_create_of_overlapping_networks() {
        let h = harness().await;
        let opts_a = net_options("br0", "10.10.0.1/16", vec![]);
        let opts_b = net_options("br1", "10.10.0.1/16", vec![]);
        let a = h.driver.create_network("net1", &opts_a);
        let b = h.driver.create_network("net2", &opts_b);
        let (ra, rb) = tokio::join!(a, b);
        assert_ne!(ra.is_ok(), rb.is_ok(), "exactly one create may win");
    }

    #[tokio::test]
    async fn test_live_restore_purges_stale_endpoints() {
        let store = Arc::new(MemStore::new());
        let record = EndpointRecord {
            id: "ghost".to_string(),
            network_id: "gone".to_string(),
            src_name: "veth0000001".to_string(),
            dst_name: "veth0000002".to_string(),
            mac: "02:42:ac:11:00:02".to_string(),
            addr_v4: "172.30.0.2/16".parse().unwrap(),
            addr_v6: None,
            exposed_ports: vec![],
            requested_ports: vec![],
            port_mapping: vec![PortBinding {
                proto: Proto::Tcp,
                ip: Some("172.30.0.2".parse().unwrap()),
                port: 80,
                host_ip: Some("0.0.0.0".parse().unwrap()),
                host_port: 8080,
                host_port_end: 8080,
            }],
        };
        store
            .put_atomic(
                &endpoint_key("ghost"),
                serde_json::to_value(&record).unwrap(),
                None,
            )
            .await
            .unwrap();

        let h = harness_with_store(store.clone()).await;
        h.driver.restore().await.unwrap();

        // Record gone, no rules installed for it.
        assert!(store.keys().is_empty());
        assert!(h
            .backend
            .rules(IpVersion::V4, Table::Nat, DOCKER_CHAIN)
            .is_empty());
    }

    #[tokio::test]
    async fn test_delete_network_rejected_while_endpoints_exist() {
        let h = harness().await;
        h.driver
            .create_network("net1", &net_options("docker0", "172.17.0.1/16", vec![]))
            .await
            .unwrap();
        let mut epinfo = EndpointInfo::default();
        h.driver
            .create_endpoint("net1", "ep1", &mut epinfo, &[])
            .await
            .unwrap();

        let err = h.driver.delete_network("net1").await.unwrap_err();
        assert!(matches!(err, DriverError::Conflict(_)));
        // Rejection made no mutations.
        assert!(h.kernel.has_link("docker0"));
        assert!(h.driver.network("net1").await.is_ok());

        h.driver.delete_endpoint("net1", "ep1").await.unwrap();
        h.driver.delete_network("net1").await.unwrap();
        assert!(!h.kernel.has_link("docker0"));
        assert!(h.store.keys().is_empty());
    }

    #[tokio::test]
    async fn test_endpoint_addresses_avoid_bridge_and_gateway() {
        let h = harness().await;
        h.driver
            .create_network(
                "net1",
                &net_options(
                    "docker0",
                    "172.17.0.1/29",
                    vec![NetworkOption::DefaultGatewayV4("172.17.0.2".parse().unwrap())],
                ),
            )
            .await
            .unwrap();

        let prefix: IpNetwork = "172.17.0.0/29".parse().unwrap();
        for i in 0..4 {
            let mut epinfo = EndpointInfo::default();
            h.driver
                .create_endpoint("net1", &format!("ep{i}"), &mut epinfo, &[])
                .await
                .unwrap();
            let addr = epinfo.iface.unwrap().addr_v4.ip();
            assert!(prefix.contains(addr.into()));
            assert_ne!(addr.to_string(), "172.17.0.1", "bridge IP is reserved");
            assert_ne!(addr.to_string(), "172.17.0.2", "gateway is reserved");
        }
        // /29 leaves .3 to .6 for endpoints; a fifth must fail exhausted.
        let mut epinfo = EndpointInfo::default();
        let err = h
            .driver
            .create_endpoint("net1", "ep4", &mut epinfo, &[])
            .await
            .unwrap_err();
        assert!(matches!(err, DriverError::Exhausted(_)));
    }

    #[tokio::test]
    async fn test_duplicate_endpoint_and_prepopulated_iface_rejected() {
        let h = harness().await;
        h.driver
            .create_network("net1", &net_options("docker0", "172.17.0.1/16", vec![]))
            .await
            .unwrap();

        let mut epinfo = EndpointInfo::default();
        h.driver
            .create_endpoint("net1", "ep1", &mut epinfo, &[])
            .await
            .unwrap();
        let populated = epinfo.clone();

        let mut fresh = EndpointInfo::default();
        assert!(matches!(
            h.driver
                .create_endpoint("net1", "ep1", &mut fresh, &[])
                .await
                .unwrap_err(),
            DriverError::Exists(_)
        ));
        let mut reused = populated;
        assert!(matches!(
            h.driver
                .create_endpoint("net1", "ep2", &mut reused, &[])
                .await
                .unwrap_err(),
            DriverError::InvalidArgument(_)
        ));
    }

    #[tokio::test]
    async fn test_failed_endpoint_create_leaves_nothing() {
        let h = harness().await;
        h.driver
            .create_network("net1", &net_options("docker0", "172.17.0.1/16", vec![]))
            .await
            .unwrap();

        // Occupy the single requested host port so the mapping must fail.
        let mut epinfo = EndpointInfo::default();
        h.driver
            .create_endpoint(
                "net1",
                "ep1",
                &mut epinfo,
                &[port_map_option((8080, 8080), 80)],
            )
            .await
            .unwrap();

        let links_before = h.kernel.link_names();
        let mut epinfo2 = EndpointInfo::default();
        let err = h
            .driver
            .create_endpoint(
                "net1",
                "ep2",
                &mut epinfo2,
                &[port_map_option((8080, 8080), 80)],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DriverError::Firewall(_)));
        assert!(epinfo2.iface.is_none());
        // No veth left behind, no record persisted.
        assert_eq!(h.kernel.link_names(), links_before);
        assert!(!h.store.keys().contains(&endpoint_key("ep2")));
        // The released address is immediately reusable.
        let mut epinfo3 = EndpointInfo::default();
        h.driver
            .create_endpoint("net1", "ep3", &mut epinfo3, &[])
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_join_supplies_gateway_and_leave_removes_links() {
        let h = harness().await;
        h.driver
            .create_network(
                "net1",
                &net_options("docker0", "172.17.0.1/16", vec![]),
            )
            .await
            .unwrap();

        let mut parent_info = EndpointInfo::default();
        let exposed = serde_json::json!([{"Proto": "tcp", "Port": 5432}]);
        let exposed_opt = EndpointOption::parse(crate::config::OPT_EP_EXPOSED_PORTS, &exposed)
            .unwrap()
            .into_iter()
            .next()
            .unwrap();
        h.driver
            .create_endpoint("net1", "db", &mut parent_info, &[exposed_opt])
            .await
            .unwrap();
        let mut child_info = EndpointInfo::default();
        h.driver
            .create_endpoint("net1", "web", &mut child_info, &[])
            .await
            .unwrap();

        let mut join_info = JoinInfo::default();
        h.driver
            .join(
                "net1",
                "web",
                "/var/run/netns/web",
                &mut join_info,
                &[JoinOption::ParentEndpoints(vec!["db".to_string()])],
            )
            .await
            .unwrap();

        assert_eq!(join_info.gateway_v4, Some("172.17.0.1".parse().unwrap()));
        assert_eq!(join_info.iface_name_prefix, "eth");
        let docker_rules = h.backend.rules(IpVersion::V4, Table::Filter, DOCKER_CHAIN);
        assert!(docker_rules.iter().any(|r| r.contains("--dport 5432")));
        assert!(docker_rules.iter().any(|r| r.contains("--sport 5432")));

        h.driver.leave("net1", "web").await.unwrap();
        let docker_rules = h.backend.rules(IpVersion::V4, Table::Filter, DOCKER_CHAIN);
        assert!(!docker_rules.iter().any(|r| r.contains("5432")));
    }

    #[tokio::test]
    async fn test_reload_hook_restores_flushed_rules() {
        let h = harness().await;
        h.driver
            .create_network(
                "net1",
                &net_options(
                    "docker0",
                    "172.17.0.1/16",
                    vec![NetworkOption::EnableIpMasquerade(true)],
                ),
            )
            .await
            .unwrap();
        let mut epinfo = EndpointInfo::default();
        h.driver
            .create_endpoint(
                "net1",
                "ep1",
                &mut epinfo,
                &[port_map_option((8080, 8080), 80)],
            )
            .await
            .unwrap();

        let nat_before = h.backend.rules(IpVersion::V4, Table::Nat, "POSTROUTING");
        let dnat_before = h.backend.rules(IpVersion::V4, Table::Nat, DOCKER_CHAIN);

        h.backend.simulate_external_flush();
        assert!(h.backend.rules(IpVersion::V4, Table::Nat, DOCKER_CHAIN).is_empty());

        h.driver.reload_hook().fire().await;

        assert_eq!(
            h.backend.rules(IpVersion::V4, Table::Nat, "POSTROUTING"),
            nat_before
        );
        assert_eq!(
            h.backend.rules(IpVersion::V4, Table::Nat, DOCKER_CHAIN),
            dnat_before
        );
    }

    #[tokio::test]
    async fn test_isolated_gateway_mode_withholds_gateway() {
        let h = harness().await;
        h.driver
            .create_network(
                "net1",
                &net_options(
                    "docker0",
                    "172.17.0.1/16",
                    vec![NetworkOption::GatewayModeV4(GatewayMode::Isolated)],
                ),
            )
            .await
            .unwrap();
        let mut epinfo = EndpointInfo::default();
        h.driver
            .create_endpoint("net1", "ep1", &mut epinfo, &[])
            .await
            .unwrap();
        let mut join_info = JoinInfo::default();
        h.driver
            .join("net1", "ep1", "/var/run/netns/x", &mut join_info, &[])
            .await
            .unwrap();
        assert_eq!(join_info.gateway_v4, None);
    }

    #[tokio::test]
    async fn test_ipv6_endpoint_gets_eui64_address() {
        let h = harness().await;
        h.driver
            .create_network(
                "net1",
                &net_options(
                    "docker0",
                    "172.17.0.1/16",
                    vec![
                        NetworkOption::EnableIpv6(true),
                        NetworkOption::AddressV6("fd00:1::1/64".parse().unwrap()),
                    ],
                ),
            )
            .await
            .unwrap();
        let mac = "02:42:ac:11:00:02".parse().unwrap();
        let mac_opt = EndpointOption::MacAddress(mac);
        let mut epinfo = EndpointInfo::default();
        h.driver
            .create_endpoint("net1", "ep1", &mut epinfo, &[mac_opt])
            .await
            .unwrap();
        let v6 = epinfo.iface.unwrap().addr_v6.expect("v6 address expected");
        assert_eq!(
            v6.ip(),
            libipam::eui64_address("fd00:1::/64".parse().unwrap(), mac).unwrap()
        );
    }

    #[tokio::test]
    async fn test_exposed_ports_in_oper_info() {
        let h = harness().await;
        h.driver
            .create_network("net1", &net_options("docker0", "172.17.0.1/16", vec![]))
            .await
            .unwrap();
        let exposed = serde_json::json!([{"Proto": "udp", "Port": 53}]);
        let opt = EndpointOption::parse(crate::config::OPT_EP_EXPOSED_PORTS, &exposed)
            .unwrap()
            .into_iter()
            .next()
            .unwrap();
        let mut epinfo = EndpointInfo::default();
        h.driver
            .create_endpoint("net1", "ep1", &mut epinfo, &[opt])
            .await
            .unwrap();
        let oper = h.driver.endpoint_oper_info("net1", "ep1").await.unwrap();
        assert_eq!(oper.get("ExposedPorts").map(String::as_str), Some("53/udp"));
    }
}
