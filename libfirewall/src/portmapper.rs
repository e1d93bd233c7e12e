use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::backend::RuleBackend;
use crate::error::FirewallError;
use crate::portalloc::PortAllocator;
use crate::proxy::{ProxyHandle, spawn_proxy};
use crate::rule::{IpVersion, Rule, Table};

/// nat table chain holding per-port DNAT rules; the filter table chain of
/// the same name holds the matching per-port accepts.
pub const DOCKER_CHAIN: &str = "DOCKER";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Proto {
    Tcp,
    Udp,
    Sctp,
}

impl fmt::Display for Proto {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Proto::Tcp => "tcp",
            Proto::Udp => "udp",
            Proto::Sctp => "sctp",
        })
    }
}

impl FromStr for Proto {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Proto::Tcp),
            "udp" => Ok(Proto::Udp),
            "sctp" => Ok(Proto::Sctp),
            other => Err(format!("unknown protocol {other:?}")),
        }
    }
}

/// One requested (and, once allocated, effective) port binding.
///
/// The field names are the persisted wire format and must not drift: after
/// a restart the mapping is rebuilt from exactly these. `HostPort` 0 asks
/// for an ephemeral port; `HostPortEnd` > `HostPort` asks for any port in
/// the range. Once allocated both carry the concrete port, so a restart
/// never re-runs range selection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortBinding {
    #[serde(rename = "Proto")]
    pub proto: Proto,
    #[serde(rename = "IP", default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<IpAddr>,
    #[serde(rename = "Port")]
    pub port: u16,
    #[serde(rename = "HostIP", default, skip_serializing_if = "Option::is_none")]
    pub host_ip: Option<IpAddr>,
    #[serde(rename = "HostPort", default)]
    pub host_port: u16,
    #[serde(rename = "HostPortEnd", default)]
    pub host_port_end: u16,
}

impl PortBinding {
    fn requested_range(&self) -> (u16, u16) {
        if self.host_port == 0 {
            (0, 0)
        } else {
            (self.host_port, self.host_port_end.max(self.host_port))
        }
    }
}

/// Per-network knobs the mapper needs; derived from the network
/// configuration at create time.
#[derive(Debug, Clone)]
pub struct PortMapperConfig {
    pub bridge_name: String,
    pub host_binding_v4: Option<Ipv4Addr>,
    pub host_binding_v6: Option<Ipv6Addr>,
    pub userland_proxy: bool,
    pub proxy_path: Option<PathBuf>,
    /// Mirrored-loopback environments additionally need raw-table accepts
    /// for published ports.
    pub mirrored_loopback: bool,
}

struct ActiveMapping {
    binding: PortBinding,
    rules: Vec<Rule>,
    proxy: Option<ProxyHandle>,
}

/// Turns requested bindings into allocated host ports plus installed rules,
/// and keeps enough state to undo them per endpoint.
pub struct PortMapper {
    cfg: PortMapperConfig,
    backend: Arc<dyn RuleBackend>,
    ports: Arc<PortAllocator>,
    active: Mutex<HashMap<String, Vec<ActiveMapping>>>,
}

impl PortMapper {
    pub fn new(
        cfg: PortMapperConfig,
        backend: Arc<dyn RuleBackend>,
        ports: Arc<PortAllocator>,
    ) -> Self {
        PortMapper {
            cfg,
            backend,
            ports,
            active: Mutex::new(HashMap::new()),
        }
    }

    /// Allocate and install every binding in `requests` for endpoint `eid`.
    ///
    /// Either the whole list goes in or none of it: a failure rolls back
    /// the rules, ports and proxies already committed by this call.
    pub fn map_ports(
        &self,
        eid: &str,
        requests: &[PortBinding],
        container_v4: Ipv4Addr,
        container_v6: Option<Ipv6Addr>,
    ) -> Result<Vec<PortBinding>, FirewallError> {
        let mut done: Vec<ActiveMapping> = Vec::with_capacity(requests.len());

        for request in requests {
            let result = self.map_one(request, container_v4, container_v6, None);
            match result {
                Ok(mapping) => done.push(mapping),
                Err(e) => {
                    self.rollback(&mut done);
                    return Err(e);
                }
            }
        }

        let effective = done.iter().map(|m| m.binding.clone()).collect();
        self.active
            .lock()
            .unwrap()
            .entry(eid.to_string())
            .or_default()
            .extend(done);
        Ok(effective)
    }

    /// Reinstall persisted mappings after a restart. The recorded host port
    /// is claimed verbatim; the originally requested range is gone and must
    /// not be re-run.
    pub fn restore(
        &self,
        eid: &str,
        bindings: &[PortBinding],
        container_v4: Ipv4Addr,
        container_v6: Option<Ipv6Addr>,
    ) -> Result<(), FirewallError> {
        let mut done: Vec<ActiveMapping> = Vec::with_capacity(bindings.len());
        for binding in bindings {
            match self.map_one(binding, container_v4, container_v6, Some(binding.host_port)) {
                Ok(mapping) => done.push(mapping),
                Err(e) => {
                    self.rollback(&mut done);
                    return Err(e);
                }
            }
        }
        self.active
            .lock()
            .unwrap()
            .entry(eid.to_string())
            .or_default()
            .extend(done);
        Ok(())
    }

    /// Undo every mapping held by `eid`. Teardown keeps going past
    /// individual failures.
    pub fn unmap_all(&self, eid: &str) {
        let Some(mut mappings) = self.active.lock().unwrap().remove(eid) else {
            return;
        };
        self.rollback(&mut mappings);
    }

    /// Effective bindings currently held by `eid`.
    pub fn mapped_ports(&self, eid: &str) -> Vec<PortBinding> {
        self.active
            .lock()
            .unwrap()
            .get(eid)
            .map(|ms| ms.iter().map(|m| m.binding.clone()).collect())
            .unwrap_or_default()
    }

    /// Declarative rule set for every active mapping; the reload
    /// reconciliation path re-applies exactly this.
    pub fn active_rules(&self) -> Vec<Rule> {
        self.active
            .lock()
            .unwrap()
            .values()
            .flatten()
            .flat_map(|m| m.rules.iter().cloned())
            .collect()
    }

    fn map_one(
        &self,
        request: &PortBinding,
        container_v4: Ipv4Addr,
        container_v6: Option<Ipv6Addr>,
        exact_port: Option<u16>,
    ) -> Result<ActiveMapping, FirewallError> {
        let host_ip = self.select_host_ip(request, container_v6.is_some());
        let container_ip = match host_ip {
            IpAddr::V4(_) => IpAddr::V4(container_v4),
            IpAddr::V6(_) => IpAddr::V6(container_v6.ok_or(FirewallError::MissingV6Address)?),
        };

        let host_port = match exact_port {
            Some(port) => {
                self.ports.acquire(host_ip, request.proto, port)?;
                port
            }
            None => self
                .ports
                .allocate(host_ip, request.proto, request.requested_range())?,
        };

        let binding = PortBinding {
            proto: request.proto,
            ip: Some(container_ip),
            port: request.port,
            host_ip: Some(host_ip),
            host_port,
            host_port_end: host_port,
        };

        let rules = binding_rules(&self.cfg, &binding, container_ip);
        let mut installed: Vec<Rule> = Vec::with_capacity(rules.len());
        for rule in &rules {
            let applied = self
                .backend
                .ensure_chain(rule.ipv, rule.table, &rule.chain)
                .and_then(|_| self.backend.append(rule));
            if let Err(e) = applied {
                self.undo_partial(&installed, host_ip, request.proto, host_port);
                return Err(e);
            }
            installed.push(rule.clone());
        }

        let proxy = if self.cfg.userland_proxy {
            let path = self
                .cfg
                .proxy_path
                .clone()
                .unwrap_or_else(|| PathBuf::from("docker-proxy"));
            match spawn_proxy(
                &path,
                binding.proto,
                host_ip,
                host_port,
                container_ip,
                binding.port,
            ) {
                Ok(handle) => Some(handle),
                Err(e) => {
                    self.undo_partial(&installed, host_ip, request.proto, host_port);
                    return Err(e);
                }
            }
        } else {
            None
        };

        debug!(
            "mapped {}/{}:{} -> {}:{}",
            binding.proto, host_ip, host_port, container_ip, binding.port
        );
        Ok(ActiveMapping {
            binding,
            rules: installed,
            proxy,
        })
    }

    /// The binding's explicit IP wins, then the network's default bind IP,
    /// then the v4 wildcard.
    fn select_host_ip(&self, request: &PortBinding, has_v6: bool) -> IpAddr {
        if let Some(ip) = request.host_ip {
            return ip;
        }
        if let Some(ip) = self.cfg.host_binding_v4
            && !ip.is_unspecified()
        {
            return IpAddr::V4(ip);
        }
        if has_v6
            && let Some(ip) = self.cfg.host_binding_v6
            && !ip.is_unspecified()
        {
            return IpAddr::V6(ip);
        }
        IpAddr::V4(Ipv4Addr::UNSPECIFIED)
    }

    fn undo_partial(&self, installed: &[Rule], host_ip: IpAddr, proto: Proto, host_port: u16) {
        for rule in installed.iter().rev() {
            if let Err(e) = self.backend.delete_if_exists(rule) {
                warn!("rollback of {rule} failed: {e}");
            }
        }
        self.ports.release(host_ip, proto, host_port);
    }

    fn rollback(&self, mappings: &mut Vec<ActiveMapping>) {
        while let Some(mapping) = mappings.pop() {
            if let Some(proxy) = mapping.proxy {
                proxy.stop();
            }
            for rule in mapping.rules.iter().rev() {
                if let Err(e) = self.backend.delete_if_exists(rule) {
                    warn!("failed to remove {rule}: {e}");
                }
            }
            if let (Some(host_ip), proto, port) = (
                mapping.binding.host_ip,
                mapping.binding.proto,
                mapping.binding.host_port,
            ) {
                self.ports.release(host_ip, proto, port);
            }
        }
    }
}

/// The rule set implementing one effective binding.
///
/// Kept pure so the composition is checkable without a backend: DNAT in the
/// nat DOCKER chain, hairpin MASQUERADE so the container can reach its own
/// published port through the host address, a per-port forward accept, and
/// the raw-table accept on mirrored-loopback hosts.
pub fn binding_rules(cfg: &PortMapperConfig, binding: &PortBinding, container: IpAddr) -> Vec<Rule> {
    let ipv = match container {
        IpAddr::V4(_) => IpVersion::V4,
        IpAddr::V6(_) => IpVersion::V6,
    };
    let host_width = match container {
        IpAddr::V4(_) => 32,
        IpAddr::V6(_) => 128,
    };
    let proto = binding.proto.to_string();
    let host_port = binding.host_port.to_string();
    let container_port = binding.port.to_string();
    let dnat_target = match container {
        IpAddr::V4(ip) => format!("{}:{}", ip, binding.port),
        IpAddr::V6(ip) => format!("[{}]:{}", ip, binding.port),
    };

    let mut dnat_args: Vec<String> = Vec::new();
    if let Some(host_ip) = binding.host_ip
        && !host_ip.is_unspecified()
    {
        dnat_args.extend(["-d".to_string(), format!("{host_ip}/{host_width}")]);
    }
    let container_net = format!("{container}/{host_width}");
    dnat_args.extend(
        [
            "!",
            "-i",
            cfg.bridge_name.as_str(),
            "-p",
            proto.as_str(),
            "--dport",
            host_port.as_str(),
            "-j",
            "DNAT",
            "--to-destination",
            dnat_target.as_str(),
        ]
        .map(str::to_string),
    );

    let mut rules = vec![
        Rule::new(ipv, Table::Nat, DOCKER_CHAIN, dnat_args),
        Rule::new(
            ipv,
            Table::Nat,
            "POSTROUTING",
            [
                "-s",
                container_net.as_str(),
                "-d",
                container_net.as_str(),
                "-p",
                proto.as_str(),
                "--dport",
                container_port.as_str(),
                "-j",
                "MASQUERADE",
            ]
            .map(str::to_string),
        ),
        Rule::new(
            ipv,
            Table::Filter,
            DOCKER_CHAIN,
            [
                "-d",
                container_net.as_str(),
                "!",
                "-i",
                cfg.bridge_name.as_str(),
                "-o",
                cfg.bridge_name.as_str(),
                "-p",
                proto.as_str(),
                "--dport",
                container_port.as_str(),
                "-j",
                "ACCEPT",
            ]
            .map(str::to_string),
        ),
    ];

    if cfg.mirrored_loopback {
        rules.push(Rule::new(
            ipv,
            Table::Raw,
            "PREROUTING",
            [
                "-p",
                proto.as_str(),
                "--dport",
                host_port.as_str(),
                "-j",
                "ACCEPT",
            ]
            .map(str::to_string),
        ));
    }

    rules
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;

    fn mapper(backend: Arc<MemoryBackend>) -> PortMapper {
        mapper_with(backend, PortMapperConfig {
            bridge_name: "docker0".to_string(),
            host_binding_v4: None,
            host_binding_v6: None,
            userland_proxy: false,
            proxy_path: None,
            mirrored_loopback: false,
        })
    }

    fn mapper_with(backend: Arc<MemoryBackend>, cfg: PortMapperConfig) -> PortMapper {
        PortMapper::new(cfg, backend, Arc::new(PortAllocator::new()))
    }

    fn tcp_binding(container_port: u16, range: (u16, u16)) -> PortBinding {
        PortBinding {
            proto: Proto::Tcp,
            ip: None,
            port: container_port,
            host_ip: None,
            host_port: range.0,
            host_port_end: range.1,
        }
    }

    #[test]
    fn test_map_allocates_in_range_and_installs_dnat() {
        let backend = Arc::new(MemoryBackend::new());
        let mapper = mapper(backend.clone());
        let container = "172.17.0.2".parse().unwrap();

        let effective = mapper
            .map_ports("ep1", &[tcp_binding(80, (8000, 8009))], container, None)
            .unwrap();
        assert_eq!(effective.len(), 1);
        let port = effective[0].host_port;
        assert!((8000..=8009).contains(&port));
        assert_eq!(effective[0].host_port_end, port);

        let dnat = backend.rules(IpVersion::V4, Table::Nat, DOCKER_CHAIN);
        assert_eq!(
            dnat,
            vec![format!(
                "! -i docker0 -p tcp --dport {port} -j DNAT --to-destination 172.17.0.2:80"
            )]
        );
        let masq = backend.rules(IpVersion::V4, Table::Nat, "POSTROUTING");
        assert_eq!(
            masq,
            vec![
                "-s 172.17.0.2/32 -d 172.17.0.2/32 -p tcp --dport 80 -j MASQUERADE".to_string()
            ]
        );
    }

    #[test]
    fn test_explicit_host_ip_lands_in_dnat_match() {
        let backend = Arc::new(MemoryBackend::new());
        let mapper = mapper(backend.clone());
        let container = "172.17.0.2".parse().unwrap();

        let mut binding = tcp_binding(80, (8080, 8080));
        binding.host_ip = Some("192.0.2.2".parse().unwrap());
        mapper
            .map_ports("ep1", &[binding], container, None)
            .unwrap();

        let dnat = backend.rules(IpVersion::V4, Table::Nat, DOCKER_CHAIN);
        assert_eq!(
            dnat,
            vec![
                "-d 192.0.2.2/32 ! -i docker0 -p tcp --dport 8080 -j DNAT --to-destination 172.17.0.2:80"
                    .to_string()
            ]
        );
    }

    #[test]
    fn test_failure_mid_list_rolls_everything_back() {
        let backend = Arc::new(MemoryBackend::new());
        let mapper = mapper(backend.clone());
        let container = "172.17.0.2".parse().unwrap();

        // Occupy 9000 so the second binding cannot be satisfied.
        mapper
            .ports
            .acquire(IpAddr::V4(Ipv4Addr::UNSPECIFIED), Proto::Tcp, 9000)
            .unwrap();

        let err = mapper
            .map_ports(
                "ep1",
                &[tcp_binding(80, (8080, 8080)), tcp_binding(81, (9000, 9000))],
                container,
                None,
            )
            .unwrap_err();
        assert!(matches!(err, FirewallError::NoAvailablePort(_, _)));

        assert!(backend.rules(IpVersion::V4, Table::Nat, DOCKER_CHAIN).is_empty());
        assert!(backend
            .rules(IpVersion::V4, Table::Nat, "POSTROUTING")
            .is_empty());
        // 8080 was released by the rollback.
        mapper
            .ports
            .acquire(IpAddr::V4(Ipv4Addr::UNSPECIFIED), Proto::Tcp, 8080)
            .unwrap();
    }

    #[test]
    fn test_unmap_removes_rules_and_frees_port() {
        let backend = Arc::new(MemoryBackend::new());
        let mapper = mapper(backend.clone());
        let container = "172.17.0.2".parse().unwrap();

        mapper
            .map_ports("ep1", &[tcp_binding(80, (8080, 8080))], container, None)
            .unwrap();
        mapper.unmap_all("ep1");

        assert!(backend.rules(IpVersion::V4, Table::Nat, DOCKER_CHAIN).is_empty());
        assert!(mapper.mapped_ports("ep1").is_empty());
        mapper
            .ports
            .acquire(IpAddr::V4(Ipv4Addr::UNSPECIFIED), Proto::Tcp, 8080)
            .unwrap();
    }

    #[test]
    fn test_restore_reinstalls_identical_rules() {
        let backend = Arc::new(MemoryBackend::new());
        let mapper = mapper(backend.clone());
        let container: Ipv4Addr = "172.17.0.2".parse().unwrap();

        let effective = mapper
            .map_ports("ep1", &[tcp_binding(80, (8000, 8009))], container, None)
            .unwrap();
        let before = backend.rules(IpVersion::V4, Table::Nat, DOCKER_CHAIN);

        // Process restart: rules gone, mapping rebuilt from the persisted
        // effective binding.
        mapper.unmap_all("ep1");
        mapper.restore("ep1", &effective, container, None).unwrap();

        let after = backend.rules(IpVersion::V4, Table::Nat, DOCKER_CHAIN);
        assert_eq!(before, after);
        assert_eq!(mapper.mapped_ports("ep1"), effective);
    }

    #[test]
    fn test_mirrored_loopback_adds_raw_accept() {
        let backend = Arc::new(MemoryBackend::new());
        let mapper = mapper_with(backend.clone(), PortMapperConfig {
            bridge_name: "docker0".to_string(),
            host_binding_v4: None,
            host_binding_v6: None,
            userland_proxy: false,
            proxy_path: None,
            mirrored_loopback: true,
        });
        let container = "172.17.0.2".parse().unwrap();

        mapper
            .map_ports("ep1", &[tcp_binding(80, (8080, 8080))], container, None)
            .unwrap();
        assert_eq!(
            backend.rules(IpVersion::V4, Table::Raw, "PREROUTING"),
            vec!["-p tcp --dport 8080 -j ACCEPT"]
        );
    }

    #[test]
    fn test_network_default_host_binding_is_used() {
        let backend = Arc::new(MemoryBackend::new());
        let mapper = mapper_with(backend.clone(), PortMapperConfig {
            bridge_name: "docker0".to_string(),
            host_binding_v4: Some("192.0.2.7".parse().unwrap()),
            host_binding_v6: None,
            userland_proxy: false,
            proxy_path: None,
            mirrored_loopback: false,
        });
        let container = "172.17.0.2".parse().unwrap();

        let effective = mapper
            .map_ports("ep1", &[tcp_binding(80, (8080, 8080))], container, None)
            .unwrap();
        assert_eq!(effective[0].host_ip, Some("192.0.2.7".parse().unwrap()));
    }

    #[test]
    fn test_binding_serde_wire_format() {
        let binding = PortBinding {
            proto: Proto::Tcp,
            ip: Some("172.17.0.2".parse().unwrap()),
            port: 80,
            host_ip: Some("0.0.0.0".parse().unwrap()),
            host_port: 8004,
            host_port_end: 8004,
        };
        let json = serde_json::to_value(&binding).unwrap();
        assert_eq!(json["Proto"], "tcp");
        assert_eq!(json["HostPort"], 8004);
        assert_eq!(json["HostPortEnd"], 8004);
        let back: PortBinding = serde_json::from_value(json).unwrap();
        assert_eq!(back, binding);
    }
}
