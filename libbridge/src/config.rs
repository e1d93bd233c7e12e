use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use ipnetwork::{Ipv4Network, Ipv6Network};
use libfirewall::PortBinding;
use macaddr::MacAddr6;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::DriverError;

/// Name every network with an empty bridge name is normalised to. Only one
/// network may hold it.
pub const DEFAULT_BRIDGE_NAME: &str = "docker0";

pub const DEFAULT_CONTAINER_IFACE_PREFIX: &str = "eth";

const MAX_MTU: u32 = 65535;

// Well-known option keys.
pub const OPT_BRIDGE_NAME: &str = "com.docker.network.bridge.name";
pub const OPT_ENABLE_IP_MASQUERADE: &str = "com.docker.network.bridge.enable_ip_masquerade";
pub const OPT_ENABLE_ICC: &str = "com.docker.network.bridge.enable_icc";
pub const OPT_INHIBIT_IPV4: &str = "com.docker.network.bridge.inhibit_ipv4";
pub const OPT_HOST_BINDING_IPV4: &str = "com.docker.network.bridge.host_binding_ipv4";
pub const OPT_HOST_BINDING_IPV6: &str = "com.docker.network.bridge.host_binding_ipv6";
pub const OPT_GATEWAY_MODE_IPV4: &str = "com.docker.network.bridge.gateway_mode_ipv4";
pub const OPT_GATEWAY_MODE_IPV6: &str = "com.docker.network.bridge.gateway_mode_ipv6";
pub const OPT_DEFAULT_BRIDGE: &str = "com.docker.network.bridge.default_bridge";
pub const OPT_ADDRESS_IPV4: &str = "com.docker.network.bridge.address_ipv4";
pub const OPT_ADDRESS_IPV6: &str = "com.docker.network.bridge.address_ipv6";
pub const OPT_FIXED_CIDR_IPV4: &str = "com.docker.network.bridge.fixed_cidr_ipv4";
pub const OPT_FIXED_CIDR_IPV6: &str = "com.docker.network.bridge.fixed_cidr_ipv6";
pub const OPT_DEFAULT_GATEWAY_IPV4: &str = "com.docker.network.bridge.default_gateway_ipv4";
pub const OPT_DEFAULT_GATEWAY_IPV6: &str = "com.docker.network.bridge.default_gateway_ipv6";
pub const OPT_ENABLE_IPV6: &str = "com.docker.network.enable_ipv6";
pub const OPT_ENABLE_IP_TABLES: &str = "com.docker.network.bridge.enable_ip_tables";
pub const OPT_USERLAND_PROXY: &str = "com.docker.network.bridge.userland_proxy";
pub const OPT_INTERNAL: &str = "com.docker.network.internal";
pub const OPT_MTU: &str = "com.docker.network.driver.mtu";
pub const OPT_CONTAINER_IFACE_PREFIX: &str = "com.docker.network.container_iface_prefix";

pub const OPT_EP_MAC_ADDRESS: &str = "netlabel.mac_address";
pub const OPT_EP_PORT_MAP: &str = "netlabel.port_map";
pub const OPT_EP_EXPOSED_PORTS: &str = "netlabel.exposed_ports";
pub const OPT_EP_GENERIC_DATA: &str = "netlabel.generic_data";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GatewayMode {
    #[default]
    Nat,
    Routed,
    Isolated,
}

impl FromStr for GatewayMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "nat" => Ok(GatewayMode::Nat),
            "routed" => Ok(GatewayMode::Routed),
            "isolated" => Ok(GatewayMode::Isolated),
            other => Err(format!("unknown gateway mode {other:?}")),
        }
    }
}

impl fmt::Display for GatewayMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            GatewayMode::Nat => "nat",
            GatewayMode::Routed => "routed",
            GatewayMode::Isolated => "isolated",
        })
    }
}

/// One exposed transport port of an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportPort {
    #[serde(rename = "Proto")]
    pub proto: libfirewall::Proto,
    #[serde(rename = "Port")]
    pub port: u16,
}

/// Closed set of network creation options. Everything the caller may say
/// about a network is one of these; there is no pass-through for unknown
/// keys.
#[derive(Debug, Clone, PartialEq)]
pub enum NetworkOption {
    BridgeName(String),
    EnableIpMasquerade(bool),
    EnableIcc(bool),
    EnableIpTables(bool),
    EnableIpv6(bool),
    InhibitIpv4(bool),
    Internal(bool),
    DefaultBridge(bool),
    UserlandProxy(bool),
    Mtu(u32),
    AddressV4(Ipv4Network),
    AddressV6(Ipv6Network),
    FixedCidrV4(Ipv4Network),
    FixedCidrV6(Ipv6Network),
    DefaultGatewayV4(Ipv4Addr),
    DefaultGatewayV6(Ipv6Addr),
    HostBindingIpv4(Ipv4Addr),
    HostBindingIpv6(Ipv6Addr),
    GatewayModeV4(GatewayMode),
    GatewayModeV6(GatewayMode),
    ContainerIfacePrefix(String),
}

fn opt_bool(key: &str, value: &Value) -> Result<bool, DriverError> {
    match value {
        Value::Bool(b) => Ok(*b),
        Value::String(s) => s
            .parse()
            .map_err(|_| DriverError::InvalidArgument(format!("{key}: expected bool, got {s:?}"))),
        other => Err(DriverError::InvalidArgument(format!(
            "{key}: expected bool, got {other}"
        ))),
    }
}

fn opt_str<'v>(key: &str, value: &'v Value) -> Result<&'v str, DriverError> {
    value
        .as_str()
        .ok_or_else(|| DriverError::InvalidArgument(format!("{key}: expected string")))
}

fn opt_parse<T>(key: &str, value: &Value) -> Result<T, DriverError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    opt_str(key, value)?
        .parse()
        .map_err(|e| DriverError::InvalidArgument(format!("{key}: {e}")))
}

impl NetworkOption {
    /// Total parse from the well-known string keys; unknown keys are
    /// rejected, not ignored.
    pub fn parse(key: &str, value: &Value) -> Result<Self, DriverError> {
        match key {
            OPT_BRIDGE_NAME => Ok(NetworkOption::BridgeName(opt_str(key, value)?.to_string())),
            OPT_ENABLE_IP_MASQUERADE => {
                Ok(NetworkOption::EnableIpMasquerade(opt_bool(key, value)?))
            }
            OPT_ENABLE_ICC => Ok(NetworkOption::EnableIcc(opt_bool(key, value)?)),
            OPT_ENABLE_IP_TABLES => Ok(NetworkOption::EnableIpTables(opt_bool(key, value)?)),
            OPT_ENABLE_IPV6 => Ok(NetworkOption::EnableIpv6(opt_bool(key, value)?)),
            OPT_INHIBIT_IPV4 => Ok(NetworkOption::InhibitIpv4(opt_bool(key, value)?)),
            OPT_INTERNAL => Ok(NetworkOption::Internal(opt_bool(key, value)?)),
            OPT_DEFAULT_BRIDGE => Ok(NetworkOption::DefaultBridge(opt_bool(key, value)?)),
            OPT_USERLAND_PROXY => Ok(NetworkOption::UserlandProxy(opt_bool(key, value)?)),
            OPT_MTU => match value {
                Value::Number(n) => n
                    .as_u64()
                    .and_then(|n| u32::try_from(n).ok())
                    .map(NetworkOption::Mtu)
                    .ok_or_else(|| DriverError::InvalidArgument(format!("{key}: bad mtu"))),
                _ => Ok(NetworkOption::Mtu(opt_parse(key, value)?)),
            },
            OPT_ADDRESS_IPV4 => Ok(NetworkOption::AddressV4(opt_parse(key, value)?)),
            OPT_ADDRESS_IPV6 => Ok(NetworkOption::AddressV6(opt_parse(key, value)?)),
            OPT_FIXED_CIDR_IPV4 => Ok(NetworkOption::FixedCidrV4(opt_parse(key, value)?)),
            OPT_FIXED_CIDR_IPV6 => Ok(NetworkOption::FixedCidrV6(opt_parse(key, value)?)),
            OPT_DEFAULT_GATEWAY_IPV4 => {
                Ok(NetworkOption::DefaultGatewayV4(opt_parse(key, value)?))
            }
            OPT_DEFAULT_GATEWAY_IPV6 => {
                Ok(NetworkOption::DefaultGatewayV6(opt_parse(key, value)?))
            }
            OPT_HOST_BINDING_IPV4 => Ok(NetworkOption::HostBindingIpv4(opt_parse(key, value)?)),
            OPT_HOST_BINDING_IPV6 => Ok(NetworkOption::HostBindingIpv6(opt_parse(key, value)?)),
            OPT_GATEWAY_MODE_IPV4 => Ok(NetworkOption::GatewayModeV4(opt_parse(key, value)?)),
            OPT_GATEWAY_MODE_IPV6 => Ok(NetworkOption::GatewayModeV6(opt_parse(key, value)?)),
            OPT_CONTAINER_IFACE_PREFIX => Ok(NetworkOption::ContainerIfacePrefix(
                opt_str(key, value)?.to_string(),
            )),
            unknown => Err(DriverError::InvalidArgument(format!(
                "unknown network option {unknown:?}"
            ))),
        }
    }
}

/// Immutable configuration of one bridge network. The serialised form is
/// the persisted wire format; renames are deliberate and stable across
/// upgrades (the v4 host binding in particular has always been `HostIP` on
/// disk).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkConfiguration {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "BridgeName")]
    pub bridge_name: String,
    /// Bridge IPv4 address with its prefix, e.g. 172.17.0.1/16.
    #[serde(rename = "AddressIPv4")]
    pub address_v4: Ipv4Network,
    #[serde(rename = "AddressIPv6", default, skip_serializing_if = "Option::is_none")]
    pub address_v6: Option<Ipv6Network>,
    #[serde(rename = "FixedCIDR", default, skip_serializing_if = "Option::is_none")]
    pub fixed_cidr_v4: Option<Ipv4Network>,
    #[serde(rename = "FixedCIDRv6", default, skip_serializing_if = "Option::is_none")]
    pub fixed_cidr_v6: Option<Ipv6Network>,
    #[serde(
        rename = "DefaultGatewayIPv4",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub default_gateway_v4: Option<Ipv4Addr>,
    #[serde(
        rename = "DefaultGatewayIPv6",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub default_gateway_v6: Option<Ipv6Addr>,
    #[serde(rename = "Mtu", default)]
    pub mtu: u32,
    #[serde(rename = "EnableIPv6", default)]
    pub enable_ipv6: bool,
    #[serde(rename = "EnableIPMasquerade", default)]
    pub enable_ip_masquerade: bool,
    #[serde(rename = "EnableICC", default)]
    pub enable_icc: bool,
    #[serde(rename = "EnableIPTables", default)]
    pub enable_ip_tables: bool,
    #[serde(rename = "InhibitIPv4", default)]
    pub inhibit_ipv4: bool,
    #[serde(rename = "Internal", default)]
    pub internal: bool,
    #[serde(rename = "DefaultBridge", default)]
    pub default_bridge: bool,
    #[serde(rename = "UserlandProxy", default)]
    pub userland_proxy: bool,
    #[serde(rename = "HostIP", default, skip_serializing_if = "Option::is_none")]
    pub host_binding_ipv4: Option<Ipv4Addr>,
    #[serde(rename = "HostIPv6", default, skip_serializing_if = "Option::is_none")]
    pub host_binding_ipv6: Option<Ipv6Addr>,
    #[serde(rename = "GatewayModeIPv4", default)]
    pub gateway_mode_v4: GatewayMode,
    #[serde(rename = "GatewayModeIPv6", default)]
    pub gateway_mode_v6: GatewayMode,
    #[serde(rename = "ContainerIfacePrefix", default)]
    pub container_iface_prefix: String,
}

impl NetworkConfiguration {
    pub fn from_options(id: &str, options: &[NetworkOption]) -> Result<Self, DriverError> {
        let mut address_v4: Option<Ipv4Network> = None;
        let mut cfg = NetworkConfiguration {
            id: id.to_string(),
            bridge_name: String::new(),
            address_v4: Ipv4Network::new(Ipv4Addr::UNSPECIFIED, 0)
                .expect("the zero network is well formed"),
            address_v6: None,
            fixed_cidr_v4: None,
            fixed_cidr_v6: None,
            default_gateway_v4: None,
            default_gateway_v6: None,
            mtu: 0,
            enable_ipv6: false,
            enable_ip_masquerade: false,
            enable_icc: true,
            enable_ip_tables: true,
            inhibit_ipv4: false,
            internal: false,
            default_bridge: false,
            userland_proxy: false,
            host_binding_ipv4: None,
            host_binding_ipv6: None,
            gateway_mode_v4: GatewayMode::Nat,
            gateway_mode_v6: GatewayMode::Nat,
            container_iface_prefix: DEFAULT_CONTAINER_IFACE_PREFIX.to_string(),
        };

        for option in options {
            match option.clone() {
                NetworkOption::BridgeName(name) => cfg.bridge_name = name,
                NetworkOption::EnableIpMasquerade(v) => cfg.enable_ip_masquerade = v,
                NetworkOption::EnableIcc(v) => cfg.enable_icc = v,
                NetworkOption::EnableIpTables(v) => cfg.enable_ip_tables = v,
                NetworkOption::EnableIpv6(v) => cfg.enable_ipv6 = v,
                NetworkOption::InhibitIpv4(v) => cfg.inhibit_ipv4 = v,
                NetworkOption::Internal(v) => cfg.internal = v,
                NetworkOption::DefaultBridge(v) => cfg.default_bridge = v,
                NetworkOption::UserlandProxy(v) => cfg.userland_proxy = v,
                NetworkOption::Mtu(v) => cfg.mtu = v,
                NetworkOption::AddressV4(v) => address_v4 = Some(v),
                NetworkOption::AddressV6(v) => cfg.address_v6 = Some(v),
                NetworkOption::FixedCidrV4(v) => cfg.fixed_cidr_v4 = Some(v),
                NetworkOption::FixedCidrV6(v) => cfg.fixed_cidr_v6 = Some(v),
                NetworkOption::DefaultGatewayV4(v) => cfg.default_gateway_v4 = Some(v),
                NetworkOption::DefaultGatewayV6(v) => cfg.default_gateway_v6 = Some(v),
                NetworkOption::HostBindingIpv4(v) => cfg.host_binding_ipv4 = Some(v),
                NetworkOption::HostBindingIpv6(v) => cfg.host_binding_ipv6 = Some(v),
                NetworkOption::GatewayModeV4(v) => cfg.gateway_mode_v4 = v,
                NetworkOption::GatewayModeV6(v) => cfg.gateway_mode_v6 = v,
                NetworkOption::ContainerIfacePrefix(v) => cfg.container_iface_prefix = v,
            }
        }

        cfg.address_v4 = address_v4.ok_or_else(|| {
            DriverError::InvalidArgument("network requires an IPv4 bridge address".to_string())
        })?;
        if cfg.bridge_name.is_empty() {
            cfg.bridge_name = DEFAULT_BRIDGE_NAME.to_string();
        }

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), DriverError> {
        if self.mtu > MAX_MTU {
            return Err(DriverError::InvalidArgument(format!(
                "mtu {} out of range (max {MAX_MTU})",
                self.mtu
            )));
        }

        if let Some(fixed) = self.fixed_cidr_v4
            && !contains_v4(&self.v4_prefix(), &fixed)
        {
            return Err(DriverError::InvalidArgument(format!(
                "fixed-cidr {fixed} is not a subset of {}",
                self.v4_prefix()
            )));
        }

        if let Some(gw) = self.default_gateway_v4
            && !self.v4_prefix().contains(gw)
        {
            return Err(DriverError::InvalidArgument(format!(
                "default gateway {gw} is outside {}",
                self.v4_prefix()
            )));
        }

        if let Some(v6) = self.address_v6 {
            if let Some(fixed) = self.fixed_cidr_v6
                && !contains_v6(&v6_prefix_of(&v6), &fixed)
            {
                return Err(DriverError::InvalidArgument(format!(
                    "fixed-cidr-v6 {fixed} is not a subset of {}",
                    v6_prefix_of(&v6)
                )));
            }
            if let Some(gw) = self.default_gateway_v6
                && !v6_prefix_of(&v6).contains(gw)
            {
                return Err(DriverError::InvalidArgument(format!(
                    "default gateway {gw} is outside {}",
                    v6_prefix_of(&v6)
                )));
            }
        } else if self.enable_ipv6 {
            return Err(DriverError::InvalidArgument(
                "IPv6 is enabled but no IPv6 bridge address is configured".to_string(),
            ));
        }

        Ok(())
    }

    /// The bridge's IPv4 subnet (host bits stripped).
    pub fn v4_prefix(&self) -> Ipv4Network {
        Ipv4Network::new(self.address_v4.network(), self.address_v4.prefix())
            .expect("network address is always valid for its own prefix")
    }

    pub fn v6_prefix(&self) -> Option<Ipv6Network> {
        self.address_v6.as_ref().map(v6_prefix_of)
    }

    /// Gateway handed to joining sandboxes; the bridge address unless
    /// overridden.
    pub fn effective_gateway_v4(&self) -> Ipv4Addr {
        self.default_gateway_v4.unwrap_or_else(|| self.address_v4.ip())
    }

    pub fn effective_gateway_v6(&self) -> Option<Ipv6Addr> {
        self.default_gateway_v6
            .or_else(|| self.address_v6.map(|a| a.ip()))
    }

    /// Why this configuration cannot coexist with `other`, if it cannot.
    pub fn conflict_with(&self, other: &NetworkConfiguration) -> Option<String> {
        if self.bridge_name == other.bridge_name {
            return Some(format!(
                "bridge name {} already in use by network {}",
                self.bridge_name, other.id
            ));
        }
        let (a, b) = (self.v4_prefix(), other.v4_prefix());
        if a.contains(b.network()) || b.contains(a.network()) {
            return Some(format!(
                "subnet {a} overlaps with {b} of network {}",
                other.id
            ));
        }
        None
    }
}

fn contains_v4(outer: &Ipv4Network, inner: &Ipv4Network) -> bool {
    outer.contains(inner.network()) && inner.prefix() >= outer.prefix()
}

fn contains_v6(outer: &Ipv6Network, inner: &Ipv6Network) -> bool {
    outer.contains(inner.network()) && inner.prefix() >= outer.prefix()
}

fn v6_prefix_of(addr: &Ipv6Network) -> Ipv6Network {
    Ipv6Network::new(addr.network(), addr.prefix())
        .expect("network address is always valid for its own prefix")
}

/// Closed set of endpoint creation options.
#[derive(Debug, Clone, PartialEq)]
pub enum EndpointOption {
    MacAddress(MacAddr6),
    PortMap(Vec<PortBinding>),
    ExposedPorts(Vec<TransportPort>),
}

impl EndpointOption {
    pub fn parse(key: &str, value: &Value) -> Result<Vec<Self>, DriverError> {
        match key {
            OPT_EP_MAC_ADDRESS => {
                let mac: MacAddr6 = opt_parse(key, value)?;
                Ok(vec![EndpointOption::MacAddress(mac)])
            }
            OPT_EP_PORT_MAP => {
                let bindings: Vec<PortBinding> = serde_json::from_value(value.clone())
                    .map_err(|e| DriverError::InvalidArgument(format!("{key}: {e}")))?;
                Ok(vec![EndpointOption::PortMap(bindings)])
            }
            OPT_EP_EXPOSED_PORTS => {
                let ports: Vec<TransportPort> = serde_json::from_value(value.clone())
                    .map_err(|e| DriverError::InvalidArgument(format!("{key}: {e}")))?;
                Ok(vec![EndpointOption::ExposedPorts(ports)])
            }
            OPT_EP_GENERIC_DATA => {
                let map = value.as_object().ok_or_else(|| {
                    DriverError::InvalidArgument(format!("{key}: expected a map"))
                })?;
                let mut parsed = Vec::new();
                for (k, v) in map {
                    parsed.extend(EndpointOption::parse(k, v)?);
                }
                Ok(parsed)
            }
            unknown => Err(DriverError::InvalidArgument(format!(
                "unknown endpoint option {unknown:?}"
            ))),
        }
    }
}

/// Join-time connectivity options; parent/child links are the legacy ICC
/// mechanism on the default bridge.
#[derive(Debug, Clone, PartialEq)]
pub enum JoinOption {
    ParentEndpoints(Vec<String>),
    ChildEndpoints(Vec<String>),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_options() -> Vec<NetworkOption> {
        vec![
            NetworkOption::BridgeName("docker0".to_string()),
            NetworkOption::AddressV4("172.17.0.1/16".parse().unwrap()),
        ]
    }

    #[test]
    fn test_empty_bridge_name_normalises_to_default() {
        let cfg = NetworkConfiguration::from_options(
            "net1",
            &[NetworkOption::AddressV4("172.17.0.1/16".parse().unwrap())],
        )
        .unwrap();
        assert_eq!(cfg.bridge_name, DEFAULT_BRIDGE_NAME);
    }

    #[test]
    fn test_mtu_boundaries() {
        for mtu in [0u32, 1, 1500, 9000, 65535] {
            let mut opts = base_options();
            opts.push(NetworkOption::Mtu(mtu));
            NetworkConfiguration::from_options("net1", &opts)
                .unwrap_or_else(|e| panic!("mtu {mtu} should be accepted: {e}"));
        }
        let mut opts = base_options();
        opts.push(NetworkOption::Mtu(65536));
        assert!(matches!(
            NetworkConfiguration::from_options("net1", &opts).unwrap_err(),
            DriverError::InvalidArgument(_)
        ));
    }

    #[test]
    fn test_fixed_cidr_must_be_subset() {
        let mut opts = base_options();
        opts.push(NetworkOption::FixedCidrV4("172.17.5.0/24".parse().unwrap()));
        NetworkConfiguration::from_options("net1", &opts).unwrap();

        let mut opts = base_options();
        opts.push(NetworkOption::FixedCidrV4("10.11.0.0/16".parse().unwrap()));
        assert!(NetworkConfiguration::from_options("net1", &opts).is_err());
    }

    #[test]
    fn test_gateway_must_be_in_prefix() {
        let mut opts = base_options();
        opts.push(NetworkOption::DefaultGatewayV4("172.17.0.254".parse().unwrap()));
        NetworkConfiguration::from_options("net1", &opts).unwrap();

        let mut opts = base_options();
        opts.push(NetworkOption::DefaultGatewayV4("10.0.0.1".parse().unwrap()));
        assert!(NetworkConfiguration::from_options("net1", &opts).is_err());
    }

    #[test]
    fn test_enable_ipv6_requires_address() {
        let mut opts = base_options();
        opts.push(NetworkOption::EnableIpv6(true));
        assert!(NetworkConfiguration::from_options("net1", &opts).is_err());

        opts.push(NetworkOption::AddressV6("fd00::1/64".parse().unwrap()));
        NetworkConfiguration::from_options("net1", &opts).unwrap();
    }

    #[test]
    fn test_conflict_detection() {
        let a = NetworkConfiguration::from_options("a", &base_options()).unwrap();
        let b = NetworkConfiguration::from_options(
            "b",
            &[
                NetworkOption::BridgeName("br-1".to_string()),
                NetworkOption::AddressV4("172.17.128.1/17".parse().unwrap()),
            ],
        )
        .unwrap();
        // Same name conflicts.
        assert!(a.conflict_with(&a).is_some());
        // Contained subnet conflicts even with a different name.
        assert!(a.conflict_with(&b).is_some());

        let c = NetworkConfiguration::from_options(
            "c",
            &[
                NetworkOption::BridgeName("br-2".to_string()),
                NetworkOption::AddressV4("10.10.0.1/24".parse().unwrap()),
            ],
        )
        .unwrap();
        assert!(a.conflict_with(&c).is_none());
    }

    #[test]
    fn test_unknown_option_key_rejected() {
        let err = NetworkOption::parse("com.docker.network.bridge.bogus", &Value::Bool(true))
            .unwrap_err();
        assert!(matches!(err, DriverError::InvalidArgument(_)));
    }

    #[test]
    fn test_option_parse_accepts_string_bools() {
        assert_eq!(
            NetworkOption::parse(OPT_ENABLE_ICC, &Value::String("false".into())).unwrap(),
            NetworkOption::EnableIcc(false)
        );
        assert_eq!(
            NetworkOption::parse(OPT_MTU, &serde_json::json!(1500)).unwrap(),
            NetworkOption::Mtu(1500)
        );
    }

    #[test]
    fn test_config_serde_roundtrip_and_field_names() {
        let mut opts = base_options();
        opts.push(NetworkOption::HostBindingIpv4("192.0.2.2".parse().unwrap()));
        opts.push(NetworkOption::EnableIpMasquerade(true));
        let cfg = NetworkConfiguration::from_options("net1", &opts).unwrap();

        let json = serde_json::to_value(&cfg).unwrap();
        // The v4 host binding is HostIP on disk, nothing else.
        assert_eq!(json["HostIP"], "192.0.2.2");
        assert!(json.get("HostIPv4").is_none());
        assert_eq!(json["AddressIPv4"], "172.17.0.1/16");

        let back: NetworkConfiguration = serde_json::from_value(json).unwrap();
        assert_eq!(back, cfg);
    }

    #[test]
    fn test_endpoint_generic_data_flattens() {
        let value = serde_json::json!({
            "netlabel.mac_address": "02:42:ac:11:00:02",
        });
        let opts = EndpointOption::parse(OPT_EP_GENERIC_DATA, &value).unwrap();
        assert_eq!(
            opts,
            vec![EndpointOption::MacAddress(MacAddr6::new(
                0x02, 0x42, 0xac, 0x11, 0x00, 0x02
            ))]
        );
    }
}
