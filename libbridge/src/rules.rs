use ipnetwork::IpNetwork;
use libfirewall::portmapper::DOCKER_CHAIN;
use libfirewall::{FirewallError, IpVersion, Rule, RuleBackend, Table};
use std::net::IpAddr;

use crate::config::{GatewayMode, NetworkConfiguration, TransportPort};

pub const DOCKER_FORWARD_CHAIN: &str = "DOCKER-FORWARD";
pub const ISOLATION_STAGE_1: &str = "DOCKER-ISOLATION-STAGE-1";
pub const ISOLATION_STAGE_2: &str = "DOCKER-ISOLATION-STAGE-2";

/// Whether a rule is appended or inserted at the head of its chain.
/// Isolation and jump rules go first so they win over accepts that other
/// software may have planted in the builtin chains.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    Append,
    InsertHead,
}

#[derive(Debug, Clone)]
pub struct PlacedRule {
    pub rule: Rule,
    pub placement: Placement,
}

fn append(rule: Rule) -> PlacedRule {
    PlacedRule {
        rule,
        placement: Placement::Append,
    }
}

fn insert_head(rule: Rule) -> PlacedRule {
    PlacedRule {
        rule,
        placement: Placement::InsertHead,
    }
}

/// The user-defined chains of the skeleton, shared by every network.
pub fn user_chains() -> Vec<(Table, &'static str)> {
    vec![
        (Table::Filter, DOCKER_CHAIN),
        (Table::Filter, DOCKER_FORWARD_CHAIN),
        (Table::Filter, ISOLATION_STAGE_1),
        (Table::Filter, ISOLATION_STAGE_2),
        (Table::Nat, DOCKER_CHAIN),
    ]
}

/// Process-wide jump rules from the builtin chains into ours. Installed
/// idempotently by every network, never torn down per network.
pub fn global_rules(ipv: IpVersion) -> Vec<PlacedRule> {
    let loopback = match ipv {
        IpVersion::V4 => "127.0.0.0/8",
        IpVersion::V6 => "::1/128",
    };
    vec![
        insert_head(Rule::new(
            ipv,
            Table::Filter,
            "FORWARD",
            ["-j", DOCKER_FORWARD_CHAIN],
        )),
        insert_head(Rule::new(
            ipv,
            Table::Filter,
            DOCKER_FORWARD_CHAIN,
            ["-j", ISOLATION_STAGE_1],
        )),
        append(Rule::new(
            ipv,
            Table::Nat,
            "PREROUTING",
            ["-m", "addrtype", "--dst-type", "LOCAL", "-j", DOCKER_CHAIN],
        )),
        append(Rule::new(
            ipv,
            Table::Nat,
            "OUTPUT",
            [
                "!",
                "-d",
                loopback,
                "-m",
                "addrtype",
                "--dst-type",
                "LOCAL",
                "-j",
                DOCKER_CHAIN,
            ],
        )),
    ]
}

/// The declarative per-network rule set: ICC policy, masquerade/SNAT,
/// internal isolation and cross-bridge isolation for one address family.
fn family_rules(cfg: &NetworkConfiguration, ipv: IpVersion, prefix: IpNetwork) -> Vec<PlacedRule> {
    let br = cfg.bridge_name.as_str();
    let prefix_str = prefix.to_string();
    let mut rules = Vec::new();

    // Established return traffic and the per-port accepts of published
    // ports.
    rules.push(append(Rule::new(
        ipv,
        Table::Filter,
        DOCKER_FORWARD_CHAIN,
        [
            "-o",
            br,
            "-m",
            "conntrack",
            "--ctstate",
            "RELATED,ESTABLISHED",
            "-j",
            "ACCEPT",
        ],
    )));
    rules.push(append(Rule::new(
        ipv,
        Table::Filter,
        DOCKER_FORWARD_CHAIN,
        ["-o", br, "-j", DOCKER_CHAIN],
    )));
    rules.push(append(Rule::new(
        ipv,
        Table::Filter,
        DOCKER_FORWARD_CHAIN,
        ["-i", br, "!", "-o", br, "-j", "ACCEPT"],
    )));

    // ICC policy for traffic turning around on the same bridge.
    let icc_verdict = if cfg.enable_icc { "ACCEPT" } else { "DROP" };
    rules.push(append(Rule::new(
        ipv,
        Table::Filter,
        DOCKER_FORWARD_CHAIN,
        ["-i", br, "-o", br, "-j", icc_verdict],
    )));

    let gateway_mode = match ipv {
        IpVersion::V4 => cfg.gateway_mode_v4,
        IpVersion::V6 => cfg.gateway_mode_v6,
    };

    if cfg.enable_ip_masquerade
        && !cfg.internal
        && gateway_mode == GatewayMode::Nat
    {
        let snat_source: Option<IpAddr> = match ipv {
            IpVersion::V4 => cfg.host_binding_ipv4.map(IpAddr::V4),
            IpVersion::V6 => cfg.host_binding_ipv6.map(IpAddr::V6),
        };
        let rule = match snat_source {
            Some(source) if !source.is_unspecified() => Rule::new(
                ipv,
                Table::Nat,
                "POSTROUTING",
                [
                    "-s",
                    prefix_str.as_str(),
                    "!",
                    "-o",
                    br,
                    "-j",
                    "SNAT",
                    "--to-source",
                    source.to_string().as_str(),
                ],
            ),
            _ => Rule::new(
                ipv,
                Table::Nat,
                "POSTROUTING",
                ["-s", prefix_str.as_str(), "!", "-o", br, "-j", "MASQUERADE"],
            ),
        };
        rules.push(append(rule));
    }

    if cfg.internal {
        // Nothing in or out except the bridge subnet itself.
        rules.push(insert_head(Rule::new(
            ipv,
            Table::Filter,
            ISOLATION_STAGE_1,
            ["!", "-s", prefix_str.as_str(), "-o", br, "-j", "DROP"],
        )));
        rules.push(insert_head(Rule::new(
            ipv,
            Table::Filter,
            ISOLATION_STAGE_1,
            ["!", "-d", prefix_str.as_str(), "-i", br, "-j", "DROP"],
        )));
    } else {
        // Two-stage isolation towards other bridges: stage 1 matches
        // traffic leaving this bridge, stage 2 drops it when it would
        // enter a different one.
        rules.push(insert_head(Rule::new(
            ipv,
            Table::Filter,
            ISOLATION_STAGE_1,
            ["-i", br, "!", "-o", br, "-j", ISOLATION_STAGE_2],
        )));
        rules.push(insert_head(Rule::new(
            ipv,
            Table::Filter,
            ISOLATION_STAGE_2,
            ["-o", br, "-j", "DROP"],
        )));
    }

    rules
}

/// Per-network rules over both enabled address families.
pub fn network_rules(cfg: &NetworkConfiguration) -> Vec<PlacedRule> {
    let mut rules = family_rules(cfg, IpVersion::V4, IpNetwork::V4(cfg.v4_prefix()));
    if cfg.enable_ipv6
        && let Some(prefix) = cfg.v6_prefix()
    {
        rules.extend(family_rules(cfg, IpVersion::V6, IpNetwork::V6(prefix)));
    }
    rules
}

/// Rules for one legacy parent/child link: the peer may reach this
/// endpoint's exposed ports, replies flow back.
pub fn link_rules(
    bridge: &str,
    exposer_ip: IpAddr,
    peer_ip: IpAddr,
    exposed: &[TransportPort],
) -> Vec<Rule> {
    let mut rules = Vec::with_capacity(exposed.len() * 2);
    for tp in exposed {
        let proto = tp.proto.to_string();
        let port = tp.port.to_string();
        rules.push(Rule::new(
            IpVersion::V4,
            Table::Filter,
            DOCKER_CHAIN,
            [
                "-s",
                peer_ip.to_string().as_str(),
                "-d",
                exposer_ip.to_string().as_str(),
                "-i",
                bridge,
                "-o",
                bridge,
                "-p",
                proto.as_str(),
                "--dport",
                port.as_str(),
                "-j",
                "ACCEPT",
            ],
        ));
        rules.push(Rule::new(
            IpVersion::V4,
            Table::Filter,
            DOCKER_CHAIN,
            [
                "-s",
                exposer_ip.to_string().as_str(),
                "-d",
                peer_ip.to_string().as_str(),
                "-i",
                bridge,
                "-o",
                bridge,
                "-p",
                proto.as_str(),
                "--sport",
                port.as_str(),
                "-j",
                "ACCEPT",
            ],
        ));
    }
    rules
}

/// Ensure the skeleton chains and install `rules` with their placements.
pub fn apply_placed(
    backend: &dyn RuleBackend,
    ipv: IpVersion,
    rules: &[PlacedRule],
) -> Result<(), FirewallError> {
    for (table, chain) in user_chains() {
        backend.ensure_chain(ipv, table, chain)?;
    }
    for placed in rules {
        match placed.placement {
            Placement::Append => backend.append(&placed.rule)?,
            Placement::InsertHead => backend.insert(&placed.rule, 1)?,
        }
    }
    Ok(())
}

/// Install the full skeleton plus per-network policy for `cfg`, returning
/// the per-network rules for later teardown. Global jumps are shared and
/// not returned.
pub fn install_network_rules(
    backend: &dyn RuleBackend,
    cfg: &NetworkConfiguration,
) -> Result<Vec<Rule>, FirewallError> {
    apply_placed(backend, IpVersion::V4, &global_rules(IpVersion::V4))?;
    if cfg.enable_ipv6 {
        apply_placed(backend, IpVersion::V6, &global_rules(IpVersion::V6))?;
    }
    let placed = network_rules(cfg);
    apply_placed(backend, IpVersion::V4, &placed)?;
    Ok(placed.into_iter().map(|p| p.rule).collect())
}

/// Best-effort removal of a network's rules on deletion.
pub fn remove_network_rules(backend: &dyn RuleBackend, rules: &[Rule]) {
    for rule in rules.iter().rev() {
        if let Err(e) = backend.delete_if_exists(rule) {
            log::warn!("failed to remove {rule}: {e}");
        }
    }
}
