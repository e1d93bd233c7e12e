use std::net::IpAddr;
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use ipnetwork::IpNetwork;
use libfirewall::portmapper::PortMapper;
use libfirewall::{Rule, RuleBackend};
use libipam::HostAllocator;
use libnetlink::{KernelAdapter, LinkSpec};
use log::{debug, warn};

use crate::config::{DEFAULT_BRIDGE_NAME, GatewayMode, NetworkConfiguration};
use crate::error::DriverError;
use crate::interface::BridgeInterface;
use crate::rules;

/// Everything a setup step may touch, plus the undo stack it feeds.
pub struct SetupContext {
    pub kernel: Arc<dyn KernelAdapter>,
    pub firewall: Arc<dyn RuleBackend>,
    pub ipam: Arc<HostAllocator>,
    pub undo: Mutex<UndoStack>,
    /// Per-network rules installed by `setup_iptables`; the coordinator
    /// moves these into the network's runtime state on success.
    pub fw_rules: Mutex<Vec<Rule>>,
}

impl SetupContext {
    pub fn new(
        kernel: Arc<dyn KernelAdapter>,
        firewall: Arc<dyn RuleBackend>,
        ipam: Arc<HostAllocator>,
    ) -> Self {
        SetupContext {
            kernel,
            firewall,
            ipam,
            undo: Mutex::new(UndoStack::default()),
            fw_rules: Mutex::new(Vec::new()),
        }
    }

    fn push_undo(&self, action: UndoAction) {
        self.undo.lock().unwrap().push(action);
    }
}

/// Compensating actions, run LIFO when a pipeline fails part-way. A closed
/// enum rather than captured closures so rollback is inspectable and
/// testable on its own.
#[derive(Debug, Clone, PartialEq)]
pub enum UndoAction {
    DeleteLink { name: String },
    UnregisterPool { prefix: IpNetwork },
    ReleaseAddress { prefix: IpNetwork, addr: IpAddr },
    RemoveRules { rules: Vec<Rule> },
    UnmapPorts { endpoint: String },
}

#[derive(Debug, Default)]
pub struct UndoStack {
    actions: Vec<UndoAction>,
}

impl UndoStack {
    pub fn push(&mut self, action: UndoAction) {
        self.actions.push(action);
    }

    /// Success path: committed state must not be unwound later.
    pub fn clear(&mut self) {
        self.actions.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn actions(&self) -> &[UndoAction] {
        &self.actions
    }

    /// Run every recorded action in reverse. Failures are logged and do not
    /// stop the unwind; half of a rollback is still better than none.
    pub async fn unwind(
        &mut self,
        kernel: &dyn KernelAdapter,
        ipam: &HostAllocator,
        firewall: &dyn RuleBackend,
        portmapper: Option<&PortMapper>,
    ) {
        while let Some(action) = self.actions.pop() {
            debug!("undo: {action:?}");
            match action {
                UndoAction::DeleteLink { name } => match kernel.link_by_name(&name).await {
                    Ok(link) => {
                        if let Err(e) = kernel.link_del(&link).await {
                            warn!("undo: failed to delete link {name}: {e}");
                        }
                    }
                    Err(e) if e.is_not_found() => {}
                    Err(e) => warn!("undo: failed to look up link {name}: {e}"),
                },
                UndoAction::UnregisterPool { prefix } => ipam.unregister(prefix),
                UndoAction::ReleaseAddress { prefix, addr } => ipam.release(prefix, addr),
                UndoAction::RemoveRules { rules } => {
                    rules::remove_network_rules(firewall, &rules);
                }
                UndoAction::UnmapPorts { endpoint } => match portmapper {
                    Some(mapper) => mapper.unmap_all(&endpoint),
                    None => warn!("undo: no port mapper to unmap {endpoint}"),
                },
            }
        }
    }
}

type StepFn = for<'a> fn(
    &'a SetupContext,
    &'a NetworkConfiguration,
    &'a mut BridgeInterface,
) -> BoxFuture<'a, Result<(), DriverError>>;

pub struct SetupStep {
    pub name: &'static str,
    run: StepFn,
}

/// Ordered queue of idempotent setup steps. The queue stops at the first
/// error and leaves rollback to the coordinator's undo stack.
pub struct SetupQueue {
    steps: Vec<SetupStep>,
}

impl SetupQueue {
    pub fn new() -> Self {
        SetupQueue { steps: Vec::new() }
    }

    pub fn push(&mut self, name: &'static str, run: StepFn) {
        self.steps.push(SetupStep { name, run });
    }

    /// The canonical pipeline for bringing up one network.
    pub fn for_network() -> Self {
        let mut queue = SetupQueue::new();
        queue.push("setup_device", setup_device);
        queue.push("setup_default_sysctl", setup_default_sysctl);
        queue.push("setup_ipv4", setup_ipv4);
        queue.push("setup_ipv6", setup_ipv6);
        queue.push("setup_ipv4_bridge_netfilter", setup_ipv4_bridge_netfilter);
        queue.push("setup_ipv6_bridge_netfilter", setup_ipv6_bridge_netfilter);
        queue.push("setup_fixed_cidr_v4", setup_fixed_cidr_v4);
        queue.push("setup_fixed_cidr_v6", setup_fixed_cidr_v6);
        queue.push("setup_ip_forwarding", setup_ip_forwarding);
        queue.push("setup_iptables", setup_iptables);
        queue.push("setup_gateway_v4", setup_gateway_v4);
        queue.push("setup_gateway_v6", setup_gateway_v6);
        queue.push("setup_loopback_routing", setup_loopback_routing);
        queue.push("setup_device_up", setup_device_up);
        queue
    }

    pub async fn apply(
        &self,
        ctx: &SetupContext,
        cfg: &NetworkConfiguration,
        bridge: &mut BridgeInterface,
    ) -> Result<(), DriverError> {
        for step in &self.steps {
            debug!("running {} for network {}", step.name, cfg.id);
            if let Err(e) = (step.run)(ctx, cfg, bridge).await {
                warn!("{} failed for network {}: {e}", step.name, cfg.id);
                return Err(e);
            }
        }
        Ok(())
    }
}

fn setup_device<'a>(
    ctx: &'a SetupContext,
    cfg: &'a NetworkConfiguration,
    bridge: &'a mut BridgeInterface,
) -> BoxFuture<'a, Result<(), DriverError>> {
    Box::pin(async move {
        if cfg.default_bridge && cfg.bridge_name != DEFAULT_BRIDGE_NAME {
            return Err(DriverError::InvalidArgument(format!(
                "only {DEFAULT_BRIDGE_NAME} may be the default bridge, got {}",
                cfg.bridge_name
            )));
        }
        if bridge.exists(ctx.kernel.as_ref()).await? {
            return Ok(());
        }
        ctx.kernel
            .link_add(LinkSpec::Bridge {
                name: cfg.bridge_name.clone(),
                mtu: cfg.mtu,
            })
            .await?;
        ctx.push_undo(UndoAction::DeleteLink {
            name: cfg.bridge_name.clone(),
        });
        bridge.exists(ctx.kernel.as_ref()).await?;
        Ok(())
    })
}

fn setup_default_sysctl<'a>(
    ctx: &'a SetupContext,
    cfg: &'a NetworkConfiguration,
    _bridge: &'a mut BridgeInterface,
) -> BoxFuture<'a, Result<(), DriverError>> {
    Box::pin(async move {
        // Nothing should ever renumber a bridge via router advertisements.
        let key = format!("net/ipv6/conf/{}/accept_ra", cfg.bridge_name);
        if let Err(e) = ctx.kernel.sysctl_set(&key, "0") {
            warn!("could not disable accept_ra on {}: {e}", cfg.bridge_name);
        }
        Ok(())
    })
}

fn setup_ipv4<'a>(
    ctx: &'a SetupContext,
    cfg: &'a NetworkConfiguration,
    bridge: &'a mut BridgeInterface,
) -> BoxFuture<'a, Result<(), DriverError>> {
    Box::pin(async move {
        let prefix = IpNetwork::V4(cfg.v4_prefix());
        if !ctx.ipam.is_registered(prefix) {
            ctx.ipam.register(prefix);
            ctx.push_undo(UndoAction::UnregisterPool { prefix });
        }
        ctx.ipam
            .reserve(prefix, IpAddr::V4(cfg.address_v4.ip()))?;

        if !cfg.inhibit_ipv4 {
            let link = bridge.link()?;
            ctx.kernel
                .addr_replace(link, IpNetwork::V4(cfg.address_v4))
                .await?;
        }
        bridge.address_v4 = Some(cfg.address_v4);
        Ok(())
    })
}

fn setup_ipv6<'a>(
    ctx: &'a SetupContext,
    cfg: &'a NetworkConfiguration,
    bridge: &'a mut BridgeInterface,
) -> BoxFuture<'a, Result<(), DriverError>> {
    Box::pin(async move {
        let disable_key = format!("net/ipv6/conf/{}/disable_ipv6", cfg.bridge_name);
        if !cfg.enable_ipv6 {
            if let Err(e) = ctx.kernel.sysctl_set(&disable_key, "1") {
                warn!("could not disable IPv6 on {}: {e}", cfg.bridge_name);
            }
            return Ok(());
        }

        let address_v6 = cfg.address_v6.ok_or_else(|| {
            DriverError::InvalidArgument("IPv6 enabled without an address".to_string())
        })?;
        ctx.kernel.sysctl_set(&disable_key, "0")?;
        if cfg.gateway_mode_v6 != GatewayMode::Isolated {
            let fwd_key = format!("net/ipv6/conf/{}/forwarding", cfg.bridge_name);
            ctx.kernel.sysctl_set(&fwd_key, "1")?;
        }

        bridge
            .program_ipv6_addresses(ctx.kernel.as_ref(), address_v6)
            .await?;

        let prefix = IpNetwork::V6(
            cfg.v6_prefix()
                .expect("enable_ipv6 was validated to come with an address"),
        );
        if !ctx.ipam.is_registered(prefix) {
            ctx.ipam.register(prefix);
            ctx.push_undo(UndoAction::UnregisterPool { prefix });
        }
        ctx.ipam.reserve(prefix, IpAddr::V6(address_v6.ip()))?;
        Ok(())
    })
}

fn setup_ipv4_bridge_netfilter<'a>(
    ctx: &'a SetupContext,
    cfg: &'a NetworkConfiguration,
    _bridge: &'a mut BridgeInterface,
) -> BoxFuture<'a, Result<(), DriverError>> {
    Box::pin(async move {
        if cfg.enable_ip_tables && !cfg.internal {
            ctx.kernel
                .sysctl_set("net/bridge/bridge-nf-call-iptables", "1")?;
        }
        Ok(())
    })
}

fn setup_ipv6_bridge_netfilter<'a>(
    ctx: &'a SetupContext,
    cfg: &'a NetworkConfiguration,
    _bridge: &'a mut BridgeInterface,
) -> BoxFuture<'a, Result<(), DriverError>> {
    Box::pin(async move {
        if cfg.enable_ip_tables && !cfg.internal && cfg.enable_ipv6 {
            ctx.kernel
                .sysctl_set("net/bridge/bridge-nf-call-ip6tables", "1")?;
        }
        Ok(())
    })
}

fn setup_fixed_cidr_v4<'a>(
    ctx: &'a SetupContext,
    cfg: &'a NetworkConfiguration,
    _bridge: &'a mut BridgeInterface,
) -> BoxFuture<'a, Result<(), DriverError>> {
    Box::pin(async move {
        if let Some(fixed) = cfg.fixed_cidr_v4 {
            ctx.ipam
                .constrain(IpNetwork::V4(cfg.v4_prefix()), IpNetwork::V4(fixed))?;
        }
        Ok(())
    })
}

fn setup_fixed_cidr_v6<'a>(
    ctx: &'a SetupContext,
    cfg: &'a NetworkConfiguration,
    _bridge: &'a mut BridgeInterface,
) -> BoxFuture<'a, Result<(), DriverError>> {
    Box::pin(async move {
        if let (Some(fixed), Some(prefix)) = (cfg.fixed_cidr_v6, cfg.v6_prefix()) {
            ctx.ipam
                .constrain(IpNetwork::V6(prefix), IpNetwork::V6(fixed))?;
        }
        Ok(())
    })
}

fn setup_ip_forwarding<'a>(
    ctx: &'a SetupContext,
    cfg: &'a NetworkConfiguration,
    _bridge: &'a mut BridgeInterface,
) -> BoxFuture<'a, Result<(), DriverError>> {
    Box::pin(async move {
        if cfg.internal {
            return Ok(());
        }
        if cfg.gateway_mode_v4 != GatewayMode::Isolated {
            ctx.kernel.sysctl_set("net/ipv4/ip_forward", "1")?;
        }
        if cfg.enable_ipv6 && cfg.gateway_mode_v6 != GatewayMode::Isolated {
            ctx.kernel
                .sysctl_set("net/ipv6/conf/all/forwarding", "1")?;
        }
        Ok(())
    })
}

fn setup_iptables<'a>(
    ctx: &'a SetupContext,
    cfg: &'a NetworkConfiguration,
    _bridge: &'a mut BridgeInterface,
) -> BoxFuture<'a, Result<(), DriverError>> {
    Box::pin(async move {
        if !cfg.enable_ip_tables {
            return Ok(());
        }
        let installed = rules::install_network_rules(ctx.firewall.as_ref(), cfg)?;
        ctx.push_undo(UndoAction::RemoveRules {
            rules: installed.clone(),
        });
        *ctx.fw_rules.lock().unwrap() = installed;
        Ok(())
    })
}

fn setup_gateway_v4<'a>(
    ctx: &'a SetupContext,
    cfg: &'a NetworkConfiguration,
    bridge: &'a mut BridgeInterface,
) -> BoxFuture<'a, Result<(), DriverError>> {
    Box::pin(async move {
        let gateway = cfg.effective_gateway_v4();
        ctx.ipam
            .reserve(IpNetwork::V4(cfg.v4_prefix()), IpAddr::V4(gateway))?;
        bridge.gateway_v4 = Some(gateway);
        Ok(())
    })
}

fn setup_gateway_v6<'a>(
    ctx: &'a SetupContext,
    cfg: &'a NetworkConfiguration,
    bridge: &'a mut BridgeInterface,
) -> BoxFuture<'a, Result<(), DriverError>> {
    Box::pin(async move {
        if !cfg.enable_ipv6 {
            return Ok(());
        }
        if let (Some(gateway), Some(prefix)) = (cfg.effective_gateway_v6(), cfg.v6_prefix()) {
            ctx.ipam
                .reserve(IpNetwork::V6(prefix), IpAddr::V6(gateway))?;
            bridge.gateway_v6 = Some(gateway);
        }
        Ok(())
    })
}

fn setup_loopback_routing<'a>(
    ctx: &'a SetupContext,
    cfg: &'a NetworkConfiguration,
    _bridge: &'a mut BridgeInterface,
) -> BoxFuture<'a, Result<(), DriverError>> {
    Box::pin(async move {
        // Without the proxy, loopback-originated traffic must be allowed to
        // route into the bridge for published ports to work from the host.
        if !cfg.userland_proxy {
            let key = format!("net/ipv4/conf/{}/route_localnet", cfg.bridge_name);
            ctx.kernel.sysctl_set(&key, "1")?;
        }
        Ok(())
    })
}

fn setup_device_up<'a>(
    ctx: &'a SetupContext,
    _cfg: &'a NetworkConfiguration,
    bridge: &'a mut BridgeInterface,
) -> BoxFuture<'a, Result<(), DriverError>> {
    Box::pin(async move {
        ctx.kernel.link_set_up(bridge.link()?).await?;
        Ok(())
    })
}
