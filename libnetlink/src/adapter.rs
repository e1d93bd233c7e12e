use std::net::IpAddr;

use async_trait::async_trait;
use ipnetwork::IpNetwork;
use macaddr::MacAddr6;

use crate::error::KernelError;
use crate::types::{IpFamily, LinkHandle, LinkSpec};

/// The one seam between the driver and the kernel.
///
/// All operations are awaited to completion and report the typed categories
/// of [`KernelError`]. Implementations must be safe to share across tasks;
/// serialization of conflicting mutations is the caller's business.
#[async_trait]
pub trait KernelAdapter: Send + Sync {
    async fn link_by_name(&self, name: &str) -> Result<LinkHandle, KernelError>;

    async fn link_add(&self, spec: LinkSpec) -> Result<(), KernelError>;

    async fn link_del(&self, handle: &LinkHandle) -> Result<(), KernelError>;

    async fn link_set_up(&self, handle: &LinkHandle) -> Result<(), KernelError>;

    async fn link_set_master(
        &self,
        handle: &LinkHandle,
        master: &LinkHandle,
    ) -> Result<(), KernelError>;

    async fn link_set_mtu(&self, handle: &LinkHandle, mtu: u32) -> Result<(), KernelError>;

    async fn link_set_hwaddr(&self, handle: &LinkHandle, mac: MacAddr6)
    -> Result<(), KernelError>;

    /// Toggle hairpin mode on a bridge port.
    async fn link_set_hairpin(
        &self,
        handle: &LinkHandle,
        enabled: bool,
    ) -> Result<(), KernelError>;

    async fn addr_list(
        &self,
        handle: &LinkHandle,
        family: IpFamily,
    ) -> Result<Vec<IpNetwork>, KernelError>;

    async fn addr_add(&self, handle: &LinkHandle, addr: IpNetwork) -> Result<(), KernelError>;

    /// Install `addr`, replacing an existing entry for the same address
    /// instead of failing with "exists".
    async fn addr_replace(&self, handle: &LinkHandle, addr: IpNetwork) -> Result<(), KernelError>;

    async fn addr_del(&self, handle: &LinkHandle, addr: IpNetwork) -> Result<(), KernelError>;

    async fn route_add(
        &self,
        dst: IpNetwork,
        via: Option<IpAddr>,
        dev: Option<&LinkHandle>,
    ) -> Result<(), KernelError>;

    /// Read a numeric file under `/proc/sys`, dotted or slashed notation.
    fn sysctl_get(&self, name: &str) -> Result<String, KernelError>;

    fn sysctl_set(&self, name: &str, value: &str) -> Result<(), KernelError>;
}
