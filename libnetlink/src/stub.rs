//! Placeholder adapter for platforms without Linux bridge support.

use std::net::IpAddr;

use async_trait::async_trait;
use ipnetwork::IpNetwork;
use macaddr::MacAddr6;

use crate::adapter::KernelAdapter;
use crate::error::KernelError;
use crate::types::{IpFamily, LinkHandle, LinkSpec};

#[derive(Debug, Default)]
pub struct StubAdapter;

impl StubAdapter {
    pub fn new() -> Self {
        StubAdapter
    }
}

#[async_trait]
impl KernelAdapter for StubAdapter {
    async fn link_by_name(&self, _name: &str) -> Result<LinkHandle, KernelError> {
        Err(KernelError::NotImplemented)
    }

    async fn link_add(&self, _spec: LinkSpec) -> Result<(), KernelError> {
        Err(KernelError::NotImplemented)
    }

    async fn link_del(&self, _handle: &LinkHandle) -> Result<(), KernelError> {
        Err(KernelError::NotImplemented)
    }

    async fn link_set_up(&self, _handle: &LinkHandle) -> Result<(), KernelError> {
        Err(KernelError::NotImplemented)
    }

    async fn link_set_master(
        &self,
        _handle: &LinkHandle,
        _master: &LinkHandle,
    ) -> Result<(), KernelError> {
        Err(KernelError::NotImplemented)
    }

    async fn link_set_mtu(&self, _handle: &LinkHandle, _mtu: u32) -> Result<(), KernelError> {
        Err(KernelError::NotImplemented)
    }

    async fn link_set_hwaddr(
        &self,
        _handle: &LinkHandle,
        _mac: MacAddr6,
    ) -> Result<(), KernelError> {
        Err(KernelError::NotImplemented)
    }

    async fn link_set_hairpin(
        &self,
        _handle: &LinkHandle,
        _enabled: bool,
    ) -> Result<(), KernelError> {
        Err(KernelError::NotImplemented)
    }

    async fn addr_list(
        &self,
        _handle: &LinkHandle,
        _family: IpFamily,
    ) -> Result<Vec<IpNetwork>, KernelError> {
        Err(KernelError::NotImplemented)
    }

    async fn addr_add(&self, _handle: &LinkHandle, _addr: IpNetwork) -> Result<(), KernelError> {
        Err(KernelError::NotImplemented)
    }

    async fn addr_replace(
        &self,
        _handle: &LinkHandle,
        _addr: IpNetwork,
    ) -> Result<(), KernelError> {
        Err(KernelError::NotImplemented)
    }

    async fn addr_del(&self, _handle: &LinkHandle, _addr: IpNetwork) -> Result<(), KernelError> {
        Err(KernelError::NotImplemented)
    }

    async fn route_add(
        &self,
        _dst: IpNetwork,
        _via: Option<IpAddr>,
        _dev: Option<&LinkHandle>,
    ) -> Result<(), KernelError> {
        Err(KernelError::NotImplemented)
    }

    fn sysctl_get(&self, _name: &str) -> Result<String, KernelError> {
        Err(KernelError::NotImplemented)
    }

    fn sysctl_set(&self, _name: &str, _value: &str) -> Result<(), KernelError> {
        Err(KernelError::NotImplemented)
    }
}
