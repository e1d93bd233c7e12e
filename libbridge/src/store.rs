use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Mutex;

use async_trait::async_trait;
use ipnetwork::{Ipv4Network, Ipv6Network};
use libfirewall::PortBinding;
use macaddr::MacAddr6;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::config::TransportPort;
use crate::endpoint::Endpoint;
use crate::error::DriverError;

pub const NETWORK_KEY_PREFIX: &str = "bridge/";
pub const ENDPOINT_KEY_PREFIX: &str = "bridge-endpoint/";

pub fn network_key(id: &str) -> String {
    format!("{NETWORK_KEY_PREFIX}{id}")
}

pub fn endpoint_key(eid: &str) -> String {
    format!("{ENDPOINT_KEY_PREFIX}{eid}")
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("version conflict on {0}")]
    Cas(String),

    #[error("store backend: {0}")]
    Backend(String),
}

impl From<StoreError> for DriverError {
    fn from(err: StoreError) -> Self {
        DriverError::Persistence(err.to_string())
    }
}

/// The key/value contract the driver consumes. The concrete store is the
/// framework's business; writes go through compare-and-swap so concurrent
/// daemons cannot silently overwrite each other.
#[async_trait]
pub trait Datastore: Send + Sync {
    /// Write `value`, expecting the current version to be `prev_version`
    /// (`None` for a fresh key). Returns the new version.
    async fn put_atomic(
        &self,
        key: &str,
        value: Value,
        prev_version: Option<u64>,
    ) -> Result<u64, StoreError>;

    async fn get(&self, key: &str) -> Result<Option<Value>, StoreError>;

    async fn list(&self, prefix: &str) -> Result<Vec<(String, Value)>, StoreError>;

    /// Deleting an absent key is a no-op.
    async fn delete(&self, key: &str) -> Result<(), StoreError>;
}

/// In-memory store with CAS semantics, used by tests and by daemons
/// running without persistence.
#[derive(Debug, Default)]
pub struct MemStore {
    data: Mutex<HashMap<String, (u64, Value)>>,
}

impl MemStore {
    pub fn new() -> Self {
        MemStore::default()
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<_> = self.data.lock().unwrap().keys().cloned().collect();
        keys.sort();
        keys
    }
}

#[async_trait]
impl Datastore for MemStore {
    async fn put_atomic(
        &self,
        key: &str,
        value: Value,
        prev_version: Option<u64>,
    ) -> Result<u64, StoreError> {
        let mut data = self.data.lock().unwrap();
        let current = data.get(key).map(|(v, _)| *v);
        if current != prev_version {
            return Err(StoreError::Cas(key.to_string()));
        }
        let next = current.unwrap_or(0) + 1;
        data.insert(key.to_string(), (next, value));
        Ok(next)
    }

    async fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        Ok(self.data.lock().unwrap().get(key).map(|(_, v)| v.clone()))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<(String, Value)>, StoreError> {
        let data = self.data.lock().unwrap();
        let mut entries: Vec<_> = data
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(k, (_, v))| (k.clone(), v.clone()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(entries)
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.data.lock().unwrap().remove(key);
        Ok(())
    }
}

/// Persisted form of one endpoint. Schema-stable: the effective mapping
/// carries the allocated host port as both `HostPort` and `HostPortEnd` so
/// a restart reinstalls the exact port instead of re-running range
/// allocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointRecord {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "NetworkID")]
    pub network_id: String,
    #[serde(rename = "SrcName")]
    pub src_name: String,
    #[serde(rename = "DstName")]
    pub dst_name: String,
    #[serde(rename = "MacAddress")]
    pub mac: String,
    #[serde(rename = "Addr")]
    pub addr_v4: Ipv4Network,
    #[serde(rename = "AddrV6", default, skip_serializing_if = "Option::is_none")]
    pub addr_v6: Option<Ipv6Network>,
    #[serde(rename = "ExposedPorts", default, skip_serializing_if = "Vec::is_empty")]
    pub exposed_ports: Vec<TransportPort>,
    #[serde(rename = "PortBindings", default, skip_serializing_if = "Vec::is_empty")]
    pub requested_ports: Vec<PortBinding>,
    #[serde(rename = "PortMapping", default, skip_serializing_if = "Vec::is_empty")]
    pub port_mapping: Vec<PortBinding>,
}

impl EndpointRecord {
    pub fn from_endpoint(network_id: &str, ep: &Endpoint) -> Self {
        EndpointRecord {
            id: ep.id.clone(),
            network_id: network_id.to_string(),
            src_name: ep.src_name.clone(),
            dst_name: ep.dst_name.clone(),
            mac: ep.mac.to_string(),
            addr_v4: ep.addr_v4,
            addr_v6: ep.addr_v6,
            exposed_ports: ep.exposed_ports.clone(),
            requested_ports: ep.requested_ports.clone(),
            port_mapping: ep.port_mapping.clone(),
        }
    }

    pub fn into_endpoint(self) -> Result<Endpoint, DriverError> {
        let mac = MacAddr6::from_str(&self.mac)
            .map_err(|e| DriverError::Persistence(format!("bad MAC {:?}: {e}", self.mac)))?;
        Ok(Endpoint {
            id: self.id,
            src_name: self.src_name,
            dst_name: self.dst_name,
            mac,
            addr_v4: self.addr_v4,
            addr_v6: self.addr_v6,
            requested_ports: self.requested_ports,
            port_mapping: self.port_mapping,
            exposed_ports: self.exposed_ports,
        })
    }
}
