//! Host-local Linux bridge network driver.
//!
//! Materialises a named L2/L3 network as a kernel bridge, attaches
//! container sandboxes to it through veth pairs with allocated IPv4/IPv6
//! addresses, installs the iptables rules for isolation, masquerade and
//! port publishing, and persists enough state to rebuild everything after
//! a daemon restart.
//!
//! The driver itself never touches data-plane traffic; the kernel owns the
//! forwarding plane. All kernel access goes through the injected
//! [`libnetlink::KernelAdapter`], all rule mutation through one
//! [`libfirewall::RuleBackend`], which keeps the whole crate testable
//! without CAP_NET_ADMIN.

pub mod config;
pub mod endpoint;
pub mod env;
pub mod error;
pub mod interface;
pub mod manager;
pub mod network;
pub mod rules;
pub mod setup;
pub mod store;

pub use config::{
    EndpointOption, GatewayMode, JoinOption, NetworkConfiguration, NetworkOption, TransportPort,
};
pub use endpoint::{Endpoint, EndpointInfo, InterfaceInfo, JoinInfo};
pub use error::DriverError;
pub use manager::{BridgeDriver, DriverConfig};
pub use store::{Datastore, MemStore, StoreError};
