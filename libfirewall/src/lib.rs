//! Firewall plumbing for the bridge driver.
//!
//! [`RuleBackend`] is the single seam towards iptables: ordered chains of
//! argument-vector rules with idempotent insert and delete. The port mapper
//! turns requested port bindings into allocated host ports plus the
//! DNAT/hairpin/forward rule set, and optionally a userland proxy process
//! per mapping. An external flush (firewalld reload, manual `iptables -F`)
//! is handled by re-running registered reconciliation callbacks through
//! [`ReloadHook`].

pub mod backend;
pub mod error;
pub mod portalloc;
pub mod portmapper;
pub mod proxy;
pub mod reload;
pub mod rule;

pub use backend::{IptablesBackend, MemoryBackend, RuleBackend};
pub use error::FirewallError;
pub use portalloc::PortAllocator;
pub use portmapper::{PortBinding, PortMapper, PortMapperConfig, Proto};
pub use reload::ReloadHook;
pub use rule::{IpVersion, Rule, Table};
