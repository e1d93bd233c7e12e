//! Thin facade over the kernel's network configuration surface.
//!
//! Everything the driver asks of the kernel goes through the
//! [`KernelAdapter`] trait: link add/del, address list/add/del, route add
//! and numeric files under `/proc/sys/net`. The Linux implementation talks
//! rtnetlink; other platforms get a stub that fails cleanly. Higher layers
//! never touch netlink types directly.

pub mod adapter;
pub mod error;
pub mod fake;
#[cfg(target_os = "linux")]
pub mod netlink;
#[cfg(not(target_os = "linux"))]
pub mod stub;
#[cfg(target_os = "linux")]
pub mod sysctl;
pub mod types;

pub use adapter::KernelAdapter;
pub use error::KernelError;
pub use fake::FakeKernel;
#[cfg(target_os = "linux")]
pub use netlink::NetlinkAdapter;
#[cfg(not(target_os = "linux"))]
pub use stub::StubAdapter;
pub use types::{IpFamily, LinkHandle, LinkSpec};
