//! IPv4/IPv6 host-address allocation for bridge networks.
//!
//! One process-wide [`HostAllocator`] holds an independent pool per
//! registered prefix. The allocator is always an injected dependency of
//! whoever hands out addresses; nothing in here is a global.

pub mod allocator;
pub mod error;
pub mod eui64;

pub use allocator::HostAllocator;
pub use error::IpamError;
pub use eui64::eui64_address;
