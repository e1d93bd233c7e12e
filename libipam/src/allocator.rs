use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Mutex;

use ipnetwork::IpNetwork;
use log::debug;

use crate::error::IpamError;

/// Host-address pools, one per registered prefix.
///
/// Keyed by prefix so independent networks never contend on each other's
/// pool. All state sits behind one mutex; critical sections are map and set
/// operations only.
#[derive(Debug, Default)]
pub struct HostAllocator {
    pools: Mutex<HashMap<IpNetwork, PrefixPool>>,
}

#[derive(Debug)]
struct PrefixPool {
    /// Allocation range; equals the registered prefix until constrained to
    /// a fixed container CIDR.
    range: IpNetwork,
    allocated: HashSet<IpAddr>,
    reserved: HashSet<IpAddr>,
}

impl HostAllocator {
    pub fn new() -> Self {
        HostAllocator::default()
    }

    /// Register a pool for `prefix`. Registering an already-known prefix is
    /// a no-op so that setup steps stay re-applicable.
    pub fn register(&self, prefix: IpNetwork) {
        let mut pools = self.pools.lock().unwrap();
        pools.entry(prefix).or_insert_with(|| PrefixPool {
            range: prefix,
            allocated: HashSet::new(),
            reserved: HashSet::new(),
        });
    }

    /// Drop the pool for `prefix`, releasing everything in it.
    pub fn unregister(&self, prefix: IpNetwork) {
        self.pools.lock().unwrap().remove(&prefix);
    }

    pub fn is_registered(&self, prefix: IpNetwork) -> bool {
        self.pools.lock().unwrap().contains_key(&prefix)
    }

    /// Mark an address (bridge IP, gateway) as never handed out.
    pub fn reserve(&self, prefix: IpNetwork, addr: IpAddr) -> Result<(), IpamError> {
        let mut pools = self.pools.lock().unwrap();
        let pool = pools
            .get_mut(&prefix)
            .ok_or(IpamError::UnknownPool(prefix))?;
        pool.reserved.insert(addr);
        Ok(())
    }

    /// Restrict future allocation to `sub`, which must lie inside the
    /// registered prefix. Existing allocations are untouched.
    pub fn constrain(&self, prefix: IpNetwork, sub: IpNetwork) -> Result<(), IpamError> {
        if !contains_net(&prefix, &sub) {
            return Err(IpamError::NotASubset { prefix, sub });
        }
        let mut pools = self.pools.lock().unwrap();
        let pool = pools
            .get_mut(&prefix)
            .ok_or(IpamError::UnknownPool(prefix))?;
        pool.range = sub;
        Ok(())
    }

    /// Hand out a free host address.
    ///
    /// With a `hint` the scan starts there (EUI-64-derived IPv6 addresses
    /// arrive this way); otherwise at the first host of the range. The scan
    /// increases and wraps around once, then fails exhausted.
    pub fn request(&self, prefix: IpNetwork, hint: Option<IpAddr>) -> Result<IpAddr, IpamError> {
        let mut pools = self.pools.lock().unwrap();
        let pool = pools
            .get_mut(&prefix)
            .ok_or(IpamError::UnknownPool(prefix))?;

        let (first, last) = host_bounds(&pool.range).ok_or(IpamError::Exhausted(pool.range))?;

        let start = match hint {
            Some(hint) => {
                if !pool.range.contains(hint) {
                    return Err(IpamError::OutOfRange {
                        prefix: pool.range,
                        addr: hint.to_string(),
                    });
                }
                hint
            }
            None => first,
        };

        let mut cur = start;
        loop {
            if !pool.allocated.contains(&cur) && !pool.reserved.contains(&cur) {
                pool.allocated.insert(cur);
                debug!("allocated {cur} from {}", pool.range);
                return Ok(cur);
            }
            cur = if cur == last {
                first
            } else {
                succ(cur).ok_or(IpamError::Exhausted(pool.range))?
            };
            if cur == start {
                return Err(IpamError::Exhausted(pool.range));
            }
        }
    }

    /// Return an address to its pool. Unknown addresses are ignored.
    pub fn release(&self, prefix: IpNetwork, addr: IpAddr) {
        let mut pools = self.pools.lock().unwrap();
        if let Some(pool) = pools.get_mut(&prefix) {
            pool.allocated.remove(&addr);
        }
    }
}

/// First and last allocatable host of a range, or `None` when the range has
/// no hosts (v4 /31 and /32, v6 /128).
fn host_bounds(range: &IpNetwork) -> Option<(IpAddr, IpAddr)> {
    match range {
        IpNetwork::V4(net) => {
            if net.prefix() >= 31 {
                return None;
            }
            let base = u32::from(net.network());
            let bcast = u32::from(net.broadcast());
            Some((
                IpAddr::V4(Ipv4Addr::from(base + 1)),
                IpAddr::V4(Ipv4Addr::from(bcast - 1)),
            ))
        }
        IpNetwork::V6(net) => {
            if net.prefix() >= 128 {
                return None;
            }
            let base = u128::from(net.network());
            let span = if net.prefix() == 0 {
                u128::MAX
            } else {
                (1u128 << (128 - net.prefix())) - 1
            };
            Some((
                IpAddr::V6(Ipv6Addr::from(base + 1)),
                IpAddr::V6(Ipv6Addr::from(base + span)),
            ))
        }
    }
}

fn succ(ip: IpAddr) -> Option<IpAddr> {
    match ip {
        IpAddr::V4(v4) => u32::from(v4)
            .checked_add(1)
            .map(|n| IpAddr::V4(Ipv4Addr::from(n))),
        IpAddr::V6(v6) => u128::from(v6)
            .checked_add(1)
            .map(|n| IpAddr::V6(Ipv6Addr::from(n))),
    }
}

fn contains_net(outer: &IpNetwork, inner: &IpNetwork) -> bool {
    outer.contains(inner.network()) && inner.prefix() >= outer.prefix()
}
