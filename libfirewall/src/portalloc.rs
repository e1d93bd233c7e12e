use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Mutex;

use log::debug;

use crate::error::FirewallError;
use crate::portmapper::Proto;

/// First port of the ephemeral range handed out when a binding requests
/// port 0.
pub const EPHEMERAL_PORT_START: u16 = 49153;
pub const EPHEMERAL_PORT_END: u16 = 65535;

/// How many occupied candidates a single allocation call will step over
/// before giving up.
const MAX_COLLISIONS: usize = 10;

/// Process-wide host-port bookkeeping.
///
/// A binding is unique per (host IP, protocol, host port); the unspecified
/// address of a family collides with every specific address of the same
/// family and vice versa.
#[derive(Debug, Default)]
pub struct PortAllocator {
    state: Mutex<State>,
}

#[derive(Debug)]
struct State {
    taken: HashSet<(IpAddr, Proto, u16)>,
    next_ephemeral: u16,
}

impl Default for State {
    fn default() -> Self {
        State {
            taken: HashSet::new(),
            next_ephemeral: EPHEMERAL_PORT_START,
        }
    }
}

impl PortAllocator {
    pub fn new() -> Self {
        PortAllocator::default()
    }

    /// Allocate a port on `host_ip` within `range` (inclusive), or from the
    /// ephemeral range when `range` is `(0, 0)`.
    pub fn allocate(
        &self,
        host_ip: IpAddr,
        proto: Proto,
        range: (u16, u16),
    ) -> Result<u16, FirewallError> {
        let mut state = self.state.lock().unwrap();
        let (start, end) = if range == (0, 0) {
            (EPHEMERAL_PORT_START, EPHEMERAL_PORT_END)
        } else {
            range
        };
        if start > end || start == 0 {
            return Err(FirewallError::NoAvailablePort(start, end));
        }

        let first = if range == (0, 0) {
            state.next_ephemeral.clamp(start, end)
        } else {
            start
        };

        let mut collisions = 0;
        let mut port = first;
        loop {
            if !state.is_taken(host_ip, proto, port) {
                state.taken.insert((host_ip, proto, port));
                if range == (0, 0) {
                    state.next_ephemeral = if port == end { start } else { port + 1 };
                }
                debug!("allocated host port {port}/{proto} on {host_ip}");
                return Ok(port);
            }
            collisions += 1;
            if collisions >= MAX_COLLISIONS {
                return Err(FirewallError::NoAvailablePort(start, end));
            }
            port = if port == end { start } else { port + 1 };
            if port == first {
                return Err(FirewallError::NoAvailablePort(start, end));
            }
        }
    }

    /// Claim a specific port, e.g. when reinstalling a persisted mapping.
    pub fn acquire(&self, host_ip: IpAddr, proto: Proto, port: u16) -> Result<(), FirewallError> {
        let mut state = self.state.lock().unwrap();
        if state.is_taken(host_ip, proto, port) {
            return Err(FirewallError::PortInUse(port, proto.to_string()));
        }
        state.taken.insert((host_ip, proto, port));
        Ok(())
    }

    pub fn release(&self, host_ip: IpAddr, proto: Proto, port: u16) {
        let mut state = self.state.lock().unwrap();
        state.taken.remove(&(host_ip, proto, port));
    }
}

impl State {
    fn is_taken(&self, host_ip: IpAddr, proto: Proto, port: u16) -> bool {
        if self.taken.contains(&(host_ip, proto, port)) {
            return true;
        }
        let wildcard = match host_ip {
            IpAddr::V4(_) => IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED),
            IpAddr::V6(_) => IpAddr::V6(std::net::Ipv6Addr::UNSPECIFIED),
        };
        if host_ip == wildcard {
            // The wildcard collides with any specific binding of the family.
            self.taken
                .iter()
                .any(|(ip, p, pt)| *p == proto && *pt == port && ip.is_ipv4() == host_ip.is_ipv4())
        } else {
            self.taken.contains(&(wildcard, proto, port))
        }
    }
}
