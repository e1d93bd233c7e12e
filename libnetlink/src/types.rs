use macaddr::MacAddr6;

/// Address family selector for address listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IpFamily {
    V4,
    V6,
}

/// A resolved kernel link.
///
/// The index is the kernel's identifier; name and kind are captured at
/// lookup time so callers can verify what they found (an existing link with
/// the right name but the wrong kind is a configuration conflict, not a
/// match).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkHandle {
    pub index: u32,
    pub name: String,
    pub kind: Option<String>,
    pub mac: Option<MacAddr6>,
}

impl LinkHandle {
    pub fn is_bridge(&self) -> bool {
        self.kind.as_deref() == Some("bridge")
    }
}

/// Closed set of link types the driver creates.
#[derive(Debug, Clone)]
pub enum LinkSpec {
    /// A kernel bridge device. `mtu` 0 leaves the kernel default in place.
    Bridge { name: String, mtu: u32 },
    /// A veth pair; `name` stays in the current namespace, `peer_name` is
    /// the end later moved into the sandbox.
    VethPair {
        name: String,
        peer_name: String,
        mtu: u32,
        tx_queue_len: u32,
        mac: Option<MacAddr6>,
    },
}

impl LinkSpec {
    /// Name of the link this spec creates in the current namespace.
    pub fn name(&self) -> &str {
        match self {
            LinkSpec::Bridge { name, .. } => name,
            LinkSpec::VethPair { name, .. } => name,
        }
    }
}
