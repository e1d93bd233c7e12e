use thiserror::Error;

#[derive(Debug, Error)]
pub enum FirewallError {
    #[error("chain {0} does not exist in table {1}")]
    ChainMissing(String, String),

    #[error("rule not present: {0}")]
    RuleMissing(String),

    #[error("no available host port in range {0}-{1}")]
    NoAvailablePort(u16, u16),

    #[error("host port {0}/{1} already in use")]
    PortInUse(u16, String),

    #[error("port binding requires an IPv6 address on the endpoint")]
    MissingV6Address,

    #[error("userland proxy: {0}")]
    Proxy(String),

    #[error("iptables: {0}")]
    Command(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
