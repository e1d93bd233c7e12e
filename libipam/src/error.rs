use ipnetwork::IpNetwork;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IpamError {
    #[error("no available IP addresses in {0}")]
    Exhausted(IpNetwork),

    #[error("no pool registered for {0}")]
    UnknownPool(IpNetwork),

    #[error("{addr} is outside {prefix}")]
    OutOfRange { prefix: IpNetwork, addr: String },

    #[error("{sub} is not a subset of {prefix}")]
    NotASubset { prefix: IpNetwork, sub: IpNetwork },
}
