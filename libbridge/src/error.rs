use libfirewall::FirewallError;
use libipam::IpamError;
use libnetlink::KernelError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("{0} already exists")]
    Exists(String),

    #[error("resources exhausted: {0}")]
    Exhausted(String),

    #[error(transparent)]
    Kernel(#[from] KernelError),

    #[error(transparent)]
    Firewall(#[from] FirewallError),

    #[error("persistence: {0}")]
    Persistence(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl DriverError {
    /// Whether teardown paths may log this error and keep going. A veth
    /// that is already gone or a rule that is already absent must not abort
    /// a delete.
    pub fn is_maskable(&self) -> bool {
        match self {
            DriverError::NotFound(_) => true,
            DriverError::Kernel(k) => k.is_not_found(),
            DriverError::Firewall(FirewallError::RuleMissing(_)) => true,
            DriverError::Firewall(FirewallError::ChainMissing(_, _)) => true,
            _ => false,
        }
    }
}

impl From<IpamError> for DriverError {
    fn from(err: IpamError) -> Self {
        match err {
            IpamError::Exhausted(prefix) => DriverError::Exhausted(prefix.to_string()),
            other => DriverError::InvalidArgument(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_maskable_classification() {
        assert!(DriverError::NotFound("ep".into()).is_maskable());
        assert!(DriverError::Kernel(KernelError::NotFound("veth0".into())).is_maskable());
        assert!(!DriverError::Conflict("subnet overlap".into()).is_maskable());
        assert!(!DriverError::Kernel(KernelError::Permission("link".into())).is_maskable());
    }

    #[test]
    fn test_exhausted_ipam_maps_to_exhausted() {
        let prefix = "10.0.0.0/29".parse().unwrap();
        let err: DriverError = IpamError::Exhausted(prefix).into();
        assert!(matches!(err, DriverError::Exhausted(_)));
    }
}
