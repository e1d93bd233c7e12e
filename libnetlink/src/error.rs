use thiserror::Error;

/// Error categories for kernel operations.
///
/// Callers branch on the category, not on message text: "not found" during
/// teardown is routinely masked, "exists" during create is routinely
/// converged on. No retries happen at this layer.
#[derive(Debug, Error)]
pub enum KernelError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("{0} already exists")]
    Exists(String),

    #[error("permission denied: {0}")]
    Permission(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("kernel operation failed: {0}")]
    Transient(String),

    #[error("not implemented on this platform")]
    NotImplemented,
}

impl KernelError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, KernelError::NotFound(_))
    }

    pub fn is_exists(&self) -> bool {
        matches!(self, KernelError::Exists(_))
    }
}
