use std::io::{ErrorKind, Read, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

use crate::error::KernelError;

pub const IPV4_FORWARD: &str = "net.ipv4.ip_forward";
pub const IPV6_FORWARD_ALL: &str = "net.ipv6.conf.all.forwarding";

pub fn sysctl_get(name: &str) -> Result<String, KernelError> {
    let base_path: &Path = "/proc/sys".as_ref();
    let full_name = base_path.join(normalize_sysctl_name(name));
    let mut file = std::fs::OpenOptions::new()
        .read(true)
        .open(full_name)
        .map_err(|e| classify_io(name, e))?;
    let mut value = String::new();
    file.read_to_string(&mut value)
        .map_err(|e| classify_io(name, e))?;
    Ok(value.trim().to_string())
}

pub fn sysctl_set(name: &str, value: &str) -> Result<(), KernelError> {
    let base_path: &Path = "/proc/sys".as_ref();
    let full_name = base_path.join(normalize_sysctl_name(name));
    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .truncate(true)
        .mode(0o644)
        .open(full_name)
        .map_err(|e| classify_io(name, e))?;
    file.write_all(value.as_bytes())
        .map_err(|e| classify_io(name, e))?;
    file.flush().map_err(|e| classify_io(name, e))?;
    Ok(())
}

#[inline]
fn normalize_sysctl_name(name: &str) -> String {
    name.replace('.', "/")
}

fn classify_io(name: &str, err: std::io::Error) -> KernelError {
    match err.kind() {
        ErrorKind::NotFound => KernelError::NotFound(name.to_string()),
        ErrorKind::PermissionDenied => KernelError::Permission(name.to_string()),
        ErrorKind::InvalidInput => KernelError::InvalidArgument(format!("{name}: {err}")),
        _ => KernelError::Transient(format!("{name}: {err}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize() {
        assert_eq!(normalize_sysctl_name(IPV4_FORWARD), "net/ipv4/ip_forward");
        assert_eq!(
            normalize_sysctl_name("net/ipv6/conf/br0/accept_ra"),
            "net/ipv6/conf/br0/accept_ra"
        );
    }

    #[test]
    fn test_missing_key_is_not_found() {
        let err = sysctl_get("net.ipv4.no_such_knob_here").unwrap_err();
        assert!(err.is_not_found());
    }
}
