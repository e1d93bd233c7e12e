use std::net::IpAddr;
use std::path::Path;
use std::process::{Child, Command, Stdio};

use log::{error, warn};

use crate::error::FirewallError;
use crate::portmapper::Proto;

/// A running userland proxy for one published port. The process lives
/// exactly as long as the mapping.
#[derive(Debug)]
pub struct ProxyHandle {
    child: Child,
    desc: String,
}

pub fn spawn_proxy(
    binary: &Path,
    proto: Proto,
    host_ip: IpAddr,
    host_port: u16,
    container_ip: IpAddr,
    container_port: u16,
) -> Result<ProxyHandle, FirewallError> {
    let desc = format!("{proto}/{host_ip}:{host_port} -> {container_ip}:{container_port}");
    let child = Command::new(binary)
        .arg("-proto")
        .arg(proto.to_string())
        .arg("-host-ip")
        .arg(host_ip.to_string())
        .arg("-host-port")
        .arg(host_port.to_string())
        .arg("-container-ip")
        .arg(container_ip.to_string())
        .arg("-container-port")
        .arg(container_port.to_string())
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|e| FirewallError::Proxy(format!("spawn {} for {desc}: {e}", binary.display())))?;
    Ok(ProxyHandle { child, desc })
}

impl ProxyHandle {
    /// Kill and reap the proxy. Failures are logged; the mapping teardown
    /// keeps going regardless.
    pub fn stop(self) {
        drop(self);
    }
}

impl Drop for ProxyHandle {
    fn drop(&mut self) {
        if let Err(e) = self.child.kill() {
            warn!("failed to kill proxy for {}: {e}", self.desc);
        }
        if let Err(e) = self.child.wait() {
            error!("failed to reap proxy for {}: {e}", self.desc);
        }
    }
}
