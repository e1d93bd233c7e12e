use std::path::Path;

use libnetlink::KernelAdapter;
use log::info;

const MIRRORED_LOOPBACK_DEVICE: &str = "loopback0";
const WSL_INFO_TOOL: &str = "wslinfo";

/// Probe for a mirrored-loopback environment (WSL2 networkingMode=mirrored):
/// a `loopback0` device together with an executable `wslinfo` on PATH.
/// Probed once at driver init and cached; tests override it through the
/// driver configuration.
pub async fn detect_mirrored_loopback(kernel: &dyn KernelAdapter) -> bool {
    if kernel.link_by_name(MIRRORED_LOOPBACK_DEVICE).await.is_err() {
        return false;
    }
    let found = tool_on_path(WSL_INFO_TOOL);
    if found {
        info!("mirrored-loopback environment detected, enabling raw-table accepts");
    }
    found
}

fn tool_on_path(tool: &str) -> bool {
    let Some(paths) = std::env::var_os("PATH") else {
        return false;
    };
    std::env::split_paths(&paths).any(|dir| is_executable(&dir.join(tool)))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

#[cfg(test)]
mod tests {
    use super::*;
    use libnetlink::FakeKernel;

    #[tokio::test]
    async fn test_no_loopback0_means_no_mirror() {
        let kernel = FakeKernel::new();
        assert!(!detect_mirrored_loopback(&kernel).await);
    }

    #[tokio::test]
    async fn test_loopback0_alone_is_not_enough() {
        // Without wslinfo on PATH the probe must stay negative even when
        // the device exists.
        let kernel = FakeKernel::new();
        kernel.seed_link("loopback0", None);
        if !tool_on_path(WSL_INFO_TOOL) {
            assert!(!detect_mirrored_loopback(&kernel).await);
        }
    }
}
