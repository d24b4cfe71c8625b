//! Container runtime preparation
//!
//! Swap, containerd, kernel modules, and sysctl flags. Each step probes
//! current state first and only mutates the host when something is missing.

use crate::exec::CommandExecutor;
use anyhow::{Context, Result};

const MODULES_CONF: &str = "/etc/modules-load.d/k8s.conf";
const SYSCTL_CONF: &str = "/etc/sysctl.d/k8s.conf";
const CONTAINERD_CONF: &str = "/etc/containerd/config.toml";

const MODULES_CONTENT: &str = "overlay\nbr_netfilter\n";
const SYSCTL_CONTENT: &str = "net.bridge.bridge-nf-call-iptables = 1\n\
net.bridge.bridge-nf-call-ip6tables = 1\n\
net.ipv4.ip_forward = 1\n";

/// Drive the host from `uninitialized` to `runtime-ready`.
pub fn prepare<E: CommandExecutor>(exec: &E) -> Result<()> {
    disable_swap(exec)?;
    configure_kernel_modules(exec)?;
    configure_sysctl(exec)?;
    install_containerd(exec)?;
    Ok(())
}

/// Kubelet refuses to start with swap active.
fn disable_swap<E: CommandExecutor>(exec: &E) -> Result<()> {
    let active = exec.execute_shell("swapon --noheadings 2>/dev/null")?;
    let fstab = exec.execute_shell("grep -vE '^\\s*#' /etc/fstab 2>/dev/null | grep swap")?;
    let swap_active = !String::from_utf8_lossy(&active.stdout).trim().is_empty();
    let swap_in_fstab = !String::from_utf8_lossy(&fstab.stdout).trim().is_empty();

    if !swap_active && !swap_in_fstab {
        println!("✓ Swap already disabled");
        return Ok(());
    }

    println!("Disabling swap...");
    exec.execute_shell_streaming("sudo swapoff -a")
        .context("Failed to disable active swap")?;
    exec.execute_shell_streaming("sudo sed -i '/\\sswap\\s/d' /etc/fstab")
        .context("Failed to remove swap entries from fstab")?;
    println!("✓ Swap disabled");
    Ok(())
}

fn configure_kernel_modules<E: CommandExecutor>(exec: &E) -> Result<()> {
    let conf_current = exec
        .execute_shell(&format!("cat {} 2>/dev/null", MODULES_CONF))?
        .stdout;
    let overlay = exec.execute_shell("lsmod | grep -w overlay")?;
    let br_netfilter = exec.execute_shell("lsmod | grep -w br_netfilter")?;

    let configured = String::from_utf8_lossy(&conf_current) == MODULES_CONTENT;
    let loaded = overlay.status.success() && br_netfilter.status.success();
    if configured && loaded {
        println!("✓ Kernel modules already configured and loaded");
        return Ok(());
    }

    println!("Configuring kernel networking modules...");
    exec.execute_shell_streaming(&format!(
        "printf '{}' | sudo tee {} > /dev/null",
        MODULES_CONTENT.replace('\n', "\\n"),
        MODULES_CONF
    ))
    .context("Failed to write kernel module configuration")?;
    exec.execute_shell_streaming("sudo modprobe overlay")
        .context("Failed to load overlay module")?;
    exec.execute_shell_streaming("sudo modprobe br_netfilter")
        .context("Failed to load br_netfilter module")?;
    println!("✓ Kernel modules loaded");
    Ok(())
}

fn configure_sysctl<E: CommandExecutor>(exec: &E) -> Result<()> {
    let current = exec
        .execute_shell(&format!("cat {} 2>/dev/null", SYSCTL_CONF))?
        .stdout;
    if String::from_utf8_lossy(&current) == SYSCTL_CONTENT {
        println!("✓ Sysctl flags already configured");
        return Ok(());
    }

    println!("Applying bridge and forwarding sysctl flags...");
    exec.execute_shell_streaming(&format!(
        "printf '{}' | sudo tee {} > /dev/null",
        SYSCTL_CONTENT.replace('\n', "\\n"),
        SYSCTL_CONF
    ))
    .context("Failed to write sysctl configuration")?;
    exec.execute_shell_streaming("sudo sysctl --system > /dev/null")
        .context("Failed to reload sysctl settings")?;
    println!("✓ Sysctl flags applied");
    Ok(())
}

fn install_containerd<E: CommandExecutor>(exec: &E) -> Result<()> {
    let installed = is_package_installed(exec, "containerd")?;
    let configured = exec.file_exists(CONTAINERD_CONF)?;
    let active = exec
        .execute_shell("systemctl is-active --quiet containerd")?
        .status
        .success();

    if installed && configured && active {
        println!("✓ containerd already installed and active");
        return Ok(());
    }

    if !installed {
        println!("Installing containerd...");
        exec.execute_shell_streaming("sudo apt-get update")
            .context("apt-get update failed")?;
        exec.execute_shell_streaming(
            "sudo apt-get install -y --no-install-recommends containerd",
        )
        .context("Failed to install containerd")?;
    }

    if !configured {
        // Default config plus the systemd cgroup driver kubelet expects.
        println!("Writing containerd configuration...");
        exec.execute_shell_streaming("sudo mkdir -p /etc/containerd")?;
        exec.execute_shell_streaming(&format!(
            "containerd config default | sudo tee {} > /dev/null",
            CONTAINERD_CONF
        ))
        .context("Failed to generate containerd default config")?;
        exec.execute_shell_streaming(&format!(
            "sudo sed -i 's/SystemdCgroup = false/SystemdCgroup = true/' {}",
            CONTAINERD_CONF
        ))
        .context("Failed to set the systemd cgroup driver")?;
    }

    println!("Restarting containerd...");
    exec.execute_shell_streaming("sudo systemctl enable containerd > /dev/null 2>&1 || true")?;
    exec.execute_shell_streaming("sudo systemctl restart containerd")
        .context("Failed to restart containerd")?;
    println!("✓ containerd ready");
    Ok(())
}

/// dpkg-level install check; `hold` counts as installed.
pub fn is_package_installed<E: CommandExecutor>(exec: &E, package: &str) -> Result<bool> {
    let output = exec.execute_shell(&format!(
        "dpkg-query -W -f='${{Status}}' {} 2>/dev/null",
        package
    ))?;
    let status = String::from_utf8_lossy(&output.stdout).trim().to_string();
    Ok(output.status.success()
        && (status == "install ok installed" || status == "hold ok installed"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::fake::FakeExecutor;

    #[test]
    fn test_disable_swap_noop_when_already_off() {
        let exec = FakeExecutor::new()
            .respond("swapon", "", true)
            .respond("/etc/fstab", "", true);
        disable_swap(&exec).unwrap();
        assert!(!exec.ran("swapoff"));
    }

    #[test]
    fn test_disable_swap_runs_when_active() {
        let exec = FakeExecutor::new().respond("swapon", "/swapfile file 2G", true);
        disable_swap(&exec).unwrap();
        assert!(exec.ran("sudo swapoff -a"));
        assert!(exec.ran("sed -i"));
    }

    #[test]
    fn test_containerd_skipped_when_active() {
        let exec = FakeExecutor::new()
            .respond("dpkg-query", "install ok installed", true)
            .respond("systemctl is-active", "", true)
            .with_file(CONTAINERD_CONF, "[plugins]");
        install_containerd(&exec).unwrap();
        assert!(!exec.ran("apt-get install"));
        assert!(!exec.ran("systemctl restart containerd"));
    }

    #[test]
    fn test_containerd_installed_when_missing() {
        let exec = FakeExecutor::new()
            .respond("dpkg-query", "unknown ok not-installed", false)
            .respond("systemctl is-active", "", false);
        install_containerd(&exec).unwrap();
        assert!(exec.ran("apt-get install -y --no-install-recommends containerd"));
        assert!(exec.ran("containerd config default"));
        assert!(exec.ran("SystemdCgroup = false/SystemdCgroup = true"));
        assert!(exec.ran("systemctl restart containerd"));
    }

    #[test]
    fn test_package_installed_requires_dpkg_status() {
        let held = FakeExecutor::new().respond("dpkg-query", "hold ok installed", true);
        assert!(is_package_installed(&held, "kubeadm").unwrap());

        let missing = FakeExecutor::new().respond("dpkg-query", "", false);
        assert!(!is_package_installed(&missing, "kubeadm").unwrap());
    }
}
