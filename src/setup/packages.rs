//! Kubernetes package installation
//!
//! Configures the pkgs.k8s.io apt repository pinned to one minor version
//! and installs kubelet/kubeadm/kubectl with automatic upgrades held back.
//! Minor versions whose repository signing key has expired are remapped to
//! a known-good fallback before any repository is configured.

use crate::config::EnvConfig;
use crate::exec::CommandExecutor;
use crate::setup::runtime::is_package_installed;
use anyhow::{Context, Result};

const APT_KEYRING: &str = "/etc/apt/keyrings/kubernetes-apt-keyring.gpg";
const APT_SOURCE: &str = "/etc/apt/sources.list.d/kubernetes.list";
const CLUSTER_PACKAGES: &[&str] = &["kubelet", "kubeadm", "kubectl"];

/// Minor versions whose repository signing key has expired upstream.
const EXPIRED_KEY_VERSIONS: &[&str] = &["1.24", "1.25", "1.26"];
/// Repository minor these are remapped to.
const FALLBACK_REPO_VERSION: &str = "1.28";

/// Remap a requested repository minor version away from expired signing
/// keys. Returns the version to configure and whether a remap happened.
pub fn resolve_repo_version(requested: &str) -> (&str, bool) {
    if EXPIRED_KEY_VERSIONS.contains(&requested) {
        (FALLBACK_REPO_VERSION, true)
    } else {
        (requested, false)
    }
}

/// Drive the host from `runtime-ready` to `packages-ready`.
pub fn install<E: CommandExecutor>(exec: &E, config: &EnvConfig) -> Result<()> {
    let all_installed = CLUSTER_PACKAGES
        .iter()
        .map(|p| is_package_installed(exec, p))
        .collect::<Result<Vec<_>>>()?
        .into_iter()
        .all(|installed| installed);

    if all_installed {
        println!("✓ Cluster packages already installed and pinned");
        return Ok(());
    }

    for tool in ["curl", "gpg"] {
        if !exec.command_exists(tool)? {
            anyhow::bail!(
                "{} is required to configure the package repository; install it first",
                tool
            );
        }
    }

    let (repo_version, remapped) = resolve_repo_version(&config.repo_version);
    if remapped {
        println!(
            "⚠ Repository version {} has an expired signing key; using {} instead",
            config.repo_version, repo_version
        );
    }

    // Stale entries from a prior minor version cause signature conflicts.
    println!("Purging stale Kubernetes repository entries...");
    exec.execute_shell_streaming(&format!("sudo rm -f {} {}", APT_SOURCE, APT_KEYRING))?;
    exec.execute_shell_streaming("sudo apt-get clean")?;

    println!("Configuring Kubernetes {} apt repository...", repo_version);
    exec.execute_shell_streaming("sudo mkdir -p /etc/apt/keyrings")?;
    exec.execute_shell_streaming(&format!(
        "curl -fsSL https://pkgs.k8s.io/core:/stable:/v{}/deb/Release.key \
         | sudo gpg --dearmor -o {}",
        repo_version, APT_KEYRING
    ))
    .context("Failed to download the repository signing key")?;
    exec.execute_shell_streaming(&format!(
        "echo 'deb [signed-by={}] https://pkgs.k8s.io/core:/stable:/v{}/deb/ /' \
         | sudo tee {} > /dev/null",
        APT_KEYRING, repo_version, APT_SOURCE
    ))
    .context("Failed to write the repository source entry")?;

    println!("Installing cluster packages...");
    exec.execute_shell_streaming("sudo apt-get update")
        .context("apt-get update failed after repository configuration")?;
    exec.execute_shell_streaming(&format!(
        "sudo apt-get install -y --no-install-recommends {}",
        CLUSTER_PACKAGES.join(" ")
    ))
    .context("Failed to install kubelet/kubeadm/kubectl")?;
    exec.execute_shell_streaming(&format!("sudo apt-mark hold {}", CLUSTER_PACKAGES.join(" ")))
        .context("Failed to pin cluster packages")?;

    println!("✓ Cluster packages installed and pinned");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::fake::FakeExecutor;

    fn test_config(repo_version: &str) -> EnvConfig {
        let mut config = crate::config::test_config();
        config.repo_version = repo_version.to_string();
        config
    }

    #[test]
    fn test_expired_versions_remap_to_fallback() {
        for version in EXPIRED_KEY_VERSIONS {
            let (resolved, remapped) = resolve_repo_version(version);
            assert_eq!(resolved, FALLBACK_REPO_VERSION);
            assert!(remapped);
        }
    }

    #[test]
    fn test_good_versions_pass_through() {
        assert_eq!(resolve_repo_version("1.28"), ("1.28", false));
        assert_eq!(resolve_repo_version("1.29"), ("1.29", false));
    }

    #[test]
    fn test_expired_repo_never_configured() {
        let exec = FakeExecutor::new().respond("dpkg-query", "", false);
        install(&exec, &test_config("1.25")).unwrap();
        assert!(!exec.ran("stable:/v1.25"));
        assert!(exec.ran(&format!("stable:/v{}", FALLBACK_REPO_VERSION)));
    }

    #[test]
    fn test_install_skipped_when_packages_present() {
        let exec = FakeExecutor::new().respond("dpkg-query", "hold ok installed", true);
        install(&exec, &test_config("1.28")).unwrap();
        assert!(!exec.ran("apt-get install"));
        assert!(!exec.ran("pkgs.k8s.io"));
    }

    #[test]
    fn test_install_refuses_without_curl() {
        let exec = FakeExecutor::new()
            .respond("dpkg-query", "", false)
            .respond("command -v curl", "", false);
        let err = install(&exec, &test_config("1.28")).unwrap_err();
        assert!(err.to_string().contains("curl"));
        assert!(!exec.ran("pkgs.k8s.io"));
    }

    #[test]
    fn test_stale_entries_purged_before_configuration() {
        let exec = FakeExecutor::new().respond("dpkg-query", "", false);
        install(&exec, &test_config("1.28")).unwrap();
        let log = exec.log.borrow();
        let purge_idx = log.iter().position(|c| c.contains("rm -f")).unwrap();
        let configure_idx = log.iter().position(|c| c.contains("Release.key")).unwrap();
        assert!(purge_idx < configure_idx);
        assert!(exec.ran("apt-mark hold kubelet kubeadm kubectl"));
    }
}
