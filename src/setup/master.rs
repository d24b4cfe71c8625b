//! Control-plane role
//!
//! Initializes the control plane (or restarts the node agent when
//! credentials already exist), waits for the API server with a bounded
//! retry budget, applies the add-on manifests, and prints a fresh join
//! credential on the marker line the coordinator captures.

use crate::config::EnvConfig;
use crate::exec::CommandExecutor;
use crate::setup::worker::normalize_join_command;
use crate::setup::{probe_master_initialized, CRI_SOCKET, JOIN_MARKER};
use anyhow::{Context, Result};
use std::time::Duration;

const POD_NETWORK_CIDR: &str = "10.244.0.0/16";
const SERVICE_CIDR: &str = "10.96.0.0/12";

/// Pod network add-on manifest, expected in the distributed tree.
const NETWORK_MANIFEST: &str = "manifests/kube-flannel.yml";
/// Optional container-metrics add-on manifest.
const METRICS_MANIFEST: &str = "manifests/cadvisor.yaml";

const HEALTH_ATTEMPTS: u32 = 45;
const HEALTH_INTERVAL: Duration = Duration::from_secs(2);

/// Apply the master role with the default health-poll budget.
/// `working_root` is the project tree on the host the executor targets.
pub fn apply<E: CommandExecutor>(exec: &E, config: &EnvConfig, working_root: &str) -> Result<()> {
    apply_with_budget(exec, config, working_root, HEALTH_ATTEMPTS, HEALTH_INTERVAL)
}

pub fn apply_with_budget<E: CommandExecutor>(
    exec: &E,
    config: &EnvConfig,
    working_root: &str,
    health_attempts: u32,
    health_interval: Duration,
) -> Result<()> {
    if probe_master_initialized(exec)? {
        // Existing credentials do not guarantee a live API server.
        println!("✓ Control plane already initialized, skipping kubeadm init");
        println!("Restarting kubelet...");
        exec.execute_shell_streaming("sudo systemctl restart kubelet")
            .context("Failed to restart kubelet")?;
    } else {
        let mut init_cmd = format!(
            "sudo kubeadm init --pod-network-cidr={} --service-cidr={} --cri-socket={}",
            POD_NETWORK_CIDR, SERVICE_CIDR, CRI_SOCKET
        );
        if let Some(ip) = &config.master_ip {
            init_cmd.push_str(&format!(" --apiserver-advertise-address={}", ip));
        }

        println!("Initializing control plane...");
        exec.execute_shell_streaming(&init_cmd)
            .context("kubeadm init failed")?;
    }

    wait_for_api_server(exec, health_attempts, health_interval)?;

    apply_addons(exec, working_root)?;
    install_kubeconfig(exec)?;
    emit_join_command(exec)?;
    Ok(())
}

/// Poll the API server health endpoint with a bounded budget.
fn wait_for_api_server<E: CommandExecutor>(
    exec: &E,
    attempts: u32,
    interval: Duration,
) -> Result<()> {
    println!("Waiting for the API server to become healthy...");
    for attempt in 1..=attempts {
        let output = exec.execute_shell("curl -sk https://localhost:6443/healthz")?;
        if output.status.success() && String::from_utf8_lossy(&output.stdout).trim() == "ok" {
            println!("✓ API server is healthy (attempt {}/{})", attempt, attempts);
            return Ok(());
        }
        if attempt < attempts {
            std::thread::sleep(interval);
        }
    }
    anyhow::bail!(
        "API server did not become healthy after {} attempts.\n\
         To recover, reset the node and re-run setup:\n\
           sudo kubeadm reset -f\n\
           kubestrap setup master",
        attempts
    );
}

/// Apply the pod-network and metrics add-ons from the distributed tree.
/// Paths are resolved against `working_root` so the probe and the apply hit
/// the same tree whether the executor is local or remote. A single missing
/// manifest is a warning; both missing is fatal.
fn apply_addons<E: CommandExecutor>(exec: &E, working_root: &str) -> Result<()> {
    let mut applied = 0;
    for (name, manifest) in [
        ("pod network add-on", NETWORK_MANIFEST),
        ("metrics add-on", METRICS_MANIFEST),
    ] {
        let path = format!("{}/{}", working_root, manifest);
        if !exec.file_exists(&path)? {
            println!("⚠ Manifest {} not found, skipping {}", path, name);
            continue;
        }
        println!("Applying {}...", name);
        exec.execute_shell_streaming(&format!(
            "sudo kubectl --kubeconfig /etc/kubernetes/admin.conf apply -f {}",
            path
        ))
        .with_context(|| format!("Failed to apply {}", name))?;
        applied += 1;
    }
    if applied == 0 {
        anyhow::bail!(
            "No add-on manifests found ({} and {} are both missing)",
            NETWORK_MANIFEST,
            METRICS_MANIFEST
        );
    }
    Ok(())
}

/// Copy admin credentials into the invoking user's kubeconfig.
fn install_kubeconfig<E: CommandExecutor>(exec: &E) -> Result<()> {
    println!("Installing admin kubeconfig for the current user...");
    exec.execute_shell_streaming(
        "mkdir -p \"$HOME/.kube\" \
         && sudo cp -f /etc/kubernetes/admin.conf \"$HOME/.kube/config\" \
         && sudo chown \"$(id -u):$(id -g)\" \"$HOME/.kube/config\"",
    )
    .context("Failed to install admin kubeconfig")?;
    Ok(())
}

/// Mint a fresh bootstrap token and print the normalized join command on
/// the marker line for the coordinator to capture.
fn emit_join_command<E: CommandExecutor>(exec: &E) -> Result<()> {
    let output = exec
        .execute_shell("sudo kubeadm token create --print-join-command")
        .context("Failed to create a bootstrap token")?;
    if !output.status.success() {
        anyhow::bail!(
            "kubeadm token create failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    let raw = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if raw.is_empty() {
        anyhow::bail!("kubeadm token create produced an empty join command");
    }

    let join = normalize_join_command(&raw);
    println!("{}={}", JOIN_MARKER, join);
    Ok(())
}
