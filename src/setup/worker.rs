//! Worker role
//!
//! Joins the node to an existing control plane. The join credential comes
//! from the CLI argument first, then the configuration; proceeding without
//! one would join against an undefined token, so the step fails closed.

use crate::config::EnvConfig;
use crate::exec::CommandExecutor;
use crate::setup::{probe_worker_joined, CRI_SOCKET};
use anyhow::{Context, Result};

/// Normalize a captured join command: drop a leading elevation prefix
/// (elevation is applied at execution time) and make sure the CRI socket
/// flag is present exactly once.
pub fn normalize_join_command(raw: &str) -> String {
    let mut command = raw.trim();
    if let Some(stripped) = command.strip_prefix("sudo ") {
        command = stripped.trim_start();
    }
    let mut command = command.to_string();
    if !command.contains("--cri-socket") {
        command.push_str(&format!(" --cri-socket={}", CRI_SOCKET));
    }
    command
}

/// Apply the worker role.
pub fn apply<E: CommandExecutor>(
    exec: &E,
    join_command: Option<&str>,
    config: &EnvConfig,
) -> Result<()> {
    if probe_worker_joined(exec)? {
        println!("✓ Node already joined to a cluster, skipping join");
        return Ok(());
    }

    let raw = join_command
        .map(str::to_string)
        .or_else(|| config.join_command.clone())
        .filter(|c| !c.trim().is_empty())
        .context(
            "No join command available for the worker role.\n\
             Provide one as an argument or set JOIN_COMMAND in .env:\n\
               kubestrap setup worker 'kubeadm join <host>:6443 --token ...'",
        )?;

    let join = normalize_join_command(&raw);
    println!("Joining the cluster...");
    exec.execute_shell_streaming(&format!("sudo {}", join))
        .context("kubeadm join failed")?;
    println!("✓ Node joined the cluster");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::fake::FakeExecutor;
    use crate::setup::KUBELET_CONF;

    const RAW_JOIN: &str =
        "kubeadm join 10.0.0.1:6443 --token abc.123 --discovery-token-ca-cert-hash sha256:deadbeef";

    fn test_config() -> EnvConfig {
        crate::config::test_config()
    }

    #[test]
    fn test_normalize_strips_sudo_and_appends_socket() {
        let normalized = normalize_join_command(&format!("sudo {}", RAW_JOIN));
        assert!(!normalized.starts_with("sudo"));
        assert!(normalized.starts_with("kubeadm join"));
        assert_eq!(
            normalized.matches("--cri-socket").count(),
            1,
            "socket flag appended exactly once"
        );
        assert!(normalized.ends_with(&format!("--cri-socket={}", CRI_SOCKET)));
    }

    #[test]
    fn test_normalize_does_not_duplicate_socket_flag() {
        let with_socket = format!("{} --cri-socket={}", RAW_JOIN, CRI_SOCKET);
        let normalized = normalize_join_command(&with_socket);
        assert_eq!(normalized.matches("--cri-socket").count(), 1);
        assert_eq!(normalized, with_socket);
    }

    #[test]
    fn test_join_executes_once_then_skips() {
        // Scenario C: first invocation joins, second is a no-op.
        let exec = FakeExecutor::new();
        apply(&exec, Some(RAW_JOIN), &test_config()).unwrap();
        assert!(exec.ran("kubeadm join"));

        let joined = FakeExecutor::new().with_file(KUBELET_CONF, "apiVersion: v1");
        apply(&joined, Some(RAW_JOIN), &test_config()).unwrap();
        assert!(!joined.ran("kubeadm join"));
    }

    #[test]
    fn test_missing_join_command_fails_closed() {
        let exec = FakeExecutor::new();
        let mut config = test_config();
        config.join_command = None;
        let err = apply(&exec, None, &config).unwrap_err();
        assert!(err.to_string().contains("No join command"));
        assert!(!exec.ran("kubeadm join"));
    }

    #[test]
    fn test_blank_join_command_fails_closed() {
        let exec = FakeExecutor::new();
        let mut config = test_config();
        config.join_command = Some("   ".to_string());
        assert!(apply(&exec, None, &config).is_err());
    }

    #[test]
    fn test_config_join_command_used_as_fallback() {
        let exec = FakeExecutor::new();
        let mut config = test_config();
        config.join_command = Some(RAW_JOIN.to_string());
        apply(&exec, None, &config).unwrap();
        assert!(exec.ran("kubeadm join 10.0.0.1:6443"));
    }
}
