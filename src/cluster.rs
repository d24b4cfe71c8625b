//! Cluster bootstrap coordination
//!
//! Sequences the multi-node bring-up: distribute the project to every
//! host, run the installer role=master on the master while capturing its
//! output, extract the join credential from the capture, then run the
//! installer role=worker with the credential. The worker step never starts
//! before the master output is fully captured and parsed.

use crate::config::EnvConfig;
use crate::deploy;
use crate::distribute;
use crate::exec::SshConnection;
use crate::setup::JOIN_MARKER;
use crate::verify;
use anyhow::{Context, Result};

const RUN_MASTER_SCRIPT: &str = r#"
set -e
cd "$1"
./kubestrap setup master
"#;

const RUN_WORKER_SCRIPT: &str = r#"
set -e
cd "$1"
./kubestrap setup worker "$2"
"#;

/// Extract the join credential from captured master output: the last line
/// carrying the marker prefix wins; zero matches is a hand-off failure.
pub fn extract_join_command(output: &str) -> Option<String> {
    let prefix = format!("{}=", JOIN_MARKER);
    output
        .lines()
        .rev()
        .find_map(|line| line.strip_prefix(prefix.as_str()))
        .map(|credential| credential.trim().to_string())
        .filter(|credential| !credential.is_empty())
}

/// Full multi-node bootstrap.
pub fn bootstrap(config: &EnvConfig) -> Result<()> {
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    println!("Cluster bootstrap: {} + {}", config.master_host, config.worker_host);
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    println!();

    distribute::distribute(&config.master_host, config)?;
    distribute::distribute(&config.worker_host, config)?;
    if config.skip_loadgen {
        println!("Skipping loadgen host preparation (SKIP_LOADGEN)");
    } else {
        distribute::distribute(&config.loadgen_host, config)?;
    }
    println!();

    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    println!("Setting up control plane on {}", config.master_host);
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    println!();

    let master = SshConnection::new(&config.ssh_target(&config.master_host));
    let captured = master
        .run_script_streaming(RUN_MASTER_SCRIPT, &[&config.remote_path])
        .context("Master setup failed")?;
    save_capture(&captured, config);

    let join = extract_join_command(&captured).with_context(|| {
        format!(
            "No {}= line found in the master output; refusing to join the \
             worker against an unknown credential",
            JOIN_MARKER
        )
    })?;
    println!();
    println!("✓ Captured join credential from master output");
    println!();

    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    println!("Joining worker {}", config.worker_host);
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    println!();

    let worker = SshConnection::new(&config.ssh_target(&config.worker_host));
    worker
        .run_script_streaming(RUN_WORKER_SCRIPT, &[&config.remote_path, &join])
        .context("Worker join failed")?;

    println!();
    println!("✓ Cluster is up");

    if config.run_deploy {
        println!();
        deploy::deploy(config)?;
        verify::verify(config)?;
    }

    Ok(())
}

/// Keep a timestamped capture of the master output for post-mortems.
/// Best effort; a failed write never aborts the bootstrap.
fn save_capture(captured: &str, config: &EnvConfig) {
    let stamp = chrono::Local::now().format("%Y%m%d-%H%M%S");
    let path = std::env::temp_dir().join(format!(
        "kubestrap-{}-master-{}.log",
        config.project_name, stamp
    ));
    match std::fs::write(&path, captured) {
        Ok(()) => println!("Master output captured to {}", path.display()),
        Err(e) => println!("⚠ Could not save capture file: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_takes_last_marker_line() {
        let output = "\
preparing node
KUBESTRAP_JOIN=kubeadm join 10.0.0.1:6443 --token old.token --cri-socket=unix:///run/containerd/containerd.sock
restarting kubelet
KUBESTRAP_JOIN=kubeadm join 10.0.0.1:6443 --token new.token --cri-socket=unix:///run/containerd/containerd.sock
done
";
        let join = extract_join_command(output).unwrap();
        assert!(join.contains("new.token"));
        assert!(!join.contains("old.token"));
        assert!(join.starts_with("kubeadm join"));
    }

    #[test]
    fn test_extract_fails_on_no_marker() {
        let output = "preparing node\nkubeadm init done\n";
        assert!(extract_join_command(output).is_none());
    }

    #[test]
    fn test_extract_rejects_empty_credential() {
        assert!(extract_join_command("KUBESTRAP_JOIN=\n").is_none());
        assert!(extract_join_command("KUBESTRAP_JOIN=   \n").is_none());
    }

    #[test]
    fn test_extract_ignores_indented_lookalikes() {
        let output = "  KUBESTRAP_JOIN=not-a-marker-line\n";
        assert!(extract_join_command(output).is_none());
    }
}
