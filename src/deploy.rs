//! Post-bootstrap deployment (optional phase)
//!
//! Applies the demo application and metrics manifests on the master,
//! scales every workload to a single replica (the lone worker cannot hold
//! more), and (re)starts the auxiliary background sessions: reverse proxy,
//! deployment controller, metrics collector on the master and the load
//! generator on the loadgen host. Sessions are detached tmux sessions; a
//! prior session of the same name is replaced.

use crate::config::EnvConfig;
use crate::exec::SshConnection;
use anyhow::{Context, Result};
use std::path::Path;

/// Application workloads, scaled to one replica each.
pub const WORKLOADS: &[&str] = &[
    "frontend",
    "catalogue",
    "carts",
    "orders",
    "payment",
    "shipping",
    "user",
];

/// Container-metrics agent workload; its rollout failures are tolerated.
pub const METRICS_AGENT: &str = "cadvisor";

const MASTER_RUNTIME_FILES: &[&str] = &[
    "runtime/reverse_proxy.py",
    "runtime/controller_rule.py",
    "runtime/controller_pid.py",
    "runtime/controller_mpc.py",
    "runtime/collect_metrics.py",
];

const LOADGEN_RUNTIME_FILES: &[&str] = &["runtime/load_generator.py", "runtime/locustfile.py"];

/// tmux and the Python runtime are assumed by the background sessions.
const ENSURE_TOOLS_SCRIPT: &str = r#"
set -e
if ! command -v tmux > /dev/null 2>&1; then
    sudo apt-get update
    sudo apt-get install -y --no-install-recommends tmux
fi
if ! command -v python3 > /dev/null 2>&1 || ! command -v pip3 > /dev/null 2>&1; then
    sudo apt-get install -y --no-install-recommends python3 python3-pip
fi
"#;

const APPLY_AND_SCALE_SCRIPT: &str = r#"
set -e
cd "$1"
kubectl="sudo kubectl --kubeconfig /etc/kubernetes/admin.conf"
$kubectl apply -f manifests/app.yaml
if [ -f manifests/cadvisor.yaml ]; then
    $kubectl apply -f manifests/cadvisor.yaml
fi
for workload in $2; do
    $kubectl scale deployment "$workload" --replicas=1
done
"#;

const RESTART_SESSION_SCRIPT: &str = r#"
set -e
cd "$1"
tmux kill-session -t "$2" 2> /dev/null || true
tmux new-session -d -s "$2" "$3"
"#;

const REWRITE_TARGET_SCRIPT: &str = r#"
set -e
cd "$1"
for f in runtime/load_generator.py runtime/locustfile.py; do
    [ -f "$f" ] || continue
    sed -i -E "s|^TARGET_HOST *=.*|TARGET_HOST = \"$2\"|" "$f"
done
"#;

/// Named background sessions started on the master, with their commands.
pub fn master_sessions(config: &EnvConfig) -> Vec<(String, String)> {
    vec![
        (
            "proxy".to_string(),
            format!(
                "python3 runtime/reverse_proxy.py --port {}",
                config.frontend_port
            ),
        ),
        (
            "controller".to_string(),
            format!("python3 {}", config.controller_variant.script_name()),
        ),
        (
            "collector".to_string(),
            "python3 runtime/collect_metrics.py".to_string(),
        ),
    ]
}

/// Run the full deploy phase.
pub fn deploy(config: &EnvConfig) -> Result<()> {
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    println!("Deploying application and control stack");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    println!();

    deploy_master(config)?;
    if config.skip_loadgen {
        println!("Skipping loadgen deployment (SKIP_LOADGEN)");
    } else {
        deploy_loadgen(config)?;
    }
    Ok(())
}

fn deploy_master(config: &EnvConfig) -> Result<()> {
    let conn = SshConnection::new(&config.ssh_target(&config.master_host));

    println!("Checking session tools on {}...", config.master_host);
    conn.run_script_streaming(ENSURE_TOOLS_SCRIPT, &[])
        .context("Failed to prepare tmux/python on the master")?;

    push_runtime_files(&conn, config, MASTER_RUNTIME_FILES)?;

    println!("Applying manifests and scaling workloads...");
    conn.run_script_streaming(
        APPLY_AND_SCALE_SCRIPT,
        &[&config.remote_path, &WORKLOADS.join(" ")],
    )
    .context("Failed to apply or scale the application manifests")?;

    for (name, command) in master_sessions(config) {
        println!("Restarting session '{}'...", name);
        conn.run_script_streaming(
            RESTART_SESSION_SCRIPT,
            &[&config.remote_path, &name, &command],
        )
        .with_context(|| format!("Failed to start tmux session '{}'", name))?;
    }

    println!("✓ Master deployment complete");
    Ok(())
}

fn deploy_loadgen(config: &EnvConfig) -> Result<()> {
    let conn = SshConnection::new(&config.ssh_target(&config.loadgen_host));

    println!();
    println!("Checking session tools on {}...", config.loadgen_host);
    conn.run_script_streaming(ENSURE_TOOLS_SCRIPT, &[])
        .context("Failed to prepare tmux/python on the loadgen host")?;

    push_runtime_files(&conn, config, LOADGEN_RUNTIME_FILES)?;

    println!(
        "Pointing load scripts at {}...",
        config.master_address()
    );
    conn.run_script_streaming(
        REWRITE_TARGET_SCRIPT,
        &[&config.remote_path, config.master_address()],
    )
    .context("Failed to rewrite load-generation targets")?;

    println!("Restarting session 'loadgen'...");
    conn.run_script_streaming(
        RESTART_SESSION_SCRIPT,
        &[
            &config.remote_path,
            "loadgen",
            "python3 runtime/load_generator.py",
        ],
    )
    .context("Failed to start the load-generation session")?;

    println!("✓ Loadgen deployment complete");
    Ok(())
}

/// Push the listed runtime files from the local tree; files absent locally
/// are skipped with a notice.
fn push_runtime_files(conn: &SshConnection, config: &EnvConfig, files: &[&str]) -> Result<()> {
    for file in files {
        let local = config.project_root.join(file);
        if !local.exists() {
            println!("⚠ {} not found locally, skipping push", file);
            continue;
        }
        let content = std::fs::read(&local)
            .with_context(|| format!("Failed to read {}", local.display()))?;
        let remote = format!("{}/{}", config.remote_path, file);
        if let Some(parent) = Path::new(&remote).parent() {
            conn.mkdir_p(&parent.to_string_lossy())?;
        }
        conn.write_file(&remote, &content)?;
        println!("✓ Pushed {}", file);
    }
    Ok(())
}
