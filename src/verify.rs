//! Post-deploy verification
//!
//! Awaits workload rollouts with a bounded timeout, then probes the
//! externally exposed frontend port. An unreachable frontend is reported
//! but not fatal; the service may still be warming up.

use crate::config::EnvConfig;
use crate::deploy::{METRICS_AGENT, WORKLOADS};
use crate::exec::SshConnection;
use anyhow::{Context, Result};
use std::time::Duration;

const ROLLOUT_TIMEOUT_SECS: u32 = 300;
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

const ROLLOUT_SCRIPT: &str = r#"
set -e
cd "$1"
sudo kubectl --kubeconfig /etc/kubernetes/admin.conf \
    rollout status "$2" --timeout="$3"
"#;

pub fn frontend_url(config: &EnvConfig) -> String {
    format!("http://{}:{}/", config.master_address(), config.frontend_port)
}

/// Await rollouts and probe the frontend.
pub fn verify(config: &EnvConfig) -> Result<()> {
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    println!("Verifying deployment");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    println!();

    await_rollouts(config)?;
    probe_frontend(config);
    Ok(())
}

fn await_rollouts(config: &EnvConfig) -> Result<()> {
    let conn = SshConnection::new(&config.ssh_target(&config.master_host));
    let timeout = format!("{}s", ROLLOUT_TIMEOUT_SECS);

    for workload in WORKLOADS {
        println!("Waiting for rollout of {}...", workload);
        conn.run_script_streaming(
            ROLLOUT_SCRIPT,
            &[
                &config.remote_path,
                &format!("deployment/{}", workload),
                &timeout,
            ],
        )
        .with_context(|| format!("Rollout of {} did not complete in time", workload))?;
    }

    // The metrics agent is best effort; a stuck rollout is only a warning.
    println!("Waiting for rollout of {} (best effort)...", METRICS_AGENT);
    if let Err(e) = conn.run_script_streaming(
        ROLLOUT_SCRIPT,
        &[
            &config.remote_path,
            &format!("daemonset/{}", METRICS_AGENT),
            &timeout,
        ],
    ) {
        println!("⚠ Metrics agent rollout did not complete: {}", e);
    }

    println!("✓ Application rollouts complete");
    Ok(())
}

/// Probe the exposed frontend port. Reported, never fatal.
fn probe_frontend(config: &EnvConfig) {
    let url = frontend_url(config);
    println!();
    println!("Probing frontend at {}...", url);

    let client = match reqwest::blocking::Client::builder()
        .timeout(PROBE_TIMEOUT)
        .build()
    {
        Ok(client) => client,
        Err(e) => {
            println!("⚠ Could not build HTTP client: {}", e);
            return;
        }
    };

    match client.get(&url).send() {
        Ok(response) => {
            println!("✓ Frontend reachable (HTTP {})", response.status().as_u16());
        }
        Err(e) => {
            println!("⚠ Frontend not reachable yet: {}", e);
            println!("  The service may still be warming up; retry in a minute.");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> EnvConfig {
        crate::config::test_config()
    }

    #[test]
    fn test_frontend_url_uses_master_address_and_port() {
        let mut config = test_config();
        config.master_ip = Some("10.1.2.3".to_string());
        config.frontend_port = 30440;
        assert_eq!(frontend_url(&config), "http://10.1.2.3:30440/");
    }

    #[test]
    fn test_frontend_url_falls_back_to_hostname() {
        let mut config = test_config();
        config.master_ip = None;
        config.master_host = "master-node".to_string();
        assert_eq!(
            frontend_url(&config),
            format!("http://master-node:{}/", config.frontend_port)
        );
    }

    #[test]
    fn test_rollout_timeout_is_bounded() {
        assert_eq!(ROLLOUT_TIMEOUT_SECS, 300);
        assert!(ROLLOUT_SCRIPT.contains("rollout status"));
    }
}
