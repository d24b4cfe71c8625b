//! Environment resolution
//!
//! All options are resolved once at startup into an immutable `EnvConfig`.
//! Precedence per key: `.env` override file > process environment > default.

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Default NodePort the demo frontend is exposed on.
const DEFAULT_FRONTEND_PORT: u16 = 30440;

/// Deployment controller implementation started on the master.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerVariant {
    Rule,
    Pid,
    Mpc,
}

impl ControllerVariant {
    pub fn parse(value: &str) -> Result<Self> {
        match value.trim().to_lowercase().as_str() {
            "rule" => Ok(ControllerVariant::Rule),
            "pid" => Ok(ControllerVariant::Pid),
            "mpc" => Ok(ControllerVariant::Mpc),
            other => anyhow::bail!(
                "Unknown CONTROLLER_VARIANT '{}' (expected rule, pid, or mpc)",
                other
            ),
        }
    }

    /// Script the controller tmux session runs.
    pub fn script_name(&self) -> &'static str {
        match self {
            ControllerVariant::Rule => "runtime/controller_rule.py",
            ControllerVariant::Pid => "runtime/controller_pid.py",
            ControllerVariant::Mpc => "runtime/controller_mpc.py",
        }
    }
}

/// Resolved configuration, immutable after load.
#[derive(Debug, Clone)]
pub struct EnvConfig {
    pub master_host: String,
    pub worker_host: String,
    pub loadgen_host: String,
    pub ssh_user: String,
    pub project_name: String,
    /// Local project tree the distributor packages.
    pub project_root: PathBuf,
    /// Where the project lands on each remote host.
    pub remote_path: String,
    /// Source reference for git distribution; `None` selects archive streaming.
    pub repo_url: Option<String>,
    pub repo_branch: String,
    /// Requested apt repository minor version, defaulting to `K8S_VERSION`
    /// (may be remapped away from expired keys, see packages).
    pub repo_version: String,
    /// Explicit advertise address for the control plane, if known.
    pub master_ip: Option<String>,
    /// Pre-supplied worker join command.
    pub join_command: Option<String>,
    pub skip_loadgen: bool,
    pub run_deploy: bool,
    pub controller_variant: ControllerVariant,
    pub frontend_port: u16,
}

impl EnvConfig {
    /// Address the loadgen scripts and the frontend probe should target.
    pub fn master_address(&self) -> &str {
        self.master_ip.as_deref().unwrap_or(&self.master_host)
    }

    /// `user@host` for an SSH connection.
    pub fn ssh_target(&self, host: &str) -> String {
        format!("{}@{}", self.ssh_user, host)
    }
}

/// Read the `.env` override file into a map without touching the process
/// environment. File values must win over inherited environment variables.
fn read_override_file(path: &Path) -> Result<HashMap<String, String>> {
    let mut overrides = HashMap::new();
    if !path.exists() {
        return Ok(overrides);
    }
    // The iterator API is deprecated upstream but is the only dotenv entry
    // point that yields keys without mutating the process environment.
    #[allow(deprecated)]
    let iter = dotenv::from_path_iter(path)
        .with_context(|| format!("Failed to open override file {}", path.display()))?;
    for item in iter {
        let (key, value) =
            item.with_context(|| format!("Malformed line in {}", path.display()))?;
        overrides.insert(key, value);
    }
    Ok(overrides)
}

fn lookup(overrides: &HashMap<String, String>, key: &str) -> Option<String> {
    overrides
        .get(key)
        .cloned()
        .or_else(|| std::env::var(key).ok())
}

fn lookup_or(overrides: &HashMap<String, String>, key: &str, default: &str) -> String {
    lookup(overrides, key).unwrap_or_else(|| default.to_string())
}

fn lookup_flag(overrides: &HashMap<String, String>, key: &str) -> bool {
    lookup(overrides, key)
        .map(|v| matches!(v.trim().to_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(false)
}

/// Load configuration from `<project_root>/.env`, the environment, and defaults.
pub fn load(project_root: &Path) -> Result<EnvConfig> {
    let overrides = read_override_file(&project_root.join(".env"))?;
    build(project_root, &overrides)
}

fn build(project_root: &Path, overrides: &HashMap<String, String>) -> Result<EnvConfig> {
    let ssh_user = lookup_or(overrides, "SSH_USER", &whoami::username());
    let project_name = lookup_or(overrides, "PROJECT_NAME", "kubestrap");
    let remote_path = lookup(overrides, "REMOTE_PATH")
        .unwrap_or_else(|| format!("/home/{}/{}", ssh_user, project_name));
    let k8s_version = lookup_or(overrides, "K8S_VERSION", "1.28");
    let repo_version = lookup_or(overrides, "K8S_REPO_VERSION", &k8s_version);
    let controller_variant =
        ControllerVariant::parse(&lookup_or(overrides, "CONTROLLER_VARIANT", "rule"))?;
    let frontend_port = match lookup(overrides, "FRONTEND_PORT") {
        Some(raw) => raw
            .trim()
            .parse::<u16>()
            .with_context(|| format!("FRONTEND_PORT is not a valid port: '{}'", raw))?,
        None => DEFAULT_FRONTEND_PORT,
    };

    Ok(EnvConfig {
        master_host: lookup_or(overrides, "MASTER_HOST", "master"),
        worker_host: lookup_or(overrides, "WORKER_HOST", "worker"),
        loadgen_host: lookup_or(overrides, "LOADGEN_HOST", "loadgen"),
        ssh_user,
        project_name,
        project_root: project_root.to_path_buf(),
        remote_path,
        repo_url: lookup(overrides, "REPO_URL"),
        repo_branch: lookup_or(overrides, "REPO_BRANCH", "main"),
        repo_version,
        master_ip: lookup(overrides, "MASTER_IP"),
        join_command: lookup(overrides, "JOIN_COMMAND"),
        skip_loadgen: lookup_flag(overrides, "SKIP_LOADGEN"),
        run_deploy: lookup_flag(overrides, "RUN_DEPLOY"),
        controller_variant,
        frontend_port,
    })
}

/// Fixed configuration for unit tests, built without consulting the
/// process environment so exported variables cannot leak into assertions.
#[cfg(test)]
pub fn test_config() -> EnvConfig {
    EnvConfig {
        master_host: "master".to_string(),
        worker_host: "worker".to_string(),
        loadgen_host: "loadgen".to_string(),
        ssh_user: "testuser".to_string(),
        project_name: "kubestrap".to_string(),
        project_root: PathBuf::from("/tmp/kubestrap-test"),
        remote_path: "/home/testuser/kubestrap".to_string(),
        repo_url: None,
        repo_branch: "main".to_string(),
        repo_version: "1.28".to_string(),
        master_ip: None,
        join_command: None,
        skip_loadgen: false,
        run_deploy: false,
        controller_variant: ControllerVariant::Rule,
        frontend_port: DEFAULT_FRONTEND_PORT,
    }
}
