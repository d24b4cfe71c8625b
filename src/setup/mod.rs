//! Per-node installer
//!
//! Prepares a single host and applies its cluster role. The informal
//! "disable swap; install runtime; install packages; apply role" sequence
//! is an explicit phase machine: `Uninitialized -> RuntimeReady ->
//! PackagesReady -> RoleApplied`, one fallible transition per phase.
//! Every transition is check-then-set idempotent, so re-running the
//! installer on an already-configured host is a safe no-op.

pub mod master;
pub mod packages;
pub mod runtime;
pub mod worker;

use crate::config::EnvConfig;
use crate::exec::CommandExecutor;
use anyhow::Result;
use std::fmt;

/// Control-plane credentials; presence means "already initialized".
pub const ADMIN_CONF: &str = "/etc/kubernetes/admin.conf";
/// Node-agent configuration; presence means "already joined".
pub const KUBELET_CONF: &str = "/etc/kubernetes/kubelet.conf";
/// Container runtime socket handed to kubeadm on both roles.
pub const CRI_SOCKET: &str = "unix:///run/containerd/containerd.sock";
/// Marker prefix for the join-credential line the master step prints.
/// This is the sole structured output contract between the master installer
/// and the coordinator; it must stay byte-stable.
pub const JOIN_MARKER: &str = "KUBESTRAP_JOIN";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Master,
    Worker,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Master => write!(f, "master"),
            Role::Worker => write!(f, "worker"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Uninitialized,
    RuntimeReady,
    PackagesReady,
    RoleApplied,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Uninitialized => write!(f, "uninitialized"),
            Phase::RuntimeReady => write!(f, "runtime-ready"),
            Phase::PackagesReady => write!(f, "packages-ready"),
            Phase::RoleApplied => write!(f, "role-applied"),
        }
    }
}

/// Does this host already hold control-plane credentials?
pub fn probe_master_initialized<E: CommandExecutor>(exec: &E) -> Result<bool> {
    exec.file_exists(ADMIN_CONF)
}

/// Has this host's node agent already joined a cluster?
pub fn probe_worker_joined<E: CommandExecutor>(exec: &E) -> Result<bool> {
    exec.file_exists(KUBELET_CONF)
}

/// Run the full installer for one role on one host. `working_root` is the
/// project tree on the host the executor targets; manifest paths resolve
/// against it.
pub fn run<E: CommandExecutor>(
    exec: &E,
    role: Role,
    join_command: Option<&str>,
    config: &EnvConfig,
    working_root: &str,
) -> Result<()> {
    let mut phase = Phase::Uninitialized;
    println!("Node setup, role {} (phase: {})", role, phase);
    println!();

    runtime::prepare(exec)?;
    phase = Phase::RuntimeReady;
    println!("✓ Phase: {}", phase);
    println!();

    packages::install(exec, config)?;
    phase = Phase::PackagesReady;
    println!("✓ Phase: {}", phase);
    println!();

    match role {
        Role::Master => master::apply(exec, config, working_root)?,
        Role::Worker => worker::apply(exec, join_command, config)?,
    }
    phase = Phase::RoleApplied;
    println!("✓ Phase: {}", phase);

    Ok(())
}
