//! Repository distribution
//!
//! Guarantees a working copy of the project at the resolved remote path on
//! a target host. Archive streaming is the default: the local tree is
//! packed into a tar.gz and piped straight into `tar -x` on the far side,
//! no temp file on either end. When a source reference is configured the
//! git strategy is used instead: clone if absent, otherwise fetch and
//! fast-forward, leaving the current branch untouched with a warning if
//! the target branch does not exist upstream.

use crate::config::EnvConfig;
use crate::exec::{shell_escape, SshConnection};
use anyhow::{Context, Result};
use flate2::write::GzEncoder;
use flate2::Compression;
use std::path::Path;

const GIT_SYNC_SCRIPT: &str = r#"
set -e
path="$1"; url="$2"; branch="$3"
if [ ! -d "$path/.git" ]; then
    git clone "$url" "$path"
fi
cd "$path"
git fetch origin
if git ls-remote --exit-code --heads origin "$branch" > /dev/null 2>&1; then
    git checkout "$branch"
    git merge --ff-only "origin/$branch"
else
    echo "warning: branch $branch not found upstream, leaving current branch untouched"
fi
"#;

/// Directory and file names never shipped to a host.
fn is_excluded(name: &str) -> bool {
    matches!(name, ".git" | "target" | "__pycache__" | ".venv") || name.ends_with(".pyc")
}

/// Ensure the project is present on `host` and push the local overrides.
pub fn distribute(host: &str, config: &EnvConfig) -> Result<()> {
    which::which("ssh").context("ssh is required on the local machine")?;

    let conn = SshConnection::new(&config.ssh_target(host));
    println!("Distributing {} to {}...", config.project_name, conn.target());

    if let Some(repo_url) = &config.repo_url {
        sync_via_git(&conn, repo_url, config)?;
    } else {
        sync_via_archive(&conn, config)?;
    }

    push_override_file(&conn, config)?;
    install_binary(&conn, config)?;

    println!("✓ {} is up to date on {}", config.project_name, host);
    Ok(())
}

fn sync_via_git(conn: &SshConnection, repo_url: &str, config: &EnvConfig) -> Result<()> {
    println!("Syncing via git ({} @ {})...", repo_url, config.repo_branch);
    let output = conn
        .run_script(
            GIT_SYNC_SCRIPT,
            &[&config.remote_path, repo_url, &config.repo_branch],
        )
        .context("git sync session failed")?;
    let stdout = String::from_utf8_lossy(&output.stdout);
    print!("{}", stdout);
    if !output.status.success() {
        anyhow::bail!(
            "git sync failed on {}: {}",
            conn.target(),
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    if stdout.contains("not found upstream") {
        println!(
            "⚠ Branch {} does not exist upstream; existing checkout left as is",
            config.repo_branch
        );
    }
    Ok(())
}

fn sync_via_archive(conn: &SshConnection, config: &EnvConfig) -> Result<()> {
    println!("Packing project tree...");
    let archive = pack_tree(&config.project_root)
        .with_context(|| format!("Failed to pack {}", config.project_root.display()))?;
    println!(
        "Streaming archive ({} KiB) to {}...",
        archive.len() / 1024,
        conn.target()
    );
    let remote = shell_escape(&config.remote_path);
    conn.stream_to_shell(&format!("mkdir -p {r} && tar -xzf - -C {r}", r = remote), &archive)
        .context("Archive extraction failed on the remote host")
}

/// Build a gzipped tar of the tree, skipping VCS metadata, build caches,
/// and bytecode artifacts.
fn pack_tree(root: &Path) -> Result<Vec<u8>> {
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = tar::Builder::new(encoder);
    append_dir(&mut builder, root, Path::new(""))?;
    let encoder = builder.into_inner().context("Failed to finish archive")?;
    encoder.finish().context("Failed to finish compression")
}

fn append_dir(
    builder: &mut tar::Builder<GzEncoder<Vec<u8>>>,
    dir: &Path,
    rel: &Path,
) -> Result<()> {
    for entry in std::fs::read_dir(dir)
        .with_context(|| format!("Failed to read directory {}", dir.display()))?
    {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        if is_excluded(&name) {
            continue;
        }
        let path = entry.path();
        let rel_path = rel.join(&name);
        if path.is_dir() {
            append_dir(builder, &path, &rel_path)?;
        } else if path.is_file() {
            builder
                .append_path_with_name(&path, &rel_path)
                .with_context(|| format!("Failed to archive {}", path.display()))?;
        }
    }
    Ok(())
}

/// Push the local `.env` override file, with a notice if there is none.
fn push_override_file(conn: &SshConnection, config: &EnvConfig) -> Result<()> {
    let local_env = config.project_root.join(".env");
    if !local_env.exists() {
        println!("No local .env override file, skipping push");
        return Ok(());
    }
    let content = std::fs::read(&local_env)
        .with_context(|| format!("Failed to read {}", local_env.display()))?;
    conn.write_file(&format!("{}/.env", config.remote_path), &content)?;
    println!("✓ Pushed .env override file");
    Ok(())
}

/// Ship the running binary so the coordinator can invoke the installer on
/// the host, and mark it executable.
fn install_binary(conn: &SshConnection, config: &EnvConfig) -> Result<()> {
    let exe = std::env::current_exe().context("Failed to locate the running binary")?;
    let bytes =
        std::fs::read(&exe).with_context(|| format!("Failed to read {}", exe.display()))?;
    let remote_bin = format!("{}/kubestrap", config.remote_path);
    conn.write_file(&remote_bin, &bytes)?;
    let output = conn.execute_simple("chmod", &["+x", &remote_bin])?;
    if !output.status.success() {
        anyhow::bail!("Failed to mark {} executable", remote_bin);
    }
    println!("✓ Installed kubestrap binary on {}", conn.target());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;
    use std::fs;

    #[test]
    fn test_exclusion_filter() {
        assert!(is_excluded(".git"));
        assert!(is_excluded("target"));
        assert!(is_excluded("__pycache__"));
        assert!(is_excluded(".venv"));
        assert!(is_excluded("module.pyc"));
        assert!(!is_excluded("src"));
        assert!(!is_excluded("manifests"));
        assert!(!is_excluded("controller.py"));
    }

    #[test]
    fn test_pack_tree_skips_excluded_entries() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("src")).unwrap();
        fs::write(dir.path().join("src/main.rs"), "fn main() {}").unwrap();
        fs::write(dir.path().join("run.py"), "print('hi')").unwrap();
        fs::create_dir(dir.path().join(".git")).unwrap();
        fs::write(dir.path().join(".git/HEAD"), "ref: x").unwrap();
        fs::write(dir.path().join("run.pyc"), "bytecode").unwrap();

        let archive = pack_tree(dir.path()).unwrap();
        let mut entries = Vec::new();
        let mut reader = tar::Archive::new(GzDecoder::new(archive.as_slice()));
        for entry in reader.entries().unwrap() {
            let entry = entry.unwrap();
            entries.push(entry.path().unwrap().to_string_lossy().to_string());
        }
        entries.sort();

        assert_eq!(entries, vec!["run.py", "src/main.rs"]);
    }

    #[test]
    fn test_git_sync_script_warns_instead_of_failing() {
        // The fallback path must not abort the script (set -e is active).
        assert!(GIT_SYNC_SCRIPT.contains("set -e"));
        assert!(GIT_SYNC_SCRIPT.contains("ls-remote --exit-code --heads"));
        assert!(GIT_SYNC_SCRIPT.contains("leaving current branch untouched"));
        assert!(GIT_SYNC_SCRIPT.contains("--ff-only"));
    }
}
