//! Local and remote command execution
//!
//! Every remote step is a structured request: a script body plus positional
//! arguments handed to `sh -s --` on the far side. Values never get spliced
//! into the remote command line, so spaces and shell metacharacters in
//! arguments survive the transport.

use anyhow::{Context, Result};
use std::io::{BufRead, BufReader, Write};
use std::process::{Command, Output, Stdio};

/// SSH connection for remote command execution.
///
/// Assumes pre-shared non-interactive authentication; `BatchMode` keeps a
/// misconfigured host from hanging the run on a password prompt.
pub struct SshConnection {
    target: String,
}

impl SshConnection {
    pub fn new(target: &str) -> Self {
        Self {
            target: target.to_string(),
        }
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    fn base_args(&self) -> Vec<String> {
        vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            "StrictHostKeyChecking=accept-new".to_string(),
            self.target.clone(),
        ]
    }

    pub fn execute_simple(&self, program: &str, args: &[&str]) -> Result<Output> {
        let mut ssh_args = self.base_args();
        ssh_args.push(program.to_string());
        for arg in args {
            ssh_args.push(arg.to_string());
        }

        Command::new("ssh")
            .args(&ssh_args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .with_context(|| format!("Failed to run '{}' on {}", program, self.target))
    }

    pub fn execute_shell(&self, command: &str) -> Result<Output> {
        let mut ssh_args = self.base_args();
        ssh_args.push("sh".to_string());
        ssh_args.push("-c".to_string());
        ssh_args.push(shell_escape(command));

        Command::new("ssh")
            .args(&ssh_args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .with_context(|| format!("Failed to run shell command on {}", self.target))
    }

    /// Run a script body remotely with positional arguments, collecting stdout.
    pub fn run_script(&self, script: &str, args: &[&str]) -> Result<Output> {
        let mut child = self.spawn_script(args, Stdio::piped(), Stdio::piped())?;
        self.feed_script(&mut child, script)?;
        child
            .wait_with_output()
            .with_context(|| format!("Failed to collect script output from {}", self.target))
    }

    /// Run a script body remotely, teeing its stdout to the console line by
    /// line while accumulating it for the caller. Fails on a non-zero remote
    /// exit status.
    pub fn run_script_streaming(&self, script: &str, args: &[&str]) -> Result<String> {
        let mut child = self.spawn_script(args, Stdio::piped(), Stdio::inherit())?;
        self.feed_script(&mut child, script)?;

        let stdout = child
            .stdout
            .take()
            .context("Remote session produced no stdout handle")?;
        let mut captured = String::new();
        for line in BufReader::new(stdout).lines() {
            let line = line.context("Failed to read remote output")?;
            println!("{}", line);
            captured.push_str(&line);
            captured.push('\n');
        }

        let status = child
            .wait()
            .with_context(|| format!("Failed to wait for remote session on {}", self.target))?;
        if !status.success() {
            anyhow::bail!(
                "Remote step on {} failed with exit code {}",
                self.target,
                status.code().unwrap_or(1)
            );
        }
        Ok(captured)
    }

    /// Run a remote shell command with the given bytes piped to its stdin.
    /// Used for archive streaming; no temp file on either side.
    pub fn stream_to_shell(&self, command: &str, input: &[u8]) -> Result<()> {
        let mut ssh_args = self.base_args();
        ssh_args.push("sh".to_string());
        ssh_args.push("-c".to_string());
        ssh_args.push(shell_escape(command));

        let mut child = Command::new("ssh")
            .args(&ssh_args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .spawn()
            .with_context(|| format!("Failed to open stream to {}", self.target))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(input)?;
            stdin.flush()?;
        }

        let status = child
            .wait()
            .with_context(|| format!("Stream to {} was interrupted", self.target))?;
        if !status.success() {
            anyhow::bail!(
                "Remote command '{}' on {} failed with exit code {}",
                command,
                self.target,
                status.code().unwrap_or(1)
            );
        }
        Ok(())
    }

    pub fn write_file(&self, path: &str, content: &[u8]) -> Result<()> {
        self.stream_to_shell(&format!("cat > {}", shell_escape(path)), content)
            .with_context(|| format!("Failed to write {} on {}", path, self.target))
    }

    pub fn file_exists(&self, path: &str) -> Result<bool> {
        let output = self.execute_simple("test", &["-f", path])?;
        Ok(output.status.success())
    }

    pub fn mkdir_p(&self, path: &str) -> Result<()> {
        let output = self.execute_simple("mkdir", &["-p", path])?;
        if !output.status.success() {
            anyhow::bail!("Failed to create {} on {}", path, self.target);
        }
        Ok(())
    }

    fn spawn_script(
        &self,
        args: &[&str],
        stdout: Stdio,
        stderr: Stdio,
    ) -> Result<std::process::Child> {
        let mut ssh_args = self.base_args();
        ssh_args.push("sh".to_string());
        ssh_args.push("-s".to_string());
        ssh_args.push("--".to_string());
        for arg in args {
            ssh_args.push(shell_escape(arg));
        }

        Command::new("ssh")
            .args(&ssh_args)
            .stdin(Stdio::piped())
            .stdout(stdout)
            .stderr(stderr)
            .spawn()
            .with_context(|| format!("Failed to open session to {}", self.target))
    }

    fn feed_script(&self, child: &mut std::process::Child, script: &str) -> Result<()> {
        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(script.as_bytes())
                .with_context(|| format!("Failed to send script to {}", self.target))?;
            stdin.flush()?;
        }
        Ok(())
    }
}

/// Escape a string for safe use in shell commands.
pub fn shell_escape(s: &str) -> String {
    if s.is_empty() {
        return "''".to_string();
    }
    if s
        .chars()
        .all(|c| c.is_alphanumeric() || c == '-' || c == '_' || c == '/' || c == '.' || c == '=' || c == ':')
    {
        return s.to_string();
    }
    let escaped = s.replace('\'', "'\"'\"'");
    format!("'{}'", escaped)
}

/// Local command execution helpers.
pub mod local {
    use super::*;

    pub fn execute_shell(command: &str) -> Result<Output> {
        Command::new("sh")
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .with_context(|| format!("Failed to execute shell command: {}", command))
    }

    pub fn execute_shell_streaming(command: &str) -> Result<()> {
        let status = Command::new("sh")
            .arg("-c")
            .arg(command)
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .status()
            .with_context(|| format!("Failed to execute shell command: {}", command))?;
        if !status.success() {
            anyhow::bail!(
                "Command failed with exit code {}: {}",
                status.code().unwrap_or(1),
                command
            );
        }
        Ok(())
    }
}

/// Trait for executing commands either locally or on a remote host. The
/// per-node installer is written against this seam so its state machine can
/// be exercised with a fake in tests.
pub trait CommandExecutor {
    fn execute_shell(&self, command: &str) -> Result<Output>;

    /// Run a shell command with inherited stdio, failing on non-zero exit.
    fn execute_shell_streaming(&self, command: &str) -> Result<()>;

    fn command_exists(&self, command: &str) -> Result<bool>;

    fn file_exists(&self, path: &str) -> Result<bool>;
}

/// Executor that is either the local machine or an SSH connection.
pub enum Executor {
    Local,
    Remote(SshConnection),
}

impl Executor {
    pub fn remote(target: &str) -> Self {
        Executor::Remote(SshConnection::new(target))
    }
}

impl CommandExecutor for Executor {
    fn execute_shell(&self, command: &str) -> Result<Output> {
        match self {
            Executor::Local => local::execute_shell(command),
            Executor::Remote(conn) => conn.execute_shell(command),
        }
    }

    fn execute_shell_streaming(&self, command: &str) -> Result<()> {
        match self {
            Executor::Local => local::execute_shell_streaming(command),
            Executor::Remote(conn) => {
                let output = conn.execute_shell(command)?;
                print!("{}", String::from_utf8_lossy(&output.stdout));
                if !output.status.success() {
                    anyhow::bail!(
                        "Remote command failed on {}: {}",
                        conn.target(),
                        String::from_utf8_lossy(&output.stderr).trim()
                    );
                }
                Ok(())
            }
        }
    }

    fn command_exists(&self, command: &str) -> Result<bool> {
        match self {
            Executor::Local => Ok(which::which(command).is_ok()),
            Executor::Remote(conn) => {
                let output = conn.execute_shell(&format!("command -v {}", command))?;
                Ok(output.status.success())
            }
        }
    }

    fn file_exists(&self, path: &str) -> Result<bool> {
        match self {
            Executor::Local => Ok(std::path::Path::new(path).exists()),
            Executor::Remote(conn) => conn.file_exists(path),
        }
    }
}

#[cfg(test)]
pub mod fake {
    use super::*;
    use std::cell::RefCell;
    use std::collections::HashMap;
    use std::os::unix::process::ExitStatusExt;
    use std::process::ExitStatus;

    /// Canned-response executor. Commands are matched against substring
    /// rules in order; unmatched commands succeed with empty output.
    #[derive(Default)]
    pub struct FakeExecutor {
        rules: Vec<(String, String, bool)>,
        pub files: RefCell<HashMap<String, String>>,
        pub log: RefCell<Vec<String>>,
    }

    impl FakeExecutor {
        pub fn new() -> Self {
            Self::default()
        }

        /// Register a response for any command containing `pattern`.
        pub fn respond(mut self, pattern: &str, stdout: &str, success: bool) -> Self {
            self.rules
                .push((pattern.to_string(), stdout.to_string(), success));
            self
        }

        pub fn with_file(self, path: &str, content: &str) -> Self {
            self.files
                .borrow_mut()
                .insert(path.to_string(), content.to_string());
            self
        }

        pub fn ran(&self, pattern: &str) -> bool {
            self.log.borrow().iter().any(|c| c.contains(pattern))
        }

        pub fn runs_matching(&self, pattern: &str) -> usize {
            self.log.borrow().iter().filter(|c| c.contains(pattern)).count()
        }

        fn respond_to(&self, command: &str) -> (String, bool) {
            self.log.borrow_mut().push(command.to_string());
            for (pattern, stdout, success) in &self.rules {
                if command.contains(pattern.as_str()) {
                    return (stdout.clone(), *success);
                }
            }
            (String::new(), true)
        }

        fn output_for(&self, command: &str) -> Output {
            let (stdout, success) = self.respond_to(command);
            Output {
                status: ExitStatus::from_raw(if success { 0 } else { 1 << 8 }),
                stdout: stdout.into_bytes(),
                stderr: Vec::new(),
            }
        }
    }

    impl CommandExecutor for FakeExecutor {
        fn execute_shell(&self, command: &str) -> Result<Output> {
            Ok(self.output_for(command))
        }

        fn execute_shell_streaming(&self, command: &str) -> Result<()> {
            let (_, success) = self.respond_to(command);
            if !success {
                anyhow::bail!("fake command failed: {}", command);
            }
            Ok(())
        }

        fn command_exists(&self, command: &str) -> Result<bool> {
            let (_, success) = self.respond_to(&format!("command -v {}", command));
            Ok(success)
        }

        fn file_exists(&self, path: &str) -> Result<bool> {
            Ok(self.files.borrow().contains_key(path))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shell_escape_plain_values_untouched() {
        assert_eq!(shell_escape("/home/user/project"), "/home/user/project");
        assert_eq!(shell_escape("--cri-socket=unix:///run/x.sock"), "--cri-socket=unix:///run/x.sock");
    }

    #[test]
    fn test_shell_escape_quotes_metacharacters() {
        assert_eq!(shell_escape("a b"), "'a b'");
        assert_eq!(shell_escape("x;rm -rf"), "'x;rm -rf'");
        assert_eq!(shell_escape(""), "''");
    }

    #[test]
    fn test_shell_escape_embedded_single_quote() {
        assert_eq!(shell_escape("it's"), "'it'\"'\"'s'");
    }
}
