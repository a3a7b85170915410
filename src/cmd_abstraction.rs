//! Command execution seam for the packet-filter and conntrack drivers.
//!
//! Every kernel mutation goes through `iptables`, `ip6tables`, `nft` or
//! `conntrack`. Routing those calls through [`CommandExecutor`] lets the
//! backends be exercised in unit tests with `mockall` or a stateful fake,
//! without root and without touching the host's rules.

use anyhow::{Context, Result};
use std::io::Write;
use std::process::{Command, Stdio};
use std::sync::Arc;

#[cfg(test)]
use mockall::automock;

/// Output from command execution
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    /// Standard output from the command
    pub stdout: String,
    /// Standard error from the command
    pub stderr: String,
    /// Whether the command succeeded (exit code 0)
    pub success: bool,
    /// The exit code, if available
    pub code: Option<i32>,
}

impl CommandOutput {
    /// Turn a finished command into its stdout, or an error carrying stderr.
    pub fn into_stdout(self, program: &str) -> Result<String> {
        if self.success {
            Ok(self.stdout)
        } else {
            anyhow::bail!("{} failed: {}", program, self.stderr.trim())
        }
    }

    /// stdout and stderr together; some tools report on either stream.
    pub fn combined(&self) -> String {
        format!("{}{}", self.stdout, self.stderr)
    }
}

/// Abstraction over process execution so drivers can be tested without a kernel.
#[cfg_attr(test, automock)]
pub trait CommandExecutor: Send + Sync {
    /// Execute `cmd` with `args` and capture its output.
    fn execute(&self, cmd: &str, args: &[String]) -> Result<CommandOutput>;

    /// Execute `cmd` with `args`, feeding `stdin` to the child.
    fn execute_with_stdin(&self, cmd: &str, args: &[String], stdin: &str) -> Result<CommandOutput>;
}

/// Runs real system commands.
#[derive(Debug, Clone, Default)]
pub struct RealCommandExecutor;

impl RealCommandExecutor {
    pub fn new() -> Self {
        Self
    }
}

impl CommandExecutor for RealCommandExecutor {
    fn execute(&self, cmd: &str, args: &[String]) -> Result<CommandOutput> {
        let output = Command::new(cmd)
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .with_context(|| format!("Failed to execute {}", cmd))?;

        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            success: output.status.success(),
            code: output.status.code(),
        })
    }

    fn execute_with_stdin(
        &self,
        cmd: &str,
        args: &[String],
        stdin_data: &str,
    ) -> Result<CommandOutput> {
        let mut child = Command::new(cmd)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("Failed to spawn {}", cmd))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(stdin_data.as_bytes())?;
        }

        let output = child.wait_with_output()?;

        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            success: output.status.success(),
            code: output.status.code(),
        })
    }
}

/// Helper to convert a slice of &str to Vec<String>.
///
/// mockall has trouble with the nested lifetimes of `&[&str]`, so the trait
/// takes `&[String]`.
pub fn args_to_strings(args: &[&str]) -> Vec<String> {
    args.iter().map(|s| s.to_string()).collect()
}

/// Run a command on the blocking pool.
///
/// Kernel tools can stall (xtables lock, netlink congestion); keeping them
/// off the async workers means one slow call cannot hold up unblock timers.
pub async fn run(
    executor: &Arc<dyn CommandExecutor>,
    program: &str,
    args: &[&str],
) -> Result<CommandOutput> {
    let executor = Arc::clone(executor);
    let program = program.to_string();
    let args = args_to_strings(args);
    tokio::task::spawn_blocking(move || executor.execute(&program, &args))
        .await
        .context("Command task panicked")?
}

/// Like [`run`], with data piped to stdin.
pub async fn run_with_stdin(
    executor: &Arc<dyn CommandExecutor>,
    program: &str,
    args: &[&str],
    stdin: &str,
) -> Result<CommandOutput> {
    let executor = Arc::clone(executor);
    let program = program.to_string();
    let args = args_to_strings(args);
    let stdin = stdin.to_string();
    tokio::task::spawn_blocking(move || executor.execute_with_stdin(&program, &args, &stdin))
        .await
        .context("Command task panicked")?
}
