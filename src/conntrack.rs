//! Connection-tracking eviction.
//!
//! A new DROP rule only affects packets of flows the kernel has not yet
//! accepted. Established flows keep going through their conntrack entry, so
//! every block is followed by deleting the entries involving the address.

use anyhow::{Context, Result};
use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::cmd_abstraction::{run, CommandExecutor};
use crate::enforcer::parse_ip;
use crate::error::TblockerError;

const MODULE: &str = "nf_conntrack";
const AUTOLOAD_PATH: &str = "/etc/modules-load.d/conntrack.conf";

/// Original and reply direction, source and destination.
const TUPLE_FLAGS: [&str; 4] = ["--orig-src", "--orig-dst", "--reply-src", "--reply-dst"];

pub struct ConntrackController {
    executor: Arc<dyn CommandExecutor>,
    available: AtomicBool,
    autoload_path: PathBuf,
}

impl ConntrackController {
    pub fn new(executor: Arc<dyn CommandExecutor>) -> Self {
        Self {
            executor,
            available: AtomicBool::new(false),
            autoload_path: PathBuf::from(AUTOLOAD_PATH),
        }
    }

    pub fn with_autoload_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.autoload_path = path.into();
        self
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::Acquire)
    }

    /// Make sure the kernel module is loaded and the tool works.
    ///
    /// On error the controller stays unavailable and every later call
    /// returns [`TblockerError::Conntrack`].
    pub async fn initialize(&self) -> Result<()> {
        self.ensure_kernel_module().await?;

        let output = run(&self.executor, "conntrack", &["--version"])
            .await
            .context("conntrack tool not found")?;
        if !output.success {
            return Err(TblockerError::Conntrack(format!(
                "conntrack --version failed: {}",
                output.combined().trim()
            ))
            .into());
        }

        self.available.store(true, Ordering::Release);
        info!("Conntrack controller ready ({})", output.combined().trim());
        Ok(())
    }

    /// Check that the tool answers, without loading modules or writing
    /// files. For read-only callers such as `status`.
    pub async fn check_available(&self) -> bool {
        let ok = run(&self.executor, "conntrack", &["--version"])
            .await
            .map(|output| output.success)
            .unwrap_or(false);
        self.available.store(ok, Ordering::Release);
        ok
    }

    async fn module_loaded(&self) -> bool {
        match run(&self.executor, "lsmod", &[]).await {
            Ok(output) if output.success => output.stdout.contains(MODULE),
            Ok(output) => {
                warn!("lsmod failed: {}", output.stderr.trim());
                false
            }
            Err(e) => {
                warn!("Failed to check loaded modules: {}", e);
                false
            }
        }
    }

    async fn ensure_kernel_module(&self) -> Result<()> {
        if self.module_loaded().await {
            debug!("Kernel module {} is already loaded", MODULE);
            return Ok(());
        }

        info!("Kernel module {} not loaded, running modprobe", MODULE);
        let output = run(&self.executor, "modprobe", &[MODULE]).await?;
        if !output.success || !self.module_loaded().await {
            return Err(TblockerError::Conntrack(format!(
                "failed to load {}: {}",
                MODULE,
                output.stderr.trim()
            ))
            .into());
        }

        if let Err(e) = write_autoload(&self.autoload_path) {
            warn!("Failed to configure {} autoload: {:#}", MODULE, e);
        }
        Ok(())
    }

    /// Delete every tracked flow with `ip` in any tuple position.
    /// Returns the number of entries deleted.
    pub async fn drop_connections(&self, ip: &str) -> Result<usize> {
        let addr = parse_ip(ip)?;
        self.require_available()?;

        let addr_str = addr.to_string();
        let mut deleted = 0;
        let mut errors = Vec::new();

        for flag in TUPLE_FLAGS {
            let mut args: Vec<&str> = family_args(&addr);
            args.extend(["-D", flag, addr_str.as_str()]);

            let output = match run(&self.executor, "conntrack", &args).await {
                Ok(output) => output,
                Err(e) => {
                    errors.push(format!("{} {}: {:#}", flag, addr, e));
                    continue;
                }
            };
            let count = parse_deleted_count(&output.combined());

            // conntrack exits 1 when nothing matched.
            match (output.success, count) {
                (_, Some(n)) if output.success || n == 0 => deleted += n,
                (true, None) => {}
                _ => errors.push(format!("{} {}: {}", flag, addr, output.stderr.trim())),
            }
        }

        if !errors.is_empty() {
            return Err(TblockerError::Conntrack(errors.join("; ")).into());
        }

        if deleted > 0 {
            info!("Dropped {} tracked connection(s) for {}", deleted, addr);
        } else {
            debug!("No tracked connections for {}", addr);
        }
        Ok(deleted)
    }

    /// Number of tracked flows involving `ip`.
    pub async fn connection_count(&self, ip: &str) -> Result<usize> {
        let addr = parse_ip(ip)?;
        self.require_available()?;

        let mut args = family_args(&addr);
        args.push("-L");
        let output = run(&self.executor, "conntrack", &args).await?;
        if !output.success {
            return Err(TblockerError::Conntrack(format!(
                "conntrack -L failed: {}",
                output.stderr.trim()
            ))
            .into());
        }

        Ok(output
            .stdout
            .lines()
            .filter(|line| flow_addresses(line).contains(&addr))
            .count())
    }

    fn require_available(&self) -> Result<()> {
        if self.is_available() {
            Ok(())
        } else {
            Err(TblockerError::Conntrack("conntrack is not available".to_string()).into())
        }
    }
}

fn family_args(addr: &IpAddr) -> Vec<&'static str> {
    match addr {
        IpAddr::V4(_) => Vec::new(),
        IpAddr::V6(_) => vec!["-f", "ipv6"],
    }
}

fn write_autoload(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, format!("{}\n", MODULE))?;
    info!("Module autoload configured in {}", path.display());
    Ok(())
}

/// "N flow entries have been deleted."
fn parse_deleted_count(output: &str) -> Option<usize> {
    output.lines().find_map(|line| {
        let idx = line.find(" flow entries have been deleted")?;
        line[..idx].split_whitespace().last()?.parse().ok()
    })
}

/// Up to four tuple addresses of a `conntrack -L` line: the first src/dst
/// pair is the original direction, the second the reply.
fn flow_addresses(line: &str) -> Vec<IpAddr> {
    line.split_whitespace()
        .filter_map(|token| {
            token
                .strip_prefix("src=")
                .or_else(|| token.strip_prefix("dst="))
        })
        .filter_map(|value| value.parse().ok())
        .take(4)
        .collect()
}
