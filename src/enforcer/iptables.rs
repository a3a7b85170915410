//! iptables backend: one DROP rule per address in a dedicated raw-table chain.

use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::{parse_ip, FirewallBackend};
use crate::cmd_abstraction::{run, CommandExecutor, CommandOutput};
use crate::error::TblockerError;

const TABLE: &str = "raw";
const CHAIN: &str = "TBLOCKER_BLOCKED";
const HOOK_CHAIN: &str = "PREROUTING";

/// stderr fragments meaning "nothing to delete"
const MISSING_RULE_MARKERS: &[&str] = &[
    "Bad rule",
    "does a matching rule exist",
    "No chain/target/match by that name",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Family {
    V4,
    V6,
}

impl Family {
    fn of(addr: &IpAddr) -> Self {
        match addr {
            IpAddr::V4(_) => Family::V4,
            IpAddr::V6(_) => Family::V6,
        }
    }

    fn program(&self) -> &'static str {
        match self {
            Family::V4 => "iptables",
            Family::V6 => "ip6tables",
        }
    }
}

/// Rule-chain backend.
///
/// Managed rules live in `raw/TBLOCKER_BLOCKED`, reached through a single
/// jump from `raw/PREROUTING`, so packets are dropped before conntrack and
/// the whole thing can be removed without touching unrelated rules.
pub struct IptablesBackend {
    executor: Arc<dyn CommandExecutor>,
    initialized: AtomicBool,
    ipv6_ready: AtomicBool,
    init_lock: tokio::sync::Mutex<()>,
}

impl IptablesBackend {
    pub fn new(executor: Arc<dyn CommandExecutor>) -> Self {
        Self {
            executor,
            initialized: AtomicBool::new(false),
            ipv6_ready: AtomicBool::new(false),
            init_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Run `<program> -w -t raw <args>`.
    async fn xtables(&self, family: Family, args: &[&str]) -> Result<CommandOutput> {
        let mut full = vec!["-w", "-t", TABLE];
        full.extend_from_slice(args);
        run(&self.executor, family.program(), &full).await
    }

    /// Create the chain and the jump rule for one family, skipping what exists.
    async fn setup_family(&self, family: Family) -> Result<()> {
        let program = family.program();

        let listing = self.xtables(family, &["-L", HOOK_CHAIN, "-n"]).await?;
        if !listing.success {
            return Err(TblockerError::BackendNotAvailable(format!(
                "{}: raw table not usable: {}",
                program,
                listing.stderr.trim()
            ))
            .into());
        }

        let chain = self.xtables(family, &["-S", CHAIN]).await?;
        if !chain.success {
            self.xtables(family, &["-N", CHAIN])
                .await?
                .into_stdout(program)?;
            info!("Created chain {} in {} table ({})", CHAIN, TABLE, program);
        }

        let jump = self.xtables(family, &["-C", HOOK_CHAIN, "-j", CHAIN]).await?;
        if !jump.success {
            self.xtables(family, &["-I", HOOK_CHAIN, "1", "-j", CHAIN])
                .await?
                .into_stdout(program)?;
            info!("Added jump rule {} -> {} ({})", HOOK_CHAIN, CHAIN, program);
        }

        Ok(())
    }

    async fn ensure_initialized(&self) -> Result<()> {
        if self.initialized.load(Ordering::Acquire) {
            return Ok(());
        }
        self.initialize().await
    }

    async fn list_rules(&self, family: Family) -> Result<String> {
        self.xtables(family, &["-S", CHAIN])
            .await?
            .into_stdout(family.program())
    }

    /// List the chain, re-creating chain and jump rule once if either
    /// vanished (reboot, firewall reload, manual flush). Rules behind a
    /// missing jump drop nothing, so a hook that is gone counts as drift too.
    async fn list_rules_healing(&self, family: Family) -> Result<String> {
        let hooked = self
            .xtables(family, &["-C", HOOK_CHAIN, "-j", CHAIN])
            .await?
            .success;
        if hooked {
            match self.list_rules(family).await {
                Ok(rules) => return Ok(rules),
                Err(e) => warn!("Chain {} not listable: {}", CHAIN, e),
            }
        } else {
            warn!("Jump rule {} -> {} is missing", HOOK_CHAIN, CHAIN);
        }

        info!("Re-initializing {}", family.program());
        self.initialized.store(false, Ordering::Release);
        self.initialize().await?;
        if !self.family_ready(family) {
            return Ok(String::new());
        }
        self.list_rules(family).await
    }

    fn family_ready(&self, family: Family) -> bool {
        family == Family::V4 || self.ipv6_ready.load(Ordering::Acquire)
    }
}

#[async_trait]
impl FirewallBackend for IptablesBackend {
    async fn initialize(&self) -> Result<()> {
        let _guard = self.init_lock.lock().await;
        if self.initialized.load(Ordering::Acquire) {
            return Ok(());
        }

        info!("Initializing iptables firewall...");
        self.setup_family(Family::V4).await?;

        match self.setup_family(Family::V6).await {
            Ok(()) => self.ipv6_ready.store(true, Ordering::Release),
            Err(e) => {
                self.ipv6_ready.store(false, Ordering::Release);
                warn!("ip6tables unavailable, IPv6 addresses cannot be blocked: {}", e)
            }
        }

        self.initialized.store(true, Ordering::Release);
        info!(
            "iptables firewall initialized with chain {} in {} table",
            CHAIN, TABLE
        );
        Ok(())
    }

    async fn block_ip(&self, ip: &str) -> Result<()> {
        let addr = parse_ip(ip)?;
        let family = Family::of(&addr);
        self.ensure_initialized().await?;

        if !self.family_ready(family) {
            return Err(TblockerError::Firewall(format!(
                "cannot block {}: {} is not initialized",
                addr,
                family.program()
            ))
            .into());
        }

        // Checked against the kernel, not the store, so externally added
        // duplicates are tolerated as well.
        let rules = self.list_rules_healing(family).await?;
        if rules
            .lines()
            .filter_map(parse_drop_source)
            .any(|blocked| blocked == addr)
        {
            debug!("IP {} is already blocked in chain {}", addr, CHAIN);
            return Ok(());
        }

        let source = addr.to_string();
        self.xtables(family, &["-A", CHAIN, "-s", &source, "-j", "DROP"])
            .await?
            .into_stdout(family.program())?;

        info!("IP {} blocked in chain {}", addr, CHAIN);
        Ok(())
    }

    async fn unblock_ip(&self, ip: &str) -> Result<()> {
        let addr = parse_ip(ip)?;
        let family = Family::of(&addr);
        self.ensure_initialized().await?;

        if !self.family_ready(family) {
            debug!("{} not initialized, nothing to remove for {}", family.program(), addr);
            return Ok(());
        }

        let source = addr.to_string();
        let output = self
            .xtables(family, &["-D", CHAIN, "-s", &source, "-j", "DROP"])
            .await?;

        if output.success {
            info!("IP {} unblocked from chain {}", addr, CHAIN);
            return Ok(());
        }

        if is_missing_rule(&output.stderr) {
            debug!("IP {} had no rule in chain {}, treating as unblocked", addr, CHAIN);
            return Ok(());
        }

        Err(TblockerError::Firewall(format!(
            "{} -D {} -s {} failed: {}",
            family.program(),
            CHAIN,
            addr,
            output.stderr.trim()
        ))
        .into())
    }

    async fn blocked_ips(&self) -> Result<HashSet<String>> {
        self.ensure_initialized().await?;

        let mut blocked = HashSet::new();
        for family in [Family::V4, Family::V6] {
            if !self.family_ready(family) {
                continue;
            }
            let rules = self.list_rules_healing(family).await?;
            blocked.extend(rules.lines().filter_map(parse_drop_source).map(|a| a.to_string()));
        }
        Ok(blocked)
    }

    async fn is_available(&self) -> bool {
        self.xtables(Family::V4, &["-L", HOOK_CHAIN, "-n"])
            .await
            .map(|o| o.success)
            .unwrap_or(false)
    }

    async fn teardown(&self) -> Result<()> {
        let _guard = self.init_lock.lock().await;

        for family in [Family::V4, Family::V6] {
            // Each step may fail because the object is already gone.
            let _ = self.xtables(family, &["-D", HOOK_CHAIN, "-j", CHAIN]).await;
            let _ = self.xtables(family, &["-F", CHAIN]).await;
            let _ = self.xtables(family, &["-X", CHAIN]).await;
        }

        self.initialized.store(false, Ordering::Release);
        self.ipv6_ready.store(false, Ordering::Release);
        info!("Removed chain {} and its jump rule", CHAIN);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "iptables"
    }
}

/// Extract the source address of a `-A <chain> -s <addr> -j DROP` line.
fn parse_drop_source(line: &str) -> Option<IpAddr> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    if tokens.first() != Some(&"-A") {
        return None;
    }

    let verdict = tokens
        .windows(2)
        .find(|w| w[0] == "-j")
        .map(|w| w[1])?;
    if verdict != "DROP" {
        return None;
    }

    let source = tokens.windows(2).find(|w| w[0] == "-s").map(|w| w[1])?;
    let host = match source.split_once('/') {
        Some((host, "32")) | Some((host, "128")) => host,
        Some(_) => return None,
        None => source,
    };

    let addr: IpAddr = host.parse().ok()?;
    if addr.is_unspecified() {
        return None;
    }
    Some(addr)
}

fn is_missing_rule(stderr: &str) -> bool {
    MISSING_RULE_MARKERS.iter().any(|m| stderr.contains(m))
}

#[cfg(test)]
pub(crate) mod fake {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Minimal xtables emulation: enough of -S/-L/-N/-C/-I/-A/-D/-F/-X.
    #[derive(Default)]
    pub(crate) struct FakeXtables {
        /// (program, chain) -> rule specs
        pub(crate) chains: Mutex<HashMap<(String, String), Vec<String>>>,
        missing: Mutex<HashSet<String>>,
    }

    impl FakeXtables {
        pub(crate) fn new() -> Self {
            let fake = Self::default();
            for program in ["iptables", "ip6tables"] {
                fake.chains
                    .lock()
                    .unwrap()
                    .insert((program.to_string(), HOOK_CHAIN.to_string()), Vec::new());
            }
            fake
        }

        pub(crate) fn without(program: &str) -> Self {
            let fake = Self::new();
            fake.missing.lock().unwrap().insert(program.to_string());
            fake
        }

        /// Drop every managed chain, as a reboot would.
        pub(crate) fn reset(&self) {
            let mut chains = self.chains.lock().unwrap();
            chains.retain(|(_, chain), _| chain == HOOK_CHAIN);
            for rules in chains.values_mut() {
                rules.clear();
            }
        }

        /// Remove the PREROUTING jump only, as `iptables -t raw -F PREROUTING` would.
        pub(crate) fn drop_jump(&self, program: &str) {
            if let Some(rules) = self
                .chains
                .lock()
                .unwrap()
                .get_mut(&(program.to_string(), HOOK_CHAIN.to_string()))
            {
                rules.clear();
            }
        }

        pub(crate) fn rules(&self, program: &str, chain: &str) -> Vec<String> {
            self.chains
                .lock()
                .unwrap()
                .get(&(program.to_string(), chain.to_string()))
                .cloned()
                .unwrap_or_default()
        }

        fn normalize(program: &str, rule_args: &[String]) -> String {
            let mut out = Vec::new();
            let mut iter = rule_args.iter();
            while let Some(token) = iter.next() {
                out.push(token.clone());
                if token == "-s" {
                    if let Some(addr) = iter.next() {
                        let suffix = if program == "ip6tables" { "/128" } else { "/32" };
                        if addr.contains('/') {
                            out.push(addr.clone());
                        } else {
                            out.push(format!("{}{}", addr, suffix));
                        }
                    }
                }
            }
            out.join(" ")
        }
    }

    pub(crate) fn output(success: bool, stdout: String, stderr: &str) -> CommandOutput {
        CommandOutput {
            stdout,
            stderr: stderr.to_string(),
            success,
            code: Some(if success { 0 } else { 1 }),
        }
    }

    impl CommandExecutor for FakeXtables {
        fn execute(&self, cmd: &str, args: &[String]) -> Result<CommandOutput> {
            if self.missing.lock().unwrap().contains(cmd) {
                anyhow::bail!("Failed to execute {}", cmd);
            }
            assert_eq!(&args[..3], ["-w", "-t", "raw"]);
            let op = args[3].as_str();
            let chain = args[4].clone();
            let key = (cmd.to_string(), chain.clone());
            let mut chains = self.chains.lock().unwrap();
            let no_chain = "iptables: No chain/target/match by that name.";

            Ok(match op {
                "-L" => output(chains.contains_key(&key), String::new(), no_chain),
                "-S" => match chains.get(&key) {
                    Some(rules) => {
                        let mut listing = format!("-N {}\n", chain);
                        for rule in rules {
                            listing.push_str(&format!("-A {} {}\n", chain, rule));
                        }
                        output(true, listing, "")
                    }
                    None => output(false, String::new(), no_chain),
                },
                "-N" => {
                    if chains.contains_key(&key) {
                        output(false, String::new(), "iptables: Chain already exists.")
                    } else {
                        chains.insert(key, Vec::new());
                        output(true, String::new(), "")
                    }
                }
                "-C" => {
                    let rule_args = Self::normalize(cmd, &args[5..]);
                    let found = chains.get(&key).map(|r| r.contains(&rule_args)).unwrap_or(false);
                    output(found, String::new(), "iptables: Bad rule")
                }
                "-I" => {
                    let rule_args = Self::normalize(cmd, &args[6..]);
                    chains.entry(key).or_default().insert(0, rule_args);
                    output(true, String::new(), "")
                }
                "-A" => match chains.get_mut(&key) {
                    Some(rules) => {
                        rules.push(Self::normalize(cmd, &args[5..]));
                        output(true, String::new(), "")
                    }
                    None => output(false, String::new(), no_chain),
                },
                "-D" => {
                    let rule_args = Self::normalize(cmd, &args[5..]);
                    match chains.get_mut(&key) {
                        Some(rules) => match rules.iter().position(|r| *r == rule_args) {
                            Some(pos) => {
                                rules.remove(pos);
                                output(true, String::new(), "")
                            }
                            None => output(
                                false,
                                String::new(),
                                "iptables: Bad rule (does a matching rule exist in that chain?).",
                            ),
                        },
                        None => output(false, String::new(), no_chain),
                    }
                }
                "-F" => match chains.get_mut(&key) {
                    Some(rules) => {
                        rules.clear();
                        output(true, String::new(), "")
                    }
                    None => output(false, String::new(), no_chain),
                },
                "-X" => output(chains.remove(&key).is_some(), String::new(), no_chain),
                other => panic!("unexpected xtables op {}", other),
            })
        }

        fn execute_with_stdin(&self, cmd: &str, _args: &[String], _stdin: &str) -> Result<CommandOutput> {
            panic!("{} does not read stdin", cmd)
        }
    }
}
