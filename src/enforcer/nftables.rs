//! nftables backend: address sets matched by one drop rule per family.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::{parse_ip, FirewallBackend};
use crate::cmd_abstraction::{run, run_with_stdin, CommandExecutor};
use crate::error::TblockerError;

const FAMILY: &str = "inet";
const TABLE_NAME: &str = "tblocker";
const CHAIN_NAME: &str = "TBLOCKER_BLOCKED";
const SET_NAME: &str = "TBLOCKER_BLOCKED_IPS";
const SET_NAME_V6: &str = "TBLOCKER_BLOCKED_IPS6";

/// Match protocol and set of each drop rule in the chain.
const DROP_RULES: [(&str, &str); 2] = [("ip", SET_NAME), ("ip6", SET_NAME_V6)];

/// stderr fragments meaning the element or table is already gone
const MISSING_OBJECT_MARKERS: &[&str] = &["No such file or directory", "does not exist"];

/// Statements that nft may attach to a rule without changing what it matches.
const IGNORED_STATEMENTS: &[&str] = &["counter", "comment"];

fn nft_path() -> &'static str {
    "nft"
}

fn set_for(addr: &IpAddr) -> &'static str {
    match addr {
        IpAddr::V4(_) => SET_NAME,
        IpAddr::V6(_) => SET_NAME_V6,
    }
}

/// Set-based backend.
///
/// Table, chain and sets are created once; blocking and unblocking are then
/// set-membership edits instead of per-address rule churn.
pub struct NftablesBackend {
    executor: Arc<dyn CommandExecutor>,
    initialized: AtomicBool,
    init_lock: tokio::sync::Mutex<()>,
}

impl NftablesBackend {
    pub fn new(executor: Arc<dyn CommandExecutor>) -> Self {
        Self {
            executor,
            initialized: AtomicBool::new(false),
            init_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Script creating table, chain and sets. `add` is a no-op for
    /// objects that already exist, and `nft -f` applies it atomically.
    fn generate_setup_script(&self) -> String {
        let mut script = String::new();
        script.push_str(&format!("add table {} {}\n", FAMILY, TABLE_NAME));
        script.push_str(&format!(
            "add chain {} {} {} {{ type filter hook prerouting priority -100; policy accept; }}\n",
            FAMILY, TABLE_NAME, CHAIN_NAME
        ));
        script.push_str(&format!(
            "add set {} {} {} {{ type ipv4_addr; }}\n",
            FAMILY, TABLE_NAME, SET_NAME
        ));
        script.push_str(&format!(
            "add set {} {} {} {{ type ipv6_addr; }}\n",
            FAMILY, TABLE_NAME, SET_NAME_V6
        ));
        script
    }

    async fn exec_nft_script(&self, script: &str) -> Result<()> {
        debug!("Executing nft script:\n{}", script);
        let output = run_with_stdin(&self.executor, nft_path(), &["-f", "-"], script).await?;
        if !output.success {
            anyhow::bail!("nft failed: {}", output.stderr.trim());
        }
        Ok(())
    }

    async fn exec_nft(&self, args: &[&str]) -> Result<String> {
        run(&self.executor, nft_path(), args)
            .await?
            .into_stdout(nft_path())
    }

    /// Normalized expression sequences of the rules in our chain.
    async fn installed_rules(&self) -> Result<Vec<Vec<Value>>> {
        let output = self
            .exec_nft(&["-j", "list", "chain", FAMILY, TABLE_NAME, CHAIN_NAME])
            .await?;
        parse_rule_exprs(&output)
    }

    async fn ensure_initialized(&self) -> Result<()> {
        if self.initialized.load(Ordering::Acquire) {
            return Ok(());
        }
        self.initialize().await
    }

    /// Whether both drop rules are in the chain. Set elements without
    /// their rule drop nothing, and a missing table reads as false.
    async fn rules_in_place(&self) -> bool {
        match self.installed_rules().await {
            Ok(installed) => DROP_RULES
                .iter()
                .all(|(proto, set)| installed.contains(&normalize_exprs(&drop_rule_exprs(proto, set)))),
            Err(e) => {
                debug!("Cannot list chain {}: {}", CHAIN_NAME, e);
                false
            }
        }
    }

    async fn list_set(&self, set: &str) -> Result<HashSet<String>> {
        let output = self
            .exec_nft(&["-j", "list", "set", FAMILY, TABLE_NAME, set])
            .await?;
        parse_set_elements(&output)
    }
}

#[async_trait]
impl FirewallBackend for NftablesBackend {
    async fn initialize(&self) -> Result<()> {
        let _guard = self.init_lock.lock().await;
        if self.initialized.load(Ordering::Acquire) {
            return Ok(());
        }

        info!("Initializing nftables firewall...");
        self.exec_nft_script(&self.generate_setup_script())
            .await
            .context("Failed to create nftables table, chain and sets")?;

        // Everything lives in one table, so a failure from here on leaves
        // state that `teardown` removes in one step.
        let installed = self.installed_rules().await?;
        for (proto, set) in DROP_RULES {
            let expected = normalize_exprs(&drop_rule_exprs(proto, set));
            if installed.contains(&expected) {
                debug!("Drop rule for @{} already present", set);
                continue;
            }
            let set_ref = format!("@{}", set);
            self.exec_nft(&[
                "add", "rule", FAMILY, TABLE_NAME, CHAIN_NAME, proto, "saddr", &set_ref, "drop",
            ])
            .await
            .with_context(|| format!("Failed to add drop rule for @{}", set))?;
            info!("Added drop rule for @{} to chain {}", set, CHAIN_NAME);
        }

        self.initialized.store(true, Ordering::Release);
        info!("nftables firewall initialized (table {} {})", FAMILY, TABLE_NAME);
        Ok(())
    }

    async fn block_ip(&self, ip: &str) -> Result<()> {
        let addr = parse_ip(ip)?;
        self.ensure_initialized().await?;

        let element = addr.to_string();
        let set = set_for(&addr);
        let args = ["add", "element", FAMILY, TABLE_NAME, set, "{", &element, "}"];

        if let Err(e) = self.exec_nft(&args).await {
            // The table may have been flushed away underneath us.
            warn!("Adding {} to @{} failed ({}), re-initializing", addr, set, e);
            self.initialized.store(false, Ordering::Release);
            self.initialize().await?;
            self.exec_nft(&args).await?;
        }

        info!("IP {} blocked with nftables", addr);
        Ok(())
    }

    async fn unblock_ip(&self, ip: &str) -> Result<()> {
        let addr = parse_ip(ip)?;

        let element = addr.to_string();
        let set = set_for(&addr);
        let output = run(
            &self.executor,
            nft_path(),
            &["delete", "element", FAMILY, TABLE_NAME, set, "{", &element, "}"],
        )
        .await?;

        if output.success {
            info!("IP {} unblocked with nftables", addr);
            return Ok(());
        }

        if MISSING_OBJECT_MARKERS.iter().any(|m| output.stderr.contains(m)) {
            debug!("IP {} was not in @{}, treating as unblocked", addr, set);
            return Ok(());
        }

        Err(TblockerError::Firewall(format!(
            "nft delete element {} failed: {}",
            addr,
            output.stderr.trim()
        ))
        .into())
    }

    async fn blocked_ips(&self) -> Result<HashSet<String>> {
        self.ensure_initialized().await?;

        if !self.rules_in_place().await {
            warn!("nftables drop rules or table {} missing, re-initializing", TABLE_NAME);
            self.initialized.store(false, Ordering::Release);
            self.initialize().await?;
        }

        let mut blocked = self.list_set(SET_NAME).await?;
        blocked.extend(self.list_set(SET_NAME_V6).await?);
        Ok(blocked)
    }

    async fn is_available(&self) -> bool {
        run(&self.executor, nft_path(), &["list", "tables"])
            .await
            .map(|o| o.success)
            .unwrap_or(false)
    }

    async fn teardown(&self) -> Result<()> {
        let _guard = self.init_lock.lock().await;

        let output = run(&self.executor, nft_path(), &["delete", "table", FAMILY, TABLE_NAME]).await?;
        if !output.success && !MISSING_OBJECT_MARKERS.iter().any(|m| output.stderr.contains(m)) {
            anyhow::bail!("nft delete table failed: {}", output.stderr.trim());
        }

        self.initialized.store(false, Ordering::Release);
        info!("Removed nftables table {} {}", FAMILY, TABLE_NAME);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "nftables"
    }
}

/// JSON expression list of `<proto> saddr @<set> drop`, as `nft -j` prints it.
fn drop_rule_exprs(proto: &str, set: &str) -> Vec<Value> {
    vec![
        json!({
            "match": {
                "op": "==",
                "left": { "payload": { "protocol": proto, "field": "saddr" } },
                "right": format!("@{}", set)
            }
        }),
        json!({ "drop": null }),
    ]
}

/// Drop statements that do not affect matching.
fn normalize_exprs(exprs: &[Value]) -> Vec<Value> {
    exprs
        .iter()
        .filter(|expr| {
            expr.as_object()
                .map(|obj| !obj.keys().any(|k| IGNORED_STATEMENTS.contains(&k.as_str())))
                .unwrap_or(true)
        })
        .cloned()
        .collect()
}

fn nftables_objects(output: &str) -> Result<Vec<Value>> {
    let root: Value = serde_json::from_str(output).context("Failed to parse nft JSON output")?;
    match root.get("nftables").and_then(Value::as_array) {
        Some(objects) => Ok(objects.clone()),
        None => anyhow::bail!("nft JSON output has no \"nftables\" array"),
    }
}

/// Expression sequences of every rule in `nft -j list chain` output.
fn parse_rule_exprs(output: &str) -> Result<Vec<Vec<Value>>> {
    Ok(nftables_objects(output)?
        .iter()
        .filter_map(|obj| obj.get("rule"))
        .filter_map(|rule| rule.get("expr").and_then(Value::as_array))
        .map(|exprs| normalize_exprs(exprs))
        .collect())
}

/// Addresses in `nft -j list set` output.
///
/// Elements are plain strings, or `{"elem": {"val": ...}}` when they carry
/// timeouts or comments. Prefixes and ranges are not ours and are skipped.
fn parse_set_elements(output: &str) -> Result<HashSet<String>> {
    let mut elements = HashSet::new();

    for obj in nftables_objects(output)? {
        let Some(items) = obj
            .get("set")
            .and_then(|set| set.get("elem"))
            .and_then(Value::as_array)
        else {
            continue;
        };

        for item in items {
            let value = match item {
                Value::String(s) => Some(s.as_str()),
                Value::Object(map) => map
                    .get("elem")
                    .and_then(|e| e.get("val"))
                    .and_then(Value::as_str),
                _ => None,
            };
            if let Some(addr) = value.and_then(|v| v.parse::<IpAddr>().ok()) {
                if !addr.is_unspecified() {
                    elements.insert(addr.to_string());
                }
            }
        }
    }

    Ok(elements)
}
