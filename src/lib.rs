//! # tblocker - Time-bounded address blocking for proxy nodes
//!
//! Watches a proxy access log for connections routed to a forbidden
//! outbound tag, blocks the offending client address at the kernel packet
//! filter and lifts the block automatically once its duration elapses.
//!
//! ## Features
//!
//! - **Two backends** - iptables rule chain (default) or nftables sets, with fallback
//! - **Immediate effect** - established flows are flushed from conntrack on block
//! - **Durable** - blocks survive restarts and are re-armed from an atomic JSON store
//! - **Self-healing** - a reconciliation loop re-applies blocks lost from the kernel
//! - **Non-Intrusive** - only touches its own chain/table, never existing rules
//! - **Webhooks** - optional templated notifications on block and unblock
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        tblocker                             │
//! ├─────────────────────────────────────────────────────────────┤
//! │  CLI (clap)  ──  Commands: run, status, cleanup, version    │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Config (serde_yaml)                                        │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Watcher  ──  access log tail, violation parsing            │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Orchestrator                                               │
//! │    ├── BlockStore (serde_json, atomic writes)               │
//! │    ├── UnblockScheduler + expiry sweep                      │
//! │    ├── Reconciler                                           │
//! │    └── Notifier (reqwest webhook)                           │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Enforcer (FirewallBackend trait)                           │
//! │    ├── FirewallManager (selection + fallback)               │
//! │    ├── IptablesBackend (default)                            │
//! │    └── NftablesBackend                                      │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Conntrack  ──  flow deletion on block                      │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use tblocker::clock::SystemClock;
//! use tblocker::cmd_abstraction::RealCommandExecutor;
//! use tblocker::config::Config;
//! use tblocker::enforcer::{check_root, FirewallManager};
//! use tblocker::notify::NoopNotifier;
//! use tblocker::orchestrator::{Orchestrator, Settings};
//! use tblocker::store::BlockStore;
//! use tblocker::watcher::Violation;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     check_root()?;
//!     let config = Config::load("/etc/tblocker/config.yaml")?;
//!
//!     let firewall =
//!         FirewallManager::new(&config.block_mode, Arc::new(RealCommandExecutor::new())).await?;
//!     let store = BlockStore::open(&config.storage_dir, Arc::new(SystemClock))?;
//!
//!     let orchestrator = Orchestrator::new(
//!         Arc::new(store),
//!         Arc::new(firewall),
//!         None,
//!         Arc::new(NoopNotifier),
//!         Arc::new(SystemClock),
//!         Settings::from_config(&config)?,
//!     );
//!     orchestrator.start()?;
//!
//!     orchestrator
//!         .handle_violation(&Violation {
//!             address: "203.0.113.9".to_string(),
//!             username: "alice".to_string(),
//!         })
//!         .await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`cli`] - Command-line interface definitions
//! - [`clock`] - Wall-clock abstraction for deadlines
//! - [`cmd_abstraction`] - External command execution (mockable)
//! - [`commands`] - CLI command implementations
//! - [`config`] - Configuration parsing and validation
//! - [`conntrack`] - Connection-tracking flow deletion
//! - [`enforcer`] - Firewall backend abstraction (iptables, nftables)
//! - [`error`] - Typed error kinds
//! - [`lock`] - File locking for concurrent execution prevention
//! - [`notify`] - Block/unblock webhook notifications
//! - [`orchestrator`] - Block lifecycle
//! - [`reconcile`] - Store/kernel drift repair
//! - [`scheduler`] - Per-address unblock timers
//! - [`signal`] - Graceful shutdown signal handling
//! - [`store`] - Durable blocked-address store
//! - [`watcher`] - Access-log tailing and parsing

pub mod cli;
pub mod clock;
pub mod cmd_abstraction;
pub mod commands;
pub mod config;
pub mod conntrack;
pub mod enforcer;
pub mod error;
pub mod lock;
pub mod notify;
pub mod orchestrator;
pub mod reconcile;
pub mod scheduler;
pub mod signal;
pub mod store;
pub mod watcher;

pub use cli::{Cli, Commands};
pub use config::Config;
pub use error::TblockerError;
