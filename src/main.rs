//! tblocker - blocks addresses flagged in a proxy access log for a bounded time.

use anyhow::Result;
use clap::Parser;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use tblocker::cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        Level::DEBUG
    } else if cli.quiet {
        Level::ERROR
    } else {
        Level::INFO
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Run => tblocker::commands::run::run(&cli.config).await,
        Commands::Status => tblocker::commands::status::run(&cli.config).await,
        Commands::Cleanup => tblocker::commands::cleanup::run(&cli.config).await,
        Commands::Version => {
            println!("tblocker {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}
