//! tunguard - VPN kill switch controller

use anyhow::Result;
use clap::Parser;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use tunguard::cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging based on verbosity
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
        .without_time()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Run => tunguard::commands::run::run(&cli.config).await,
        Commands::Helper { action } => tunguard::commands::helper::run(action, &cli.config).await,
        Commands::Rules { ip, interfaces } => {
            tunguard::commands::rules::run(ip, interfaces, &cli.config).await
        }
        Commands::Enable { ip } => tunguard::commands::enable::run(ip, &cli.config).await,
        Commands::Disable => tunguard::commands::disable::run(&cli.config).await,
        Commands::Status { json } => tunguard::commands::status::run(&cli.config, json).await,
        Commands::Install { trigger } => {
            tunguard::commands::install::run(trigger, &cli.config).await
        }
        Commands::Interfaces => tunguard::commands::interfaces::run(&cli.config).await,
        Commands::Version => {
            println!("tunguard {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}
