//! `tunguard helper` commands.

use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

use crate::cli::HelperAction;
use crate::cmd_abstraction::RealCommandExecutor;
use crate::config::Config;
use crate::helper::pf::PfRunner;
use crate::helper::server::{check_root, HelperServer, PeerPolicy};
use crate::helper::PrivilegedHelper;
use crate::signal::{ShutdownGuard, ShutdownToken};

pub async fn run(action: HelperAction, config_path: &Path) -> Result<()> {
    match action {
        HelperAction::Serve => serve(config_path).await,
        HelperAction::Version => version(config_path).await,
    }
}

async fn serve(config_path: &Path) -> Result<()> {
    check_root()?;

    let config = Config::load_or_default(config_path)?;
    let shutdown = ShutdownGuard::install(ShutdownToken::new()).token();

    let listener = HelperServer::bind(&config.helper.socket_path)?;
    let server = Arc::new(HelperServer::new(
        PfRunner::new(Arc::new(RealCommandExecutor::new())),
        env!("CARGO_PKG_VERSION"),
        PeerPolicy::new(config.helper.allowed_uid),
        shutdown,
    ));

    info!("Helper {} started", env!("CARGO_PKG_VERSION"));
    server.serve(listener).await?;

    // leave no dangling socket behind for the next start
    let _ = std::fs::remove_file(&config.helper.socket_path);
    Ok(())
}

async fn version(config_path: &Path) -> Result<()> {
    let config = Config::load_or_default(config_path)?;
    let client = super::helper_client(&config);

    let version = client
        .version()
        .await
        .with_context(|| format!("No helper answering on {:?}", config.helper.socket_path))?;

    println!("helper {}", version);
    if version != config.helper.bundled_version {
        println!(
            "bundled {} (run 'tunguard install --trigger update')",
            config.helper.bundled_version
        );
    }
    Ok(())
}
