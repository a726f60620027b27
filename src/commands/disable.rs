//! Disable command implementation.

use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

use crate::config::Config;
use crate::preference::KillSwitchPreference;

/// Run the disable command
pub async fn run(config_path: &Path) -> Result<()> {
    let config = Config::load_or_default(config_path)?;
    let preference = Arc::new(KillSwitchPreference::new(config.kill_switch));
    let handle = super::controller(&config, preference)?;

    info!("Disabling kill switch...");
    let result = handle
        .disable_firewall()
        .await
        .context("Failed to disable kill switch");
    handle.shutdown().await?;
    result?;

    println!("[OK] Kill switch disabled (traffic is no longer filtered)");
    Ok(())
}
