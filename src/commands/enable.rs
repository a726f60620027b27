//! Enable command implementation.

use anyhow::{Context, Result};
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

use crate::config::Config;
use crate::preference::KillSwitchPreference;

/// Run the enable command
pub async fn run(entry_ip: IpAddr, config_path: &Path) -> Result<()> {
    let config = Config::load_or_default(config_path)?;
    let preference = Arc::new(KillSwitchPreference::new(config.kill_switch));
    let handle = super::controller(&config, preference)?;

    info!("Enabling kill switch for {}...", entry_ip);
    let result = handle
        .enable_firewall(entry_ip)
        .await
        .with_context(|| format!("Failed to enable kill switch for {}", entry_ip));
    handle.shutdown().await?;
    result?;

    println!("[OK] Kill switch enabled for {}", entry_ip);
    Ok(())
}
