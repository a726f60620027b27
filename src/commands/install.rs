//! Install command implementation.

use anyhow::Result;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

use crate::config::Config;
use crate::installer::{InstallOutcome, InstallTrigger};
use crate::preference::KillSwitchPreference;

/// Run the install command
pub async fn run(trigger: InstallTrigger, config_path: &Path) -> Result<()> {
    let config = Config::load_or_default(config_path)?;
    let preference = Arc::new(KillSwitchPreference::new(config.kill_switch));
    let handle = super::controller(&config, preference)?;

    info!("Checking kill switch helper {}...", config.helper.bundled_version);
    let outcome = handle.install_helper(trigger).await;
    handle.shutdown().await?;

    match outcome? {
        InstallOutcome::AlreadyInstalled => {
            println!("[OK] Helper {} already installed", config.helper.bundled_version)
        }
        InstallOutcome::Installed => {
            println!("[OK] Helper {} installed", config.helper.bundled_version)
        }
        InstallOutcome::Declined => println!("Installation cancelled"),
        InstallOutcome::Skipped => {
            println!("Kill switch is off in {:?}, nothing to install", config_path)
        }
    }
    Ok(())
}
