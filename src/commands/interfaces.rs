//! Interface listing command.

use anyhow::Result;
use std::path::Path;

use crate::config::Config;
use crate::interfaces::{format_detection_report, SystemInterfaceResolver};

/// Run interfaces command
pub async fn run(config_path: &Path) -> Result<()> {
    let config = Config::load_or_default(config_path)?;
    let resolver = SystemInterfaceResolver::new(config.tunnel_prefixes);
    let interfaces = resolver.list_interfaces()?;

    if interfaces.is_empty() {
        println!("No network interfaces detected.");
        return Ok(());
    }

    println!("{}", format_detection_report(&interfaces));
    Ok(())
}
