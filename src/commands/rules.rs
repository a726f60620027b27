//! Print the compiled rule document.

use anyhow::{Context, Result};
use std::net::IpAddr;
use std::path::Path;

use crate::config::Config;
use crate::interfaces::{InterfaceResolver, SystemInterfaceResolver};
use crate::rules;

pub async fn run(entry_ip: IpAddr, interfaces: Vec<String>, config_path: &Path) -> Result<()> {
    let interfaces = if interfaces.is_empty() {
        let config = Config::load_or_default(config_path)?;
        SystemInterfaceResolver::new(config.tunnel_prefixes).active_tunnel_interfaces()
    } else {
        interfaces
    };

    let rules = rules::compile(entry_ip, &interfaces)
        .context("Cannot build rules (is the tunnel up? pass --interface to choose)")?;

    print!("{}", rules.text());
    Ok(())
}
