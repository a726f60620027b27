//! Status command implementation.

use anyhow::Result;
use serde::Serialize;
use std::path::Path;

use crate::config::Config;
use crate::helper::PrivilegedHelper;
use crate::state::StatusSnapshot;

#[derive(Debug, Serialize)]
struct StatusReport {
    kill_switch: bool,
    bundled_version: String,
    /// `None` when the helper did not answer
    helper_version: Option<String>,
    /// Live packet filter state, `None` when the helper did not answer
    firewall_active: Option<bool>,
    last_applied: StatusSnapshot,
}

/// Run the status command
pub async fn run(config_path: &Path, json: bool) -> Result<()> {
    let config = Config::load_or_default(config_path)?;
    let snapshot = StatusSnapshot::load(&config.state_file)?;
    let client = super::helper_client(&config);

    let helper_version = client.version().await.ok();
    let firewall_active = match (helper_version.is_some(), snapshot.entry_ip) {
        (false, _) => None,
        (true, Some(ip)) if snapshot.enabled => client.is_enabled_for(ip).await.ok(),
        (true, _) => client.any_firewall_enabled().await.ok(),
    };

    let report = StatusReport {
        kill_switch: config.kill_switch,
        bundled_version: config.helper.bundled_version.clone(),
        helper_version,
        firewall_active,
        last_applied: snapshot,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    print!("{}", format_report(&report));
    Ok(())
}

fn format_report(report: &StatusReport) -> String {
    let mut out = String::new();

    out.push('\n');
    out.push_str(&format!(
        "Kill switch preference: {}\n",
        if report.kill_switch { "on" } else { "off" }
    ));

    match &report.helper_version {
        Some(v) if *v == report.bundled_version => out.push_str(&format!("Helper: {}\n", v)),
        Some(v) => out.push_str(&format!(
            "Helper: {} (bundled {}, update pending)\n",
            v, report.bundled_version
        )),
        None => out.push_str("Helper: NOT RUNNING\n"),
    }

    match report.firewall_active {
        Some(true) => out.push_str("Packet filter: ACTIVE\n"),
        Some(false) => out.push_str("Packet filter: INACTIVE\n"),
        None => out.push_str("Packet filter: unknown\n"),
    }

    out.push_str("\nLast applied:\n");
    out.push_str(&report.last_applied.describe());
    out.push('\n');
    out
}
