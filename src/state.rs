//! Persisted kill switch status, read back by `tunguard status`.

use anyhow::{Context, Result};
use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::IpAddr;
use std::path::Path;

/// Last firewall state the controller applied
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct StatusSnapshot {
    pub enabled: bool,
    pub entry_ip: Option<IpAddr>,
    pub interfaces: Vec<String>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl StatusSnapshot {
    pub fn enabled(entry_ip: IpAddr, interfaces: &[String]) -> Self {
        Self {
            enabled: true,
            entry_ip: Some(entry_ip),
            interfaces: interfaces.to_vec(),
            updated_at: Some(Utc::now()),
        }
    }

    pub fn disabled() -> Self {
        Self {
            updated_at: Some(Utc::now()),
            ..Default::default()
        }
    }

    /// Load state from file, default when it does not exist yet
    pub fn load(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = fs::read_to_string(path)
                .with_context(|| format!("Failed to read state file: {:?}", path))?;
            serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse state file: {:?}", path))
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content).with_context(|| format!("Failed to write state file: {:?}", path))?;
        Ok(())
    }

    /// Human-readable summary for the status command
    pub fn describe(&self) -> String {
        let mut out = String::new();

        if self.enabled {
            out.push_str(" Kill switch: ENABLED\n");
        } else {
            out.push_str(" Kill switch: DISABLED\n");
        }

        if let Some(ip) = self.entry_ip {
            out.push_str(&format!(" Entry IP: {}\n", ip));
        }
        if !self.interfaces.is_empty() {
            out.push_str(&format!(" Tunnel interfaces: {}\n", self.interfaces.join(", ")));
        }

        match self.updated_at {
            Some(at) => {
                let local: DateTime<Local> = at.into();
                out.push_str(&format!(
                    " Last change: {} ({})\n",
                    local.format("%Y-%m-%d %H:%M:%S"),
                    format_duration_ago(at)
                ));
            }
            None => out.push_str(" Last change: never\n"),
        }

        out
    }
}

/// Format duration since a timestamp
fn format_duration_ago(dt: DateTime<Utc>) -> String {
    let seconds = Utc::now().signed_duration_since(dt).num_seconds();
    if seconds < 60 {
        "just now".to_string()
    } else if seconds < 3600 {
        format!("{}m ago", seconds / 60)
    } else if seconds < 86400 {
        format!("{}h ago", seconds / 3600)
    } else {
        format!("{}d ago", seconds / 86400)
    }
}
