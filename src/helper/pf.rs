//! pfctl driver used by the helper process.
//!
//! Results are exit codes, as reported over the wire: 0 means success for
//! commands and "yes" for queries.

use anyhow::Result;
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::cmd_abstraction::{args_to_strings, CommandExecutor};

pub const PFCTL: &str = "/sbin/pfctl";

const STATUS_ENABLED: &str = "Status: Enabled";

const YES: i32 = 0;
const NO: i32 = 1;

pub struct PfRunner {
    executor: Arc<dyn CommandExecutor>,
}

impl PfRunner {
    pub fn new(executor: Arc<dyn CommandExecutor>) -> Self {
        Self { executor }
    }

    /// Disable pf, flush everything, load `rules_path` and enable again.
    pub fn enable(&self, rules_path: &Path) -> Result<i32> {
        // disabling first resets any previous kill switch state
        let disabled = self.executor.execute(PFCTL, &args_to_strings(&["-d"]))?;
        if !disabled.success {
            debug!("pfctl -d: {}", disabled.stderr.trim());
        }

        let path = rules_path.to_string_lossy();
        let output = self
            .executor
            .execute(PFCTL, &args_to_strings(&["-Fa", "-f", &path, "-e"]))?;

        if output.success {
            info!("Loaded kill switch rules from {}", path);
        } else {
            warn!("pfctl failed to load {}: {}", path, output.stderr.trim());
        }
        Ok(output.exit_code())
    }

    pub fn disable(&self) -> Result<i32> {
        let output = self.executor.execute(PFCTL, &args_to_strings(&["-d"]))?;
        if output.success {
            info!("Packet filter disabled");
        }
        Ok(output.exit_code())
    }

    pub fn any_firewall_enabled(&self) -> Result<i32> {
        let output = self.executor.execute(PFCTL, &args_to_strings(&["-si"]))?;
        // pfctl prints the status block on stdout or stderr depending on version
        let enabled = output.stdout.contains(STATUS_ENABLED) || output.stderr.contains(STATUS_ENABLED);
        Ok(if enabled { YES } else { NO })
    }

    /// Enabled, and the loaded rules mention `address`.
    pub fn firewall_enabled_for(&self, address: IpAddr) -> Result<i32> {
        if self.any_firewall_enabled()? != YES {
            return Ok(NO);
        }

        let output = self.executor.execute(PFCTL, &args_to_strings(&["-sr"]))?;
        let needle = address.to_string();
        let loaded = output.stdout.lines().any(|line| {
            line.split(|c: char| c.is_whitespace() || c == '{' || c == '}' || c == ',')
                .any(|token| token == needle)
        });

        Ok(if loaded { YES } else { NO })
    }
}
