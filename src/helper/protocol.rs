//! Wire format between the controller and the privileged helper.
//!
//! One JSON object per line in each direction, one reply per request.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::PathBuf;

use crate::error::{KillSwitchError, Result};

/// Upper bound on a single protocol line
pub const MAX_LINE_LEN: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    /// Load the rule file and enable the packet filter
    Enable { rules_path: PathBuf },
    Disable,
    /// Is the filter enabled with rules mentioning `address`?
    FirewallEnabled { address: IpAddr },
    /// Is any packet filter enabled at all?
    AnyFirewallEnabled,
    Version,
    /// Stop the helper process
    Unload,
}

impl Request {
    /// Short name used in logs and timeout errors
    pub fn operation(&self) -> &'static str {
        match self {
            Request::Enable { .. } => "enable",
            Request::Disable => "disable",
            Request::FirewallEnabled { .. } => "firewall_enabled",
            Request::AnyFirewallEnabled => "any_firewall_enabled",
            Request::Version => "version",
            Request::Unload => "unload",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reply", rename_all = "snake_case")]
pub enum Reply {
    /// Exit status of the underlying command, 0 = success / yes
    Exit { code: i32 },
    Version { version: String },
    Ack,
    Error { message: String },
}

impl Reply {
    pub fn into_exit_code(self) -> Result<i32> {
        match self {
            Reply::Exit { code } => Ok(code),
            other => Err(unexpected(other)),
        }
    }

    pub fn into_version(self) -> Result<String> {
        match self {
            Reply::Version { version } => Ok(version),
            other => Err(unexpected(other)),
        }
    }

    pub fn into_ack(self) -> Result<()> {
        match self {
            Reply::Ack => Ok(()),
            other => Err(unexpected(other)),
        }
    }
}

fn unexpected(reply: Reply) -> KillSwitchError {
    match reply {
        Reply::Error { message } => KillSwitchError::Protocol(format!("helper error: {}", message)),
        other => KillSwitchError::Protocol(format!("unexpected reply: {:?}", other)),
    }
}

/// Serialize a message as one newline-terminated line.
pub fn encode<T: Serialize>(message: &T) -> Result<String> {
    let mut line = serde_json::to_string(message)
        .map_err(|e| KillSwitchError::Protocol(format!("encode failed: {}", e)))?;
    line.push('\n');
    Ok(line)
}

pub fn decode<T: DeserializeOwned>(line: &str) -> Result<T> {
    if line.len() > MAX_LINE_LEN {
        return Err(KillSwitchError::Protocol(format!(
            "line of {} bytes exceeds limit",
            line.len()
        )));
    }
    serde_json::from_str(line.trim_end())
        .map_err(|e| KillSwitchError::Protocol(format!("decode failed: {}", e)))
}
