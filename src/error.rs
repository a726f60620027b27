//! Error types for tunguard.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Errors produced while compiling a firewall rule document.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CompileError {
    #[error("No tunnel interfaces found")]
    NoInterfaces,

    #[error("Invalid interface name: {0:?}")]
    InvalidInterfaceName(String),
}

#[derive(Error, Debug)]
pub enum KillSwitchError {
    #[error("Helper did not answer '{operation}' within {timeout:?}")]
    IpcTimeout {
        operation: &'static str,
        timeout: Duration,
    },

    #[error("Helper channel lost: {0}")]
    IpcChannelLost(String),

    #[error("Privileged helper is not installed")]
    HelperNotInstalled,

    #[error("Helper installation failed: {0}")]
    HelperInstallFailed(String),

    #[error("Rule compilation failed: {0}")]
    RuleCompile(#[from] CompileError),

    #[error("Failed to write firewall rules to {path:?}: {source}")]
    ConfigWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Firewall state mismatch: {0}")]
    FirewallMismatch(String),

    #[error("Helper protocol error: {0}")]
    Protocol(String),

    #[error("Kill switch controller has stopped")]
    ControllerStopped,
}

impl KillSwitchError {
    /// Transient IPC failures: the stale handle is discarded and the
    /// operation is retried on the next triggering event.
    pub fn is_ipc(&self) -> bool {
        matches!(
            self,
            KillSwitchError::IpcTimeout { .. } | KillSwitchError::IpcChannelLost(_)
        )
    }

    /// Errors meaning the helper process is gone and installation must be
    /// re-checked.
    pub fn invalidates_helper(&self) -> bool {
        matches!(
            self,
            KillSwitchError::IpcChannelLost(_) | KillSwitchError::HelperNotInstalled
        )
    }
}

pub type Result<T> = std::result::Result<T, KillSwitchError>;
