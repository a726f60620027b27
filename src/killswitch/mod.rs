//! Kill switch controller.
//!
//! One task owns every piece of kill switch state. Connection changes,
//! explicit enable/disable requests, health-check ticks and installer results
//! all arrive as [`Command`]s on a single channel and are handled strictly in
//! arrival order, so two firewall operations never race.

mod machine;
#[cfg(test)]
mod testing;

use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};

use crate::alerts::AlertSink;
use crate::error::{KillSwitchError, Result};
use crate::helper::PrivilegedHelper;
use crate::installer::{InstallOutcome, InstallTrigger, Installer};
use crate::interfaces::InterfaceResolver;
use crate::preference::KillSwitchPreference;
use crate::rules::RulesWriter;

use machine::Machine;

const COMMAND_BUFFER: usize = 64;

/// VPN tunnel state as reported by the tunnel manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ConnectionState {
    PreparingConnection,
    Connecting { server: IpAddr },
    Connected { server: IpAddr },
    Disconnected,
    Aborted {
        #[serde(default)]
        user_initiated: bool,
    },
    Error,
}

impl ConnectionState {
    pub fn name(&self) -> &'static str {
        match self {
            ConnectionState::PreparingConnection => "preparing_connection",
            ConnectionState::Connecting { .. } => "connecting",
            ConnectionState::Connected { .. } => "connected",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Aborted { .. } => "aborted",
            ConnectionState::Error => "error",
        }
    }

    pub fn server(&self) -> Option<IpAddr> {
        match self {
            ConnectionState::Connecting { server } | ConnectionState::Connected { server } => {
                Some(*server)
            }
            _ => None,
        }
    }
}

/// A connection state change. One JSON object per line on the `run`
/// command's stdin, e.g. `{"state":"connected","server":"1.2.3.4"}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionEvent {
    #[serde(flatten)]
    pub state: ConnectionState,
    /// The user asked for the disconnect.
    #[serde(default, rename = "intentional")]
    pub intentionally_disconnected: bool,
}

impl ConnectionEvent {
    pub fn new(state: ConnectionState) -> Self {
        Self {
            state,
            intentionally_disconnected: false,
        }
    }

    pub fn intentional(state: ConnectionState) -> Self {
        Self {
            state,
            intentionally_disconnected: true,
        }
    }
}

/// Snapshot of the controller, answered by [`KillSwitchHandle::status`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KillSwitchStatus {
    pub preference: bool,
    pub connection: Option<ConnectionState>,
    pub entry_ip: Option<IpAddr>,
    pub interfaces: Vec<String>,
    pub firewall_applied: bool,
    pub blocking_alert_shown: bool,
    pub health_check_active: bool,
    pub install_in_progress: bool,
}

/// Collaborators of the controller.
pub struct KillSwitchDeps {
    pub helper: Arc<dyn PrivilegedHelper>,
    pub installer: Arc<dyn Installer>,
    pub resolver: Arc<dyn InterfaceResolver>,
    pub alerts: Arc<dyn AlertSink>,
    pub preference: Arc<KillSwitchPreference>,
    pub rules_writer: RulesWriter,
    /// Where the applied state is persisted for `tunguard status`
    pub state_file: Option<PathBuf>,
    pub health_interval: Duration,
    /// A check is skipped when the firewall was verified less than
    /// `interval - tolerance` ago
    pub health_tolerance: Duration,
    /// Helper connection loss notices
    pub invalidations: Option<broadcast::Receiver<()>>,
}

enum Command {
    Connection(ConnectionEvent),
    EnableFirewall {
        entry_ip: IpAddr,
        reply: oneshot::Sender<Result<()>>,
    },
    DisableFirewall(oneshot::Sender<Result<()>>),
    InstallHelper {
        trigger: InstallTrigger,
        reply: Option<oneshot::Sender<Result<InstallOutcome>>>,
    },
    HelperReady {
        trigger: InstallTrigger,
        outcome: Option<InstallOutcome>,
    },
    /// The blocking alert for `entry_ip` was confirmed
    ReleaseBlock {
        entry_ip: IpAddr,
    },
    HealthCheck,
    Status(oneshot::Sender<KillSwitchStatus>),
    Shutdown(oneshot::Sender<()>),
}

pub struct KillSwitch;

impl KillSwitch {
    /// Start the controller task. It runs until [`KillSwitchHandle::shutdown`]
    /// or until every handle is dropped.
    pub fn spawn(deps: KillSwitchDeps) -> KillSwitchHandle {
        let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
        let preference = deps.preference.clone();

        let machine = Machine::new(deps, tx.downgrade());
        tokio::spawn(machine.run(rx));

        KillSwitchHandle { tx, preference }
    }
}

/// Cheap, cloneable access to a running controller.
#[derive(Clone)]
pub struct KillSwitchHandle {
    tx: mpsc::Sender<Command>,
    preference: Arc<KillSwitchPreference>,
}

impl KillSwitchHandle {
    async fn send(&self, command: Command) -> Result<()> {
        self.tx
            .send(command)
            .await
            .map_err(|_| KillSwitchError::ControllerStopped)
    }

    async fn request<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.send(command(reply)).await?;
        rx.await.map_err(|_| KillSwitchError::ControllerStopped)
    }

    /// Queue a connection state change. Changes are handled in the order they
    /// are queued.
    pub async fn connection_changed(&self, event: ConnectionEvent) -> Result<()> {
        self.send(Command::Connection(event)).await
    }

    /// Turn the user-level kill switch preference on or off.
    pub fn set_preference(&self, enabled: bool) {
        self.preference.set(enabled);
    }

    pub fn preference(&self) -> bool {
        self.preference.get()
    }

    /// Force the firewall on for `entry_ip`, outside the connection state
    /// machine.
    pub async fn enable_firewall(&self, entry_ip: IpAddr) -> Result<()> {
        self.request(|reply| Command::EnableFirewall { entry_ip, reply })
            .await?
    }

    /// Force the firewall off, e.g. before the application quits.
    pub async fn disable_firewall(&self) -> Result<()> {
        self.request(Command::DisableFirewall).await?
    }

    /// Run a helper installation check and wait for its outcome.
    pub async fn install_helper(&self, trigger: InstallTrigger) -> Result<InstallOutcome> {
        self.request(|reply| Command::InstallHelper {
            trigger,
            reply: Some(reply),
        })
        .await?
    }

    pub async fn status(&self) -> Result<KillSwitchStatus> {
        self.request(Command::Status).await
    }

    /// Stop the controller. The firewall is left as it is.
    pub async fn shutdown(&self) -> Result<()> {
        self.request(Command::Shutdown).await
    }
}
