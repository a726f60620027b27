//! # tunguard - VPN kill switch controller
//!
//! Blocks all traffic outside the VPN tunnel whenever the tunnel is expected
//! to be up but is not carrying traffic: accidental disconnects, helper
//! crashes, rules removed behind our back.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        tunguard                             │
//! ├─────────────────────────────────────────────────────────────┤
//! │  CLI (clap)                                                 │
//! │    └── Commands: run, helper serve, rules, enable, status.. │
//! ├─────────────────────────────────────────────────────────────┤
//! │  KillSwitch controller (tokio actor)                        │
//! │    ├── connection state machine + health check              │
//! │    └── Alerts (log, webhook)                                │
//! ├──────────────────────┬──────────────────────────────────────┤
//! │  Rule compiler (pf)  │  Interface resolver (sysfs/ifconfig) │
//! ├──────────────────────┴──────────────────────────────────────┤
//! │  HelperClient ── NDJSON over Unix socket ──> helper (root)  │
//! │    └── Installer (version check, elevation)    └── pfctl    │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use tunguard::alerts::LogAlertSink;
//! use tunguard::cmd_abstraction::RealCommandExecutor;
//! use tunguard::helper::transport::UnixSocketConnector;
//! use tunguard::helper::{HelperClient, PrivilegedHelper};
//! use tunguard::installer::{CommandElevator, HelperInstaller};
//! use tunguard::interfaces::SystemInterfaceResolver;
//! use tunguard::killswitch::{ConnectionEvent, ConnectionState, KillSwitch, KillSwitchDeps};
//! use tunguard::preference::KillSwitchPreference;
//! use tunguard::rules::RulesWriter;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let client = HelperClient::new(
//!         Arc::new(UnixSocketConnector::new("/var/run/tunguard-helper.sock")),
//!         Duration::from_secs(3),
//!     );
//!     let invalidations = client.subscribe_invalidations();
//!     let helper: Arc<dyn PrivilegedHelper> = Arc::new(client);
//!     let alerts = Arc::new(LogAlertSink::new(true));
//!     let preference = Arc::new(KillSwitchPreference::new(true));
//!
//!     let installer = HelperInstaller::new(
//!         helper.clone(),
//!         Arc::new(CommandElevator::new(
//!             vec!["pkexec".into(), "/usr/libexec/tunguard/install-helper".into()],
//!             Arc::new(RealCommandExecutor::new()),
//!         )),
//!         alerts.clone(),
//!         preference.clone(),
//!         env!("CARGO_PKG_VERSION"),
//!     );
//!
//!     let handle = KillSwitch::spawn(KillSwitchDeps {
//!         helper,
//!         installer: Arc::new(installer),
//!         resolver: Arc::new(SystemInterfaceResolver::new(vec!["tun".into(), "wg".into()])),
//!         alerts,
//!         preference,
//!         rules_writer: RulesWriter::new("/var/lib/tunguard/killswitch.conf"),
//!         state_file: None,
//!         health_interval: Duration::from_secs(30),
//!         health_tolerance: Duration::from_secs(5),
//!         invalidations: Some(invalidations),
//!     });
//!
//!     handle
//!         .connection_changed(ConnectionEvent::new(ConnectionState::Connected {
//!             server: "1.2.3.4".parse()?,
//!         }))
//!         .await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Safety
//!
//! - **Fail safe** - a rule or config failure keeps the last good rules
//!   loaded; it never silently turns filtering off
//! - **Bounded IPC** - every helper call has a timeout; a late reply is
//!   dropped, never delivered twice
//! - **Injection Prevention** - interface names are validated before they
//!   reach the rule document; webhook headers are sanitized
//! - **Credential Protection** - webhook tokens from environment variables,
//!   memory zeroed on drop
//!
//! ## Modules
//!
//! - [`alerts`] - Alert events and sinks (log, webhook)
//! - [`cli`] - Command-line interface definitions
//! - [`commands`] - CLI command implementations
//! - [`config`] - Configuration parsing and validation
//! - [`error`] - Kill switch error taxonomy
//! - [`helper`] - Privileged helper client, protocol and process
//! - [`installer`] - Helper version check and installation
//! - [`interfaces`] - Tunnel interface detection
//! - [`killswitch`] - The kill switch controller
//! - [`lock`] - Single-instance lock for the controller
//! - [`rules`] - pf rule compiler and rule file writer
//! - [`signal`] - Graceful shutdown signal handling
//! - [`state`] - Persisted kill switch status

pub mod alerts;
pub mod cli;
pub mod cmd_abstraction;
pub mod commands;
pub mod config;
pub mod error;
pub mod fs_abstraction;
pub mod helper;
pub mod installer;
pub mod interfaces;
pub mod killswitch;
pub mod lock;
pub mod preference;
pub mod rules;
pub mod signal;
pub mod state;

pub use cli::{Cli, Commands};
pub use config::Config;
pub use error::{KillSwitchError, Result};
