//! Controller daemon.
//!
//! Reads one JSON object per line from stdin: connection events from the
//! tunnel manager, or `{"kill_switch": true|false}` to toggle the kill switch.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::installer::InstallTrigger;
use crate::killswitch::{ConnectionEvent, KillSwitchHandle};
use crate::lock::LockGuard;
use crate::preference::KillSwitchPreference;
use crate::signal::{ShutdownGuard, ShutdownToken};

#[derive(Debug, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
enum Input {
    Preference { kill_switch: bool },
    Connection(ConnectionEvent),
}

fn parse_input(line: &str) -> Result<Input> {
    serde_json::from_str(line).with_context(|| format!("Unrecognized input: {}", line))
}

/// Run the controller until stdin closes or a signal arrives. The firewall
/// is left as it is on exit.
pub async fn run(config_path: &Path) -> Result<()> {
    let mut config = Config::load_or_default(config_path)?;
    let _lock = LockGuard::acquire(&config.lock_file)?;

    let shutdown = ShutdownGuard::install(ShutdownToken::new()).token();
    let preference = Arc::new(KillSwitchPreference::new(config.kill_switch));
    let mut preference_rx = preference.subscribe();

    let handle = super::controller(&config, preference)?;
    info!("Controller ready, reading connection events from stdin");

    // a new build may ship a new helper
    let startup = handle.clone();
    tokio::spawn(async move {
        match startup.install_helper(InstallTrigger::UpdateCheck).await {
            Ok(outcome) => debug!("Startup helper check: {:?}", outcome),
            Err(e) => warn!("Startup helper check failed: {}", e),
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            changed = preference_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                config.kill_switch = *preference_rx.borrow_and_update();
                if let Err(e) = config.save(config_path) {
                    warn!("Failed to save kill switch preference: {:#}", e);
                }
            }
            line = lines.next_line() => match line.context("Failed to read stdin")? {
                Some(line) => dispatch(&handle, line.trim()).await?,
                None => {
                    info!("Input closed");
                    break;
                }
            },
        }
    }

    handle.shutdown().await?;
    Ok(())
}

async fn dispatch(handle: &KillSwitchHandle, line: &str) -> Result<()> {
    if line.is_empty() {
        return Ok(());
    }

    match parse_input(line) {
        Ok(Input::Preference { kill_switch }) => handle.set_preference(kill_switch),
        Ok(Input::Connection(event)) => handle.connection_changed(event).await?,
        Err(e) => warn!("{:#}", e),
    }
    Ok(())
}
