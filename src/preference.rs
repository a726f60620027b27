//! Observable user-level kill switch preference.

use tokio::sync::watch;
use tracing::info;

/// Shared on/off switch. The controller observes changes through
/// [`KillSwitchPreference::subscribe`]; the installer forces it off when
/// installation fails.
#[derive(Debug)]
pub struct KillSwitchPreference {
    tx: watch::Sender<bool>,
}

impl KillSwitchPreference {
    pub fn new(enabled: bool) -> Self {
        let (tx, _rx) = watch::channel(enabled);
        Self { tx }
    }

    pub fn get(&self) -> bool {
        *self.tx.borrow()
    }

    /// Update the preference; subscribers are only woken on an actual change.
    pub fn set(&self, enabled: bool) {
        let changed = self.tx.send_if_modified(|current| {
            if *current == enabled {
                false
            } else {
                *current = enabled;
                true
            }
        });

        if changed {
            info!(
                "Kill switch preference turned {}",
                if enabled { "on" } else { "off" }
            );
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}
