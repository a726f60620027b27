//! In-memory collaborators for controller tests.

use async_trait::async_trait;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

use super::KillSwitchDeps;
use crate::alerts::{Alert, AlertKind, AlertResponse, AlertSink};
use crate::error::{KillSwitchError, Result};
use crate::helper::{ExitCode, PrivilegedHelper};
use crate::installer::{InstallOutcome, InstallTrigger, Installer};
use crate::interfaces::InterfaceResolver;
use crate::preference::KillSwitchPreference;
use crate::rules::RulesWriter;

/// Helper that remembers what it was asked and keeps a fake pf state.
pub(crate) struct FakeHelper {
    enabled: Mutex<Vec<(PathBuf, String)>>,
    enable_code: AtomicI32,
    not_installed: AtomicBool,
    firewall_on: AtomicBool,
    query_fails: AtomicBool,
    disables: AtomicUsize,
    queries: AtomicUsize,
}

impl FakeHelper {
    fn new() -> Self {
        Self {
            enabled: Mutex::new(Vec::new()),
            enable_code: AtomicI32::new(0),
            not_installed: AtomicBool::new(false),
            firewall_on: AtomicBool::new(false),
            query_fails: AtomicBool::new(false),
            disables: AtomicUsize::new(0),
            queries: AtomicUsize::new(0),
        }
    }

    pub fn enable_count(&self) -> usize {
        self.enabled.lock().unwrap().len()
    }

    /// Rule documents passed to `enable`, read at call time
    pub fn enabled_documents(&self) -> Vec<String> {
        self.enabled
            .lock()
            .unwrap()
            .iter()
            .map(|(_, text)| text.clone())
            .collect()
    }

    pub fn disable_count(&self) -> usize {
        self.disables.load(Ordering::SeqCst)
    }

    pub fn query_count(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }

    pub fn set_enable_code(&self, code: i32) {
        self.enable_code.store(code, Ordering::SeqCst);
    }

    pub fn set_not_installed(&self, value: bool) {
        self.not_installed.store(value, Ordering::SeqCst);
    }

    pub fn set_firewall_on(&self, value: bool) {
        self.firewall_on.store(value, Ordering::SeqCst);
    }

    pub fn set_query_fails(&self, value: bool) {
        self.query_fails.store(value, Ordering::SeqCst);
    }
}

#[async_trait]
impl PrivilegedHelper for FakeHelper {
    async fn enable(&self, rules_path: &Path) -> Result<ExitCode> {
        if self.not_installed.load(Ordering::SeqCst) {
            return Err(KillSwitchError::HelperNotInstalled);
        }

        let text = std::fs::read_to_string(rules_path).unwrap_or_default();
        self.enabled
            .lock()
            .unwrap()
            .push((rules_path.to_path_buf(), text));

        let code = self.enable_code.load(Ordering::SeqCst);
        if code == 0 {
            self.firewall_on.store(true, Ordering::SeqCst);
        }
        Ok(code)
    }

    async fn disable(&self) -> Result<ExitCode> {
        self.disables.fetch_add(1, Ordering::SeqCst);
        self.firewall_on.store(false, Ordering::SeqCst);
        Ok(0)
    }

    async fn is_enabled_for(&self, _entry_ip: IpAddr) -> Result<bool> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        if self.query_fails.load(Ordering::SeqCst) {
            return Err(KillSwitchError::IpcTimeout {
                operation: "firewall_enabled",
                timeout: Duration::from_secs(3),
            });
        }
        Ok(self.firewall_on.load(Ordering::SeqCst))
    }

    async fn any_firewall_enabled(&self) -> Result<bool> {
        Ok(self.firewall_on.load(Ordering::SeqCst))
    }

    async fn version(&self) -> Result<String> {
        Ok("test".to_string())
    }

    async fn unload(&self) -> Result<()> {
        Ok(())
    }
}

/// Confirms every prompt except the blocking alert, unless told to.
#[derive(Default)]
pub(crate) struct RecordingAlerts {
    pushed: Mutex<Vec<Alert>>,
    dismissed: Mutex<Vec<AlertKind>>,
    release_block: AtomicBool,
}

impl RecordingAlerts {
    pub fn confirm_blocking_alerts(&self) {
        self.release_block.store(true, Ordering::SeqCst);
    }

    pub fn count(&self, kind: AlertKind) -> usize {
        self.pushed
            .lock()
            .unwrap()
            .iter()
            .filter(|a| a.kind() == kind)
            .count()
    }

    pub fn pushed(&self) -> Vec<Alert> {
        self.pushed.lock().unwrap().clone()
    }

    pub fn dismissed(&self) -> Vec<AlertKind> {
        self.dismissed.lock().unwrap().clone()
    }
}

#[async_trait]
impl AlertSink for RecordingAlerts {
    fn push(&self, alert: Alert) {
        self.pushed.lock().unwrap().push(alert);
    }

    async fn prompt(&self, alert: Alert) -> AlertResponse {
        let blocking = alert.kind() == AlertKind::FirewallBlockingConnection;
        self.pushed.lock().unwrap().push(alert);
        if blocking && !self.release_block.load(Ordering::SeqCst) {
            AlertResponse::Cancelled
        } else {
            AlertResponse::Confirmed
        }
    }

    fn dismiss(&self, kind: AlertKind) {
        self.dismissed.lock().unwrap().push(kind);
    }
}

pub(crate) struct FakeResolver {
    interfaces: Mutex<Vec<String>>,
}

impl FakeResolver {
    pub fn set(&self, interfaces: &[&str]) {
        *self.interfaces.lock().unwrap() = interfaces.iter().map(|s| s.to_string()).collect();
    }
}

impl InterfaceResolver for FakeResolver {
    fn active_tunnel_interfaces(&self) -> Vec<String> {
        self.interfaces.lock().unwrap().clone()
    }
}

pub(crate) struct FakeInstaller {
    outcome: Mutex<InstallOutcome>,
    triggers: Mutex<Vec<InstallTrigger>>,
    resets: AtomicUsize,
}

impl FakeInstaller {
    pub fn set_outcome(&self, outcome: InstallOutcome) {
        *self.outcome.lock().unwrap() = outcome;
    }

    pub fn triggers(&self) -> Vec<InstallTrigger> {
        self.triggers.lock().unwrap().clone()
    }

    pub fn reset_count(&self) -> usize {
        self.resets.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Installer for FakeInstaller {
    async fn ensure_installed(&self, trigger: InstallTrigger) -> Result<InstallOutcome> {
        self.triggers.lock().unwrap().push(trigger);
        Ok(*self.outcome.lock().unwrap())
    }

    fn reset_verification(&self) {
        self.resets.fetch_add(1, Ordering::SeqCst);
    }

    fn is_in_progress(&self) -> bool {
        false
    }
}

pub(crate) struct Fixture {
    pub helper: Arc<FakeHelper>,
    pub installer: Arc<FakeInstaller>,
    pub resolver: Arc<FakeResolver>,
    pub alerts: Arc<RecordingAlerts>,
    pub preference: Arc<KillSwitchPreference>,
    pub temp: TempDir,
}

impl Fixture {
    pub fn new(interfaces: &[&str]) -> Self {
        let resolver = FakeResolver {
            interfaces: Mutex::new(Vec::new()),
        };
        resolver.set(interfaces);

        Self {
            helper: Arc::new(FakeHelper::new()),
            installer: Arc::new(FakeInstaller {
                outcome: Mutex::new(InstallOutcome::AlreadyInstalled),
                triggers: Mutex::new(Vec::new()),
                resets: AtomicUsize::new(0),
            }),
            resolver: Arc::new(resolver),
            alerts: Arc::new(RecordingAlerts::default()),
            preference: Arc::new(KillSwitchPreference::new(true)),
            temp: TempDir::new().unwrap(),
        }
    }

    pub fn rules_path(&self) -> PathBuf {
        self.temp.path().join("killswitch.conf")
    }

    pub fn state_path(&self) -> PathBuf {
        self.temp.path().join("state.json")
    }

    pub fn deps(&self) -> KillSwitchDeps {
        KillSwitchDeps {
            helper: self.helper.clone(),
            installer: self.installer.clone(),
            resolver: self.resolver.clone(),
            alerts: self.alerts.clone(),
            preference: self.preference.clone(),
            rules_writer: RulesWriter::new(self.rules_path()),
            state_file: Some(self.state_path()),
            health_interval: Duration::from_secs(30),
            health_tolerance: Duration::from_secs(5),
            invalidations: None,
        }
    }
}
