use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::{Command, ConnectionEvent, ConnectionState, KillSwitchDeps, KillSwitchStatus};
use crate::alerts::{Alert, AlertKind, AlertResponse, AlertSink};
use crate::error::{KillSwitchError, Result};
use crate::helper::PrivilegedHelper;
use crate::installer::{InstallOutcome, InstallTrigger, Installer};
use crate::interfaces::InterfaceResolver;
use crate::preference::KillSwitchPreference;
use crate::rules::{self, RulesWriter};
use crate::state::StatusSnapshot;

/// Consecutive failed helper queries before the health check reports
const MAX_HEALTH_FAILURES: u32 = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
struct AppliedRules {
    entry_ip: IpAddr,
    interfaces: Vec<String>,
}

/// Reset on intentional disconnect, abort and whenever the kill switch is
/// turned off.
#[derive(Debug, Default)]
struct RuntimeState {
    /// Rules the helper last confirmed. `None` forces the next apply through.
    applied: Option<AppliedRules>,
    /// Entry IP of the last enable attempt, which the firewall should still
    /// protect after the VPN drops.
    last_entry_ip: Option<IpAddr>,
    blocking_alert_shown: bool,
    health_failures: u32,
    last_verified: Option<Instant>,
}

pub(super) struct Machine {
    helper: Arc<dyn PrivilegedHelper>,
    installer: Arc<dyn Installer>,
    resolver: Arc<dyn InterfaceResolver>,
    alerts: Arc<dyn AlertSink>,
    preference: Arc<KillSwitchPreference>,
    rules_writer: RulesWriter,
    state_file: Option<PathBuf>,
    health_interval: Duration,
    health_tolerance: Duration,
    invalidations: Option<broadcast::Receiver<()>>,
    commands: mpsc::WeakSender<Command>,

    preference_on: bool,
    connection: Option<ConnectionEvent>,
    state: RuntimeState,
    health_task: Option<JoinHandle<()>>,
}

/// Resolves on the next invalidation notice; never once the sender is gone.
async fn next_invalidation(rx: &mut Option<broadcast::Receiver<()>>) {
    let Some(receiver) = rx.as_mut() else {
        return std::future::pending().await;
    };

    if let Err(broadcast::error::RecvError::Closed) = receiver.recv().await {
        *rx = None;
        std::future::pending::<()>().await;
    }
}

impl Machine {
    pub(super) fn new(deps: KillSwitchDeps, commands: mpsc::WeakSender<Command>) -> Self {
        let preference_on = deps.preference.get();
        Self {
            helper: deps.helper,
            installer: deps.installer,
            resolver: deps.resolver,
            alerts: deps.alerts,
            preference: deps.preference,
            rules_writer: deps.rules_writer,
            state_file: deps.state_file,
            health_interval: deps.health_interval,
            health_tolerance: deps.health_tolerance,
            invalidations: deps.invalidations,
            commands,
            preference_on,
            connection: None,
            state: RuntimeState::default(),
            health_task: None,
        }
    }

    pub(super) async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        let mut preference = self.preference.subscribe();
        let mut invalidations = self.invalidations.take();

        info!(
            "Kill switch controller started (kill switch {})",
            if self.preference_on { "on" } else { "off" }
        );

        loop {
            tokio::select! {
                biased;

                changed = preference.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let on = *preference.borrow_and_update();
                    self.preference_changed(on).await;
                }
                _ = next_invalidation(&mut invalidations) => self.helper_invalidated(),
                command = commands.recv() => match command {
                    Some(command) => {
                        if !self.handle(command).await {
                            break;
                        }
                    }
                    None => break,
                },
            }
        }

        self.stop_health_check();
        info!("Kill switch controller stopped");
    }

    /// Returns false when the controller must stop.
    async fn handle(&mut self, command: Command) -> bool {
        match command {
            Command::Connection(event) => self.connection_changed(event).await,
            Command::EnableFirewall { entry_ip, reply } => {
                let interfaces = self.resolver.active_tunnel_interfaces();
                let result = self.apply(entry_ip, interfaces).await;
                let _ = reply.send(result);
            }
            Command::DisableFirewall(reply) => {
                let result = self.disable().await;
                let _ = reply.send(result);
            }
            Command::InstallHelper { trigger, reply } => self.spawn_install(trigger, reply),
            Command::HelperReady { trigger, outcome } => self.helper_ready(trigger, outcome).await,
            Command::ReleaseBlock { entry_ip } => self.release_block(entry_ip).await,
            Command::HealthCheck => self.health_check().await,
            Command::Status(reply) => {
                let _ = reply.send(self.status());
            }
            Command::Shutdown(reply) => {
                self.stop_health_check();
                let _ = reply.send(());
                return false;
            }
        }
        true
    }

    async fn connection_changed(&mut self, event: ConnectionEvent) {
        debug!("Connection state changed: {:?}", event);
        self.connection = Some(event.clone());

        if !self.preference_on {
            debug!("Kill switch off, ignoring '{}'", event.state.name());
            return;
        }

        match event.state {
            ConnectionState::PreparingConnection | ConnectionState::Error => {}
            ConnectionState::Connecting { server } => {
                // reconnecting: the tunnel interfaces of the previous
                // connection are still the best guess
                let known = self.state.applied.as_ref().map(|a| a.interfaces.clone());
                match known {
                    Some(interfaces) => {
                        if let Err(e) = self.apply(server, interfaces).await {
                            debug!("Early kill switch enable failed: {}", e);
                        }
                    }
                    None => debug!("No tunnel interfaces known yet, waiting for connection"),
                }
            }
            ConnectionState::Connected { server } => {
                self.state.blocking_alert_shown = false;
                self.alerts.dismiss(AlertKind::FirewallBlockingConnection);
                let interfaces = self.resolver.active_tunnel_interfaces();
                if let Err(e) = self.apply(server, interfaces).await {
                    debug!("Kill switch enable failed: {}", e);
                }
            }
            ConnectionState::Disconnected if event.intentionally_disconnected => {
                if let Err(e) = self.disable().await {
                    warn!("Failed to disable kill switch: {}", e);
                }
            }
            ConnectionState::Disconnected => self.check_blocking().await,
            ConnectionState::Aborted { .. } => {
                if let Err(e) = self.disable().await {
                    warn!("Failed to disable kill switch: {}", e);
                }
            }
        }
    }

    /// Compile, write and load rules for `entry_ip`, unless the helper
    /// already holds exactly these rules.
    async fn apply(&mut self, entry_ip: IpAddr, interfaces: Vec<String>) -> Result<()> {
        let rules = match rules::compile(entry_ip, &interfaces) {
            Ok(rules) => rules,
            Err(e) => {
                error!("Cannot build kill switch rules for {}: {}", entry_ip, e);
                self.alerts.push(Alert::FirewallError {
                    reason: e.to_string(),
                });
                return Err(e.into());
            }
        };

        self.alerts.dismiss(AlertKind::FirewallBlockingConnection);
        self.alerts.dismiss(AlertKind::FirewallError);

        let target = AppliedRules {
            entry_ip,
            interfaces: rules.interfaces().to_vec(),
        };
        if self.state.applied.as_ref() == Some(&target) {
            debug!("Kill switch rules for {} unchanged", entry_ip);
            if self.health_task.is_none() {
                self.start_health_check();
            }
            return Ok(());
        }

        let path = match self.rules_writer.write(&rules) {
            Ok(path) => path,
            Err(e) => {
                error!("{}", e);
                self.alerts.push(Alert::FirewallError {
                    reason: e.to_string(),
                });
                return Err(e);
            }
        };

        self.state.last_entry_ip = Some(entry_ip);

        let result = match self.helper.enable(&path).await {
            Ok(0) => Ok(()),
            Ok(code) => self.verify_enabled(entry_ip, code).await,
            Err(e) => Err(e),
        };

        match &result {
            Ok(()) => {
                info!(
                    "Kill switch enabled for {} via {}",
                    entry_ip,
                    target.interfaces.join(", ")
                );
                self.record(StatusSnapshot::enabled(entry_ip, &target.interfaces));
                self.state.applied = Some(target);
                self.state.health_failures = 0;
                self.state.last_verified = Some(Instant::now());
            }
            Err(e) => {
                self.state.applied = None;
                self.helper_failed("enable", e);
            }
        }

        self.start_health_check();
        result
    }

    /// `enable` exited non-zero: trust the packet filter's actual state.
    async fn verify_enabled(&mut self, entry_ip: IpAddr, code: i32) -> Result<()> {
        warn!("Helper enable exited with {}", code);

        match self.helper.is_enabled_for(entry_ip).await {
            Ok(true) => Ok(()),
            Ok(false) => {
                let reason = format!("packet filter rejected the rules (exit code {})", code);
                self.alerts.push(Alert::FirewallError {
                    reason: reason.clone(),
                });
                Err(KillSwitchError::FirewallMismatch(reason))
            }
            Err(e) => Err(e),
        }
    }

    /// The VPN dropped on its own: tell the user once that traffic is held,
    /// or that it is not.
    async fn check_blocking(&mut self) {
        if self.state.blocking_alert_shown {
            debug!("Blocking alert already shown since last connect");
            return;
        }

        let Some(entry_ip) = self.state.last_entry_ip else {
            debug!("Kill switch was never applied, nothing to hold");
            return;
        };

        match self.helper.is_enabled_for(entry_ip).await {
            Ok(true) => {
                info!("VPN dropped, kill switch is blocking traffic");
                self.state.blocking_alert_shown = true;
                self.spawn_blocking_alert(entry_ip);
            }
            Ok(false) => {
                error!("VPN dropped but the kill switch is not active");
                self.alerts.push(Alert::FirewallError {
                    reason: "the firewall is not enabled after the VPN connection dropped"
                        .to_string(),
                });
                self.state.applied = None;
            }
            Err(e) => self.helper_failed("firewall_enabled", &e),
        }
    }

    /// Confirming the alert lifts the block. The answer may take as long as
    /// the user wants, so it is awaited outside the controller.
    fn spawn_blocking_alert(&self, entry_ip: IpAddr) {
        let alerts = self.alerts.clone();
        let commands = self.commands.clone();

        tokio::spawn(async move {
            let response = alerts
                .prompt(Alert::FirewallBlockingConnection {
                    entry_ip: Some(entry_ip),
                })
                .await;
            if response != AlertResponse::Confirmed {
                return;
            }
            if let Some(tx) = commands.upgrade() {
                let _ = tx.send(Command::ReleaseBlock { entry_ip }).await;
            }
        });
    }

    /// The user confirmed the blocking alert for `entry_ip`. Ignored when
    /// that block is no longer in place.
    async fn release_block(&mut self, entry_ip: IpAddr) {
        if !self.state.blocking_alert_shown || self.state.last_entry_ip != Some(entry_ip) {
            debug!("Blocking alert for {} is stale, ignoring", entry_ip);
            return;
        }

        info!("Lifting kill switch block for {} on user request", entry_ip);
        if let Err(e) = self.disable().await {
            warn!("Failed to disable kill switch: {}", e);
        }
    }

    async fn disable(&mut self) -> Result<()> {
        self.stop_health_check();
        self.alerts.dismiss(AlertKind::FirewallBlockingConnection);
        self.alerts.dismiss(AlertKind::FirewallError);

        let result = match self.helper.disable().await {
            Ok(code) => {
                if code == 0 {
                    info!("Kill switch disabled");
                } else {
                    // pfctl -d fails when pf is already off
                    warn!("Helper disable exited with {}", code);
                }
                self.record(StatusSnapshot::disabled());
                Ok(())
            }
            Err(e) => {
                self.helper_failed("disable", &e);
                Err(e)
            }
        };

        self.state = RuntimeState::default();
        result
    }

    async fn health_check(&mut self) {
        if self.health_task.is_none() {
            return;
        }
        let Some(entry_ip) = self.state.last_entry_ip else {
            return;
        };

        if let Some(verified) = self.state.last_verified {
            if verified.elapsed() + self.health_tolerance < self.health_interval {
                debug!("Firewall verified {:?} ago, skipping health check", verified.elapsed());
                return;
            }
        }

        match self.helper.is_enabled_for(entry_ip).await {
            Ok(true) => {
                debug!("Health check: kill switch active for {}", entry_ip);
                self.state.health_failures = 0;
                self.state.last_verified = Some(Instant::now());
            }
            Ok(false) => {
                self.health_check_failed(format!("the firewall is no longer enabled for {}", entry_ip))
            }
            Err(e) => {
                self.state.health_failures += 1;
                self.helper_failed("health check", &e);
                if self.state.health_failures >= MAX_HEALTH_FAILURES {
                    self.health_check_failed(e.to_string());
                }
            }
        }
    }

    fn health_check_failed(&mut self, reason: String) {
        error!("Kill switch health check failed: {}", reason);
        self.alerts.push(Alert::FirewallError { reason });
        self.state.applied = None;
        self.state.health_failures = 0;
        self.state.last_verified = None;
        self.stop_health_check();
    }

    fn start_health_check(&mut self) {
        self.stop_health_check();

        let commands = self.commands.clone();
        let period = self.health_interval;

        self.health_task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                let Some(tx) = commands.upgrade() else {
                    break;
                };
                if tx.send(Command::HealthCheck).await.is_err() {
                    break;
                }
            }
        }));
        debug!("Health check every {:?}", period);
    }

    fn stop_health_check(&mut self) {
        if let Some(task) = self.health_task.take() {
            task.abort();
            debug!("Health check stopped");
        }
    }

    async fn preference_changed(&mut self, on: bool) {
        if on == self.preference_on {
            return;
        }
        self.preference_on = on;

        if on {
            self.spawn_install(InstallTrigger::UserInitiated, None);
        } else if let Err(e) = self.disable().await {
            warn!("Failed to disable kill switch: {}", e);
        }
    }

    fn helper_failed(&self, operation: &str, e: &KillSwitchError) {
        warn!("Helper '{}' failed: {}", operation, e);
        // a lost channel is announced through the invalidation notices,
        // a timeout is retried on the next event
        if e.is_ipc() {
            return;
        }
        if e.invalidates_helper() {
            self.spawn_install(InstallTrigger::Silent, None);
        }
    }

    fn helper_invalidated(&mut self) {
        if !self.preference_on {
            return;
        }
        info!("Helper connection lost, checking installation");
        self.installer.reset_verification();
        self.spawn_install(InstallTrigger::Silent, None);
    }

    /// Installation may wait on a credential prompt for as long as the user
    /// takes, so it runs outside the controller and reports back.
    fn spawn_install(
        &self,
        trigger: InstallTrigger,
        reply: Option<oneshot::Sender<Result<InstallOutcome>>>,
    ) {
        let installer = self.installer.clone();
        let commands = self.commands.clone();

        tokio::spawn(async move {
            let result = installer.ensure_installed(trigger).await;
            if let Err(e) = &result {
                warn!("Helper installation check failed: {}", e);
            }

            let outcome = result.as_ref().ok().copied();
            if let Some(reply) = reply {
                let _ = reply.send(result);
            }
            if let Some(tx) = commands.upgrade() {
                let _ = tx.send(Command::HelperReady { trigger, outcome }).await;
            }
        });
    }

    async fn helper_ready(&mut self, trigger: InstallTrigger, outcome: Option<InstallOutcome>) {
        let reevaluate = match outcome {
            Some(InstallOutcome::Installed) => true,
            Some(InstallOutcome::AlreadyInstalled) => trigger == InstallTrigger::UserInitiated,
            _ => false,
        };
        if reevaluate {
            self.reevaluate().await;
        }
    }

    /// Replay the current connection state, e.g. once the helper exists.
    async fn reevaluate(&mut self) {
        if !self.preference_on {
            return;
        }

        if let Some(event) = self.connection.clone() {
            if event.state.server().is_some() {
                info!("Applying kill switch to current connection");
                self.connection_changed(event).await;
            }
        }
    }

    fn record(&self, snapshot: StatusSnapshot) {
        if let Some(path) = &self.state_file {
            if let Err(e) = snapshot.save(path) {
                warn!("Failed to save kill switch status: {:#}", e);
            }
        }
    }

    fn status(&self) -> KillSwitchStatus {
        KillSwitchStatus {
            preference: self.preference_on,
            connection: self.connection.as_ref().map(|e| e.state.clone()),
            entry_ip: self.state.last_entry_ip,
            interfaces: self
                .state
                .applied
                .as_ref()
                .map(|a| a.interfaces.clone())
                .unwrap_or_default(),
            firewall_applied: self.state.applied.is_some(),
            blocking_alert_shown: self.state.blocking_alert_shown,
            health_check_active: self.health_task.is_some(),
            install_in_progress: self.installer.is_in_progress(),
        }
    }
}
