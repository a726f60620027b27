//! Installation of the privileged helper.
//!
//! The installed helper is trusted only when it reports the exact bundled
//! version. Otherwise it is unloaded and reinstalled through an OS
//! elevation step, preceded by a prompt that depends on what triggered the
//! check.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::alerts::{Alert, AlertResponse, AlertSink};
use crate::cmd_abstraction::CommandExecutor;
use crate::error::{KillSwitchError, Result};
use crate::helper::PrivilegedHelper;
use crate::preference::KillSwitchPreference;

#[cfg(test)]
use mockall::automock;

/// Confirmed retries after a failed installation before giving up
const MAX_INSTALL_ATTEMPTS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum InstallTrigger {
    /// The user just turned the kill switch on
    #[value(name = "user")]
    UserInitiated,
    /// A new application version was started
    #[value(name = "update")]
    UpdateCheck,
    /// Routine check, e.g. after the helper connection dropped
    Silent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallOutcome {
    /// The helper already had the bundled version
    AlreadyInstalled,
    /// The helper was (re)installed
    Installed,
    /// A prompt was cancelled
    Declined,
    /// Kill switch off, or another installation in flight
    Skipped,
}

/// OS-level privilege elevation. May block for as long as the user takes to
/// enter credentials.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Elevator: Send + Sync {
    async fn install_helper(&self) -> Result<()>;
}

/// Elevates by running the configured install command (pkexec, sudo, ...).
pub struct CommandElevator {
    command: Vec<String>,
    executor: Arc<dyn CommandExecutor>,
}

impl CommandElevator {
    pub fn new(command: Vec<String>, executor: Arc<dyn CommandExecutor>) -> Self {
        Self { command, executor }
    }
}

#[async_trait]
impl Elevator for CommandElevator {
    async fn install_helper(&self) -> Result<()> {
        let Some((program, args)) = self.command.split_first() else {
            return Err(KillSwitchError::HelperInstallFailed(
                "no install command configured".to_string(),
            ));
        };

        info!("Requesting privileged helper installation via {}", program);

        let program = program.clone();
        let args = args.to_vec();
        let executor = self.executor.clone();

        let output = tokio::task::spawn_blocking(move || executor.execute(&program, &args))
            .await
            .map_err(|e| KillSwitchError::HelperInstallFailed(e.to_string()))?
            .map_err(|e| KillSwitchError::HelperInstallFailed(format!("{:#}", e)))?;

        if !output.success {
            let reason = match output.stderr.trim() {
                "" => format!("install command exited with {}", output.exit_code()),
                stderr => stderr.to_string(),
            };
            return Err(KillSwitchError::HelperInstallFailed(reason));
        }

        Ok(())
    }
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait Installer: Send + Sync {
    /// Make sure the bundled helper version is installed and running.
    async fn ensure_installed(&self, trigger: InstallTrigger) -> Result<InstallOutcome>;

    /// Forget that the helper was verified, e.g. after it went away.
    fn reset_verification(&self);

    fn is_in_progress(&self) -> bool;
}

/// Clears the in-progress flag when installation ends, however it ends.
struct InProgress<'a>(&'a AtomicBool);

impl Drop for InProgress<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct HelperInstaller {
    helper: Arc<dyn PrivilegedHelper>,
    elevator: Arc<dyn Elevator>,
    alerts: Arc<dyn AlertSink>,
    preference: Arc<KillSwitchPreference>,
    bundled_version: String,
    in_progress: AtomicBool,
    verified: AtomicBool,
}

impl HelperInstaller {
    pub fn new(
        helper: Arc<dyn PrivilegedHelper>,
        elevator: Arc<dyn Elevator>,
        alerts: Arc<dyn AlertSink>,
        preference: Arc<KillSwitchPreference>,
        bundled_version: impl Into<String>,
    ) -> Self {
        Self {
            helper,
            elevator,
            alerts,
            preference,
            bundled_version: bundled_version.into(),
            in_progress: AtomicBool::new(false),
            verified: AtomicBool::new(false),
        }
    }

    async fn installed_version_matches(&self) -> bool {
        match self.helper.version().await {
            Ok(version) if version == self.bundled_version => true,
            Ok(version) => {
                info!(
                    "Installed helper version {} differs from bundled {}",
                    version, self.bundled_version
                );
                false
            }
            Err(e) => {
                debug!("Helper version query failed, treating as not installed: {}", e);
                false
            }
        }
    }

    async fn unload_then_install(&self) -> Result<()> {
        if let Err(e) = self.helper.unload().await {
            debug!("Unloading previous helper failed (ignored): {}", e);
        }
        self.elevator.install_helper().await
    }

    /// A user turning the kill switch on is warned when another firewall is
    /// already active.
    async fn helper_ready(
        &self,
        trigger: InstallTrigger,
        outcome: InstallOutcome,
    ) -> Result<InstallOutcome> {
        if trigger != InstallTrigger::UserInitiated {
            return Ok(outcome);
        }

        match self.helper.any_firewall_enabled().await {
            Ok(true) => {
                if self.alerts.prompt(Alert::ActiveFirewallDetected).await
                    == AlertResponse::Cancelled
                {
                    info!("Kill switch declined because another firewall is active");
                    self.preference.set(false);
                    return Ok(InstallOutcome::Declined);
                }
            }
            Ok(false) => {}
            Err(e) => warn!("Could not check for an active firewall: {}", e),
        }

        Ok(outcome)
    }

    async fn install(&self, mut trigger: InstallTrigger) -> Result<InstallOutcome> {
        if self.verified.load(Ordering::SeqCst) || self.installed_version_matches().await {
            self.verified.store(true, Ordering::SeqCst);
            return self
                .helper_ready(trigger, InstallOutcome::AlreadyInstalled)
                .await;
        }

        let mut attempt = 0;
        loop {
            attempt += 1;

            let prompt = match trigger {
                InstallTrigger::UserInitiated => Some(Alert::HelperInstalling),
                InstallTrigger::UpdateCheck => Some(Alert::HelperUpdating),
                InstallTrigger::Silent => None,
            };
            if let Some(alert) = prompt {
                if self.alerts.prompt(alert).await == AlertResponse::Cancelled {
                    info!("Helper installation declined");
                    return Ok(InstallOutcome::Declined);
                }
            }

            match self.unload_then_install().await {
                Ok(()) => {
                    info!("Privileged helper {} installed", self.bundled_version);
                    self.verified.store(true, Ordering::SeqCst);
                    return self.helper_ready(trigger, InstallOutcome::Installed).await;
                }
                Err(e) => {
                    error!("Helper installation failed: {}", e);
                    self.preference.set(false);

                    let reason = match e {
                        KillSwitchError::HelperInstallFailed(reason) => reason,
                        other => other.to_string(),
                    };

                    if attempt >= MAX_INSTALL_ATTEMPTS {
                        return Err(KillSwitchError::HelperInstallFailed(reason));
                    }

                    let retry = self
                        .alerts
                        .prompt(Alert::HelperInstallFailed {
                            reason: reason.clone(),
                        })
                        .await;

                    if retry == AlertResponse::Cancelled {
                        return Err(KillSwitchError::HelperInstallFailed(reason));
                    }

                    self.preference.set(true);
                    // the user already agreed once
                    trigger = InstallTrigger::Silent;
                }
            }
        }
    }
}

#[async_trait]
impl Installer for HelperInstaller {
    async fn ensure_installed(&self, trigger: InstallTrigger) -> Result<InstallOutcome> {
        if !self.preference.get() {
            debug!("Kill switch off, skipping helper check");
            return Ok(InstallOutcome::Skipped);
        }

        if self
            .in_progress
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Helper installation already in progress");
            return Ok(InstallOutcome::Skipped);
        }
        let _guard = InProgress(&self.in_progress);

        self.install(trigger).await
    }

    fn reset_verification(&self) {
        self.verified.store(false, Ordering::SeqCst);
    }

    fn is_in_progress(&self) -> bool {
        self.in_progress.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::{AlertKind, MockAlertSink};
    use crate::cmd_abstraction::{CommandOutput, MockCommandExecutor};
    use crate::helper::MockPrivilegedHelper;

    fn installer(
        helper: MockPrivilegedHelper,
        elevator: MockElevator,
        alerts: MockAlertSink,
    ) -> (HelperInstaller, Arc<KillSwitchPreference>) {
        let preference = Arc::new(KillSwitchPreference::new(true));
        let installer = HelperInstaller::new(
            Arc::new(helper),
            Arc::new(elevator),
            Arc::new(alerts),
            preference.clone(),
            "1.1",
        );
        (installer, preference)
    }

    fn no_prompts() -> MockAlertSink {
        let mut alerts = MockAlertSink::new();
        alerts.expect_prompt().never();
        alerts
    }

    #[tokio::test]
    async fn test_matching_version_is_already_installed() {
        let mut helper = MockPrivilegedHelper::new();
        helper
            .expect_version()
            .times(1)
            .returning(|| Ok("1.1".to_string()));
        let mut elevator = MockElevator::new();
        elevator.expect_install_helper().never();

        let (installer, _) = installer(helper, elevator, no_prompts());
        assert_eq!(
            installer.ensure_installed(InstallTrigger::Silent).await.unwrap(),
            InstallOutcome::AlreadyInstalled
        );
        assert!(!installer.is_in_progress());
    }

    #[tokio::test]
    async fn test_version_mismatch_reinstalls_once() {
        let mut helper = MockPrivilegedHelper::new();
        let mut seq = mockall::Sequence::new();
        helper
            .expect_version()
            .times(1)
            .returning(|| Ok("1.0".to_string()));
        helper
            .expect_unload()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| Ok(()));
        let mut elevator = MockElevator::new();
        elevator
            .expect_install_helper()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| Ok(()));

        let (installer, _) = installer(helper, elevator, no_prompts());

        assert_eq!(
            installer.ensure_installed(InstallTrigger::Silent).await.unwrap(),
            InstallOutcome::Installed
        );
        // verified: no second version query
        assert_eq!(
            installer.ensure_installed(InstallTrigger::Silent).await.unwrap(),
            InstallOutcome::AlreadyInstalled
        );
    }

    #[tokio::test]
    async fn test_unload_failure_is_ignored() {
        let mut helper = MockPrivilegedHelper::new();
        helper
            .expect_version()
            .returning(|| Err(KillSwitchError::HelperNotInstalled));
        helper
            .expect_unload()
            .returning(|| Err(KillSwitchError::HelperNotInstalled));
        let mut elevator = MockElevator::new();
        elevator
            .expect_install_helper()
            .times(1)
            .returning(|| Ok(()));

        let (installer, _) = installer(helper, elevator, no_prompts());
        assert_eq!(
            installer.ensure_installed(InstallTrigger::Silent).await.unwrap(),
            InstallOutcome::Installed
        );
    }

    #[tokio::test]
    async fn test_user_initiated_prompts_then_checks_other_firewalls() {
        let mut helper = MockPrivilegedHelper::new();
        helper
            .expect_version()
            .returning(|| Err(KillSwitchError::HelperNotInstalled));
        helper.expect_unload().returning(|| Ok(()));
        helper
            .expect_any_firewall_enabled()
            .times(1)
            .returning(|| Ok(false));
        let mut elevator = MockElevator::new();
        elevator
            .expect_install_helper()
            .times(1)
            .returning(|| Ok(()));
        let mut alerts = MockAlertSink::new();
        alerts
            .expect_prompt()
            .withf(|a| a.kind() == AlertKind::HelperInstalling)
            .times(1)
            .returning(|_| AlertResponse::Confirmed);

        let (installer, _) = installer(helper, elevator, alerts);
        assert_eq!(
            installer
                .ensure_installed(InstallTrigger::UserInitiated)
                .await
                .unwrap(),
            InstallOutcome::Installed
        );
    }

    #[tokio::test]
    async fn test_update_prompt_cancelled_declines() {
        let mut helper = MockPrivilegedHelper::new();
        helper
            .expect_version()
            .times(2)
            .returning(|| Ok("1.0".to_string()));
        helper.expect_unload().never();
        let mut elevator = MockElevator::new();
        elevator.expect_install_helper().never();
        let mut alerts = MockAlertSink::new();
        alerts
            .expect_prompt()
            .withf(|a| a.kind() == AlertKind::HelperUpdating)
            .times(2)
            .returning(|_| AlertResponse::Cancelled);

        let (installer, preference) = installer(helper, elevator, alerts);
        for _ in 0..2 {
            assert_eq!(
                installer
                    .ensure_installed(InstallTrigger::UpdateCheck)
                    .await
                    .unwrap(),
                InstallOutcome::Declined
            );
        }
        assert!(preference.get());
    }

    #[tokio::test]
    async fn test_active_firewall_cancel_turns_kill_switch_off() {
        let mut helper = MockPrivilegedHelper::new();
        helper.expect_version().returning(|| Ok("1.1".to_string()));
        helper
            .expect_any_firewall_enabled()
            .returning(|| Ok(true));
        let mut alerts = MockAlertSink::new();
        alerts
            .expect_prompt()
            .withf(|a| a.kind() == AlertKind::ActiveFirewallDetected)
            .times(1)
            .returning(|_| AlertResponse::Cancelled);

        let (installer, preference) = installer(helper, MockElevator::new(), alerts);
        assert_eq!(
            installer
                .ensure_installed(InstallTrigger::UserInitiated)
                .await
                .unwrap(),
            InstallOutcome::Declined
        );
        assert!(!preference.get());
    }

    #[tokio::test]
    async fn test_install_failure_forces_preference_off() {
        let mut helper = MockPrivilegedHelper::new();
        helper.expect_version().returning(|| Ok("1.0".to_string()));
        helper.expect_unload().returning(|| Ok(()));
        let mut elevator = MockElevator::new();
        elevator
            .expect_install_helper()
            .times(1)
            .returning(|| Err(KillSwitchError::HelperInstallFailed("denied".into())));
        let mut alerts = MockAlertSink::new();
        alerts
            .expect_prompt()
            .withf(|a| {
                *a == Alert::HelperInstallFailed {
                    reason: "denied".into(),
                }
            })
            .times(1)
            .returning(|_| AlertResponse::Cancelled);

        let (installer, preference) = installer(helper, elevator, alerts);
        let err = installer
            .ensure_installed(InstallTrigger::Silent)
            .await
            .unwrap_err();

        assert!(matches!(err, KillSwitchError::HelperInstallFailed(_)));
        assert!(!preference.get());
        assert!(!installer.is_in_progress());
    }

    #[tokio::test]
    async fn test_install_retry_after_confirm() {
        let mut helper = MockPrivilegedHelper::new();
        helper.expect_version().returning(|| Ok("1.0".to_string()));
        helper.expect_unload().returning(|| Ok(()));
        let mut elevator = MockElevator::new();
        let mut seq = mockall::Sequence::new();
        elevator
            .expect_install_helper()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| Err(KillSwitchError::HelperInstallFailed("timeout".into())));
        elevator
            .expect_install_helper()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| Ok(()));
        let mut alerts = MockAlertSink::new();
        alerts
            .expect_prompt()
            .withf(|a| a.kind() == AlertKind::HelperInstallFailed)
            .times(1)
            .returning(|_| AlertResponse::Confirmed);

        let (installer, preference) = installer(helper, elevator, alerts);
        assert_eq!(
            installer.ensure_installed(InstallTrigger::Silent).await.unwrap(),
            InstallOutcome::Installed
        );
        assert!(preference.get());
    }

    #[tokio::test]
    async fn test_retries_are_bounded() {
        let mut helper = MockPrivilegedHelper::new();
        helper.expect_version().returning(|| Ok("1.0".to_string()));
        helper.expect_unload().returning(|| Ok(()));
        let mut elevator = MockElevator::new();
        elevator
            .expect_install_helper()
            .times(MAX_INSTALL_ATTEMPTS)
            .returning(|| Err(KillSwitchError::HelperInstallFailed("denied".into())));
        let mut alerts = MockAlertSink::new();
        alerts
            .expect_prompt()
            .times(MAX_INSTALL_ATTEMPTS - 1)
            .returning(|_| AlertResponse::Confirmed);

        let (installer, preference) = installer(helper, elevator, alerts);
        assert!(installer
            .ensure_installed(InstallTrigger::Silent)
            .await
            .is_err());
        assert!(!preference.get());
    }

    #[tokio::test]
    async fn test_skipped_when_preference_off() {
        let mut helper = MockPrivilegedHelper::new();
        helper.expect_version().never();

        let (installer, preference) = installer(helper, MockElevator::new(), no_prompts());
        preference.set(false);
        assert_eq!(
            installer.ensure_installed(InstallTrigger::Silent).await.unwrap(),
            InstallOutcome::Skipped
        );
    }

    #[tokio::test]
    async fn test_skipped_when_in_progress() {
        let mut helper = MockPrivilegedHelper::new();
        helper.expect_version().never();

        let (installer, _) = installer(helper, MockElevator::new(), no_prompts());
        installer.in_progress.store(true, Ordering::SeqCst);
        assert_eq!(
            installer.ensure_installed(InstallTrigger::Silent).await.unwrap(),
            InstallOutcome::Skipped
        );
    }

    #[tokio::test]
    async fn test_reset_verification_queries_again() {
        let mut helper = MockPrivilegedHelper::new();
        helper
            .expect_version()
            .times(2)
            .returning(|| Ok("1.1".to_string()));

        let (installer, _) = installer(helper, MockElevator::new(), no_prompts());
        installer.ensure_installed(InstallTrigger::Silent).await.unwrap();
        installer.reset_verification();
        installer.ensure_installed(InstallTrigger::Silent).await.unwrap();
    }

    #[tokio::test]
    async fn test_command_elevator() {
        let mut mock = MockCommandExecutor::new();
        mock.expect_execute()
            .withf(|cmd, args| cmd == "pkexec" && args == ["/usr/libexec/tunguard/install-helper".to_string()])
            .times(1)
            .returning(|_, _| {
                Ok(CommandOutput {
                    success: true,
                    code: Some(0),
                    ..Default::default()
                })
            });

        let elevator = CommandElevator::new(
            vec![
                "pkexec".to_string(),
                "/usr/libexec/tunguard/install-helper".to_string(),
            ],
            Arc::new(mock),
        );
        elevator.install_helper().await.unwrap();
    }

    #[tokio::test]
    async fn test_command_elevator_failure() {
        let mut mock = MockCommandExecutor::new();
        mock.expect_execute().returning(|_, _| {
            Ok(CommandOutput {
                stderr: "Request dismissed\n".to_string(),
                success: false,
                code: Some(126),
                ..Default::default()
            })
        });

        let elevator = CommandElevator::new(vec!["pkexec".to_string()], Arc::new(mock));
        match elevator.install_helper().await {
            Err(KillSwitchError::HelperInstallFailed(reason)) => {
                assert_eq!(reason, "Request dismissed")
            }
            other => panic!("unexpected {:?}", other),
        }

        let empty = CommandElevator::new(vec![], Arc::new(MockCommandExecutor::new()));
        assert!(empty.install_helper().await.is_err());
    }
}
