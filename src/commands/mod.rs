//! CLI command implementations.

pub mod disable;
pub mod enable;
pub mod helper;
pub mod install;
pub mod interfaces;
pub mod rules;
pub mod run;
pub mod status;

use anyhow::Result;
use std::sync::Arc;

use crate::alerts::build_alert_sink;
use crate::cmd_abstraction::{CommandExecutor, RealCommandExecutor};
use crate::config::Config;
use crate::helper::transport::UnixSocketConnector;
use crate::helper::{HelperClient, PrivilegedHelper};
use crate::installer::{CommandElevator, HelperInstaller};
use crate::interfaces::SystemInterfaceResolver;
use crate::killswitch::{KillSwitch, KillSwitchDeps, KillSwitchHandle};
use crate::preference::KillSwitchPreference;
use crate::rules::RulesWriter;

/// Client for the helper socket named in `config`.
pub(crate) fn helper_client(config: &Config) -> HelperClient {
    HelperClient::new(
        Arc::new(UnixSocketConnector::new(&config.helper.socket_path)),
        config.helper.ipc_timeout(),
    )
}

/// Wire the controller with the real helper, installer and resolver.
pub(crate) fn controller(
    config: &Config,
    preference: Arc<KillSwitchPreference>,
) -> Result<KillSwitchHandle> {
    let executor: Arc<dyn CommandExecutor> = Arc::new(RealCommandExecutor::new());
    let client = helper_client(config);
    let invalidations = client.subscribe_invalidations();
    let helper: Arc<dyn PrivilegedHelper> = Arc::new(client);
    let alerts = build_alert_sink(&config.alerts)?;

    let installer = HelperInstaller::new(
        helper.clone(),
        Arc::new(CommandElevator::new(
            config.helper.install_command.clone(),
            executor,
        )),
        alerts.clone(),
        preference.clone(),
        config.helper.bundled_version.clone(),
    );

    Ok(KillSwitch::spawn(KillSwitchDeps {
        helper,
        installer: Arc::new(installer),
        resolver: Arc::new(SystemInterfaceResolver::new(config.tunnel_prefixes.clone())),
        alerts,
        preference,
        rules_writer: RulesWriter::new(&config.rules_file),
        state_file: Some(config.state_file.clone()),
        health_interval: config.health_check.interval(),
        health_tolerance: config.health_check.tolerance(),
        invalidations: Some(invalidations),
    }))
}
