//! Kill switch alert events and the sinks that surface them.
//!
//! Alerts are plain data. Rendering (dialogs, notifications) belongs to
//! whoever implements [`AlertSink`].

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::config::{AlertsConfig, WebhookConfig};

#[cfg(test)]
use mockall::automock;

/// Timeout for alert HTTP requests
const TIMEOUT_SECS: u64 = 10;

/// Alert severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertLevel {
    Info,
    Warning,
    Error,
}

impl AlertLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertLevel::Info => "INFO",
            AlertLevel::Warning => "WARNING",
            AlertLevel::Error => "ERROR",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    ActiveFirewallDetected,
    FirewallBlockingConnection,
    FirewallError,
    HelperInstallFailed,
    HelperInstalling,
    HelperUpdating,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Alert {
    /// Another firewall is already active; enabling the kill switch on top
    /// of it needs confirmation.
    ActiveFirewallDetected,
    /// The VPN dropped and the kill switch is holding traffic. Confirm
    /// lifts the block, cancel keeps it.
    FirewallBlockingConnection { entry_ip: Option<IpAddr> },
    /// The firewall is not in the state it should be.
    FirewallError { reason: String },
    /// Installing the helper failed. Confirm retries, cancel keeps the kill
    /// switch off.
    HelperInstallFailed { reason: String },
    HelperInstalling,
    HelperUpdating,
}

impl Alert {
    pub fn kind(&self) -> AlertKind {
        match self {
            Alert::ActiveFirewallDetected => AlertKind::ActiveFirewallDetected,
            Alert::FirewallBlockingConnection { .. } => AlertKind::FirewallBlockingConnection,
            Alert::FirewallError { .. } => AlertKind::FirewallError,
            Alert::HelperInstallFailed { .. } => AlertKind::HelperInstallFailed,
            Alert::HelperInstalling => AlertKind::HelperInstalling,
            Alert::HelperUpdating => AlertKind::HelperUpdating,
        }
    }

    pub fn level(&self) -> AlertLevel {
        match self {
            Alert::HelperInstalling | Alert::HelperUpdating => AlertLevel::Info,
            Alert::ActiveFirewallDetected | Alert::FirewallBlockingConnection { .. } => {
                AlertLevel::Warning
            }
            Alert::FirewallError { .. } | Alert::HelperInstallFailed { .. } => AlertLevel::Error,
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            Alert::ActiveFirewallDetected => "Active firewall detected",
            Alert::FirewallBlockingConnection { .. } => "Connection blocked by kill switch",
            Alert::FirewallError { .. } => "Kill switch error",
            Alert::HelperInstallFailed { .. } => "Helper installation failed",
            Alert::HelperInstalling => "Installing kill switch helper",
            Alert::HelperUpdating => "Updating kill switch helper",
        }
    }

    pub fn message(&self) -> String {
        match self {
            Alert::ActiveFirewallDetected => "Another firewall is already enabled on this system. \
                 Enabling the kill switch replaces its rules while the VPN is connected."
                .to_string(),
            Alert::FirewallBlockingConnection { entry_ip: Some(ip) } => format!(
                "The VPN connection to {} dropped. All traffic outside the tunnel is blocked \
                 until you reconnect or disconnect.",
                ip
            ),
            Alert::FirewallBlockingConnection { entry_ip: None } => {
                "The VPN connection dropped. All traffic outside the tunnel is blocked \
                 until you reconnect or disconnect."
                    .to_string()
            }
            Alert::FirewallError { reason } => {
                format!("The kill switch could not be applied: {}", reason)
            }
            Alert::HelperInstallFailed { reason } => format!(
                "The kill switch helper could not be installed ({}). \
                 The kill switch has been turned off. Retry?",
                reason
            ),
            Alert::HelperInstalling => {
                "The kill switch needs a privileged helper. You will be asked for \
                 administrator credentials."
                    .to_string()
            }
            Alert::HelperUpdating => "A new version of the kill switch helper must be installed. \
                 You will be asked for administrator credentials."
                .to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertResponse {
    Confirmed,
    Cancelled,
}

/// Destination for kill switch alerts.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait AlertSink: Send + Sync {
    /// Show an informational alert. Never blocks the caller.
    fn push(&self, alert: Alert);

    /// Show an alert carrying confirm/cancel actions and wait for the answer.
    async fn prompt(&self, alert: Alert) -> AlertResponse;

    /// Withdraw any displayed alert of this kind.
    fn dismiss(&self, kind: AlertKind);
}

/// Headless sink: alerts go to the log, prompts get a fixed answer.
#[derive(Debug, Clone, Default)]
pub struct LogAlertSink {
    auto_confirm: bool,
}

impl LogAlertSink {
    pub fn new(auto_confirm: bool) -> Self {
        Self { auto_confirm }
    }
}

#[async_trait]
impl AlertSink for LogAlertSink {
    fn push(&self, alert: Alert) {
        match alert.level() {
            AlertLevel::Info => info!("{}: {}", alert.title(), alert.message()),
            AlertLevel::Warning => warn!("{}: {}", alert.title(), alert.message()),
            AlertLevel::Error => error!("{}: {}", alert.title(), alert.message()),
        }
    }

    async fn prompt(&self, alert: Alert) -> AlertResponse {
        // lifting the block needs an operator
        let response =
            if self.auto_confirm && alert.kind() != AlertKind::FirewallBlockingConnection {
                AlertResponse::Confirmed
            } else {
                AlertResponse::Cancelled
            };
        warn!(
            "{}: {} [answered {:?}]",
            alert.title(),
            alert.message(),
            response
        );
        response
    }

    fn dismiss(&self, kind: AlertKind) {
        debug!("Dismissed {:?} alerts", kind);
    }
}

/// Forwards every alert to a JSON webhook, then hands it to `inner`, which
/// also answers prompts.
pub struct WebhookAlertSink {
    client: Client,
    config: WebhookConfig,
    inner: Arc<dyn AlertSink>,
}

impl WebhookAlertSink {
    pub fn new(config: WebhookConfig, inner: Arc<dyn AlertSink>) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(TIMEOUT_SECS))
            .build()
            .context("Failed to create HTTP client for alerts")?;

        Ok(Self {
            client,
            config,
            inner,
        })
    }

    fn forward(&self, alert: &Alert) {
        if !self.config.enabled {
            return;
        }

        let client = self.client.clone();
        let config = self.config.clone();
        let alert = alert.clone();

        tokio::spawn(async move {
            if let Err(e) = send_webhook(&client, &config, &alert).await {
                warn!("Webhook alert failed: {:#}", e);
            }
        });
    }
}

#[async_trait]
impl AlertSink for WebhookAlertSink {
    fn push(&self, alert: Alert) {
        self.forward(&alert);
        self.inner.push(alert);
    }

    async fn prompt(&self, alert: Alert) -> AlertResponse {
        self.forward(&alert);
        self.inner.prompt(alert).await
    }

    fn dismiss(&self, kind: AlertKind) {
        self.inner.dismiss(kind);
    }
}

#[derive(Serialize)]
struct WebhookPayload<'a> {
    level: &'a str,
    kind: AlertKind,
    title: &'a str,
    message: String,
    timestamp: String,
    source: &'a str,
}

async fn send_webhook(client: &Client, config: &WebhookConfig, alert: &Alert) -> Result<()> {
    let payload = WebhookPayload {
        level: alert.level().as_str(),
        kind: alert.kind(),
        title: alert.title(),
        message: alert.message(),
        timestamp: chrono::Utc::now().to_rfc3339(),
        source: "tunguard",
    };

    let mut request = client.post(&config.url).json(&payload);

    // Headers are validated during config deserialization
    for (key, value) in &config.headers {
        request = request.header(key.as_str(), value.as_str());
    }

    let token = config.get_token();
    if !token.is_empty() {
        request = request.bearer_auth(token.as_str());
    }

    let response = request.send().await.context("Failed to send webhook")?;

    if !response.status().is_success() {
        anyhow::bail!("Webhook returned {}", response.status());
    }

    debug!("Webhook alert sent: {:?}", alert.kind());
    Ok(())
}

/// Build the alert sink described by the configuration.
pub fn build_alert_sink(config: &AlertsConfig) -> Result<Arc<dyn AlertSink>> {
    let log_sink: Arc<dyn AlertSink> = Arc::new(LogAlertSink::new(config.auto_confirm));

    if config.webhook.enabled {
        Ok(Arc::new(WebhookAlertSink::new(
            config.webhook.clone(),
            log_sink,
        )?))
    } else {
        Ok(log_sink)
    }
}
