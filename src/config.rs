//! Configuration management for tunguard.

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;
use zeroize::{Zeroize, ZeroizeOnDrop};

pub const DEFAULT_CONFIG_PATH: &str = "/etc/tunguard/config.yaml";

/// Environment variable overriding the webhook bearer token
const WEBHOOK_TOKEN_ENV: &str = "TUNGUARD_WEBHOOK_TOKEN";

const MIN_HEALTH_INTERVAL_SECS: u64 = 5;
const MAX_IPC_TIMEOUT_SECS: u64 = 60;

/// Secure string type that zeroizes memory on drop
/// Used for sensitive data like tokens
#[derive(Clone, Default, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
#[serde(transparent)]
pub struct SecureString(String);

impl SecureString {
    pub fn new(s: String) -> Self {
        Self(s)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Debug for SecureString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("[REDACTED]")
    }
}

impl From<&str> for SecureString {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// User-level kill switch preference
    pub kill_switch: bool,

    /// Privileged helper settings
    pub helper: HelperConfig,

    /// Rule document handed to the helper
    pub rules_file: PathBuf,

    /// Last known firewall status, for `tunguard status`
    pub state_file: PathBuf,

    /// Single-instance lock of the controller daemon
    pub lock_file: PathBuf,

    pub health_check: HealthCheckConfig,

    /// Interface name prefixes recognized as VPN tunnels
    pub tunnel_prefixes: Vec<String>,

    pub alerts: AlertsConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            kill_switch: true,
            helper: HelperConfig::default(),
            rules_file: PathBuf::from("/var/lib/tunguard/killswitch.conf"),
            state_file: PathBuf::from("/var/lib/tunguard/state.json"),
            lock_file: PathBuf::from("/var/run/tunguard.lock"),
            health_check: HealthCheckConfig::default(),
            tunnel_prefixes: default_tunnel_prefixes(),
            alerts: AlertsConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from YAML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {:?}", path.as_ref()))?;
        let config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path.as_ref()))?;

        config.validate()?;

        Ok(config)
    }

    /// Load configuration, falling back to defaults when the file is absent
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        if path.as_ref().exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.helper.install_command.is_empty()
            || self.helper.install_command[0].trim().is_empty()
        {
            anyhow::bail!("helper.install_command must not be empty");
        }

        if self.helper.bundled_version.trim().is_empty() {
            anyhow::bail!("helper.bundled_version must not be empty");
        }

        if !(1..=MAX_IPC_TIMEOUT_SECS).contains(&self.helper.ipc_timeout_secs) {
            anyhow::bail!(
                "Invalid helper.ipc_timeout_secs {}. Must be between 1 and {}",
                self.helper.ipc_timeout_secs,
                MAX_IPC_TIMEOUT_SECS
            );
        }

        if self.health_check.interval_secs < MIN_HEALTH_INTERVAL_SECS {
            anyhow::bail!(
                "Invalid health_check.interval_secs {}. Must be at least {}",
                self.health_check.interval_secs,
                MIN_HEALTH_INTERVAL_SECS
            );
        }

        if self.health_check.tolerance_secs >= self.health_check.interval_secs {
            anyhow::bail!("health_check.tolerance_secs must be lower than interval_secs");
        }

        if self.tunnel_prefixes.is_empty() {
            anyhow::bail!("tunnel_prefixes must not be empty");
        }

        for prefix in &self.tunnel_prefixes {
            if prefix.is_empty() || !prefix.chars().all(|c| c.is_ascii_alphanumeric()) {
                anyhow::bail!("Invalid tunnel prefix '{}': use ASCII letters and digits", prefix);
            }
        }

        // Validate webhook URL uses HTTPS if enabled
        if self.alerts.webhook.enabled && !self.alerts.webhook.url.starts_with("https://") {
            anyhow::bail!("Webhook URL must use HTTPS: {}", self.alerts.webhook.url);
        }

        Ok(())
    }

    /// Save configuration to YAML file atomically
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        use std::io::Write;
        use tempfile::NamedTempFile;

        let path = path.as_ref();
        let content = serde_yaml::to_string(self).context("Failed to serialize config")?;

        let parent_dir = match path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };
        let mut temp_file = NamedTempFile::new_in(parent_dir)
            .context("Failed to create temporary file for config")?;

        temp_file.write_all(content.as_bytes())?;
        temp_file.as_file().sync_all()?;

        temp_file
            .persist(path)
            .with_context(|| format!("Failed to persist config file: {:?}", path))?;

        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HelperConfig {
    /// Unix socket the privileged helper listens on
    pub socket_path: PathBuf,

    /// Version of the helper shipped with this build
    pub bundled_version: String,

    /// Privileged command that (re)installs the helper. Runs after the
    /// operator approves elevation.
    pub install_command: Vec<String>,

    /// Per-call IPC timeout
    pub ipc_timeout_secs: u64,

    /// Non-root user the helper accepts requests from, normally the one
    /// running `tunguard run`. Root is always accepted.
    pub allowed_uid: Option<u32>,
}

impl Default for HelperConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from("/var/run/tunguard-helper.sock"),
            bundled_version: env!("CARGO_PKG_VERSION").to_string(),
            install_command: vec![
                "pkexec".to_string(),
                "/usr/libexec/tunguard/install-helper".to_string(),
            ],
            ipc_timeout_secs: 3,
            allowed_uid: None,
        }
    }
}

impl HelperConfig {
    pub fn ipc_timeout(&self) -> Duration {
        Duration::from_secs(self.ipc_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthCheckConfig {
    pub interval_secs: u64,
    /// Slack granted to the scheduler so an idle system is not woken up
    /// exactly on the interval
    pub tolerance_secs: u64,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            tolerance_secs: 5,
        }
    }
}

impl HealthCheckConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn tolerance(&self) -> Duration {
        Duration::from_secs(self.tolerance_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AlertsConfig {
    /// How prompts are answered when no operator is attached
    pub auto_confirm: bool,
    pub webhook: WebhookConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct WebhookConfig {
    pub enabled: bool,
    pub url: String,
    #[serde(deserialize_with = "deserialize_headers")]
    pub headers: HashMap<String, String>,
    /// Bearer token, can also be set via TUNGUARD_WEBHOOK_TOKEN
    /// Memory is securely zeroed when dropped
    pub token: SecureString,
    /// Environment variable name to read token from (optional)
    pub token_env: Option<String>,
}

impl WebhookConfig {
    /// Get the effective token, checking env vars before the config value
    pub fn get_token(&self) -> SecureString {
        if let Some(ref env_name) = self.token_env {
            if let Ok(val) = env::var(env_name) {
                return SecureString::new(val);
            }
        }
        if let Ok(val) = env::var(WEBHOOK_TOKEN_ENV) {
            return SecureString::new(val);
        }
        self.token.clone()
    }
}

/// Deserialize and validate HTTP headers (reject injection attempts)
fn deserialize_headers<'de, D>(deserializer: D) -> Result<HashMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    let headers: HashMap<String, String> = HashMap::deserialize(deserializer)?;

    for (key, value) in &headers {
        if value.contains('\r') || value.contains('\n') {
            return Err(serde::de::Error::custom(format!(
                "Invalid header value for '{}': contains newline characters",
                key
            )));
        }
        // RFC 7230 token subset
        if key.is_empty()
            || !key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || "-_".contains(c))
        {
            return Err(serde::de::Error::custom(format!(
                "Invalid header name '{}': contains invalid characters",
                key
            )));
        }
    }

    Ok(headers)
}

fn default_tunnel_prefixes() -> Vec<String> {
    ["ipsec", "utun", "tun", "wg"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}
