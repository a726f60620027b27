//! Tunnel interface detection and classification.
//!
//! The kill switch trusts every interface whose name starts with one of the
//! configured tunnel prefixes (`ipsec`, `utun`, `tun`, `wg` by default).

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::cmd_abstraction::{args_to_strings, CommandExecutor, RealCommandExecutor};

#[cfg(test)]
use mockall::automock;

const SYS_CLASS_NET: &str = "/sys/class/net";
const IFCONFIG: &str = "ifconfig";

/// Source of the currently active tunnel interface names.
#[cfg_attr(test, automock)]
pub trait InterfaceResolver: Send + Sync {
    /// Names of the active interfaces recognized as VPN tunnels, sorted and
    /// de-duplicated. Empty when nothing matches or detection failed.
    fn active_tunnel_interfaces(&self) -> Vec<String>;
}

/// Type of network interface
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterfaceType {
    /// IKEv2/IPsec tunnel
    Ipsec,
    /// macOS user-space tunnel
    Utun,
    /// TUN/TAP (OpenVPN, etc.)
    TunTap,
    /// WireGuard
    WireGuard,
    Loopback,
    Other,
}

impl InterfaceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            InterfaceType::Ipsec => "ipsec",
            InterfaceType::Utun => "utun",
            InterfaceType::TunTap => "tun/tap",
            InterfaceType::WireGuard => "wireguard",
            InterfaceType::Loopback => "loopback",
            InterfaceType::Other => "other",
        }
    }
}

impl std::fmt::Display for InterfaceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Label an interface by its name.
pub fn classify(name: &str) -> InterfaceType {
    if name == "lo" || name.starts_with("lo0") {
        return InterfaceType::Loopback;
    }
    if name.starts_with("ipsec") {
        return InterfaceType::Ipsec;
    }
    if name.starts_with("utun") {
        return InterfaceType::Utun;
    }
    if name.starts_with("wg") {
        return InterfaceType::WireGuard;
    }
    if name.starts_with("tun") || name.starts_with("tap") {
        return InterfaceType::TunTap;
    }
    InterfaceType::Other
}

/// Detected interface with its properties
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectedInterface {
    pub name: String,
    pub interface_type: InterfaceType,
    /// Matches one of the configured tunnel prefixes
    pub is_tunnel: bool,
    /// Link is not reported as down
    pub is_up: bool,
}

/// Resolves tunnel interfaces from the running system.
pub struct SystemInterfaceResolver {
    prefixes: Vec<String>,
    net_path: PathBuf,
    executor: Arc<dyn CommandExecutor>,
}

impl SystemInterfaceResolver {
    pub fn new(prefixes: Vec<String>) -> Self {
        Self::with_executor(prefixes, SYS_CLASS_NET, Arc::new(RealCommandExecutor::new()))
    }

    pub fn with_executor(
        prefixes: Vec<String>,
        net_path: impl Into<PathBuf>,
        executor: Arc<dyn CommandExecutor>,
    ) -> Self {
        Self {
            prefixes,
            net_path: net_path.into(),
            executor,
        }
    }

    pub fn is_tunnel(&self, name: &str) -> bool {
        self.prefixes.iter().any(|p| name.starts_with(p.as_str()))
    }

    /// List every interface on the system, sorted by name.
    pub fn list_interfaces(&self) -> Result<Vec<DetectedInterface>> {
        let mut interfaces = if self.net_path.exists() {
            self.read_sysfs()?
        } else {
            debug!("{:?} not found, falling back to {}", self.net_path, IFCONFIG);
            self.read_ifconfig()?
        };

        interfaces.sort_by(|a, b| a.name.cmp(&b.name));
        interfaces.dedup_by(|a, b| a.name == b.name);
        Ok(interfaces)
    }

    fn detected(&self, name: String, is_up: bool) -> DetectedInterface {
        DetectedInterface {
            interface_type: classify(&name),
            is_tunnel: self.is_tunnel(&name),
            is_up,
            name,
        }
    }

    fn read_sysfs(&self) -> Result<Vec<DetectedInterface>> {
        let mut interfaces = Vec::new();

        let entries = fs::read_dir(&self.net_path)
            .with_context(|| format!("Failed to read {:?}", self.net_path))?;

        for entry in entries {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            let is_up = !is_down(&entry.path());
            interfaces.push(self.detected(name, is_up));
        }

        Ok(interfaces)
    }

    fn read_ifconfig(&self) -> Result<Vec<DetectedInterface>> {
        // -u restricts the listing to interfaces that are up
        let output = self
            .executor
            .execute(IFCONFIG, &args_to_strings(&["-l", "-u"]))?;

        if !output.success {
            anyhow::bail!("{} -l -u failed: {}", IFCONFIG, output.stderr.trim());
        }

        Ok(output
            .stdout
            .split_whitespace()
            .map(|name| self.detected(name.to_string(), true))
            .collect())
    }
}

/// An interface counts as down only when the kernel says so explicitly.
fn is_down(iface_dir: &Path) -> bool {
    fs::read_to_string(iface_dir.join("operstate"))
        .map(|state| state.trim() == "down")
        .unwrap_or(false)
}

impl InterfaceResolver for SystemInterfaceResolver {
    fn active_tunnel_interfaces(&self) -> Vec<String> {
        match self.list_interfaces() {
            Ok(interfaces) => interfaces
                .into_iter()
                .filter(|i| i.is_up && i.is_tunnel)
                .map(|i| i.name)
                .collect(),
            Err(e) => {
                warn!("Interface detection failed: {:#}", e);
                Vec::new()
            }
        }
    }
}

/// Format detection report for display
pub fn format_detection_report(interfaces: &[DetectedInterface]) -> String {
    let mut output = String::new();

    output.push_str(&format!(
        "{:<15} {:<10} {:<6} {}\n",
        "Interface", "Type", "State", "Trusted"
    ));
    output.push_str(&format!(
        "{:<15} {:<10} {:<6} {}\n",
        "-".repeat(15),
        "-".repeat(10),
        "-".repeat(6),
        "-".repeat(7)
    ));

    for iface in interfaces {
        output.push_str(&format!(
            "{:<15} {:<10} {:<6} {}\n",
            iface.name,
            iface.interface_type.as_str(),
            if iface.is_up { "up" } else { "down" },
            if iface.is_up && iface.is_tunnel { "yes" } else { "no" }
        ));
    }

    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cmd_abstraction::{CommandOutput, MockCommandExecutor};
    use tempfile::TempDir;

    fn prefixes() -> Vec<String> {
        vec!["ipsec".into(), "utun".into(), "tun".into(), "wg".into()]
    }

    fn fake_sysfs(entries: &[(&str, Option<&str>)]) -> TempDir {
        let dir = TempDir::new().unwrap();
        for (name, operstate) in entries {
            let iface = dir.path().join(name);
            fs::create_dir(&iface).unwrap();
            if let Some(state) = operstate {
                fs::write(iface.join("operstate"), format!("{}\n", state)).unwrap();
            }
        }
        dir
    }

    fn unused_executor() -> Arc<dyn CommandExecutor> {
        let mut mock = MockCommandExecutor::new();
        mock.expect_execute().never();
        Arc::new(mock)
    }

    #[test]
    fn test_classify() {
        assert_eq!(classify("ipsec0"), InterfaceType::Ipsec);
        assert_eq!(classify("utun3"), InterfaceType::Utun);
        assert_eq!(classify("tun0"), InterfaceType::TunTap);
        assert_eq!(classify("tap1"), InterfaceType::TunTap);
        assert_eq!(classify("wg0"), InterfaceType::WireGuard);
        assert_eq!(classify("lo0"), InterfaceType::Loopback);
        assert_eq!(classify("lo"), InterfaceType::Loopback);
        assert_eq!(classify("en0"), InterfaceType::Other);
    }

    #[test]
    fn test_is_tunnel_uses_configured_prefixes() {
        let resolver =
            SystemInterfaceResolver::with_executor(vec!["utun".into()], "/nonexistent", unused_executor());
        assert!(resolver.is_tunnel("utun2"));
        assert!(!resolver.is_tunnel("ipsec0"));
    }

    #[test]
    fn test_active_tunnels_from_sysfs() {
        let sysfs = fake_sysfs(&[
            ("utun3", Some("up")),
            ("ipsec0", Some("unknown")),
            ("en0", Some("up")),
            ("tun1", Some("down")),
            ("wg0", None),
            ("lo", Some("unknown")),
        ]);

        let resolver =
            SystemInterfaceResolver::with_executor(prefixes(), sysfs.path(), unused_executor());

        assert_eq!(
            resolver.active_tunnel_interfaces(),
            vec!["ipsec0".to_string(), "utun3".to_string(), "wg0".to_string()]
        );
    }

    #[test]
    fn test_no_tunnels_yields_empty_list() {
        let sysfs = fake_sysfs(&[("en0", Some("up")), ("lo", None)]);
        let resolver =
            SystemInterfaceResolver::with_executor(prefixes(), sysfs.path(), unused_executor());
        assert!(resolver.active_tunnel_interfaces().is_empty());
    }

    #[test]
    fn test_ifconfig_fallback() {
        let mut mock = MockCommandExecutor::new();
        mock.expect_execute()
            .withf(|cmd, args| cmd == "ifconfig" && args == ["-l".to_string(), "-u".to_string()])
            .times(1)
            .returning(|_, _| {
                Ok(CommandOutput {
                    stdout: "lo0 en0 utun1 ipsec0 utun1\n".to_string(),
                    success: true,
                    code: Some(0),
                    ..Default::default()
                })
            });

        let resolver =
            SystemInterfaceResolver::with_executor(prefixes(), "/nonexistent/net", Arc::new(mock));

        assert_eq!(
            resolver.active_tunnel_interfaces(),
            vec!["ipsec0".to_string(), "utun1".to_string()]
        );
    }

    #[test]
    fn test_detection_failure_yields_empty_list() {
        let mut mock = MockCommandExecutor::new();
        mock.expect_execute()
            .returning(|_, _| Err(anyhow::anyhow!("ifconfig not found")));

        let resolver =
            SystemInterfaceResolver::with_executor(prefixes(), "/nonexistent/net", Arc::new(mock));
        assert!(resolver.active_tunnel_interfaces().is_empty());
    }

    #[test]
    fn test_format_detection_report() {
        let sysfs = fake_sysfs(&[("utun3", Some("up")), ("en0", Some("up"))]);
        let resolver =
            SystemInterfaceResolver::with_executor(prefixes(), sysfs.path(), unused_executor());

        let report = format_detection_report(&resolver.list_interfaces().unwrap());
        let utun = report.lines().find(|l| l.starts_with("utun3")).unwrap();
        assert!(utun.contains("utun"));
        assert!(utun.ends_with("yes"));
        let en0 = report.lines().find(|l| l.starts_with("en0")).unwrap();
        assert!(en0.ends_with("no"));
    }
}
