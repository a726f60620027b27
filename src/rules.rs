//! Kill switch rule compiler (pf syntax) and rule file writer.
//!
//! The generated document is deny-by-default. pf evaluates rules with
//! last-match-wins semantics, so the order below is load-bearing: the DNS
//! block must follow the private-network pass rules, and the entry IP and
//! tunnel pass rules must come last.

use ipnet::{Ipv4Net, Ipv6Net};
use std::fmt::Write as _;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

use crate::error::{CompileError, KillSwitchError, Result};
use crate::fs_abstraction::{FileSystem, RealFileSystem};

/// RFC1918 ranges that stay reachable while blocking
const PRIVATE_RANGES: [Ipv4Net; 3] = [
    Ipv4Net::new_assert(Ipv4Addr::new(10, 0, 0, 0), 8),
    Ipv4Net::new_assert(Ipv4Addr::new(172, 16, 0, 0), 12),
    Ipv4Net::new_assert(Ipv4Addr::new(192, 168, 0, 0), 16),
];

const MULTICAST_V4: Ipv4Net = Ipv4Net::new_assert(Ipv4Addr::new(224, 0, 0, 0), 4);

const ALL_NODES_V6: Ipv6Net = Ipv6Net::new_assert(Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 1), 16);

const LOOPBACK_INTERFACE: &str = "lo0";

/// IFNAMSIZ minus the trailing NUL
const MAX_INTERFACE_NAME_LEN: usize = 15;

/// Mode of the rule file; it is only read by the privileged helper
const RULES_FILE_MODE: u32 = 0o600;

/// A compiled kill switch rule document.
///
/// Built only through [`compile`], so `interfaces` is never empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirewallRuleSet {
    entry_ip: IpAddr,
    interfaces: Vec<String>,
    text: String,
}

impl FirewallRuleSet {
    pub fn entry_ip(&self) -> IpAddr {
        self.entry_ip
    }

    /// Trusted tunnel interfaces, sorted and de-duplicated
    pub fn interfaces(&self) -> &[String] {
        &self.interfaces
    }

    /// Rendered pf document
    pub fn text(&self) -> &str {
        &self.text
    }
}

/// Validate that an interface name is safe to splice into a pf macro.
fn is_safe_interface_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_INTERFACE_NAME_LEN
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_')
}

/// Validate, sort and de-duplicate interface names.
pub fn normalize_interfaces(interfaces: &[String]) -> std::result::Result<Vec<String>, CompileError> {
    if interfaces.is_empty() {
        return Err(CompileError::NoInterfaces);
    }

    if let Some(bad) = interfaces.iter().find(|name| !is_safe_interface_name(name)) {
        return Err(CompileError::InvalidInterfaceName(bad.clone()));
    }

    let mut normalized = interfaces.to_vec();
    normalized.sort();
    normalized.dedup();
    Ok(normalized)
}

/// Compile the kill switch rule document for `entry_ip` and the trusted
/// tunnel interfaces.
///
/// Identical inputs always produce byte-identical text; interface order and
/// duplicates do not affect the output.
pub fn compile(
    entry_ip: IpAddr,
    trusted_interfaces: &[String],
) -> std::result::Result<FirewallRuleSet, CompileError> {
    let interfaces = normalize_interfaces(trusted_interfaces)?;
    let text = render(entry_ip, &interfaces);

    Ok(FirewallRuleSet {
        entry_ip,
        interfaces,
        text,
    })
}

fn render(entry_ip: IpAddr, interfaces: &[String]) -> String {
    let private_ips = PRIVATE_RANGES
        .iter()
        .map(|net| net.to_string())
        .collect::<Vec<_>>()
        .join(", ");

    let mut doc = String::new();

    doc.push_str("# tunguard kill switch rules - generated, do not edit\n");
    let _ = writeln!(doc, "private_ips = \"{{ {} }}\"", private_ips);
    let _ = writeln!(doc, "vpn_tunnels = \"{{ {} }}\"", interfaces.join(", "));
    let _ = writeln!(doc, "vpn_ip = \"{}\"", entry_ip);
    doc.push('\n');

    doc.push_str("set block-policy drop\n");
    doc.push_str("set ruleset-optimization basic\n\n");

    doc.push_str("# Allow traffic on the loopback interface\n");
    let _ = writeln!(doc, "set skip on {}\n", LOOPBACK_INTERFACE);

    doc.push_str("# Block all traffic by default\n");
    doc.push_str("block all\n\n");

    doc.push_str("# Allow DHCP\n");
    doc.push_str("pass out inet proto udp from 0.0.0.0 to 255.255.255.255 port 67 keep state\n");
    doc.push_str("pass in proto udp from any to any port 68 keep state\n\n");

    doc.push_str("# Allow DHCPv6\n");
    let _ = writeln!(
        doc,
        "pass inet6 proto ipv6-icmp from any to {} keep state",
        ALL_NODES_V6
    );
    doc.push_str("pass out inet6 proto udp from any to any port 547 keep state\n");
    doc.push_str("pass in inet6 proto udp from any to any port 546 keep state\n\n");

    doc.push_str("# Allow private networks\n");
    doc.push_str("pass in from $private_ips to any keep state\n");
    doc.push_str("pass out from any to $private_ips keep state\n\n");

    doc.push_str("# Allow multicast discovery\n");
    let _ = writeln!(doc, "pass proto udp from any to {} keep state", MULTICAST_V4);
    let _ = writeln!(doc, "pass proto udp from {} to any keep state\n", MULTICAST_V4);

    doc.push_str("# Block DNS even where private networks are permitted\n");
    doc.push_str("block out proto {tcp, udp} from any to any port 53\n\n");

    doc.push_str("# Allow traffic to the VPN entry IP\n");
    doc.push_str("pass from any to $vpn_ip keep state\n\n");

    doc.push_str("# Allow all traffic on the tunnel interfaces\n");
    doc.push_str("pass on $vpn_tunnels all\n");

    doc
}

/// Persists compiled rules to the well-known rule file read by the helper.
#[derive(Clone)]
pub struct RulesWriter {
    path: PathBuf,
    fs: Arc<dyn FileSystem>,
}

impl RulesWriter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::with_fs(path, Arc::new(RealFileSystem))
    }

    pub fn with_fs(path: impl Into<PathBuf>, fs: Arc<dyn FileSystem>) -> Self {
        Self {
            path: path.into(),
            fs,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write the rule document atomically (temp file + rename) and return
    /// the path handed to the helper.
    pub fn write(&self, rules: &FirewallRuleSet) -> Result<PathBuf> {
        let fail = |source: std::io::Error| KillSwitchError::ConfigWriteFailed {
            path: self.path.clone(),
            source,
        };

        if let Some(dir) = self.path.parent() {
            if !dir.as_os_str().is_empty() && !self.fs.exists(dir) {
                self.fs.create_dir_all(dir).map_err(fail)?;
            }
        }

        let tmp = temp_path(&self.path);
        self.fs.write(&tmp, rules.text().as_bytes()).map_err(fail)?;

        let persisted = self
            .fs
            .set_permissions_mode(&tmp, RULES_FILE_MODE)
            .and_then(|_| self.fs.rename(&tmp, &self.path));

        if let Err(e) = persisted {
            let _ = self.fs.remove_file(&tmp);
            return Err(fail(e));
        }

        debug!(
            "Wrote kill switch rules for {} to {:?}",
            rules.entry_ip(),
            self.path
        );
        Ok(self.path.clone())
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "killswitch.conf".into());
    name.push(".tmp");
    path.with_file_name(name)
}
