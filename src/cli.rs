//! CLI argument parsing with clap.

use clap::{Parser, Subcommand};
use std::net::IpAddr;
use std::path::PathBuf;

use crate::config::DEFAULT_CONFIG_PATH;
use crate::installer::InstallTrigger;

#[derive(Parser)]
#[command(name = "tunguard")]
#[command(author, version, about = "VPN kill switch controller")]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Config file path
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH, global = true)]
    pub config: PathBuf,

    /// Quiet mode (errors only)
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Verbose mode (debug output)
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the kill switch controller, reading connection events from stdin
    Run,

    /// Privileged helper process
    Helper {
        #[command(subcommand)]
        action: HelperAction,
    },

    /// Print the kill switch rule document for an entry IP
    Rules {
        /// VPN entry IP
        #[arg(long)]
        ip: IpAddr,

        /// Trusted tunnel interface (repeatable, detected when omitted)
        #[arg(long = "interface", short = 'i')]
        interfaces: Vec<String>,
    },

    /// Force the kill switch on for an entry IP
    Enable {
        /// VPN entry IP
        #[arg(long)]
        ip: IpAddr,
    },

    /// Force the kill switch off
    Disable,

    /// Show kill switch status
    Status {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Check the installed helper and install it if needed
    Install {
        /// What the installation is for: user, update or silent
        #[arg(long, value_enum, default_value = "user")]
        trigger: InstallTrigger,
    },

    /// List network interfaces and the ones treated as VPN tunnels
    Interfaces,

    /// Show version
    Version,
}

#[derive(Subcommand)]
pub enum HelperAction {
    /// Serve helper requests (must run as root)
    Serve,
    /// Query the version of the running helper
    Version,
}
