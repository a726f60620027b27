//! The privileged helper process (`tunguard helper serve`).
//!
//! Listens on a Unix socket and applies requests one at a time: pf has a
//! single active rule set, so two requests must never touch it concurrently.

use anyhow::{Context, Result};
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::pf::PfRunner;
use super::protocol::{self, Reply, Request, MAX_LINE_LEN};
use crate::signal::ShutdownToken;

/// Socket mode: the unprivileged controller must be able to connect.
/// Access is decided per connection by [`PeerPolicy`].
const SOCKET_MODE: u32 = 0o666;

/// Local users allowed to send requests to the helper, by uid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerPolicy {
    uids: Vec<u32>,
}

impl PeerPolicy {
    /// root, plus the controller's user when configured
    pub fn new(allowed_uid: Option<u32>) -> Self {
        Self::uids(std::iter::once(0).chain(allowed_uid))
    }

    /// Exactly these uids.
    pub fn uids(uids: impl IntoIterator<Item = u32>) -> Self {
        Self {
            uids: uids.into_iter().collect(),
        }
    }

    pub fn permits(&self, uid: u32) -> bool {
        self.uids.contains(&uid)
    }
}

pub struct HelperServer {
    runner: Arc<PfRunner>,
    version: String,
    peers: PeerPolicy,
    shutdown: ShutdownToken,
    serial: Mutex<()>,
}

impl HelperServer {
    pub fn new(
        runner: PfRunner,
        version: impl Into<String>,
        peers: PeerPolicy,
        shutdown: ShutdownToken,
    ) -> Self {
        Self {
            runner: Arc::new(runner),
            version: version.into(),
            peers,
            shutdown,
            serial: Mutex::new(()),
        }
    }

    /// Bind the listening socket, replacing a stale one.
    pub fn bind(path: &Path) -> Result<UnixListener> {
        if path.exists() {
            std::fs::remove_file(path)
                .with_context(|| format!("Failed to remove stale socket {:?}", path))?;
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {:?}", parent))?;
        }

        let listener =
            UnixListener::bind(path).with_context(|| format!("Failed to bind {:?}", path))?;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(SOCKET_MODE))
            .context("Failed to set socket permissions")?;

        info!("Helper listening on {:?}", path);
        Ok(listener)
    }

    /// Accept connections until shutdown is requested (signal or `unload`).
    pub async fn serve(self: Arc<Self>, listener: UnixListener) -> Result<()> {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!("Helper shutting down");
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        let server = self.clone();
                        tokio::spawn(async move {
                            if let Err(e) = server.handle_connection(stream).await {
                                debug!("Helper connection closed: {}", e);
                            }
                        });
                    }
                    Err(e) => warn!("Failed to accept helper connection: {}", e),
                },
            }
        }
        Ok(())
    }

    async fn handle_connection(&self, stream: UnixStream) -> std::io::Result<()> {
        let uid = stream.peer_cred()?.uid();
        let (read, mut write) = stream.into_split();
        let mut reader = BufReader::new(read);

        if !self.peers.permits(uid) {
            warn!("Rejected helper connection from uid {}", uid);
            // refuse the first request without running it, then hang up
            let mut line = String::new();
            (&mut reader)
                .take(MAX_LINE_LEN as u64 + 1)
                .read_line(&mut line)
                .await?;
            let reply = Reply::Error {
                message: format!("uid {} is not allowed to use the helper", uid),
            };
            if let Ok(out) = protocol::encode(&reply) {
                write.write_all(out.as_bytes()).await?;
                write.flush().await?;
            }
            return Ok(());
        }

        loop {
            let mut line = String::new();
            let n = (&mut reader)
                .take(MAX_LINE_LEN as u64 + 1)
                .read_line(&mut line)
                .await?;
            if n == 0 {
                return Ok(());
            }

            let (reply, unload) = match protocol::decode::<Request>(&line) {
                Ok(request) => {
                    let unload = request == Request::Unload;
                    (self.handle(request).await, unload)
                }
                Err(e) => (
                    Reply::Error {
                        message: e.to_string(),
                    },
                    false,
                ),
            };

            // encoding our own reply type cannot fail
            if let Ok(out) = protocol::encode(&reply) {
                write.write_all(out.as_bytes()).await?;
                write.flush().await?;
            }

            if unload {
                info!("Unload requested");
                self.shutdown.cancel();
                return Ok(());
            }
        }
    }

    pub async fn handle(&self, request: Request) -> Reply {
        debug!("Helper request: {:?}", request);

        match request {
            Request::Version => Reply::Version {
                version: self.version.clone(),
            },
            Request::Unload => Reply::Ack,
            Request::Enable { rules_path } => {
                if !rules_path.is_absolute() {
                    return Reply::Error {
                        message: format!("rules path must be absolute: {:?}", rules_path),
                    };
                }
                self.run("enable", move |pf| pf.enable(&rules_path)).await
            }
            Request::Disable => self.run("disable", |pf| pf.disable()).await,
            Request::FirewallEnabled { address } => {
                self.run("firewall_enabled", move |pf| pf.firewall_enabled_for(address))
                    .await
            }
            Request::AnyFirewallEnabled => {
                self.run("any_firewall_enabled", |pf| pf.any_firewall_enabled())
                    .await
            }
        }
    }

    async fn run<F>(&self, operation: &'static str, f: F) -> Reply
    where
        F: FnOnce(&PfRunner) -> Result<i32> + Send + 'static,
    {
        let _serial = self.serial.lock().await;
        let runner = self.runner.clone();

        match tokio::task::spawn_blocking(move || f(&runner)).await {
            Ok(Ok(code)) => Reply::Exit { code },
            Ok(Err(e)) => {
                warn!("Helper '{}' failed: {:#}", operation, e);
                Reply::Error {
                    message: format!("{:#}", e),
                }
            }
            Err(e) => Reply::Error {
                message: format!("{} task failed: {}", operation, e),
            },
        }
    }
}

/// Check if running as root (effective UID == 0)
pub fn check_root() -> Result<()> {
    // SAFETY: geteuid() has no preconditions and cannot fail.
    let euid = unsafe { libc::geteuid() };

    if euid != 0 {
        anyhow::bail!("The helper must run as root to control the packet filter.");
    }
    Ok(())
}
