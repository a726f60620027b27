//! Privileged helper: client, wire protocol, transport and the helper
//! process itself.
//!
//! The controller never talks to the OS firewall directly. It asks the
//! helper, over a Unix socket, to load a rule file and to report on the
//! packet filter. Every request is bounded by a timeout; the helper may hang,
//! crash or disappear at any moment.

pub mod pf;
pub mod protocol;
pub mod server;
pub mod transport;

use async_trait::async_trait;
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, oneshot, Mutex};
use tracing::{debug, warn};

use crate::error::{KillSwitchError, Result};
use protocol::{Reply, Request};

#[cfg(test)]
use mockall::automock;

/// Exit status reported by the helper, 0 = success
pub type ExitCode = i32;

/// A live channel to the helper.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait HelperConnection: Send + Sync {
    /// Send one request and wait for its reply. A dead channel reports
    /// `IpcChannelLost`.
    async fn call(&self, request: Request) -> Result<Reply>;
}

/// Opens channels to the helper.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait HelperConnector: Send + Sync {
    /// `HelperNotInstalled` when nothing is listening.
    async fn connect(&self) -> Result<Arc<dyn HelperConnection>>;
}

/// Operations the privileged helper performs on behalf of the controller.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PrivilegedHelper: Send + Sync {
    /// Load the rule file at `rules_path` and enable the packet filter.
    async fn enable(&self, rules_path: &Path) -> Result<ExitCode>;

    async fn disable(&self) -> Result<ExitCode>;

    /// Whether the filter is enabled with rules that reference `entry_ip`.
    async fn is_enabled_for(&self, entry_ip: IpAddr) -> Result<bool>;

    /// Whether any packet filter is enabled on the system.
    async fn any_firewall_enabled(&self) -> Result<bool>;

    /// Version of the installed helper.
    async fn version(&self) -> Result<String>;

    /// Stop the helper process.
    async fn unload(&self) -> Result<()>;
}

type Handle = Arc<dyn HelperConnection>;

struct Inner {
    connector: Arc<dyn HelperConnector>,
    handle: Mutex<Option<Handle>>,
    invalidations: broadcast::Sender<()>,
}

impl Inner {
    /// Current handle, connecting lazily. The lock is held while connecting
    /// so at most one handle is ever created.
    async fn connection(&self) -> Result<Handle> {
        let mut guard = self.handle.lock().await;
        if let Some(conn) = guard.as_ref() {
            return Ok(conn.clone());
        }

        let conn = self.connector.connect().await?;
        debug!("Connected to privileged helper");
        *guard = Some(conn.clone());
        Ok(conn)
    }

    async fn dispatch(&self, request: Request) -> Result<Reply> {
        let conn = self.connection().await?;

        match conn.call(request).await {
            Err(e) if e.invalidates_helper() => {
                self.invalidate(&conn).await;
                Err(e)
            }
            Err(e @ KillSwitchError::Protocol(_)) => {
                // the rest of a bad reply may still be buffered, so framing
                // on this connection is lost
                if self.forget(&conn).await {
                    debug!("Dropped helper connection after a malformed reply");
                }
                Err(e)
            }
            other => other,
        }
    }

    /// Drop `conn` if it is still the current handle.
    async fn forget(&self, conn: &Handle) -> bool {
        let mut guard = self.handle.lock().await;
        let current = guard
            .as_ref()
            .map(|h| Arc::ptr_eq(h, conn))
            .unwrap_or(false);

        if current {
            guard.take();
        }
        current
    }

    /// Drop `conn` if it is still the current handle and announce it.
    async fn invalidate(&self, conn: &Handle) {
        if self.forget(conn).await {
            warn!("Helper connection invalidated");
            // no receivers is fine
            let _ = self.invalidations.send(());
        }
    }

    /// Drop the current handle without announcing it. Never waits: if a
    /// connect is in flight the handle it produces is kept.
    fn discard(&self) {
        if let Ok(mut guard) = self.handle.try_lock() {
            if guard.take().is_some() {
                debug!("Discarded helper connection");
            }
        }
    }
}

/// Client side of the privileged helper.
///
/// Owns the single connection handle. Each request runs in its own task and
/// reports through a oneshot channel; the caller waits on that channel under
/// a timeout, so whichever of {reply, timer} comes first is the one result
/// the caller ever sees.
#[derive(Clone)]
pub struct HelperClient {
    inner: Arc<Inner>,
    timeout: Duration,
}

impl HelperClient {
    pub fn new(connector: Arc<dyn HelperConnector>, timeout: Duration) -> Self {
        let (invalidations, _) = broadcast::channel(16);
        Self {
            inner: Arc::new(Inner {
                connector,
                handle: Mutex::new(None),
                invalidations,
            }),
            timeout,
        }
    }

    /// Notified whenever an established helper connection is lost.
    pub fn subscribe_invalidations(&self) -> broadcast::Receiver<()> {
        self.inner.invalidations.subscribe()
    }

    pub async fn call(&self, request: Request) -> Result<Reply> {
        let operation = request.operation();
        let (tx, rx) = oneshot::channel();
        let inner = self.inner.clone();

        tokio::spawn(async move {
            let result = inner.dispatch(request).await;
            if let Err(late) = tx.send(result) {
                warn!(
                    "discarded late helper response for '{}': {:?}",
                    operation, late
                );
            }
        });

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(result)) => {
                match &result {
                    Ok(reply) => debug!("Helper '{}' -> {:?}", operation, reply),
                    Err(e) => debug!("Helper '{}' failed: {}", operation, e),
                }
                result
            }
            Ok(Err(_)) => Err(KillSwitchError::IpcChannelLost(format!(
                "helper task for '{}' ended without a reply",
                operation
            ))),
            Err(_) => {
                warn!(
                    "Helper did not answer '{}' within {:?}",
                    operation, self.timeout
                );
                self.inner.discard();
                Err(KillSwitchError::IpcTimeout {
                    operation,
                    timeout: self.timeout,
                })
            }
        }
    }
}

#[async_trait]
impl PrivilegedHelper for HelperClient {
    async fn enable(&self, rules_path: &Path) -> Result<ExitCode> {
        self.call(Request::Enable {
            rules_path: rules_path.to_path_buf(),
        })
        .await?
        .into_exit_code()
    }

    async fn disable(&self) -> Result<ExitCode> {
        self.call(Request::Disable).await?.into_exit_code()
    }

    async fn is_enabled_for(&self, entry_ip: IpAddr) -> Result<bool> {
        let code = self
            .call(Request::FirewallEnabled { address: entry_ip })
            .await?
            .into_exit_code()?;
        Ok(code == 0)
    }

    async fn any_firewall_enabled(&self) -> Result<bool> {
        let code = self
            .call(Request::AnyFirewallEnabled)
            .await?
            .into_exit_code()?;
        Ok(code == 0)
    }

    async fn version(&self) -> Result<String> {
        self.call(Request::Version).await?.into_version()
    }

    async fn unload(&self) -> Result<()> {
        self.call(Request::Unload).await?.into_ack()?;
        // the helper exits after acknowledging
        self.inner.discard();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Connection answering every request after `delay`.
    struct SlowConnection {
        delay: Duration,
        reply: Reply,
        completed: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl HelperConnection for SlowConnection {
        async fn call(&self, _request: Request) -> Result<Reply> {
            tokio::time::sleep(self.delay).await;
            self.completed.fetch_add(1, Ordering::SeqCst);
            Ok(self.reply.clone())
        }
    }

    struct CountingConnector {
        connects: Arc<AtomicUsize>,
        delay: Duration,
        reply: Reply,
        completed: Arc<AtomicUsize>,
    }

    impl CountingConnector {
        fn new(delay: Duration, reply: Reply) -> Self {
            Self {
                connects: Arc::new(AtomicUsize::new(0)),
                delay,
                reply,
                completed: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    #[async_trait]
    impl HelperConnector for CountingConnector {
        async fn connect(&self) -> Result<Arc<dyn HelperConnection>> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(SlowConnection {
                delay: self.delay,
                reply: self.reply.clone(),
                completed: self.completed.clone(),
            }))
        }
    }

    fn mock_connection(reply: Reply) -> Arc<dyn HelperConnection> {
        let mut conn = MockHelperConnection::new();
        conn.expect_call().returning(move |_| Ok(reply.clone()));
        Arc::new(conn) as Arc<dyn HelperConnection>
    }

    #[tokio::test]
    async fn test_handle_is_created_lazily_and_reused() {
        let mut connector = MockHelperConnector::new();
        connector
            .expect_connect()
            .times(1)
            .returning(|| Ok(mock_connection(Reply::Exit { code: 0 })));

        let client = HelperClient::new(Arc::new(connector), Duration::from_secs(3));
        assert!(client.is_enabled_for("1.2.3.4".parse().unwrap()).await.unwrap());
        assert_eq!(client.disable().await.unwrap(), 0);
        assert!(client.any_firewall_enabled().await.unwrap());
    }

    #[tokio::test]
    async fn test_non_zero_exit_means_no() {
        let mut connector = MockHelperConnector::new();
        connector
            .expect_connect()
            .returning(|| Ok(mock_connection(Reply::Exit { code: 1 })));

        let client = HelperClient::new(Arc::new(connector), Duration::from_secs(3));
        assert!(!client.is_enabled_for("1.2.3.4".parse().unwrap()).await.unwrap());
        assert!(!client.any_firewall_enabled().await.unwrap());
        assert_eq!(client.enable(Path::new("/tmp/r.conf")).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_not_installed_is_surfaced() {
        let mut connector = MockHelperConnector::new();
        connector
            .expect_connect()
            .returning(|| Err(KillSwitchError::HelperNotInstalled));

        let client = HelperClient::new(Arc::new(connector), Duration::from_secs(3));
        assert!(matches!(
            client.version().await,
            Err(KillSwitchError::HelperNotInstalled)
        ));
    }

    #[tokio::test]
    async fn test_channel_lost_discards_handle_and_notifies() {
        let mut connector = MockHelperConnector::new();
        let mut seq = mockall::Sequence::new();
        connector
            .expect_connect()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| {
                let mut conn = MockHelperConnection::new();
                conn.expect_call()
                    .returning(|_| Err(KillSwitchError::IpcChannelLost("eof".into())));
                Ok(Arc::new(conn) as Arc<dyn HelperConnection>)
            });
        connector
            .expect_connect()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| {
                Ok(mock_connection(Reply::Version {
                    version: "1.1".into(),
                }))
            });

        let client = HelperClient::new(Arc::new(connector), Duration::from_secs(3));
        let mut invalidations = client.subscribe_invalidations();

        assert!(matches!(
            client.version().await,
            Err(KillSwitchError::IpcChannelLost(_))
        ));
        invalidations.recv().await.unwrap();

        // fresh handle on next demand
        assert_eq!(client.version().await.unwrap(), "1.1");
    }

    #[tokio::test]
    async fn test_helper_error_reply_keeps_handle() {
        let mut connector = MockHelperConnector::new();
        connector.expect_connect().times(1).returning(|| {
            Ok(mock_connection(Reply::Error {
                message: "relative path".into(),
            }))
        });

        let client = HelperClient::new(Arc::new(connector), Duration::from_secs(3));
        assert!(matches!(
            client.enable(Path::new("rules.conf")).await,
            Err(KillSwitchError::Protocol(_))
        ));
        assert!(client.enable(Path::new("rules.conf")).await.is_err());
    }

    #[tokio::test]
    async fn test_malformed_reply_drops_handle_quietly() {
        let mut connector = MockHelperConnector::new();
        let mut seq = mockall::Sequence::new();
        connector
            .expect_connect()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| {
                let mut conn = MockHelperConnection::new();
                conn.expect_call()
                    .returning(|_| Err(KillSwitchError::Protocol("decode failed".into())));
                Ok(Arc::new(conn) as Arc<dyn HelperConnection>)
            });
        connector
            .expect_connect()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| Ok(mock_connection(Reply::Exit { code: 1 })));

        let client = HelperClient::new(Arc::new(connector), Duration::from_secs(3));
        let mut invalidations = client.subscribe_invalidations();

        assert!(matches!(
            client.disable().await,
            Err(KillSwitchError::Protocol(_))
        ));
        // answered on a fresh handle
        assert!(!client.is_enabled_for("1.2.3.4".parse().unwrap()).await.unwrap());
        assert!(matches!(
            invalidations.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_wins_over_late_reply() {
        let connector = CountingConnector::new(Duration::from_secs(10), Reply::Exit { code: 0 });
        let completed = connector.completed.clone();
        let client = HelperClient::new(Arc::new(connector), Duration::from_secs(3));

        let err = client.disable().await.unwrap_err();
        assert!(matches!(
            err,
            KillSwitchError::IpcTimeout {
                operation: "disable",
                ..
            }
        ));
        assert_eq!(completed.load(Ordering::SeqCst), 0);

        // let the real reply arrive; it has nowhere to go
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(completed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reply_before_timeout_is_delivered() {
        let connector = CountingConnector::new(Duration::from_secs(2), Reply::Exit { code: 0 });
        let client = HelperClient::new(Arc::new(connector), Duration::from_secs(3));

        assert_eq!(client.disable().await.unwrap(), 0);

        // the timer expiring later changes nothing
        tokio::time::sleep(Duration::from_secs(5)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_discards_handle() {
        let connector = CountingConnector::new(Duration::from_secs(10), Reply::Exit { code: 0 });
        let connects = connector.connects.clone();
        let client = HelperClient::new(Arc::new(connector), Duration::from_secs(3));

        assert!(client.disable().await.is_err());
        assert!(client.disable().await.is_err());
        assert_eq!(connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_unload_discards_handle() {
        let mut connector = MockHelperConnector::new();
        connector
            .expect_connect()
            .times(2)
            .returning(|| Ok(mock_connection(Reply::Ack)));

        let client = HelperClient::new(Arc::new(connector), Duration::from_secs(3));
        client.unload().await.unwrap();
        client.unload().await.unwrap();
    }
}
