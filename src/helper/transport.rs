//! Unix domain socket transport to the privileged helper.

use async_trait::async_trait;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::sync::Mutex;

use super::protocol::{self, Reply, Request, MAX_LINE_LEN};
use super::{HelperConnection, HelperConnector};
use crate::error::{KillSwitchError, Result};

/// Connects to the helper's listening socket.
#[derive(Debug, Clone)]
pub struct UnixSocketConnector {
    path: PathBuf,
}

impl UnixSocketConnector {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl HelperConnector for UnixSocketConnector {
    async fn connect(&self) -> Result<Arc<dyn HelperConnection>> {
        match UnixStream::connect(&self.path).await {
            Ok(stream) => Ok(Arc::new(UnixSocketConnection::new(stream))),
            Err(e) if matches!(
                e.kind(),
                io::ErrorKind::NotFound | io::ErrorKind::ConnectionRefused
            ) =>
            {
                Err(KillSwitchError::HelperNotInstalled)
            }
            Err(e) => Err(KillSwitchError::IpcChannelLost(format!(
                "connect to {:?}: {}",
                self.path, e
            ))),
        }
    }
}

struct Framed {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

/// One established socket. Requests on it are strictly sequential.
pub struct UnixSocketConnection {
    io: Mutex<Framed>,
}

impl UnixSocketConnection {
    pub fn new(stream: UnixStream) -> Self {
        let (read, write) = stream.into_split();
        Self {
            io: Mutex::new(Framed {
                reader: BufReader::new(read),
                writer: write,
            }),
        }
    }
}

fn lost(e: io::Error) -> KillSwitchError {
    KillSwitchError::IpcChannelLost(e.to_string())
}

#[async_trait]
impl HelperConnection for UnixSocketConnection {
    async fn call(&self, request: Request) -> Result<Reply> {
        let line = protocol::encode(&request)?;

        let mut guard = self.io.lock().await;
        let io = &mut *guard;

        io.writer.write_all(line.as_bytes()).await.map_err(lost)?;
        io.writer.flush().await.map_err(lost)?;

        let mut buf = String::new();
        let n = (&mut io.reader)
            .take(MAX_LINE_LEN as u64 + 1)
            .read_line(&mut buf)
            .await
            .map_err(lost)?;

        if n == 0 {
            return Err(KillSwitchError::IpcChannelLost(
                "helper closed the connection".to_string(),
            ));
        }

        protocol::decode(&buf)
    }
}
