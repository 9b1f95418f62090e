//! Host-side client for the statrpc backend.

use crate::config::BridgeConfig;
use statrpc_core::{Connection, ConnectionConfig, Error, Result};
use statrpc_protocol::{
    DirEntry, ExistsResult, PathParams, READY_SENTINEL, ReaddirResult, StatRecord, methods,
};
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Name of the backend executable.
pub const BACKEND_BINARY: &str = "statrpc-backend";

/// Environment variable overriding backend discovery.
pub const BACKEND_PATH_ENV: &str = "STATRPC_BACKEND_PATH";

const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(30);

/// Typed `stat` / `exists` / `readdir` calls over a [`Connection`].
///
/// Dropping the client disposes the connection, including any clones of it.
pub struct StatRpcClient {
    connection: Connection,
    child: Option<Mutex<Child>>,
}

impl StatRpcClient {
    /// Launches the backend described by `config` and waits for it to
    /// signal readiness.
    pub async fn spawn(config: &BridgeConfig) -> Result<Self> {
        config.validate()?;
        let binary = find_backend_binary(config)?;
        debug!(binary = %binary.display(), root = %config.root.display(), "spawning backend");

        let mut child = Command::new(&binary)
            .arg("--root")
            .arg(&config.root)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                Error::StartFailed(format!("failed to spawn {}: {}", binary.display(), e))
            })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::StartFailed("backend stdin was not captured".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::StartFailed("backend stdout was not captured".to_string()))?;

        let connection = establish(
            stdout,
            stdin,
            config.connection_config(),
            config.ready_timeout(),
        )
        .await?;
        info!(pid = ?child.id(), "backend ready");

        Ok(Self {
            connection,
            child: Some(Mutex::new(child)),
        })
    }

    /// Talks to a backend over arbitrary streams, waiting for its readiness
    /// line first.
    pub async fn connect<R, W>(reader: R, writer: W, config: ConnectionConfig) -> Result<Self>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let connection = establish(reader, writer, config, DEFAULT_READY_TIMEOUT).await?;
        Ok(Self::from_connection(connection))
    }

    /// Wraps a connection whose peer is already serving.
    pub fn from_connection(connection: Connection) -> Self {
        Self {
            connection,
            child: None,
        }
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    pub async fn stat(&self, path: &str) -> Result<StatRecord> {
        self.connection
            .request(methods::STAT, &PathParams::new(path))
            .await
    }

    pub async fn exists(&self, path: &str) -> Result<bool> {
        let result: ExistsResult = self
            .connection
            .request(methods::EXISTS, &PathParams::new(path))
            .await?;
        Ok(result.exists)
    }

    pub async fn readdir(&self, path: &str) -> Result<Vec<DirEntry>> {
        let listing: ReaddirResult = self
            .connection
            .request(methods::READDIR, &PathParams::new(path))
            .await?;
        Ok(listing.result)
    }

    /// Rejects every pending call and closes the backend's input.
    pub fn dispose(&self) {
        self.connection.dispose();
    }

    pub fn is_disposed(&self) -> bool {
        self.connection.is_disposed()
    }

    /// Disposes the connection and waits for a spawned backend to exit,
    /// killing it if it outlives `grace`.
    pub async fn shutdown(&self, grace: Duration) -> Result<Option<ExitStatus>> {
        self.connection.dispose();
        self.connection.closed().await;

        let Some(child) = &self.child else {
            return Ok(None);
        };
        let mut child = child.lock().await;
        match tokio::time::timeout(grace, child.wait()).await {
            Ok(status) => Ok(Some(status?)),
            Err(_) => {
                warn!(?grace, "backend did not exit after its input closed, killing it");
                child.kill().await?;
                Ok(Some(child.wait().await?))
            }
        }
    }
}

impl Drop for StatRpcClient {
    fn drop(&mut self) {
        self.connection.dispose();
    }
}

impl std::fmt::Debug for StatRpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatRpcClient")
            .field("connection", &self.connection)
            .field("spawned", &self.child.is_some())
            .finish()
    }
}

async fn establish<R, W>(
    reader: R,
    writer: W,
    config: ConnectionConfig,
    ready_timeout: Duration,
) -> Result<Connection>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let mut reader = BufReader::new(reader);
    wait_for_sentinel(&mut reader, ready_timeout).await?;
    // the buffered reader hands any bytes read past the sentinel to the connection
    Ok(Connection::with_config(reader, writer, config))
}

/// Reads lines until the readiness sentinel, discarding anything before it.
pub async fn wait_for_sentinel<R>(reader: &mut BufReader<R>, ready_timeout: Duration) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    match tokio::time::timeout(ready_timeout, read_until_sentinel(reader)).await {
        Ok(result) => result,
        Err(_) => Err(Error::Timeout(format!(
            "backend not ready after {:?}",
            ready_timeout
        ))),
    }
}

async fn read_until_sentinel<R>(reader: &mut BufReader<R>) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut buf = String::new();
    loop {
        buf.clear();
        if reader.read_line(&mut buf).await? == 0 {
            return Err(Error::StartFailed(
                "backend closed its output before signalling readiness".to_string(),
            ));
        }
        let line = buf.trim_end_matches(['\r', '\n']);
        if line == READY_SENTINEL {
            return Ok(());
        }
        debug!(line, "discarding backend output before readiness");
    }
}

/// Locates the backend binary.
///
/// Checks, in order: the configured path, `STATRPC_BACKEND_PATH`, a sibling
/// of the current executable, then `PATH`.
pub fn find_backend_binary(config: &BridgeConfig) -> Result<PathBuf> {
    if let Some(path) = &config.backend_path {
        if path.exists() {
            return Ok(path.clone());
        }
        return Err(Error::InvalidConfig(format!(
            "backend_path {} does not exist",
            path.display()
        )));
    }

    if let Ok(path) = std::env::var(BACKEND_PATH_ENV) {
        let path = PathBuf::from(path);
        if path.exists() {
            return Ok(path);
        }
        warn!(path = %path.display(), "{} points to a missing file, ignoring", BACKEND_PATH_ENV);
    }

    if let Ok(exe) = std::env::current_exe() {
        if let Some(dir) = exe.parent() {
            let sibling = dir.join(BACKEND_BINARY);
            if sibling.exists() {
                return Ok(sibling);
            }
        }
    }

    which::which(BACKEND_BINARY).map_err(|_| Error::BackendNotFound)
}
