//! Sandbox-side half of the statrpc bridge.
//!
//! The backend prints [`READY_SENTINEL`] once, then answers `stat`, `exists`
//! and `readdir` requests arriving on its input until the input closes.

mod fs;

pub use fs::BackendFs;

use statrpc_core::{Connection, ConnectionConfig, Result};
use statrpc_protocol::{ExistsResult, PathParams, READY_SENTINEL, ReaddirResult, methods};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::info;

/// Registers the backend methods on `connection`.
pub fn register(connection: &Connection, fs: Arc<BackendFs>) {
    let stat_fs = Arc::clone(&fs);
    connection.handle(methods::STAT, move |params: PathParams| {
        let fs = Arc::clone(&stat_fs);
        async move { fs.stat(&params.path).await }
    });

    let exists_fs = Arc::clone(&fs);
    connection.handle(methods::EXISTS, move |params: PathParams| {
        let fs = Arc::clone(&exists_fs);
        async move {
            Ok(ExistsResult {
                exists: fs.exists(&params.path).await,
            })
        }
    });

    connection.handle(methods::READDIR, move |params: PathParams| {
        let fs = Arc::clone(&fs);
        async move {
            fs.readdir(&params.path)
                .await
                .map(|result| ReaddirResult { result })
        }
    });
}

/// Announces readiness on `writer` and serves requests until `reader` ends.
pub async fn serve<R, W>(reader: R, mut writer: W, fs: BackendFs) -> Result<()>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    writer
        .write_all(format!("{}\n", READY_SENTINEL).as_bytes())
        .await?;
    writer.flush().await?;

    // the backend never issues requests of its own
    let config = ConnectionConfig::new().without_request_timeout();
    let connection = Connection::with_config(reader, writer, config);
    info!(root = %fs.root().display(), "backend ready");
    register(&connection, Arc::new(fs));

    connection.closed().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Value, json};
    use tempfile::TempDir;
    use tokio::io::{AsyncBufReadExt, BufReader};

    #[tokio::test]
    async fn sentinel_precedes_responses() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"0123456789").unwrap();

        let (backend_in, mut host_out) = tokio::io::duplex(64 * 1024);
        let (host_in, backend_out) = tokio::io::duplex(64 * 1024);
        let server = tokio::spawn(serve(backend_in, backend_out, BackendFs::new(dir.path())));
        let mut lines = BufReader::new(host_in).lines();

        assert_eq!(lines.next_line().await.unwrap().unwrap(), READY_SENTINEL);

        host_out
            .write_all(
                b"{\"version\":\"v1\",\"id\":1,\"method\":\"stat\",\"params\":{\"path\":\"/a.txt\"}}\n",
            )
            .await
            .unwrap();
        let response: Value =
            serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();

        assert_eq!(response["version"], "v1");
        assert_eq!(response["id"], 1);
        assert_eq!(response["result"]["size"], 10);
        assert_eq!(response["result"]["type"], "file");
        assert_eq!(response["result"]["isSymlink"], false);
        assert!(response["result"].get("permissions").is_none());

        drop(host_out);
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn answers_in_flight_requests_before_exiting() {
        let dir = TempDir::new().unwrap();
        let (backend_in, mut host_out) = tokio::io::duplex(64 * 1024);
        let (host_in, backend_out) = tokio::io::duplex(64 * 1024);
        let server = tokio::spawn(serve(backend_in, backend_out, BackendFs::new(dir.path())));

        host_out
            .write_all(b"{\"version\":\"v1\",\"id\":7,\"method\":\"exists\",\"params\":{\"path\":\"/\"}}\n")
            .await
            .unwrap();
        drop(host_out);
        server.await.unwrap().unwrap();

        let mut lines = BufReader::new(host_in).lines();
        assert_eq!(lines.next_line().await.unwrap().unwrap(), READY_SENTINEL);
        let response: Value =
            serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
        assert_eq!(response, json!({"version": "v1", "id": 7, "result": {"exists": true}}));
    }

    #[tokio::test]
    async fn readdir_errors_carry_native_code() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("plain"), b"").unwrap();

        let (backend_in, mut host_out) = tokio::io::duplex(64 * 1024);
        let (host_in, backend_out) = tokio::io::duplex(64 * 1024);
        tokio::spawn(serve(backend_in, backend_out, BackendFs::new(dir.path())));
        let mut lines = BufReader::new(host_in).lines();
        lines.next_line().await.unwrap();

        host_out
            .write_all(b"{\"version\":\"v1\",\"id\":2,\"method\":\"readdir\",\"params\":{\"path\":\"/plain\"}}\n")
            .await
            .unwrap();
        let response: Value =
            serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
        assert_eq!(response["id"], 2);
        assert_eq!(response["error"]["code"], "ENOTDIR");
    }
}
