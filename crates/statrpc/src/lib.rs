//! Host side of the statrpc bridge.
//!
//! A sandboxed runtime often has no synchronous way for the host to inspect
//! its filesystem. statrpc runs a small backend process inside the sandbox
//! and talks to it over stdin/stdout with newline-delimited JSON. This crate
//! is the host half:
//!
//! - [`StatRpcClient`] spawns (or attaches to) a backend and offers typed
//!   `stat`, `exists` and `readdir` calls.
//! - [`FileSystemProvider`] combines those calls with the sandbox's own file
//!   operations ([`SandboxFs`]) into a file-system provider, including change
//!   notifications.
//!
//! ```rust,no_run
//! use statrpc::{BridgeConfig, StatRpcClient};
//!
//! # async fn example() -> statrpc::Result<()> {
//! let config = BridgeConfig::new().with_root("/srv/sandbox");
//! let client = StatRpcClient::spawn(&config).await?;
//!
//! let stat = client.stat("/home/projects/Cargo.toml").await?;
//! println!("{} bytes", stat.size);
//! # Ok(())
//! # }
//! ```

mod client;
mod config;
mod error;
mod provider;
mod sandbox;

pub use client::{
    BACKEND_BINARY, BACKEND_PATH_ENV, StatRpcClient, find_backend_binary, wait_for_sentinel,
};
pub use config::{BridgeConfig, DEFAULT_WORKDIR};
pub use error::{FileSystemProviderError, FileSystemProviderErrorCode};
pub use provider::{
    ChangeSubscription, FileChange, FileChangeKind, FileStat, FileSystemProvider, FileType,
    WriteOptions,
};
pub use sandbox::{LocalSandbox, NativeWatch, NativeWatchEvent, SandboxFs};

pub use statrpc_core::{Connection, ConnectionConfig, Error, Result};
pub use statrpc_protocol::{DirEntry, ErrorCode, ErrorPayload, FileKind, Permission, StatRecord};
