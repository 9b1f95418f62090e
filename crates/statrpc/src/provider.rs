//! File-system provider over the bridge and the sandbox's own file API.
//!
//! Metadata (`stat`, `exists`, `readdir`) goes through [`StatRpcClient`];
//! reads, writes and tree changes go straight to [`SandboxFs`] with the
//! working directory prefix stripped. Change notifications come from the
//! sandbox's native watcher, with renames disambiguated through `exists`.

use crate::client::StatRpcClient;
use crate::error::FileSystemProviderError;
use crate::sandbox::{NativeWatch, NativeWatchEvent, SandboxFs};
use statrpc_protocol::{DirEntry, FileKind, Permission, StatRecord};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

type Result<T> = std::result::Result<T, FileSystemProviderError>;

const CHANGE_CHANNEL_CAPACITY: usize = 1024;

/// Kind of an entry plus whether it was reached through a symbolic link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileType {
    pub kind: FileKind,
    pub is_symlink: bool,
}

impl FileType {
    pub fn is_file(&self) -> bool {
        self.kind == FileKind::File
    }

    pub fn is_directory(&self) -> bool {
        self.kind == FileKind::Directory
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileStat {
    pub file_type: FileType,
    pub ctime: u64,
    pub mtime: u64,
    pub size: u64,
    pub permissions: Option<Permission>,
}

impl From<StatRecord> for FileStat {
    fn from(record: StatRecord) -> Self {
        Self {
            file_type: FileType {
                kind: record.kind,
                is_symlink: record.is_symlink,
            },
            ctime: record.ctime,
            mtime: record.mtime,
            size: record.size,
            permissions: record.permissions,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileChangeKind {
    Added,
    Deleted,
    Updated,
}

/// One change under the sandbox, keyed by its absolute sandbox path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileChange {
    pub kind: FileChangeKind,
    pub path: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteOptions {
    pub create: bool,
    pub overwrite: bool,
}

impl WriteOptions {
    pub fn create_or_overwrite() -> Self {
        Self {
            create: true,
            overwrite: true,
        }
    }
}

/// Changes at or below one path.
#[derive(Debug)]
pub struct ChangeSubscription {
    prefix: String,
    receiver: broadcast::Receiver<FileChange>,
}

impl ChangeSubscription {
    pub fn path(&self) -> &str {
        &self.prefix
    }

    /// Next matching change, or `None` once the provider is gone.
    pub async fn recv(&mut self) -> Option<FileChange> {
        loop {
            match self.receiver.recv().await {
                Ok(change) if is_under(&change.path, &self.prefix) => return Some(change),
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, path = %self.prefix, "change subscriber fell behind");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// Adapts the bridge and the sandbox file API to a file-system provider
/// contract.
pub struct FileSystemProvider {
    client: Arc<StatRpcClient>,
    sandbox: Arc<dyn SandboxFs>,
    workdir: String,
    changes: broadcast::Sender<FileChange>,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl FileSystemProvider {
    pub fn new(
        client: Arc<StatRpcClient>,
        sandbox: Arc<dyn SandboxFs>,
        workdir: impl Into<String>,
    ) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            client,
            sandbox,
            workdir: normalize_dir(workdir.into()),
            changes,
            watcher: Mutex::new(None),
        }
    }

    pub fn client(&self) -> &StatRpcClient {
        &self.client
    }

    pub fn workdir(&self) -> &str {
        &self.workdir
    }

    pub async fn stat(&self, path: &str) -> Result<FileStat> {
        Ok(self.client.stat(path).await?.into())
    }

    pub async fn exists(&self, path: &str) -> Result<bool> {
        Ok(self.client.exists(path).await?)
    }

    pub async fn readdir(&self, path: &str) -> Result<Vec<(String, FileType)>> {
        let entries = self.client.readdir(path).await?;
        Ok(entries.into_iter().map(entry_type).collect())
    }

    pub async fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        let stat = self.stat(path).await?;
        if stat.file_type.is_directory() {
            return Err(FileSystemProviderError::is_a_directory(format!(
                "{} is a directory",
                path
            )));
        }
        let local = self.sandbox_path(path)?;
        Ok(self.sandbox.read_file(&local).await?)
    }

    pub async fn write_file(&self, path: &str, contents: &[u8], options: WriteOptions) -> Result<()> {
        let exists = self.exists(path).await?;
        if exists && !options.overwrite {
            return Err(FileSystemProviderError::exists(format!(
                "{} already exists",
                path
            )));
        }
        if !exists && !options.create {
            return Err(FileSystemProviderError::not_found(format!(
                "{} does not exist",
                path
            )));
        }

        let local = self.sandbox_path(path)?;
        debug!(path, bytes = contents.len(), "writing file");
        Ok(self.sandbox.write_file(&local, contents).await?)
    }

    pub async fn rename(&self, from: &str, to: &str, overwrite: bool) -> Result<()> {
        if !overwrite && self.exists(to).await? {
            return Err(FileSystemProviderError::exists(format!(
                "{} already exists",
                to
            )));
        }
        let from_local = self.sandbox_path(from)?;
        let to_local = self.sandbox_path(to)?;
        Ok(self.sandbox.rename(&from_local, &to_local).await?)
    }

    pub async fn mkdir(&self, path: &str) -> Result<()> {
        let local = self.sandbox_path(path)?;
        Ok(self.sandbox.mkdir(&local).await?)
    }

    pub async fn delete(&self, path: &str, recursive: bool) -> Result<()> {
        let local = self.sandbox_path(path)?;
        Ok(self.sandbox.remove(&local, recursive).await?)
    }

    /// Starts forwarding native sandbox changes to subscribers.
    ///
    /// Calling it again replaces the previous watch.
    pub fn start_watching(&self) -> Result<()> {
        let native = self.sandbox.watch()?;
        let task = tokio::spawn(forward_changes(
            native,
            Arc::clone(&self.client),
            self.workdir.clone(),
            self.changes.clone(),
        ));

        let previous = self
            .watcher
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .replace(task);
        if let Some(previous) = previous {
            previous.abort();
        }
        Ok(())
    }

    /// Every change in the sandbox.
    pub fn subscribe(&self) -> broadcast::Receiver<FileChange> {
        self.changes.subscribe()
    }

    /// Changes at or below `path`.
    pub fn watch(&self, path: &str) -> ChangeSubscription {
        ChangeSubscription {
            prefix: normalize_dir(path.to_string()),
            receiver: self.changes.subscribe(),
        }
    }

    /// Maps an absolute sandbox path onto the sandbox file API.
    fn sandbox_path(&self, path: &str) -> Result<String> {
        strip_workdir(&self.workdir, path).ok_or_else(|| {
            FileSystemProviderError::no_permissions(format!(
                "{} is outside the working directory {}",
                path, self.workdir
            ))
        })
    }
}

impl Drop for FileSystemProvider {
    fn drop(&mut self) {
        let task = self
            .watcher
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(task) = task {
            task.abort();
        }
    }
}

impl std::fmt::Debug for FileSystemProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileSystemProvider")
            .field("client", &self.client)
            .field("workdir", &self.workdir)
            .finish_non_exhaustive()
    }
}

async fn forward_changes(
    mut native: NativeWatch,
    client: Arc<StatRpcClient>,
    workdir: String,
    changes: broadcast::Sender<FileChange>,
) {
    while let Some(event) = native.recv().await {
        let path = join_workdir(&workdir, event.path());
        let kind = match &event {
            NativeWatchEvent::Change(_) => FileChangeKind::Updated,
            NativeWatchEvent::Rename(_) => match client.exists(&path).await {
                Ok(true) => FileChangeKind::Added,
                Ok(false) => FileChangeKind::Deleted,
                Err(e) => {
                    warn!(path = %path, error = %e, "could not classify sandbox change");
                    continue;
                }
            },
        };
        debug!(path = %path, ?kind, "sandbox change");
        // no subscribers is fine
        let _ = changes.send(FileChange { kind, path });
    }
    debug!("sandbox watch ended");
}

fn entry_type(entry: DirEntry) -> (String, FileType) {
    let file_type = FileType {
        kind: entry.kind,
        is_symlink: entry.is_symlink,
    };
    (entry.name, file_type)
}

fn normalize_dir(mut path: String) -> String {
    while path.len() > 1 && path.ends_with('/') {
        path.pop();
    }
    if path.is_empty() {
        path.push('/');
    }
    path
}

fn strip_workdir(workdir: &str, path: &str) -> Option<String> {
    if workdir == "/" {
        return Some(path.to_string());
    }
    match path.strip_prefix(workdir) {
        Some("") => Some("/".to_string()),
        Some(rest) if rest.starts_with('/') => Some(rest.to_string()),
        _ => None,
    }
}

fn join_workdir(workdir: &str, path: &str) -> String {
    if workdir == "/" {
        return path.to_string();
    }
    if path == "/" {
        return workdir.to_string();
    }
    format!("{}{}", workdir, path)
}

fn is_under(path: &str, prefix: &str) -> bool {
    if prefix == "/" {
        return true;
    }
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}
