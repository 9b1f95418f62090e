//! Filesystem inspection behind the `stat`, `exists` and `readdir` methods.

use statrpc_protocol::{DirEntry, ErrorCode, ErrorPayload, FileKind, Permission, StatRecord};
use std::fs::Metadata;
use std::io;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Component, Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::fs;

const OWNER_WRITE: u32 = 0o200;

/// Answers inspection requests for paths under a fixed root.
///
/// Request paths are absolute sandbox paths. They are resolved lexically, so
/// `..` cannot climb above the root; symbolic links are followed as the
/// kernel sees them.
#[derive(Debug, Clone)]
pub struct BackendFs {
    root: PathBuf,
}

impl BackendFs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Maps a request path onto the host filesystem.
    pub fn resolve(&self, path: &str) -> Result<PathBuf, ErrorPayload> {
        let mut resolved = self.root.clone();
        let mut depth = 0usize;

        for component in Path::new(path).components() {
            match component {
                Component::Normal(part) => {
                    resolved.push(part);
                    depth += 1;
                }
                Component::ParentDir => {
                    if depth == 0 {
                        return Err(ErrorPayload::new(
                            ErrorCode::PermissionDenied,
                            format!("path escapes sandbox root: {}", path),
                        ));
                    }
                    resolved.pop();
                    depth -= 1;
                }
                Component::RootDir | Component::CurDir | Component::Prefix(_) => {}
            }
        }

        Ok(resolved)
    }

    /// Returns metadata for `path`.
    ///
    /// The link itself is inspected first. A symbolic link is followed; when
    /// its target is missing the link's own metadata is reported with kind
    /// [`FileKind::Unknown`].
    pub async fn stat(&self, path: &str) -> Result<StatRecord, ErrorPayload> {
        let resolved = self.resolve(path)?;
        let link = fs::symlink_metadata(&resolved).await.map_err(io_error)?;

        if !link.file_type().is_symlink() {
            return Ok(stat_record(&link, false, false));
        }

        match fs::metadata(&resolved).await {
            Ok(target) => Ok(stat_record(&target, true, false)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(stat_record(&link, true, true)),
            Err(e) => Err(io_error(e)),
        }
    }

    /// Checks whether `path` is accessible. Never fails.
    pub async fn exists(&self, path: &str) -> bool {
        let Ok(resolved) = self.resolve(path) else {
            return false;
        };
        tokio::task::spawn_blocking(move || {
            nix::unistd::access(resolved.as_path(), nix::unistd::AccessFlags::F_OK).is_ok()
        })
        .await
        .unwrap_or(false)
    }

    /// Lists `path`, sorted by name.
    pub async fn readdir(&self, path: &str) -> Result<Vec<DirEntry>, ErrorPayload> {
        let resolved = self.resolve(path)?;
        let mut dir = fs::read_dir(&resolved).await.map_err(io_error)?;
        let mut entries = Vec::new();

        while let Some(entry) = dir.next_entry().await.map_err(io_error)? {
            let file_type = entry.file_type().await.map_err(io_error)?;
            let kind = if file_type.is_dir() {
                FileKind::Directory
            } else if file_type.is_file() {
                FileKind::File
            } else {
                FileKind::Unknown
            };
            entries.push(DirEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
                kind,
                is_symlink: file_type.is_symlink(),
            });
        }

        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }
}

fn io_error(err: io::Error) -> ErrorPayload {
    ErrorPayload::from_io(&err)
}

fn stat_record(metadata: &Metadata, is_symlink: bool, dangling: bool) -> StatRecord {
    let kind = if dangling {
        FileKind::Unknown
    } else if metadata.is_file() {
        FileKind::File
    } else if metadata.is_dir() {
        FileKind::Directory
    } else {
        FileKind::Unknown
    };

    let permissions =
        (metadata.permissions().mode() & OWNER_WRITE == 0).then_some(Permission::Locked);

    StatRecord {
        ctime: metadata
            .created()
            .map(millis)
            .unwrap_or_else(|_| change_time_millis(metadata)),
        mtime: metadata.modified().map(millis).unwrap_or(0),
        size: metadata.len(),
        permissions,
        kind,
        is_symlink,
    }
}

fn millis(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// birth time is not available on every filesystem
fn change_time_millis(metadata: &Metadata) -> u64 {
    let secs = metadata.ctime().max(0) as u64;
    let nanos = metadata.ctime_nsec().max(0) as u64;
    secs * 1000 + nanos / 1_000_000
}
