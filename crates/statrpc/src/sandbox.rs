//! Direct sandbox file operations.
//!
//! These bypass the bridge: the sandbox exposes them natively. Paths are
//! relative to the sandbox working directory and written with a leading `/`
//! (`/src/main.rs`).

use async_trait::async_trait;
use notify::event::ModifyKind;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::any::Any;
use std::io;
use std::path::{Component, Path, PathBuf};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Raw change reported by the sandbox's recursive watcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NativeWatchEvent {
    /// Contents or metadata of an existing entry changed.
    Change(String),
    /// An entry appeared, disappeared or moved. Which one is not known.
    Rename(String),
}

impl NativeWatchEvent {
    pub fn path(&self) -> &str {
        match self {
            Self::Change(path) | Self::Rename(path) => path,
        }
    }
}

/// Stream of [`NativeWatchEvent`]s. Watching stops when it is dropped.
pub struct NativeWatch {
    events: mpsc::UnboundedReceiver<NativeWatchEvent>,
    _guard: Option<Box<dyn Any + Send>>,
}

impl NativeWatch {
    pub fn new(events: mpsc::UnboundedReceiver<NativeWatchEvent>) -> Self {
        Self {
            events,
            _guard: None,
        }
    }

    /// Ties the lifetime of `guard` (typically the platform watcher) to the
    /// stream.
    pub fn with_guard(
        events: mpsc::UnboundedReceiver<NativeWatchEvent>,
        guard: impl Any + Send,
    ) -> Self {
        Self {
            events,
            _guard: Some(Box::new(guard)),
        }
    }

    pub async fn recv(&mut self) -> Option<NativeWatchEvent> {
        self.events.recv().await
    }
}

impl std::fmt::Debug for NativeWatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeWatch").finish_non_exhaustive()
    }
}

/// File operations the sandbox performs itself.
#[async_trait]
pub trait SandboxFs: Send + Sync {
    async fn read_file(&self, path: &str) -> io::Result<Vec<u8>>;

    /// Creates or truncates `path`.
    async fn write_file(&self, path: &str, contents: &[u8]) -> io::Result<()>;

    async fn rename(&self, from: &str, to: &str) -> io::Result<()>;

    async fn mkdir(&self, path: &str) -> io::Result<()>;

    /// Removes a file, or a directory (with its contents when `recursive`).
    async fn remove(&self, path: &str, recursive: bool) -> io::Result<()>;

    /// Starts a recursive watch over the whole working directory.
    fn watch(&self) -> io::Result<NativeWatch>;
}

/// [`SandboxFs`] backed by a directory on the host.
#[derive(Debug, Clone)]
pub struct LocalSandbox {
    root: PathBuf,
}

impl LocalSandbox {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> io::Result<PathBuf> {
        let mut resolved = self.root.clone();
        let mut depth = 0usize;
        for component in Path::new(path).components() {
            match component {
                Component::Normal(part) => {
                    resolved.push(part);
                    depth += 1;
                }
                Component::ParentDir if depth > 0 => {
                    resolved.pop();
                    depth -= 1;
                }
                Component::ParentDir => {
                    return Err(io::Error::new(
                        io::ErrorKind::PermissionDenied,
                        format!("path escapes sandbox: {}", path),
                    ));
                }
                Component::RootDir | Component::CurDir | Component::Prefix(_) => {}
            }
        }
        Ok(resolved)
    }
}

#[async_trait]
impl SandboxFs for LocalSandbox {
    async fn read_file(&self, path: &str) -> io::Result<Vec<u8>> {
        tokio::fs::read(self.resolve(path)?).await
    }

    async fn write_file(&self, path: &str, contents: &[u8]) -> io::Result<()> {
        tokio::fs::write(self.resolve(path)?, contents).await
    }

    async fn rename(&self, from: &str, to: &str) -> io::Result<()> {
        tokio::fs::rename(self.resolve(from)?, self.resolve(to)?).await
    }

    async fn mkdir(&self, path: &str) -> io::Result<()> {
        tokio::fs::create_dir(self.resolve(path)?).await
    }

    async fn remove(&self, path: &str, recursive: bool) -> io::Result<()> {
        let resolved = self.resolve(path)?;
        let metadata = tokio::fs::symlink_metadata(&resolved).await?;
        if !metadata.is_dir() {
            tokio::fs::remove_file(&resolved).await
        } else if recursive {
            tokio::fs::remove_dir_all(&resolved).await
        } else {
            tokio::fs::remove_dir(&resolved).await
        }
    }

    fn watch(&self) -> io::Result<NativeWatch> {
        // event paths come back canonical on some platforms
        let root = std::fs::canonicalize(&self.root)?;
        let (tx, rx) = mpsc::unbounded_channel();

        let watch_root = root.clone();
        let mut watcher = RecommendedWatcher::new(
            move |result: notify::Result<Event>| match result {
                Ok(event) => {
                    for native in translate(&watch_root, event) {
                        let _ = tx.send(native);
                    }
                }
                Err(e) => warn!(error = %e, "sandbox watcher error"),
            },
            notify::Config::default(),
        )
        .map_err(io::Error::other)?;

        watcher
            .watch(&root, RecursiveMode::Recursive)
            .map_err(io::Error::other)?;
        debug!(root = %root.display(), "watching sandbox");

        Ok(NativeWatch::with_guard(rx, watcher))
    }
}

fn translate(root: &Path, event: Event) -> Vec<NativeWatchEvent> {
    let rename = match event.kind {
        EventKind::Create(_) | EventKind::Remove(_) | EventKind::Modify(ModifyKind::Name(_)) => {
            true
        }
        EventKind::Modify(_) => false,
        _ => return Vec::new(),
    };

    event
        .paths
        .iter()
        .filter_map(|path| sandbox_path(root, path))
        .map(|path| {
            if rename {
                NativeWatchEvent::Rename(path)
            } else {
                NativeWatchEvent::Change(path)
            }
        })
        .collect()
}

fn sandbox_path(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let mut out = String::new();
    for component in relative.components() {
        out.push('/');
        out.push_str(&component.as_os_str().to_string_lossy());
    }
    if out.is_empty() {
        out.push('/');
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{CreateKind, DataChange, RemoveKind, RenameMode};
    use std::time::Duration;
    use tempfile::TempDir;

    mod local {
        use super::*;

        #[tokio::test]
        async fn write_then_read() {
            let dir = TempDir::new().unwrap();
            let sandbox = LocalSandbox::new(dir.path());

            sandbox.write_file("/notes.txt", b"hi").await.unwrap();
            assert_eq!(sandbox.read_file("/notes.txt").await.unwrap(), b"hi");
            assert_eq!(std::fs::read(dir.path().join("notes.txt")).unwrap(), b"hi");
        }

        #[tokio::test]
        async fn mkdir_rename_remove() {
            let dir = TempDir::new().unwrap();
            let sandbox = LocalSandbox::new(dir.path());

            sandbox.mkdir("/src").await.unwrap();
            sandbox.write_file("/src/a.rs", b"fn main() {}").await.unwrap();
            sandbox.rename("/src/a.rs", "/src/b.rs").await.unwrap();
            assert!(dir.path().join("src/b.rs").exists());
            assert!(!dir.path().join("src/a.rs").exists());

            let err = sandbox.remove("/src", false).await.unwrap_err();
            assert_ne!(err.kind(), io::ErrorKind::NotFound);

            sandbox.remove("/src", true).await.unwrap();
            assert!(!dir.path().join("src").exists());
        }

        #[tokio::test]
        async fn escaping_paths_are_refused() {
            let dir = TempDir::new().unwrap();
            let sandbox = LocalSandbox::new(dir.path());

            let err = sandbox.read_file("/../secret").await.unwrap_err();
            assert_eq!(err.kind(), io::ErrorKind::PermissionDenied);
        }

        #[tokio::test]
        async fn watch_reports_new_file() {
            let dir = TempDir::new().unwrap();
            let sandbox = LocalSandbox::new(dir.path());
            let mut watch = sandbox.watch().unwrap();

            std::fs::write(dir.path().join("fresh.txt"), b"new").unwrap();

            let event = tokio::time::timeout(Duration::from_secs(5), async {
                loop {
                    let event = watch.recv().await.unwrap();
                    if event.path() == "/fresh.txt" {
                        return event;
                    }
                }
            })
            .await
            .unwrap();
            assert_eq!(event.path(), "/fresh.txt");
        }
    }

    mod translation {
        use super::*;

        fn event(kind: EventKind, path: &str) -> Event {
            Event::new(kind).add_path(PathBuf::from(path))
        }

        #[test]
        fn create_and_remove_are_renames() {
            let root = Path::new("/box");
            assert_eq!(
                translate(root, event(EventKind::Create(CreateKind::File), "/box/a.txt")),
                vec![NativeWatchEvent::Rename("/a.txt".to_string())]
            );
            assert_eq!(
                translate(root, event(EventKind::Remove(RemoveKind::Any), "/box/d/b")),
                vec![NativeWatchEvent::Rename("/d/b".to_string())]
            );
            assert_eq!(
                translate(
                    root,
                    event(
                        EventKind::Modify(ModifyKind::Name(RenameMode::Any)),
                        "/box/c"
                    )
                ),
                vec![NativeWatchEvent::Rename("/c".to_string())]
            );
        }

        #[test]
        fn data_modification_is_change() {
            let root = Path::new("/box");
            assert_eq!(
                translate(
                    root,
                    event(
                        EventKind::Modify(ModifyKind::Data(DataChange::Content)),
                        "/box/a.txt"
                    )
                ),
                vec![NativeWatchEvent::Change("/a.txt".to_string())]
            );
        }

        #[test]
        fn access_and_outside_paths_are_ignored() {
            let root = Path::new("/box");
            assert!(
                translate(
                    root,
                    event(
                        EventKind::Access(notify::event::AccessKind::Any),
                        "/box/a"
                    )
                )
                .is_empty()
            );
            assert!(translate(root, event(EventKind::Create(CreateKind::Any), "/elsewhere/a")).is_empty());
        }
    }
}
