use serde::{Deserialize, Serialize};
use statrpc_core::{ConnectionConfig, Error, Result};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Working directory the sandbox's own file operations are rooted at.
pub const DEFAULT_WORKDIR: &str = "/home/projects";

const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_READY_TIMEOUT_MS: u64 = 30_000;

/// Settings for launching and talking to a backend.
///
/// Loadable from TOML; every field is optional there.
///
/// ```toml
/// root = "/srv/sandbox"
/// workdir = "/home/projects"
/// request_timeout_ms = 5000
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BridgeConfig {
    /// Explicit backend binary. Discovered when unset.
    pub backend_path: Option<PathBuf>,
    /// Host directory the backend resolves sandbox paths under.
    pub root: PathBuf,
    /// Sandbox path prefix stripped before direct sandbox operations.
    pub workdir: String,
    /// Per-request deadline in milliseconds. `0` disables it.
    pub request_timeout_ms: u64,
    /// How long to wait for the backend's readiness line.
    pub ready_timeout_ms: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            backend_path: None,
            root: PathBuf::from("/"),
            workdir: DEFAULT_WORKDIR.to_string(),
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            ready_timeout_ms: DEFAULT_READY_TIMEOUT_MS,
        }
    }
}

impl BridgeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
            .map_err(|e| Error::InvalidConfig(format!("{}: {}", path.display(), e)))
    }

    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(contents).map_err(|e| Error::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_backend_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.backend_path = Some(path.into());
        self
    }

    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = root.into();
        self
    }

    pub fn with_workdir(mut self, workdir: impl Into<String>) -> Self {
        self.workdir = workdir.into();
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn without_request_timeout(mut self) -> Self {
        self.request_timeout_ms = 0;
        self
    }

    pub fn with_ready_timeout(mut self, timeout: Duration) -> Self {
        self.ready_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if !self.workdir.starts_with('/') {
            return Err(Error::InvalidConfig(format!(
                "workdir must be an absolute sandbox path, got {:?}",
                self.workdir
            )));
        }
        if self.ready_timeout_ms == 0 {
            return Err(Error::InvalidConfig(
                "ready_timeout_ms must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        (self.request_timeout_ms > 0).then(|| Duration::from_millis(self.request_timeout_ms))
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_timeout_ms)
    }

    pub fn connection_config(&self) -> ConnectionConfig {
        match self.request_timeout() {
            Some(timeout) => ConnectionConfig::new().with_request_timeout(timeout),
            None => ConnectionConfig::new().without_request_timeout(),
        }
    }

    /// Host directory backing the sandbox working directory.
    pub fn workdir_on_host(&self) -> PathBuf {
        self.root.join(self.workdir.trim_start_matches('/'))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = BridgeConfig::default();
        assert_eq!(config.backend_path, None);
        assert_eq!(config.root, PathBuf::from("/"));
        assert_eq!(config.workdir, "/home/projects");
        assert_eq!(config.request_timeout(), Some(Duration::from_secs(30)));
        assert_eq!(config.ready_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn builder_methods() {
        let config = BridgeConfig::new()
            .with_backend_path("/opt/statrpc-backend")
            .with_root("/srv/box")
            .with_workdir("/")
            .with_request_timeout(Duration::from_millis(1500))
            .with_ready_timeout(Duration::from_secs(2));

        assert_eq!(
            config.backend_path,
            Some(PathBuf::from("/opt/statrpc-backend"))
        );
        assert_eq!(config.root, PathBuf::from("/srv/box"));
        assert_eq!(config.workdir, "/");
        assert_eq!(config.request_timeout_ms, 1500);
        assert_eq!(config.ready_timeout(), Duration::from_secs(2));
    }

    #[test]
    fn zero_request_timeout_disables_deadline() {
        let config = BridgeConfig::new().without_request_timeout();
        assert_eq!(config.request_timeout(), None);
        assert_eq!(config.connection_config().request_timeout, None);
    }

    #[test]
    fn workdir_on_host_joins_root() {
        let config = BridgeConfig::new().with_root("/srv/box");
        assert_eq!(
            config.workdir_on_host(),
            PathBuf::from("/srv/box/home/projects")
        );

        let flat = config.with_workdir("/");
        assert_eq!(flat.workdir_on_host(), PathBuf::from("/srv/box"));
    }

    mod toml_parsing {
        use super::*;

        #[test]
        fn partial_file_keeps_defaults() {
            let config = BridgeConfig::from_toml_str(
                r#"
                root = "/srv/box"
                request_timeout_ms = 0
                "#,
            )
            .unwrap();

            assert_eq!(config.root, PathBuf::from("/srv/box"));
            assert_eq!(config.workdir, DEFAULT_WORKDIR);
            assert_eq!(config.request_timeout(), None);
        }

        #[test]
        fn unknown_field_is_rejected() {
            let err = BridgeConfig::from_toml_str("rooot = \"/\"").unwrap_err();
            assert!(matches!(err, Error::InvalidConfig(_)));
        }

        #[test]
        fn relative_workdir_is_rejected() {
            let err = BridgeConfig::from_toml_str("workdir = \"projects\"").unwrap_err();
            assert!(err.to_string().contains("workdir"));
        }

        #[test]
        fn load_reads_file() {
            let dir = tempfile::TempDir::new().unwrap();
            let path = dir.path().join("statrpc.toml");
            std::fs::write(&path, "backend_path = \"/bin/statrpc-backend\"\n").unwrap();

            let config = BridgeConfig::load(&path).unwrap();
            assert_eq!(
                config.backend_path,
                Some(PathBuf::from("/bin/statrpc-backend"))
            );
        }

        #[test]
        fn load_missing_file_is_io_error() {
            let err = BridgeConfig::load("/definitely/not/here.toml").unwrap_err();
            assert!(matches!(err, Error::Io(_)));
        }
    }
}
