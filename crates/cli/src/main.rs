use clap::{Parser, Subcommand};
use statrpc::{
    BridgeConfig, DirEntry, FileChangeKind, FileKind, FileSystemProvider, LocalSandbox,
    StatRecord, StatRpcClient,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing_subscriber::EnvFilter;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

fn kind_name(kind: FileKind) -> &'static str {
    match kind {
        FileKind::File => "file",
        FileKind::Directory => "directory",
        FileKind::Unknown => "unknown",
    }
}

fn yes_no(b: bool) -> &'static str {
    if b { "yes" } else { "no" }
}

fn print_stat_text(path: &str, stat: &StatRecord) {
    println!("{path}");
    println!("  Type: {}", kind_name(stat.kind));
    println!("  Symlink: {}", yes_no(stat.is_symlink));
    println!("  Size: {} bytes", stat.size);
    println!("  Modified: {} ms", stat.mtime);
    println!("  Created: {} ms", stat.ctime);
    println!(
        "  Permissions: {}",
        if stat.is_locked() { "locked" } else { "writable" }
    );
}

fn print_readdir_text(entries: &[DirEntry]) {
    if entries.is_empty() {
        println!("(empty)");
        return;
    }

    for entry in entries {
        let suffix = match (entry.kind, entry.is_symlink) {
            (FileKind::Directory, _) => "/",
            (_, true) => "@",
            _ => "",
        };
        println!("{:<9} {}{}", kind_name(entry.kind), entry.name, suffix);
    }
}

fn change_name(kind: FileChangeKind) -> &'static str {
    match kind {
        FileChangeKind::Added => "added",
        FileChangeKind::Deleted => "deleted",
        FileChangeKind::Updated => "updated",
    }
}

fn parse_sandbox_path(s: &str) -> Result<String, String> {
    if !s.starts_with('/') {
        return Err(format!("'{s}' is not an absolute sandbox path"));
    }
    Ok(s.to_string())
}

fn parse_existing_dir(s: &str) -> Result<PathBuf, String> {
    let path = PathBuf::from(s);
    if !path.is_dir() {
        return Err(format!("not a directory: {s}"));
    }
    Ok(path)
}

#[derive(Parser)]
#[command(name = "statrpc")]
#[command(about = "Inspect a sandbox filesystem through the statrpc bridge")]
#[command(version)]
struct Cli {
    /// Path to a TOML configuration file
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    /// Host directory the backend resolves sandbox paths under
    #[arg(long, global = true, value_parser = parse_existing_dir)]
    root: Option<PathBuf>,

    /// Path to the statrpc-backend binary
    #[arg(long, global = true)]
    backend: Option<PathBuf>,

    /// Sandbox working directory
    #[arg(long, global = true, value_parser = parse_sandbox_path)]
    workdir: Option<String>,

    /// Per-request timeout in milliseconds (0 disables)
    #[arg(long, global = true)]
    timeout_ms: Option<u64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show metadata for a path
    Stat {
        #[arg(value_parser = parse_sandbox_path)]
        path: String,

        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Check whether a path exists
    Exists {
        #[arg(value_parser = parse_sandbox_path)]
        path: String,
    },

    /// List a directory
    Readdir {
        #[arg(value_parser = parse_sandbox_path)]
        path: String,

        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Print a file's contents
    Cat {
        #[arg(value_parser = parse_sandbox_path)]
        path: String,
    },

    /// Print changes under a path until interrupted
    Watch {
        /// Defaults to the working directory
        #[arg(value_parser = parse_sandbox_path)]
        path: Option<String>,
    },

    /// Show version information
    Version,
}

impl Cli {
    fn bridge_config(&self) -> anyhow::Result<BridgeConfig> {
        let mut config = match &self.config {
            Some(path) => BridgeConfig::load(path)?,
            None => BridgeConfig::default(),
        };

        if let Some(root) = &self.root {
            config = config.with_root(root);
        }
        if let Some(backend) = &self.backend {
            config = config.with_backend_path(backend);
        }
        if let Some(workdir) = &self.workdir {
            config = config.with_workdir(workdir);
        }
        if let Some(timeout_ms) = self.timeout_ms {
            config.request_timeout_ms = timeout_ms;
        }

        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run().await {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if let Commands::Version = cli.command {
        print_version();
        return Ok(());
    }

    let config = cli.bridge_config()?;
    let client = Arc::new(StatRpcClient::spawn(&config).await?);
    let result = run_command(cli.command, &config, Arc::clone(&client)).await;

    if let Err(e) = client.shutdown(SHUTDOWN_GRACE).await {
        tracing::debug!(error = %e, "backend shutdown failed");
    }
    result
}

async fn run_command(
    command: Commands,
    config: &BridgeConfig,
    client: Arc<StatRpcClient>,
) -> anyhow::Result<()> {
    match command {
        Commands::Stat { path, json } => {
            let stat = client.stat(&path).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&stat)?);
            } else {
                print_stat_text(&path, &stat);
            }
        }

        Commands::Exists { path } => {
            println!("{}", client.exists(&path).await?);
        }

        Commands::Readdir { path, json } => {
            let entries = client.readdir(&path).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&entries)?);
            } else {
                print_readdir_text(&entries);
            }
        }

        Commands::Cat { path } => {
            let provider = provider(config, client);
            let contents = provider.read_file(&path).await?;
            let mut stdout = tokio::io::stdout();
            stdout.write_all(&contents).await?;
            stdout.flush().await?;
        }

        Commands::Watch { path } => {
            let provider = provider(config, client);
            let path = path.unwrap_or_else(|| config.workdir.clone());
            let mut changes = provider.watch(&path);
            provider.start_watching()?;
            eprintln!("Watching {path}. Press Ctrl+C to stop.");

            loop {
                tokio::select! {
                    change = changes.recv() => {
                        let Some(change) = change else { break };
                        println!("{:<8} {}", change_name(change.kind), change.path);
                    }
                    _ = tokio::signal::ctrl_c() => break,
                }
            }
        }

        Commands::Version => print_version(),
    }

    Ok(())
}

fn print_version() {
    println!("statrpc {}", env!("CARGO_PKG_VERSION"));
}

fn provider(config: &BridgeConfig, client: Arc<StatRpcClient>) -> FileSystemProvider {
    let sandbox = LocalSandbox::new(config.workdir_on_host());
    FileSystemProvider::new(client, Arc::new(sandbox), config.workdir.clone())
}
