//! statrpc-backend
//!
//! Runs inside the sandbox and answers filesystem inspection requests from
//! the host over stdin/stdout. Stdout carries only the readiness sentinel and
//! protocol lines; logs go to stderr.

use anyhow::Context;
use clap::Parser;
use statrpc_backend::BackendFs;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "statrpc-backend", version, about = "Sandbox side of the statrpc bridge")]
struct Args {
    /// Directory that request paths are resolved under
    #[arg(long, default_value = "/")]
    root: PathBuf,
}

fn main() {
    if let Err(e) = run() {
        eprintln!("statrpc-backend: {:#}", e);
        std::process::exit(1);
    }
}

fn run() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    anyhow::ensure!(
        args.root.is_dir(),
        "root {} is not a directory",
        args.root.display()
    );

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;

    runtime.block_on(async {
        info!(root = %args.root.display(), "statrpc-backend starting");
        statrpc_backend::serve(tokio::io::stdin(), tokio::io::stdout(), BackendFs::new(args.root))
            .await?;
        info!("input closed, shutting down");
        Ok::<_, anyhow::Error>(())
    })
}
