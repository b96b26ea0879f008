//! Kumo server binary
//!
//! Serves local directories over the JSON API the `osjs` transport speaks.
//!
//! ## Usage
//!
//! ```bash
//! # Serve ~/ as home:/// on 127.0.0.1:8000/FS
//! kumo-server --root ~
//!
//! # Extra mount points and an upload limit
//! kumo-server --root ~ --mount music=/srv/music --max-upload-size 2097152
//! ```

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, bail};
use clap::Parser;
use kumo_server::{DEFAULT_API_ROOT, DEFAULT_BIND, ServerConfig};
use tokio::net::TcpListener;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "kumo-server", version, about = "Local filesystem JSON API for kumo")]
struct Args {
    /// Address to listen on.
    #[arg(long, env = "KUMO_BIND", default_value = DEFAULT_BIND)]
    bind: String,

    /// Directory served as `home:///`. Defaults to the home directory.
    #[arg(long, env = "KUMO_ROOT")]
    root: Option<PathBuf>,

    /// Additional mount point, as `name=directory`. Repeatable.
    #[arg(long = "mount", value_name = "NAME=DIR")]
    mounts: Vec<String>,

    /// Path prefix for every endpoint.
    #[arg(long, default_value = DEFAULT_API_ROOT)]
    api_root: String,

    /// Largest accepted upload in bytes; 0 means unlimited.
    #[arg(long, default_value_t = 0)]
    max_upload_size: u64,
}

impl Args {
    fn config(&self) -> anyhow::Result<ServerConfig> {
        let root = match &self.root {
            Some(root) => root.clone(),
            None => dirs::home_dir().context("no home directory; pass --root")?,
        };

        let mut config = ServerConfig::new(root).with_max_upload_size(self.max_upload_size);
        config.api_root = self.api_root.clone();

        for arg in &self.mounts {
            let Some((name, dir)) = arg.split_once('=') else {
                bail!("--mount expects NAME=DIR, got {arg:?}");
            };
            config = config.with_mount(name.trim(), dir.trim());
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = Args::parse();
    match run(&args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("Server error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: &Args) -> anyhow::Result<()> {
    let config = args.config()?;
    let listener = TcpListener::bind(&args.bind)
        .await
        .with_context(|| format!("binding {}", args.bind))?;

    tracing::info!("Starting kumo server on {}...", args.bind);
    kumo_server::serve(listener, &config).await?;
    Ok(())
}
