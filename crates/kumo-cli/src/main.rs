//! kumo - command-line client for the kumo virtual filesystem.
//!
//! Loads the mount point configuration, runs one verb, prints the result.
//!
//! ```bash
//! kumo mounts
//! kumo ls home:///docs
//! kumo put ./report.pdf home:///docs/
//! kumo cp home:///docs/report.pdf dropbox:///report.pdf
//! kumo signout dropbox
//! ```

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};
use url::Url;

use kumo_vfs::config::CONFIG_ENV;
use kumo_vfs::vfs::{FindQuery, ScandirOptions, TransferOptions, UploadFile, UrlOptions};
use kumo_vfs::{
    Authorizer, Dispatcher, FileBlob, FileMetadata, FileType, VfsConfig, VfsError, VfsResult,
    VirtualPath,
};

#[derive(Parser, Debug)]
#[command(name = "kumo", version)]
#[command(about = "Virtual filesystem over local, WebDAV and cloud storage")]
struct Args {
    /// Mount point configuration (TOML).
    #[arg(long, env = CONFIG_ENV, global = true)]
    config: Option<PathBuf>,

    /// Print results as JSON.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List a directory.
    Ls {
        dir: String,
        /// Include dot files.
        #[arg(short, long)]
        all: bool,
        /// Only directories.
        #[arg(long, conflicts_with = "files")]
        dirs: bool,
        /// Only files.
        #[arg(long)]
        files: bool,
        /// Only files of these mime types (`image/*`). Repeatable.
        #[arg(long = "mime")]
        mime: Vec<String>,
    },
    /// Print a file to stdout.
    Cat { file: String },
    /// Copy a file from the VFS to a local path (default: its filename).
    Get { file: String, local: Option<PathBuf> },
    /// Upload a local file. A destination ending in `/` keeps the local name.
    Put {
        local: PathBuf,
        dest: String,
        #[arg(long)]
        overwrite: bool,
    },
    /// Copy, across mount points if needed.
    Cp {
        src: String,
        dest: String,
        #[arg(long)]
        overwrite: bool,
    },
    /// Move, across mount points if needed.
    Mv {
        src: String,
        dest: String,
        #[arg(long)]
        overwrite: bool,
    },
    /// Remove a file or directory.
    Rm { path: String },
    /// Create a directory.
    Mkdir { dir: String },
    /// Show an entry's metadata.
    Stat { path: String },
    /// Print whether a path exists.
    Exists { path: String },
    /// Search below a directory.
    Find {
        dir: String,
        query: String,
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Print a URL for a file.
    Url {
        file: String,
        /// Download flag for shared links (0 keeps a preview link).
        #[arg(long)]
        dl: Option<u8>,
    },
    /// Free space of a mount point in bytes (-1 if unknown).
    Df { root: String },
    /// List mount points.
    Mounts {
        /// Only searchable mount points.
        #[arg(long)]
        searchable: bool,
    },
    /// Sign out of a mount point's backend and unmount it.
    Signout { mount: String },
}

/// Interactive sign-in on the terminal: print the authorization URL, read
/// back the URL the browser was redirected to.
struct TerminalAuthorizer;

#[async_trait]
impl Authorizer for TerminalAuthorizer {
    async fn authorize(&self, auth_url: Url) -> VfsResult<Url> {
        eprintln!("Sign in by opening this URL in a browser:\n\n    {auth_url}\n");
        eprint!("Then paste the address you were redirected to: ");

        let mut line = String::new();
        BufReader::new(tokio::io::stdin())
            .read_line(&mut line)
            .await
            .map_err(|e| VfsError::AuthFailed(e.to_string()))?;
        if line.trim().is_empty() {
            return Err(VfsError::AuthFailed("no redirect URL entered".into()));
        }
        Url::parse(line.trim()).map_err(|e| VfsError::AuthFailed(format!("bad redirect URL: {e}")))
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
    match run(args).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("kumo: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<ExitCode> {
    let config = VfsConfig::load_or_default(args.config.as_deref()).await?;
    let registry = config.build_registry(Arc::new(TerminalAuthorizer)).await;

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        }
    });
    let vfs = Dispatcher::new(registry)
        .with_source("kumo-cli")
        .with_cancel(cancel);

    let json = args.json;
    match args.command {
        Command::Ls {
            dir,
            all,
            dirs,
            files,
            mime,
        } => {
            let opts = ScandirOptions {
                show_hidden: all,
                type_filter: match (dirs, files) {
                    (true, _) => Some(FileType::Dir),
                    (_, true) => Some(FileType::File),
                    _ => None,
                },
                mime_filter: mime,
                ..Default::default()
            };
            print_entries(&vfs.scandir(&dir, &opts).await?, json)?;
        }
        Command::Cat { file } => {
            let blob = vfs.read(&file).await?;
            let mut stdout = tokio::io::stdout();
            stdout.write_all(&blob.data).await?;
            stdout.flush().await?;
        }
        Command::Get { file, local } => {
            let file = VirtualPath::parse(&file)?;
            let local = local.unwrap_or_else(|| PathBuf::from(file.filename()));
            let blob = vfs.read(&file).await?;
            tokio::fs::write(&local, &blob.data)
                .await
                .with_context(|| format!("writing {}", local.display()))?;
            eprintln!("{} -> {} ({} bytes)", file, local.display(), blob.len());
        }
        Command::Put {
            local,
            dest,
            overwrite,
        } => {
            let (dir, name) = upload_target(&local, &dest)?;
            let data = tokio::fs::read(&local)
                .await
                .with_context(|| format!("reading {}", local.display()))?;
            let file = UploadFile::new(name.clone(), FileBlob::guessed(data, &name));
            let uploaded = vfs.upload(&dir, file, TransferOptions { overwrite }).await?;
            print_entry(&uploaded, json)?;
        }
        Command::Cp {
            src,
            dest,
            overwrite,
        } => {
            let copied = vfs.copy(&src, &dest, TransferOptions { overwrite }).await?;
            print_entry(&copied, json)?;
        }
        Command::Mv {
            src,
            dest,
            overwrite,
        } => {
            let moved = vfs.rename(&src, &dest, TransferOptions { overwrite }).await?;
            print_entry(&moved, json)?;
        }
        Command::Rm { path } => vfs.unlink(&path).await?,
        Command::Mkdir { dir } => {
            let created = vfs.mkdir(&dir, TransferOptions::default()).await?;
            print_entry(&created, json)?;
        }
        Command::Stat { path } => print_entry(&vfs.fileinfo(&path).await?, json)?,
        Command::Exists { path } => {
            let exists = vfs.exists(&path).await?;
            println!("{exists}");
            if !exists {
                return Ok(ExitCode::FAILURE);
            }
        }
        Command::Find { dir, query, limit } => {
            let query = FindQuery { query, limit };
            print_entries(&vfs.find(&dir, &query).await?, json)?;
        }
        Command::Url { file, dl } => println!("{}", vfs.url(&file, &UrlOptions { dl }).await?),
        Command::Df { root } => println!("{}", vfs.free_space(&root).await?),
        Command::Mounts { searchable } => {
            let mounts = if searchable {
                vfs.mount_points(true)
            } else {
                vfs.snapshot()
            };
            if json {
                println!("{}", serde_json::to_string_pretty(&mounts)?);
            } else {
                for m in mounts {
                    let state = match (m.enabled, m.mounted) {
                        (false, _) => "unavailable",
                        (true, false) => "unmounted",
                        (true, true) => "mounted",
                    };
                    let access = if m.read_only { "ro" } else { "rw" };
                    println!(
                        "{:<12} {:<10} {:<8} {:<11} {access}",
                        m.root, m.name, m.transport, state
                    );
                }
            }
        }
        Command::Signout { mount } => {
            vfs.sign_out(&mount).await?;
            eprintln!("signed out of {mount}");
        }
    }

    Ok(ExitCode::SUCCESS)
}

/// Split `dest` into upload directory and filename.
fn upload_target(local: &Path, dest: &str) -> Result<(VirtualPath, String)> {
    let target = VirtualPath::parse(dest)?;
    if dest.ends_with('/') || target.is_root() {
        return Ok((target, local_name(local)?));
    }
    Ok((target.parent(), target.filename().to_string()))
}

fn local_name(local: &Path) -> Result<String> {
    local
        .file_name()
        .and_then(|n| n.to_str())
        .map(str::to_string)
        .with_context(|| format!("{} has no usable file name", local.display()))
}

fn print_entry(entry: &FileMetadata, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(entry)?);
    } else {
        println!("{}", format_entry(entry));
    }
    Ok(())
}

fn print_entries(entries: &[FileMetadata], json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(entries)?);
    } else {
        for entry in entries {
            println!("{}", format_entry(entry));
        }
    }
    Ok(())
}

fn format_entry(entry: &FileMetadata) -> String {
    if entry.is_dir() {
        format!("d {:>12}  {}/", "-", entry.filename)
    } else {
        format!(
            "- {:>12}  {}  ({})",
            entry.size,
            entry.filename,
            entry.mime.as_deref().unwrap_or("?")
        )
    }
}
