//! screenreel – command-line client for a screenreel server.
//!
//! Subcommands:
//! - `screenreel upload <file>` - Upload an existing recording
//! - `screenreel list` - Show stored recordings and quota usage
//! - `screenreel rename <old> <new>` / `screenreel delete <name>`
//! - `screenreel clean [--days N]` - Remove recordings older than N days
//! - `screenreel token` - Fetch a CSRF token (connectivity check)

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use screenreel_common::config::{self, Config};
use screenreel_recorder::{Artifact, UploadClient};

#[derive(Parser)]
#[command(name = "screenreel")]
#[command(about = "Upload and manage screen recordings on a screenreel server")]
#[command(version)]
struct Cli {
    /// KEY=VALUE configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Upload a recording file (mp4, webm or mkv)
    Upload {
        file: PathBuf,

        /// Recording length in seconds, reported to the server
        #[arg(short, long, default_value = "0")]
        duration: u64,
    },

    /// List stored recordings
    List,

    /// Rename a stored recording
    Rename { old_name: String, new_name: String },

    /// Delete a stored recording
    Delete { filename: String },

    /// Delete recordings older than the given age
    Clean {
        #[arg(short, long, default_value = "30")]
        days: u32,
    },

    /// Fetch a CSRF token for this session
    Token,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();

    // A missing default config just means "use the defaults".
    let config = match &cli.config {
        Some(path) => config::load(path).context("Config load failed")?,
        None if Path::new(Config::default_path()).exists() => {
            config::load(Path::new(Config::default_path())).context("Config load failed")?
        }
        None => Config::default(),
    };

    let client = UploadClient::from_config(&config)?;
    info!("Using server {}", config.server_url);

    match cli.command {
        Commands::Upload { file, duration } => {
            let artifact = read_artifact(&file, duration)?;
            let stored = client.upload(&artifact).await?;
            println!("Stored as {} ({} bytes)", stored.filename, stored.size);
        }
        Commands::List => {
            let listing = client.list().await?;
            for rec in &listing.recordings {
                println!(
                    "{:<40} {:>10}  {}  {}",
                    rec.filename, rec.size_formatted, rec.created_formatted, rec.url
                );
            }
            println!(
                "{} file(s), {} of {} used ({}%), {} available",
                listing.total_files,
                listing.total_size_formatted,
                listing.space_limit_formatted,
                listing.percentage_used,
                listing.space_available_formatted
            );
        }
        Commands::Rename { old_name, new_name } => {
            println!("{}", client.rename(&old_name, &new_name).await?.message);
        }
        Commands::Delete { filename } => {
            println!("{}", client.delete(&filename).await?.message);
        }
        Commands::Clean { days } => {
            println!("{}", client.clean_old(days).await?.message);
        }
        Commands::Token => {
            println!("{}", client.fetch_token().await?);
        }
    }

    Ok(())
}

/// Load a recording from disk with a MIME type matching its extension.
fn read_artifact(path: &Path, duration: u64) -> Result<Artifact> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    let mime = match ext.as_str() {
        "mp4" => "video/mp4",
        "webm" => "video/webm",
        "mkv" => "video/x-matroska",
        other => bail!("Unsupported recording type: {other:?}"),
    };
    let bytes =
        std::fs::read(path).with_context(|| format!("Cannot read {}", path.display()))?;
    Ok(Artifact::new(bytes, mime, duration))
}
