mod commands;
mod store;

use std::fs::{self, OpenOptions};
use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::{prelude::*, EnvFilter};

/// Manifest generation and hot-update tooling.
#[derive(Debug, Parser)]
#[command(name = "hotpatch", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Scan a build output tree and write project.manifest and
    /// version.manifest into it.
    GenerateManifest {
        /// Root of the build output to scan.
        build_path: PathBuf,
        /// Version string to stamp into the manifests.
        version: String,
        /// Server base URL the assets will be hosted under.
        server_url: String,
    },
    /// Scan a source tree and write both manifests into a separate
    /// destination directory.
    GenerateVersion {
        /// Version string to stamp into the manifests.
        #[arg(short = 'v', long = "ver")]
        version: String,
        /// Base URL the assets will be served from.
        #[arg(short = 'u', long = "url")]
        url: String,
        /// Source tree to scan.
        #[arg(short = 's', long = "source")]
        source: PathBuf,
        /// Directory the manifests are written into.
        #[arg(short = 'd', long = "dest")]
        dest: PathBuf,
    },
    /// Check the remote manifest and download and apply any update.
    Update {
        /// TOML configuration file; see UpdaterConfig for the schema.
        #[arg(long)]
        config: Option<PathBuf>,
        /// Bundled local manifest, overriding the configured one.
        #[arg(long)]
        manifest: Option<PathBuf>,
        /// Writable content root, overriding the configured one.
        #[arg(long)]
        storage: Option<PathBuf>,
        /// Retry failed downloads until the retry budget is exhausted.
        #[arg(long)]
        retry: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging()?;

    let cli = Cli::parse();
    match cli.command {
        Command::GenerateManifest {
            build_path,
            version,
            server_url,
        } => commands::generate_manifest(&build_path, &version, &server_url),
        Command::GenerateVersion {
            version,
            url,
            source,
            dest,
        } => commands::generate_version(&source, &dest, &version, &url),
        Command::Update {
            config,
            manifest,
            storage,
            retry,
        } => commands::update(config.as_deref(), manifest, storage, retry).await,
    }
}

fn init_logging() -> Result<()> {
    let log_dir = std::env::current_dir()?.join("logs");
    fs::create_dir_all(&log_dir)?;
    let log_path = log_dir.join("hotpatch.log");

    let env_filter = EnvFilter::from_default_env();

    let stdout_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .compact()
        .with_writer(std::io::stdout);

    let file_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .compact()
        .with_writer(move || {
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(&log_path)
                .expect("failed to open log file")
        });

    tracing_subscriber::registry()
        .with(env_filter)
        .with(stdout_layer)
        .with(file_layer)
        .init();

    Ok(())
}
