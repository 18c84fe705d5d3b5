use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use s3xfer::cli::{args, commands};
use s3xfer::{config, TransferManager};

#[derive(Parser)]
#[command(name = "s3xfer")]
#[command(version, about = "Resumable, concurrent transfers for S3-compatible storage", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path (falls back to environment variables)
    #[arg(long, global = true, env = "S3XFER_CONFIG")]
    config: Option<String>,

    /// Profile to use from config
    #[arg(long, global = true)]
    profile: Option<String>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,

    /// Disable SSL certificate verification
    #[arg(long, global = true)]
    insecure: bool,

    /// Print machine-readable JSON instead of text
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// List objects
    Ls {
        /// S3 path (s3://bucket/prefix/)
        path: String,

        /// List recursively
        #[arg(short, long)]
        recursive: bool,

        /// Maximum number of results to show (0 = unlimited)
        #[arg(long, default_value = "0")]
        max_keys: usize,
    },

    /// Upload a file
    Put {
        /// Local file
        source: PathBuf,

        /// Destination (s3://bucket/key, or s3://bucket/prefix/)
        destination: String,
    },

    /// Download an object
    Get {
        /// Source object (s3://bucket/key)
        source: String,

        /// Local file or directory (default: object name in the current directory)
        destination: Option<PathBuf>,
    },

    /// Remove objects
    Rm {
        /// S3 path to remove
        path: String,

        /// Remove every object under the prefix
        #[arg(short, long)]
        recursive: bool,
    },

    /// Show object info
    Stat {
        /// S3 path
        path: String,
    },

    /// Print a presigned GET URL
    Presign {
        /// S3 path
        path: String,

        /// URL lifetime (e.g. 900, 15m, 12h, 7d)
        #[arg(long, default_value = "1h")]
        expires: String,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| cli.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    // Set before config loading so the override is picked up with the others
    if cli.insecure {
        std::env::set_var("S3XFER_INSECURE_TLS", "true");
    }

    // Parts run concurrently, so transfers want every core
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async_main(cli))
}

async fn async_main(cli: Cli) -> Result<()> {
    let config = config::load_config(cli.config.as_deref(), cli.profile.as_deref())?;
    let profile = config
        .get_profile(cli.profile.as_deref())
        .context("No S3 profile configured")?;

    let manager = TransferManager::from_profile(profile, config.transfer.clone())
        .context("Failed to create S3 transport")?;

    match cli.command {
        Commands::Ls { path, recursive, max_keys } => {
            commands::cmd_ls(&manager, &path, recursive, max_keys, cli.json).await?;
        }
        Commands::Put { source, destination } => {
            commands::cmd_put(&manager, &source, &destination, cli.json).await?;
        }
        Commands::Get { source, destination } => {
            commands::cmd_get(&manager, &source, destination.as_deref(), cli.json).await?;
        }
        Commands::Rm { path, recursive } => {
            commands::cmd_rm(&manager, &path, recursive).await?;
        }
        Commands::Stat { path } => {
            commands::cmd_stat(&manager, &path, cli.json).await?;
        }
        Commands::Presign { path, expires } => {
            let expires = args::parse_expiry(&expires)?;
            commands::cmd_presign(&manager, &path, expires, cli.json)?;
        }
    }

    Ok(())
}
