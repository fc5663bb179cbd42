//! Browse archives nested in a directory tree as if they were directories.
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use deep_fs::fs::archive::{TarProvider, ZipProvider};
use deep_fs::fs::local::LocalFs;
use deep_fs::fs::nested::Nested;
use deep_fs::fs::{EntryKind, Metadata, ViewProvider};
use deep_fs::registry::RegistryError;
use deep_fs::{DeepFs, FsError, ProviderRegistry, ViewCacheConfig};
use thiserror::Error;
use tokio::io::AsyncWriteExt as _;
use tracing::{debug, error};

mod app_config;
mod trc;

use crate::app_config::{Config, ConfigError};
use crate::trc::Trc;

#[derive(Parser)]
#[command(version, about = "A read-only filesystem that looks inside archives.")]
struct Args {
    #[arg(
        short,
        long,
        value_parser,
        help = "Optional path to a deep-fs config TOML."
    )]
    config_path: Option<PathBuf>,

    #[arg(short, long, help = "Directory to serve. Overrides the configured root.")]
    root: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List a directory.
    Ls {
        #[arg(default_value = ".")]
        path: String,
    },

    /// Write a file to stdout.
    Cat { path: String },

    /// Show the metadata of a file or directory.
    Stat { path: String },
}

#[derive(Debug, Error)]
enum CommandError {
    #[error(transparent)]
    Fs(#[from] FsError),

    #[error("cannot register providers: {0}")]
    Registry(#[from] RegistryError),

    #[error("cannot write output: {0}")]
    Io(#[from] io::Error),
}

fn describe(meta: &Metadata) -> &'static str {
    match meta.kind {
        EntryKind::Directory => "dir",
        EntryKind::Symlink => "link",
        _ => "file",
    }
}

/// The archive providers, each looking `depth` levels into the archives it contains.
fn archive_providers(
    depth: usize,
    cache: ViewCacheConfig,
) -> Result<Vec<Arc<dyn ViewProvider>>, RegistryError> {
    let plain: Vec<Arc<dyn ViewProvider>> =
        vec![Arc::new(TarProvider::new()), Arc::new(ZipProvider::new())];
    if depth == 0 {
        return Ok(plain);
    }

    let mut inner = ProviderRegistry::new();
    for provider in archive_providers(depth - 1, cache)? {
        inner = inner.with_provider(provider)?;
    }
    Ok(plain
        .into_iter()
        .map(|provider| {
            Arc::new(Nested::new(provider, inner.clone()).with_config(cache)) as Arc<dyn ViewProvider>
        })
        .collect())
}

async fn run(config: Config, command: Command) -> Result<(), CommandError> {
    let cache = config.cache.to_view_cache_config();
    let mut builder = DeepFs::builder(Arc::new(LocalFs::new(config.root))).config(cache);
    for provider in archive_providers(config.nesting_depth, cache)? {
        builder = builder.provider(provider);
    }
    let fs = builder.build()?;
    debug!(fs = ?fs, "Filesystem ready.");

    let mut stdout = tokio::io::stdout();
    match command {
        Command::Ls { path } => {
            let mut out = String::new();
            for entry in fs.read_dir(&path).await? {
                let suffix = if entry.is_dir() { "/" } else { "" };
                out.push_str(&format!(
                    "{:>4} {:>12} {}{suffix}\n",
                    describe(&entry.metadata),
                    entry.metadata.size,
                    entry.name
                ));
            }
            stdout.write_all(out.as_bytes()).await?;
        }
        Command::Cat { path } => {
            let data = fs.read(&path).await?;
            stdout.write_all(&data).await?;
        }
        Command::Stat { path } => {
            let meta = fs.stat(&path).await?;
            let mut out = format!("kind: {}\nsize: {}\n", describe(&meta), meta.size);
            if let Some(modified) = meta.modified
                && let Ok(since_epoch) = modified.duration_since(std::time::UNIX_EPOCH)
            {
                out.push_str(&format!("modified: {}\n", since_epoch.as_secs()));
            }
            stdout.write_all(out.as_bytes()).await?;
        }
    }
    stdout.flush().await?;
    Ok(())
}

/// Main entry point for the application.
fn main() {
    let args = Args::parse();

    // Errors use eprintln since tracing isn't initialized yet.
    let mut config = Config::load_or_default(args.config_path.as_deref()).unwrap_or_else(|e| {
        eprintln!("Failed to load configuration: {e}");
        std::process::exit(1);
    });
    if let Some(root) = args.root {
        config.root = root;
    }
    let config = match config.validated() {
        Ok(config) => config,
        Err(ConfigError::ValidationErrors(error_messages)) => {
            eprintln!("Configuration is invalid.");
            for msg in &error_messages {
                eprintln!(" - {msg}");
            }
            std::process::exit(1);
        }
        Err(e) => {
            eprintln!("Failed to load configuration: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = Trc::default().init() {
        eprintln!("Failed to initialize logging: {e}");
        std::process::exit(1);
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Failed to create Tokio runtime: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = runtime.block_on(run(config, args.command)) {
        error!("{e}");
        std::process::exit(1);
    }
}
