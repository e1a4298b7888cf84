//! remotedata - cache files from remote content stores
//!
//! Downloads a requested file once and reuses the local copy until the
//! remote revision changes.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, Result};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use remotedata::{RemoteDataCache, SourceOptions};

#[derive(Debug)]
enum Command {
    Get { path: String },
    Remove { path: String },
    Clear,
}

fn print_help() {
    eprintln!(
        r#"remotedata - cache files from remote content stores

USAGE:
    remotedata get <remote-path>
    remotedata remove <remote-path>
    remotedata clear
    remotedata help

COMMANDS:
    get     Print the local path of the file, downloading it if needed
    remove  Drop the cached copy of a file
    clear   Drop every cached entry for the configured source
    help    Show this help message

ENVIRONMENT:
    REMOTEDATA_SOURCE        source-control | cloud-storage
    REMOTEDATA_CACHE_DIR     Cache root (default: the platform cache directory)
    REMOTEDATA_REPO          Repository as <owner>/<repo> or <owner>/<repo>/<branch>
    REMOTEDATA_BRANCH        Branch to track (overrides the repository string)
    REMOTEDATA_BUCKET        Storage bucket name
    REMOTEDATA_TOKEN         Credential token (<keyId>:<applicationKey> for storage)
    REMOTEDATA_TIMEOUT_SECS  Request timeout in seconds (default: 30)
    RUST_LOG                 Log level (trace, debug, info, warn, error)

EXAMPLES:
    REMOTEDATA_SOURCE=source-control REMOTEDATA_REPO=acme/data \
        remotedata get README.md
"#
    );
}

/// Returns None when the invocation only asks for help
fn parse_args() -> Result<Option<Command>> {
    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        return Ok(None);
    }

    match args[1].as_str() {
        "get" => {
            let path = args
                .get(2)
                .ok_or_else(|| anyhow!("Usage: remotedata get <remote-path>"))?;
            Ok(Some(Command::Get { path: path.clone() }))
        }
        "remove" => {
            let path = args
                .get(2)
                .ok_or_else(|| anyhow!("Usage: remotedata remove <remote-path>"))?;
            Ok(Some(Command::Remove { path: path.clone() }))
        }
        "clear" => Ok(Some(Command::Clear)),
        "help" | "--help" | "-h" => Ok(None),
        other => {
            eprintln!("Unknown command: {}", other);
            Ok(None)
        }
    }
}

fn options_from_env() -> SourceOptions {
    SourceOptions {
        source: env::var("REMOTEDATA_SOURCE").ok(),
        cache_root: env::var("REMOTEDATA_CACHE_DIR").ok().map(PathBuf::from),
        repository: env::var("REMOTEDATA_REPO").ok(),
        branch: env::var("REMOTEDATA_BRANCH").ok(),
        bucket: env::var("REMOTEDATA_BUCKET").ok(),
        token: env::var("REMOTEDATA_TOKEN").ok(),
        request_timeout: env::var("REMOTEDATA_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_secs),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    let log_level = env::var("RUST_LOG")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(Level::INFO);
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let command = match parse_args() {
        Ok(Some(command)) => command,
        Ok(None) => {
            print_help();
            return Ok(());
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            print_help();
            std::process::exit(1);
        }
    };

    let config = options_from_env().resolve()?;
    let cache = RemoteDataCache::new(&config)?;

    match command {
        Command::Get { path } => {
            let local = cache.get(&path).await?;
            println!("{}", local.display());
        }
        Command::Remove { path } => {
            cache.remove(&path).await?;
            info!(path = %path, "Removed cached entry");
        }
        Command::Clear => {
            cache.clear().await?;
            info!("Cache cleared");
        }
    }

    Ok(())
}
