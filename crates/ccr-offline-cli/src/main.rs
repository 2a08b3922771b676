//! ccr-offline - operator tool for the CCR offline store.
//!
//! Inspects and drains the offline queue and cache that the mobile client
//! keeps on disk, using the same core the app links against.

mod commands;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use ccr_offline_core::{FileStore, HttpBackend, OfflineConfig, OfflineContext, SystemClock};

// ============================================================================
// Constants
// ============================================================================

/// Used when `CCR_BACKEND_URL` is not set
const DEFAULT_BACKEND_URL: &str = "http://localhost:8000/api";

/// Log file name prefix for the rolling appender
const LOG_FILE_PREFIX: &str = "ccr-offline.log";

const USAGE: &str = "\
Usage: ccr-offline [--config <path>] [--log-dir <dir>] <command>

Commands:
  status                   Connectivity, pending count and last sync
  queue                    List queued mutations in replay order
  enqueue <action> <json>  Queue a mutation for the next sync
  sync                     Replay the queue against the backend now
  get <path>               Fetch a resource, falling back to the cache
  cache-info               Cache entry counts and size
  cache-clear              Remove every cache entry
  purge                    Remove expired cache entries
  queue-clear              Drop every queued mutation

Environment:
  CCR_BACKEND_URL          API base URL
  CCR_TOKEN                Bearer token for the API
  RUST_LOG                 Log filter (default: warn)";

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Status,
    Queue,
    Enqueue { action: String, payload: serde_json::Value },
    Sync,
    Get { path: String },
    CacheInfo,
    CacheClear,
    Purge,
    QueueClear,
}

#[derive(Debug, Default, PartialEq)]
struct Options {
    config: Option<PathBuf>,
    log_dir: Option<PathBuf>,
}

fn parse_args(args: &[String]) -> Result<(Options, Command)> {
    let mut options = Options::default();
    let mut rest = Vec::new();

    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--config" => {
                let path = iter.next().context("--config needs a path")?;
                options.config = Some(PathBuf::from(path));
            }
            "--log-dir" => {
                let dir = iter.next().context("--log-dir needs a directory")?;
                options.log_dir = Some(PathBuf::from(dir));
            }
            _ => rest.push(arg.as_str()),
        }
    }

    let command = match rest.as_slice() {
        ["status"] => Command::Status,
        ["queue"] => Command::Queue,
        ["enqueue", action, payload] => Command::Enqueue {
            action: action.to_string(),
            payload: serde_json::from_str(payload)
                .with_context(|| format!("Payload is not valid JSON: {}", payload))?,
        },
        ["sync"] => Command::Sync,
        ["get", path] => Command::Get {
            path: path.to_string(),
        },
        ["cache-info"] => Command::CacheInfo,
        ["cache-clear"] => Command::CacheClear,
        ["purge"] => Command::Purge,
        ["queue-clear"] => Command::QueueClear,
        [] => bail!("No command given\n\n{}", USAGE),
        other => bail!("Unknown command: {}\n\n{}", other.join(" "), USAGE),
    };
    Ok((options, command))
}

/// Initialize the tracing subscriber for logging.
/// The returned guard flushes the file appender on drop.
fn init_tracing(log_dir: Option<&PathBuf>) -> Option<WorkerGuard> {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(fmt::layer().with_writer(writer).with_ansi(false)),
                Some(guard),
            )
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(file_layer)
        .with(filter)
        .init();

    guard
}

fn build_backend() -> Result<HttpBackend> {
    let base_url =
        std::env::var("CCR_BACKEND_URL").unwrap_or_else(|_| DEFAULT_BACKEND_URL.to_string());
    let backend = HttpBackend::new(base_url).context("Failed to build HTTP client")?;
    Ok(match std::env::var("CCR_TOKEN") {
        Ok(token) if !token.is_empty() => backend.with_token(token),
        _ => backend,
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.iter().any(|a| a == "-h" || a == "--help") {
        println!("{}", USAGE);
        return Ok(());
    }
    let (options, command) = parse_args(&args)?;

    let _guard = init_tracing(options.log_dir.as_ref());
    info!(?command, "ccr-offline starting");

    let config = match options.config {
        Some(ref path) => OfflineConfig::load_from(path)?,
        None => OfflineConfig::load()?,
    };
    let storage = FileStore::open(config.data_dir()?).await?;
    let backend = Arc::new(build_backend()?);

    let ctx = OfflineContext::build(config, Arc::new(storage), backend.clone(), Arc::new(SystemClock))
        .await?;

    let result = commands::run(&ctx, &backend, command).await;
    ctx.shutdown();
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_simple_commands() {
        let (_, cmd) = parse_args(&args(&["status"])).unwrap();
        assert_eq!(cmd, Command::Status);
        let (_, cmd) = parse_args(&args(&["cache-clear"])).unwrap();
        assert_eq!(cmd, Command::CacheClear);
    }

    #[test]
    fn test_parse_enqueue_payload() {
        let (_, cmd) =
            parse_args(&args(&["enqueue", "createDonation", r#"{"amount":1000}"#])).unwrap();
        assert_eq!(
            cmd,
            Command::Enqueue {
                action: "createDonation".to_string(),
                payload: json!({"amount": 1000}),
            }
        );
    }

    #[test]
    fn test_parse_flags_anywhere() {
        let (options, cmd) =
            parse_args(&args(&["--log-dir", "/tmp/logs", "sync", "--config", "c.json"])).unwrap();
        assert_eq!(cmd, Command::Sync);
        assert_eq!(options.log_dir, Some(PathBuf::from("/tmp/logs")));
        assert_eq!(options.config, Some(PathBuf::from("c.json")));
    }

    #[test]
    fn test_parse_errors() {
        assert!(parse_args(&args(&[])).is_err());
        assert!(parse_args(&args(&["frobnicate"])).is_err());
        assert!(parse_args(&args(&["enqueue", "logPrayer", "{not json"])).is_err());
        assert!(parse_args(&args(&["--config"])).is_err());
    }
}
