//! staticreq - serve remote JSON cache-first from the command line.
//!
//! Usage:
//!   staticreq [--offline] get <url>      cached value now, refreshed value if it changed
//!   staticreq [--offline] fetch <url>    network first, cache on failure
//!   staticreq cached <url>               cache only
//!
//! Set STATICREQ_CACHE_DIR to override the cache location.

use std::io;
use std::path::PathBuf;

use anyhow::{bail, Result};
use serde_json::Value;
use staticreq_core::{
    Config, HttpJsonRequest, HttpParams, LifecycleBus, RequestHandle, StaticRequestManager,
};
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const USAGE: &str = "usage: staticreq [--offline] <get|fetch|cached> <url>";

/// Environment variable overriding the configured cache directory
const CACHE_DIR_ENV: &str = "STATICREQ_CACHE_DIR";

/// Initialize the tracing subscriber for logging
fn init_tracing() {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(filter)
        .init();
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Get,
    Fetch,
    Cached,
}

struct Args {
    command: Command,
    url: String,
    offline: bool,
}

fn parse_args(args: &[String]) -> Result<Args> {
    let mut offline = false;
    let mut rest = Vec::new();
    for arg in args {
        match arg.as_str() {
            "--offline" => offline = true,
            _ => rest.push(arg.as_str()),
        }
    }

    let (command, url) = match rest.as_slice() {
        [command, url] => (*command, *url),
        _ => bail!(USAGE),
    };

    let command = match command {
        "get" => Command::Get,
        "fetch" => Command::Fetch,
        "cached" => Command::Cached,
        other => bail!("unknown command '{}'\n{}", other, USAGE),
    };

    Ok(Args {
        command,
        url: url.to_string(),
        offline,
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    init_tracing();

    let argv: Vec<String> = std::env::args().skip(1).collect();
    let args = parse_args(&argv)?;

    let mut config = Config::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "Failed to load config, using defaults");
        Config::default()
    });
    if let Ok(dir) = std::env::var(CACHE_DIR_ENV) {
        config.cache_dir = Some(PathBuf::from(dir));
    }
    if args.offline {
        config.offline_mode = true;
    }

    let manager = StaticRequestManager::from_config(&config, LifecycleBus::new())?;
    let params = HttpParams::new(args.url.clone());
    info!(url = %args.url, command = ?args.command, "staticreq starting");

    if args.command == Command::Cached {
        match manager.get_cache_only::<HttpJsonRequest>(&params) {
            Some(value) => print_value("cached", &value)?,
            None => eprintln!("No cached data for {}", args.url),
        }
        return Ok(());
    }

    let (tx, mut rx) = mpsc::unbounded_channel::<Value>();
    let on_done = move |value: Value| {
        let _ = tx.send(value);
    };

    let request = HttpJsonRequest::new()?;
    let handle = match args.command {
        Command::Get => manager.get_data(request, params, on_done),
        _ => manager.get_data_ignore_cache(request, params, on_done),
    };

    let delivered = report(&mut rx, handle.as_ref(), args.command).await?;
    if delivered == 0 {
        eprintln!("No data available for {}", args.url);
    }
    Ok(())
}

/// Prints every delivery for one retrieval and returns how many there were.
async fn report(
    rx: &mut mpsc::UnboundedReceiver<Value>,
    handle: Option<&RequestHandle>,
    command: Command,
) -> Result<usize> {
    let mut delivered = 0;

    // Synchronous deliveries are already queued
    while let Ok(value) = rx.try_recv() {
        let tag = if command == Command::Get { "cached" } else { "fetched" };
        print_value(tag, &value)?;
        delivered += 1;
    }

    if let Some(handle) = handle {
        handle.completed().await;
        while let Ok(value) = rx.try_recv() {
            let tag = if command == Command::Get { "updated" } else { "fetched" };
            print_value(tag, &value)?;
            delivered += 1;
        }
    }

    Ok(delivered)
}

fn print_value(tag: &str, value: &Value) -> Result<()> {
    println!("[{}] {}", tag, serde_json::to_string_pretty(value)?);
    Ok(())
}
