//! glidecache - offline cache manager for aeronautical glide-range charts.
//!
//! Mirrors chart configurations, map tiles and the app shell from a
//! chart server into local per-class cache stores, so the map client
//! keeps working with no connectivity. A background worker owns the
//! stores; the CLI drives it through the client/worker message
//! protocol.

mod classify;
mod client;
mod config;
mod net;
mod state;
mod store;
#[cfg(test)]
mod testutil;
mod tiles;
mod worker;

use std::io;

use anyhow::Result;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use client::{CacheClient, UpdateOutcome};
use config::Config;
use state::StateStore;
use worker::WorkerEvent;

/// Initialize the tracing subscriber for logging
fn init_tracing() {
    // Set up logging with environment-based filter
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(filter)
        .init();
}

fn print_usage() {
    eprintln!("Usage: glidecache <command>");
    eprintln!();
    eprintln!("Commands:");
    eprintln!("  init                   Write the config file with current values");
    eprintln!("  status [URL]           Show cache status; classify URL if given");
    eprintln!("  install                Precache the app shell and external resources");
    eprintln!("  cache-config [CONFIG]  Cache a configuration (default: active one)");
    eprintln!("  cache-tiles            Precache map tiles for the configured bounds");
    eprintln!("  update-app             Run the two-phase app update");
    eprintln!("  store-tracklog FILE [DATE]");
    eprintln!("                         Persist a recorded tracklog (JSON array of points)");
    eprintln!("  geolocation on|off     Toggle geolocation; off also disables navboxes");
    eprintln!("  reset-state            Clear saved state, keep caches");
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    init_tracing();

    let config = Config::load()?;
    let args: Vec<String> = std::env::args().collect();
    let command = args.get(1).map(String::as_str);

    match command {
        Some("init") => init(config),
        Some("status") => status(config, args.get(2).map(String::as_str)).await,
        Some("install") => install(config).await,
        Some("cache-config") => cache_config(config, args.get(2).map(String::as_str)).await,
        Some("cache-tiles") => cache_tiles(config).await,
        Some("update-app") => update_app(config).await,
        Some("store-tracklog") => {
            store_tracklog(config, args.get(2).map(String::as_str), args.get(3).map(String::as_str))
                .await
        }
        Some("geolocation") => geolocation(config, args.get(2).map(String::as_str)),
        Some("reset-state") => reset_state(config),
        _ => {
            print_usage();
            Ok(())
        }
    }
}

/// Warn about a corrupted active configuration before any command that
/// depends on it; the state store falls back to the defaults itself.
fn open_state(config: &Config) -> Result<StateStore> {
    let mut state = StateStore::open(&config.cache_root()?)?;
    if let Some(warning) = state.check_configuration_integrity()? {
        eprintln!("{}", warning);
    }
    Ok(state)
}

/// Echo worker progress events while a bulk operation runs.
fn spawn_event_printer(client: &CacheClient) -> tokio::task::JoinHandle<()> {
    let mut events = client.events();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                WorkerEvent::CacheStart { message }
                | WorkerEvent::CacheProgress { message, .. }
                | WorkerEvent::CacheError { message }
                | WorkerEvent::AppUpdateStart { message }
                | WorkerEvent::AppUpdateProgress { message, .. }
                | WorkerEvent::AppUpdateError { message }
                | WorkerEvent::LoadWarning { message, .. } => eprintln!("{}", message),
                _ => {}
            }
        }
    })
}

fn init(config: Config) -> Result<()> {
    config.save()?;
    println!("Configuration written; edit baseUrl to point at your chart server");
    Ok(())
}

async fn status(config: Config, url: Option<&str>) -> Result<()> {
    let mut state = StateStore::open(&config.cache_root()?)?;
    let client = CacheClient::start(config)?;

    if let Some(warning) = state.check_configuration_integrity()? {
        eprintln!("{}", warning);
    }
    println!("Active configuration: {}", state.state().current_config);

    let stores = &client.runtime().stores;
    println!("Cached entries:");
    for store in [
        &stores.core,
        &stores.tiles,
        &stores.geojson,
        &stores.dynamic,
        &stores.airspace,
        &stores.tracklog,
    ] {
        println!("  {:24} {}", store.name(), store.len()?);
    }
    println!("Active fetches: {}", client.runtime().active_fetch_count());

    let configs = client.cached_configurations()?;
    if configs.is_empty() {
        println!("No configurations cached for offline use");
    } else {
        println!("Configurations cached for offline use:");
        for c in &configs {
            println!("  {}", c);
        }
    }

    if let Some(url) = url {
        match client.runtime().effective_class(url) {
            Some(class) => println!("{} -> {:?}", url, class),
            None => println!("{} -> not intercepted", url),
        }
    }
    Ok(())
}

async fn install(config: Config) -> Result<()> {
    let client = CacheClient::start(config)?;
    let cached = client.precache_install().await?;
    println!("Precached {} install resources", cached);
    Ok(())
}

async fn cache_config(config: Config, configuration: Option<&str>) -> Result<()> {
    let state = open_state(&config)?;
    let configuration = configuration
        .map(str::to_string)
        .unwrap_or_else(|| state.state().current_config.clone());

    let client = CacheClient::start(config)?;
    let printer = spawn_event_printer(&client);
    let summary = client.cache_configuration(&configuration).await?;
    printer.abort();

    if summary.timed_out {
        println!(
            "Timed out waiting for completion; the worker may still be caching {}",
            configuration
        );
    } else {
        println!(
            "Successfully cached {} of {} files for {}",
            summary.completed, summary.total, configuration
        );
        if !summary.errors.is_empty() {
            println!("{} files failed; re-run to retry them", summary.errors.len());
        }
    }
    info!(configuration, completed = summary.completed, "cache-config finished");
    Ok(())
}

async fn cache_tiles(config: Config) -> Result<()> {
    let client = CacheClient::start(config)?;
    let printer = spawn_event_printer(&client);
    let summary = client.cache_tiles().await?;
    printer.abort();

    if summary.timed_out {
        println!(
            "Timed out after {} of {} tiles; the worker may still be caching the rest",
            summary.completed, summary.planned
        );
    } else {
        println!(
            "Tile caching finished ({} of {} tiles reported)",
            summary.completed, summary.planned
        );
    }
    Ok(())
}

async fn update_app(config: Config) -> Result<()> {
    let client = CacheClient::start(config)?;
    let printer = spawn_event_printer(&client);
    let outcome = client.update_app().await?;
    printer.abort();

    match outcome {
        UpdateOutcome::Updated {
            files,
            needs_reload,
        } => {
            println!("Successfully updated {} app files", files);
            if needs_reload {
                println!("Restart the app to load the updated files");
            }
        }
        UpdateOutcome::Failed { errors } => {
            for error in &errors {
                eprintln!("{}", error);
            }
            anyhow::bail!("App update failed");
        }
        UpdateOutcome::TimedOut => {
            anyhow::bail!("Timed out waiting for the app update to finish");
        }
    }
    Ok(())
}

async fn store_tracklog(config: Config, file: Option<&str>, date: Option<&str>) -> Result<()> {
    let Some(file) = file else {
        anyhow::bail!("store-tracklog requires a tracklog file");
    };
    let contents = std::fs::read_to_string(file)?;
    let points: Vec<state::TrackPoint> = serde_json::from_str(&contents)?;
    let date = date
        .map(str::to_string)
        .unwrap_or_else(|| chrono::Utc::now().format("%Y-%m-%d").to_string());

    let mut state = StateStore::open(&config.cache_root()?)?;
    let client = CacheClient::start(config)?;
    client.store_tracklog(points.clone(), &date).await?;

    // The worker persists asynchronously; wait for the entry before exiting
    let key = format!("tracklog-{}", date);
    for _ in 0..100 {
        if client.runtime().stores.tracklog.contains(&key) {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    if !client.runtime().stores.tracklog.contains(&key) {
        anyhow::bail!("Timed out waiting for the tracklog to persist");
    }

    state.mutate(state::StatePatch {
        tracklog: Some(points),
        last_tracklog_date: Some(date.clone()),
        ..state::StatePatch::default()
    })?;
    println!("Stored tracklog for {}", date);
    Ok(())
}

fn geolocation(config: Config, setting: Option<&str>) -> Result<()> {
    let mut state = StateStore::open(&config.cache_root()?)?;
    match setting {
        Some("on") => {
            state.mutate(state::StatePatch {
                geolocation_enabled: Some(true),
                ..state::StatePatch::default()
            })?;
            println!("Geolocation enabled");
        }
        Some("off") => {
            state.apply_geolocation_permission(false)?;
            println!("Geolocation disabled (navboxes disabled with it)");
        }
        _ => anyhow::bail!("geolocation requires on or off"),
    }
    Ok(())
}

fn reset_state(config: Config) -> Result<()> {
    let mut state = StateStore::open(&config.cache_root()?)?;
    state.reset()?;
    println!(
        "Saved state cleared; active configuration reset to {}",
        config::default_configuration()
    );
    Ok(())
}
