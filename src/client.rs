//! Client-side orchestration over the worker message protocol.
//!
//! `CacheClient` owns the command channel to the worker task and wraps
//! the fire-and-forget protocol into awaitable operations with
//! client-side watchdog timeouts. The watchdogs only stop the client
//! waiting; the worker-side job always runs to completion and reports
//! through events regardless.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

use crate::config::{self, Config};
use crate::state::TrackPoint;
use crate::tiles::plan_tiles;
use crate::worker::{ClientMessage, WorkerEvent, WorkerRuntime};

/// Command channel depth between client and worker.
const COMMAND_CHANNEL_CAPACITY: usize = 32;

/// Result of an app update interaction.
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateOutcome {
    /// All files committed; the app should reload to pick them up.
    Updated { files: usize, needs_reload: bool },
    /// The update aborted; the installed app is unchanged.
    Failed { errors: Vec<String> },
    /// No terminal event within the watchdog window.
    TimedOut,
}

/// Result of a bulk configuration caching run.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheSummary {
    pub completed: usize,
    pub total: usize,
    pub errors: Vec<String>,
    /// The client stopped waiting; counts cover events seen so far.
    pub timed_out: bool,
}

/// Result of a tile precache run.
#[derive(Debug, Clone, PartialEq)]
pub struct TileCacheSummary {
    pub planned: usize,
    /// Tiles reported finished by the worker, counting tolerated
    /// failures and already-cached tiles.
    pub completed: usize,
    pub timed_out: bool,
}

pub struct CacheClient {
    runtime: Arc<WorkerRuntime>,
    commands: mpsc::Sender<ClientMessage>,
    config: Config,
}

impl CacheClient {
    /// Build the worker runtime and spawn its message loop.
    pub fn start(config: Config) -> Result<Self> {
        let cache_root = config.cache_root()?;
        let runtime = Arc::new(WorkerRuntime::new(&config, &cache_root)?);
        let (tx, rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        tokio::spawn(Arc::clone(&runtime).run(rx));
        Ok(Self {
            runtime,
            commands: tx,
            config,
        })
    }

    pub fn runtime(&self) -> &Arc<WorkerRuntime> {
        &self.runtime
    }

    pub fn events(&self) -> broadcast::Receiver<WorkerEvent> {
        self.runtime.subscribe()
    }

    async fn send(&self, message: ClientMessage) -> Result<()> {
        self.commands
            .send(message)
            .await
            .context("Worker command channel closed")
    }

    /// Fetch the current core-file manifest and run the two-phase
    /// updater, waiting up to the update watchdog for a terminal event.
    /// The manifest request is cache-busted so a stale intermediary can
    /// never pin the app to an old file list.
    pub async fn update_app(&self) -> Result<UpdateOutcome> {
        let manifest_url = format!(
            "{}?v={}",
            self.config.manifest_url(),
            Utc::now().timestamp_millis()
        );
        let files: Vec<String> = self
            .runtime
            .fetcher
            .get_json(&manifest_url)
            .await
            .context("Failed to fetch app file manifest")?;

        let total = files.len();
        let mut events = self.events();
        self.send(ClientMessage::UpdateAppFiles { files }).await?;

        let deadline = Duration::from_secs(config::UPDATE_TIMEOUT_SECS);
        let mut errors = Vec::new();
        let outcome = tokio::time::timeout(deadline, async {
            loop {
                match events.recv().await {
                    Ok(WorkerEvent::AppUpdateComplete {
                        needs_reload,
                        message,
                    }) => {
                        debug!(message, "App update complete");
                        return UpdateOutcome::Updated {
                            files: total,
                            needs_reload,
                        };
                    }
                    Ok(WorkerEvent::AppUpdateError { message }) => errors.push(message),
                    Ok(WorkerEvent::AppUpdateFailed { message }) => {
                        errors.push(message);
                        return UpdateOutcome::Failed {
                            errors: std::mem::take(&mut errors),
                        };
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(missed = n, "Event stream lagged during update");
                    }
                    Err(broadcast::error::RecvError::Closed) => return UpdateOutcome::TimedOut,
                }
            }
        })
        .await
        .unwrap_or(UpdateOutcome::TimedOut);

        Ok(outcome)
    }

    /// Derive the file list for a configuration and hand it to the bulk
    /// populator. The list is the main chart overlay, its sectors
    /// companion, and every per-site file named by the main overlay's
    /// Point features.
    pub async fn cache_configuration(&self, configuration: &str) -> Result<CacheSummary> {
        if !config::is_valid_configuration(configuration) {
            bail!("Invalid configuration path: {}", configuration);
        }
        let files = self.configuration_file_list(configuration).await?;

        let mut events = self.events();
        self.send(ClientMessage::CacheFiles {
            files,
            config: configuration.to_string(),
        })
        .await?;

        let deadline = Duration::from_secs(config::CACHE_TIMEOUT_SECS);
        let mut summary = CacheSummary {
            completed: 0,
            total: 0,
            errors: Vec::new(),
            timed_out: false,
        };
        let finished = tokio::time::timeout(deadline, async {
            loop {
                match events.recv().await {
                    Ok(WorkerEvent::CacheError { message }) => summary.errors.push(message),
                    Ok(WorkerEvent::CacheComplete {
                        completed, total, ..
                    }) => {
                        summary.completed = completed;
                        summary.total = total;
                        return;
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(missed = n, "Event stream lagged during caching");
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        })
        .await;
        summary.timed_out = finished.is_err();
        Ok(summary)
    }

    /// The files that make a configuration fully available offline.
    async fn configuration_file_list(&self, configuration: &str) -> Result<Vec<String>> {
        let (policy, params) = configuration
            .split_once('/')
            .context("Configuration path has no parameters")?;
        // The overlay file names carry only the first three parameter
        // groups; the fourth selects the sector altitude band.
        let prefix: Vec<&str> = params.split('-').take(3).collect();
        let prefix = prefix.join("-");

        let main_file = format!("{}/aa_{}_{}.geojson", configuration, policy, prefix);
        let sectors_file = format!("{}/aa_{}_{}_sectors1.geojson", configuration, policy, prefix);
        let mut files = vec![main_file.clone(), sectors_file];

        // The main overlay's Point features name the per-site detail
        // files a user can open while offline.
        let main_url = self.config.resolve(&main_file);
        let overlay = match self.runtime.fetch(&main_url).await {
            Some(response) if response.is_success() => {
                response.json::<serde_json::Value>().with_context(|| {
                    format!("Main overlay is not valid GeoJSON: {}", main_file)
                })?
            }
            _ => bail!("Failed to load main overlay: {}", main_file),
        };

        if let Some(features) = overlay["features"].as_array() {
            for feature in features {
                if feature["geometry"]["type"].as_str() != Some("Point") {
                    continue;
                }
                if let Some(filename) = feature["properties"]["filename"].as_str() {
                    files.push(format!("{}/{}", configuration, filename));
                }
            }
        }
        Ok(files)
    }

    /// Plan the tile working set for the configured bounds and zoom
    /// range and hand it to the worker.
    pub async fn cache_tiles(&self) -> Result<TileCacheSummary> {
        let settings = &self.config.tile_cache;
        let tiles = plan_tiles(
            &self.config.map_bounds,
            settings.min_zoom,
            settings.max_zoom,
        );
        let planned = tiles.len();

        let mut events = self.events();
        self.send(ClientMessage::CacheTiles {
            tiles,
            base_path: settings.base_path.clone(),
        })
        .await?;

        // One completion event arrives per tile; the run is done once
        // every planned tile has reported.
        let mut completed = 0;
        let mut timed_out = false;
        if planned > 0 {
            let deadline = Duration::from_secs(config::CACHE_TIMEOUT_SECS);
            let finished = tokio::time::timeout(deadline, async {
                while completed < planned {
                    match events.recv().await {
                        Ok(WorkerEvent::CacheTileComplete) => completed += 1,
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            // A tile run only broadcasts completion
                            // events, so lagged events are completions
                            warn!(missed = n, "Event stream lagged during tile caching");
                            completed += n as usize;
                        }
                        Err(broadcast::error::RecvError::Closed) => return,
                    }
                }
            })
            .await;
            timed_out = finished.is_err();
        }

        Ok(TileCacheSummary {
            planned,
            completed: completed.min(planned),
            timed_out,
        })
    }

    pub async fn store_tracklog(&self, tracklog: Vec<TrackPoint>, date: &str) -> Result<()> {
        self.send(ClientMessage::StoreTracklog {
            tracklog,
            date: date.to_string(),
        })
        .await
    }

    /// Configurations with files in the dynamic store, i.e. prepared
    /// for offline use. Derived from store keys, deduplicated.
    pub fn cached_configurations(&self) -> Result<Vec<String>> {
        let base = format!("{}/", self.config.base_url.trim_end_matches('/'));
        let mut found = BTreeSet::new();
        for key in self.runtime.dynamic_keys()? {
            let Some(rest) = key.strip_prefix(&base) else {
                continue;
            };
            let mut segments = rest.split('/');
            let (Some(policy), Some(params)) = (segments.next(), segments.next()) else {
                continue;
            };
            let candidate = format!("{}/{}", policy, params);
            if config::is_valid_configuration(&candidate) {
                found.insert(candidate);
            }
        }
        Ok(found.into_iter().collect())
    }

    /// Seed the core store with the app shell and the external
    /// resources. Best-effort; returns how many resources are cached.
    pub async fn precache_install(&self) -> Result<usize> {
        let mut urls: Vec<String> = match self
            .runtime
            .fetcher
            .get_json::<Vec<String>>(&self.config.manifest_url())
            .await
        {
            Ok(files) => files.iter().map(|f| self.config.resolve(f)).collect(),
            Err(e) => {
                warn!(error = %e, "Manifest unavailable, precaching external resources only");
                Vec::new()
            }
        };
        urls.extend(config::EXTERNAL_RESOURCES.iter().map(|u| u.to_string()));
        Ok(self.runtime.precache(&urls).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::CachedResponse;
    use crate::testutil::TestServer;
    use tempfile::TempDir;

    fn client_with(config: Config, root: &TempDir) -> CacheClient {
        let runtime =
            Arc::new(WorkerRuntime::new(&config, root.path()).expect("runtime"));
        let (tx, rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        tokio::spawn(Arc::clone(&runtime).run(rx));
        CacheClient {
            runtime,
            commands: tx,
            config,
        }
    }

    fn client_for(base_url: &str, root: &TempDir) -> CacheClient {
        let config = Config {
            base_url: base_url.to_string(),
            ..Config::default()
        };
        client_with(config, root)
    }

    fn overlay_with_sites(filenames: &[&str]) -> Vec<u8> {
        let features: Vec<serde_json::Value> = filenames
            .iter()
            .map(|f| {
                serde_json::json!({
                    "type": "Feature",
                    "geometry": {"type": "Point", "coordinates": [8.5, 46.5]},
                    "properties": {"filename": f}
                })
            })
            .collect();
        serde_json::to_vec(&serde_json::json!({
            "type": "FeatureCollection",
            "features": features
        }))
        .expect("overlay json")
    }

    #[tokio::test]
    async fn test_cache_configuration_end_to_end() {
        let overlay = overlay_with_sites(&["site_a.geojson", "site_b.geojson"]);
        let server = TestServer::start(move |path| {
            if path.ends_with(".geojson") {
                if path.contains("aa_alps_10-100-250.geojson") {
                    Some((200, "application/json", overlay.clone()))
                } else {
                    Some((200, "application/json", b"{}".to_vec()))
                }
            } else {
                None
            }
        })
        .await;
        let root = TempDir::new().expect("tempdir");
        let client = client_for(&format!("{}/app", server.url()), &root);

        let summary = client
            .cache_configuration("alps/10-100-250-4200")
            .await
            .expect("summary");

        // Main + sectors + two site files
        assert_eq!(summary.total, 4);
        assert_eq!(summary.completed, 4);
        assert!(summary.errors.is_empty());
        assert!(!summary.timed_out);

        assert_eq!(
            client.cached_configurations().expect("configs"),
            vec!["alps/10-100-250-4200".to_string()]
        );
    }

    #[tokio::test]
    async fn test_cache_configuration_rejects_invalid_path() {
        let root = TempDir::new().expect("tempdir");
        let client = client_for("http://127.0.0.1:9/app", &root);
        assert!(client.cache_configuration("alps/10-100").await.is_err());
    }

    #[tokio::test]
    async fn test_update_app_reports_failure() {
        let server = TestServer::start(|path| {
            if path.starts_with("/app/core-files.json") {
                Some((
                    200,
                    "application/json",
                    br#"["index.html","missing.js"]"#.to_vec(),
                ))
            } else if path == "/app/index.html" {
                Some((200, "text/html", b"<html>".to_vec()))
            } else {
                Some((404, "text/plain", b"gone".to_vec()))
            }
        })
        .await;
        let root = TempDir::new().expect("tempdir");
        let client = client_for(&format!("{}/app", server.url()), &root);

        let outcome = client.update_app().await.expect("outcome");
        let UpdateOutcome::Failed { errors } = outcome else {
            panic!("expected failed outcome, got {:?}", outcome);
        };
        assert!(errors.iter().any(|e| e.contains("missing.js")));
        assert!(client.runtime.stores.core.is_empty().expect("is_empty"));
    }

    #[tokio::test]
    async fn test_update_app_success_needs_reload() {
        let server = TestServer::start(|path| {
            if path.starts_with("/app/core-files.json") {
                Some((200, "application/json", br#"["index.html"]"#.to_vec()))
            } else if path == "/app/index.html" {
                Some((200, "text/html", b"<html>".to_vec()))
            } else {
                None
            }
        })
        .await;
        let root = TempDir::new().expect("tempdir");
        let client = client_for(&format!("{}/app", server.url()), &root);

        let outcome = client.update_app().await.expect("outcome");
        assert!(matches!(
            outcome,
            UpdateOutcome::Updated {
                needs_reload: true,
                ..
            }
        ));
    }

    fn small_tile_config(base_url: &str) -> Config {
        Config {
            base_url: base_url.to_string(),
            map_bounds: crate::tiles::BoundingBox([[8.5, 46.5], [8.6, 46.6]]),
            tile_cache: config::TileCacheSettings {
                min_zoom: 4,
                max_zoom: 6,
                base_path: "tiles".to_string(),
            },
            ..Config::default()
        }
    }

    #[tokio::test]
    async fn test_cache_tiles_waits_for_every_tile() {
        let server = TestServer::start(|path| {
            if path.ends_with(".png") {
                Some((200, "image/png", b"tile".to_vec()))
            } else {
                None
            }
        })
        .await;
        let root = TempDir::new().expect("tempdir");
        let client = client_with(small_tile_config(&format!("{}/app", server.url())), &root);

        let summary = client.cache_tiles().await.expect("summary");
        assert!(summary.planned >= 3);
        assert_eq!(summary.completed, summary.planned);
        assert!(!summary.timed_out);
        assert_eq!(
            client.runtime.stores.tiles.len().expect("len"),
            summary.planned
        );
    }

    #[tokio::test]
    async fn test_cache_tiles_counts_tolerated_failures() {
        let root = TempDir::new().expect("tempdir");
        // Connection-refused base: every tile fails, every tile still
        // reports completion
        let client = client_with(small_tile_config("http://127.0.0.1:9/app"), &root);

        let summary = client.cache_tiles().await.expect("summary");
        assert_eq!(summary.completed, summary.planned);
        assert!(!summary.timed_out);
        assert!(client.runtime.stores.tiles.is_empty().expect("is_empty"));
    }

    #[tokio::test]
    async fn test_cached_configurations_ignores_foreign_keys() {
        let root = TempDir::new().expect("tempdir");
        let client = client_for("http://127.0.0.1:9/app", &root);
        let entry = CachedResponse::ok("application/json", b"{}".to_vec());

        let store = &client.runtime.stores.dynamic;
        store
            .put("http://127.0.0.1:9/app/alps/10-100-250-4200/a.geojson", &entry)
            .expect("put");
        store
            .put("http://127.0.0.1:9/app/not-a-config.geojson", &entry)
            .expect("put");
        store
            .put("https://elsewhere.example.org/alps/10-100-250-4200/b.geojson", &entry)
            .expect("put");

        assert_eq!(
            client.cached_configurations().expect("configs"),
            vec!["alps/10-100-250-4200".to_string()]
        );
    }

    #[tokio::test]
    async fn test_store_tracklog_round_trips_through_worker() {
        let root = TempDir::new().expect("tempdir");
        let client = client_for("http://127.0.0.1:9/app", &root);
        let points = vec![TrackPoint {
            lon: 8.5,
            lat: 46.5,
            altitude: None,
            timestamp: 1_770_000_000_000,
        }];

        client
            .store_tracklog(points.clone(), "2026-08-30")
            .await
            .expect("send");

        // The worker task persists asynchronously
        for _ in 0..50 {
            if client.runtime.stores.tracklog.contains("tracklog-2026-08-30") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let entry = client
            .runtime
            .stores
            .tracklog
            .get("tracklog-2026-08-30")
            .expect("get")
            .expect("entry");
        let back: Vec<TrackPoint> = entry.json().expect("parse");
        assert_eq!(back, points);
    }
}
