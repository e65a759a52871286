use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::{broadcast, mpsc, OnceCell};
use tracing::{debug, error, warn};

use crate::classify::{Classifier, ResourceClass};
use crate::config::Config;
use crate::net::HttpFetcher;
use crate::state::TrackPoint;
use crate::store::{
    clean_stale_generations, CacheGeneration, CacheStore, CachedResponse, StoreClass,
};

use super::messages::{ClientMessage, WorkerEvent};
use super::{populate, update};

/// A fetch still unresolved after this long triggers a non-terminal
/// warning broadcast; the fetch itself keeps running.
const SLOW_FETCH_WARNING: Duration = Duration::from_secs(5);

/// Event broadcast channel capacity. Slow subscribers lag rather than
/// block the worker.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Glyph shard ranges prefetched on the first request for a font
/// family, amortizing future glyph requests.
const GLYPH_RANGES: &[&str] = &["0-255", "256-511"];

/// The worker's per-class cache stores. Opening them also retires any
/// stale store generations left by a previous version.
pub(crate) struct Stores {
    pub core: CacheStore,
    pub tiles: CacheStore,
    pub geojson: CacheStore,
    pub dynamic: CacheStore,
    pub airspace: CacheStore,
    pub tracklog: CacheStore,
}

impl Stores {
    fn open(root: &Path) -> Result<Self> {
        std::fs::create_dir_all(root)
            .with_context(|| format!("Failed to create cache root: {}", root.display()))?;
        clean_stale_generations(root)?;
        let open = |class| CacheStore::open(root, CacheGeneration::current(class));
        Ok(Self {
            core: open(StoreClass::CoreAsset)?,
            tiles: open(StoreClass::Tile)?,
            geojson: open(StoreClass::GeojsonStatic)?,
            dynamic: open(StoreClass::GeojsonDynamic)?,
            airspace: open(StoreClass::Airspace)?,
            tracklog: open(StoreClass::Tracklog)?,
        })
    }
}

/// All worker-side state, constructed once at startup and shared with
/// every handler. Nothing here is assumed to survive a restart except
/// the store contents; the single-flight map is a per-lifetime
/// optimization only.
pub struct WorkerRuntime {
    pub(crate) stores: Stores,
    pub(crate) fetcher: HttpFetcher,
    classifier: Classifier,
    base_url: String,
    events: broadcast::Sender<WorkerEvent>,
    active_fetches: AtomicUsize,
    /// Deduplicates concurrent identical GeoJSON network fetches
    /// within one worker lifetime.
    inflight_geojson: Mutex<HashMap<String, Arc<OnceCell<CachedResponse>>>>,
}

impl WorkerRuntime {
    pub fn new(config: &Config, cache_root: &Path) -> Result<Self> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Ok(Self {
            stores: Stores::open(cache_root)?,
            fetcher: HttpFetcher::new().context("Failed to build HTTP fetcher")?,
            classifier: Classifier::for_base_url(&config.base_url)?,
            base_url: config.base_url.clone(),
            events,
            active_fetches: AtomicUsize::new(0),
            inflight_geojson: Mutex::new(HashMap::new()),
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WorkerEvent> {
        self.events.subscribe()
    }

    /// Number of GeoJSON fetches currently on the network path. Drives
    /// the client's loading indicator.
    pub fn active_fetch_count(&self) -> usize {
        self.active_fetches.load(Ordering::Relaxed)
    }

    pub(crate) fn emit(&self, event: WorkerEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    pub(crate) fn resolve(&self, relative: &str) -> String {
        let rel = relative.trim_start_matches("./").trim_start_matches('/');
        format!("{}/{}", self.base_url.trim_end_matches('/'), rel)
    }

    /// The effective class of a URL right now: static GeoJSON upgrades
    /// to dynamic when the dynamic store holds the key. Used by
    /// cache-status queries alongside the fetch path.
    pub fn effective_class(&self, url: &str) -> Option<ResourceClass> {
        match self.classifier.classify(url)? {
            ResourceClass::GeojsonStatic if self.stores.dynamic.contains(url) => {
                Some(ResourceClass::GeojsonDynamic)
            }
            class => Some(class),
        }
    }

    /// Intercept a GET request. Returns `None` when the URL is out of
    /// scope (callers fall through to their own networking). Never
    /// fails: errors degrade to an empty FeatureCollection for GeoJSON
    /// classes and a 404 placeholder otherwise.
    pub async fn fetch(&self, url: &str) -> Option<CachedResponse> {
        let class = self.classifier.classify(url)?;
        let is_geojson = class.is_geojson();

        if is_geojson {
            self.active_fetches.fetch_add(1, Ordering::Relaxed);
            self.emit(WorkerEvent::FetchStart {
                url: url.to_string(),
            });
        }

        let warning = {
            let events = self.events.clone();
            let url = url.to_string();
            tokio::spawn(async move {
                tokio::time::sleep(SLOW_FETCH_WARNING).await;
                let _ = events.send(WorkerEvent::LoadWarning {
                    message: format!(
                        "Warning: \"{}\" is taking too long to load. \
                         It may not be cached or network is slow.",
                        url
                    ),
                    url,
                });
            })
        };

        let result = self.dispatch(class, url).await;
        warning.abort();

        if is_geojson {
            self.active_fetches.fetch_sub(1, Ordering::Relaxed);
            self.emit(WorkerEvent::FetchComplete {
                url: url.to_string(),
            });
        }

        match result {
            Ok(response) => Some(response),
            Err(e) => {
                self.emit(WorkerEvent::LoadError {
                    url: url.to_string(),
                    message: format!("Error: Failed to load \"{}\" - {}", url, e),
                });
                if is_geojson {
                    Some(CachedResponse::empty_feature_collection())
                } else {
                    Some(CachedResponse::placeholder_not_found(
                        "Resource not available offline",
                    ))
                }
            }
        }
    }

    async fn dispatch(&self, class: ResourceClass, url: &str) -> Result<CachedResponse> {
        match class {
            ResourceClass::Tile => self.handle_tile(url).await,
            ResourceClass::GeojsonAirspace => self.handle_airspace(url).await,
            ResourceClass::GeojsonStatic | ResourceClass::GeojsonDynamic => {
                self.handle_geojson(url).await
            }
            ResourceClass::FontGlyph => self.handle_glyph(url).await,
            ResourceClass::CoreAsset => self.handle_core(url).await,
        }
    }

    async fn handle_core(&self, url: &str) -> Result<CachedResponse> {
        if let Some(hit) = self.stores.core.get(url)? {
            return Ok(hit);
        }
        let response = self.fetcher.get(url).await?;
        if response.is_success() {
            self.stores.core.put(url, &response)?;
        }
        Ok(response)
    }

    /// Tiles are allowed to be visually missing: a failed fetch yields
    /// a synthesized 404 placeholder, not an error.
    async fn handle_tile(&self, url: &str) -> Result<CachedResponse> {
        if let Some(hit) = self.stores.tiles.get(url)? {
            return Ok(hit);
        }
        match self.fetcher.get(url).await {
            Ok(response) => {
                if response.is_success() {
                    self.stores.tiles.put(url, &response)?;
                }
                Ok(response)
            }
            Err(e) => {
                debug!(url, error = %e, "Tile fetch failed");
                Ok(CachedResponse::placeholder_not_found(
                    "Tile not available offline",
                ))
            }
        }
    }

    /// The airspace dataset is safety-relevant and isolated from
    /// generic GeoJSON churn in its own store.
    async fn handle_airspace(&self, url: &str) -> Result<CachedResponse> {
        if let Some(hit) = self.stores.airspace.get(url)? {
            return Ok(hit);
        }
        let response = self.fetcher.get(url).await?;
        if response.is_success() {
            self.stores.airspace.put(url, &response)?;
        }
        Ok(response)
    }

    /// Lookup order: dynamic store, static store, network. Network
    /// fetches populate the static store only - the dynamic store is
    /// written exclusively by the bulk populator, so offline-prepared
    /// data always shadows opportunistically cached data.
    async fn handle_geojson(&self, url: &str) -> Result<CachedResponse> {
        if let Some(hit) = self.stores.dynamic.get(url)? {
            return Ok(hit);
        }
        if let Some(hit) = self.stores.geojson.get(url)? {
            return Ok(hit);
        }

        let cell = {
            let mut inflight = self
                .inflight_geojson
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            inflight
                .entry(url.to_string())
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone()
        };

        let result = cell
            .get_or_try_init(|| async {
                let response = self.fetcher.get(url).await?;
                if response.is_success() {
                    self.stores.geojson.put(url, &response)?;
                }
                Ok::<_, anyhow::Error>(response)
            })
            .await
            .cloned();

        let mut inflight = self
            .inflight_geojson
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        inflight.remove(url);

        result
    }

    /// First glyph request for a fontstack eagerly fetches the fixed
    /// shard ranges alongside it, from the same host and fontstack as
    /// the requested shard. Individual failures are logged and
    /// non-fatal (the map continues with missing glyphs).
    async fn handle_glyph(&self, url: &str) -> Result<CachedResponse> {
        if let Some(hit) = self.stores.core.get(url)? {
            return Ok(hit);
        }

        if let Some((base, rest)) = url.split_once("/font/") {
            if let Some((fontstack, _)) = rest.rsplit_once('/') {
                for range in GLYPH_RANGES {
                    let glyph_url = format!("{}/font/{}/{}.pbf", base, fontstack, range);
                    match self.fetcher.get(&glyph_url).await {
                        Ok(response) if response.is_success() => {
                            if let Err(e) = self.stores.core.put(&glyph_url, &response) {
                                warn!(url = %glyph_url, error = %e, "Failed to store glyph range");
                            }
                        }
                        Ok(response) => {
                            warn!(url = %glyph_url, status = response.status,
                                "Glyph range fetch failed")
                        }
                        Err(e) => warn!(url = %glyph_url, error = %e, "Glyph range fetch failed"),
                    }
                }
            }
        }

        // The requested shard is usually one of the prefetched ranges
        if let Some(hit) = self.stores.core.get(url)? {
            return Ok(hit);
        }
        let response = self.fetcher.get(url).await?;
        if response.is_success() {
            self.stores.core.put(url, &response)?;
        }
        Ok(response)
    }

    /// Seed the core store with the initial resource list. Failures are
    /// tolerated; returns how many resources ended up cached.
    pub async fn precache(&self, urls: &[String]) -> usize {
        let mut cached = 0;
        for url in urls {
            if self.stores.core.contains(url) {
                cached += 1;
                continue;
            }
            match self.fetcher.get(url).await {
                Ok(response) if response.is_success() => {
                    match self.stores.core.put(url, &response) {
                        Ok(()) => cached += 1,
                        Err(e) => warn!(url, error = %e, "Failed to store install resource"),
                    }
                }
                Ok(response) => {
                    warn!(url, status = response.status, "Install resource fetch failed")
                }
                Err(e) => warn!(url, error = %e, "Install resource fetch failed"),
            }
        }
        cached
    }

    pub(crate) fn store_tracklog(&self, tracklog: &[TrackPoint], date: &str) -> Result<()> {
        let key = format!("tracklog-{}", date);
        let body = serde_json::to_vec(tracklog).context("Failed to serialize tracklog")?;
        self.stores
            .tracklog
            .put(&key, &CachedResponse::ok("application/json", body))
            .with_context(|| format!("Failed to store tracklog for {}", date))
    }

    /// Keys currently held by the dynamic store. Used by cache-status
    /// queries to work out which configurations are available offline.
    pub fn dynamic_keys(&self) -> Result<Vec<String>> {
        self.stores.dynamic.keys()
    }

    /// Worker message loop. Commands arrive over the channel; results
    /// are reported exclusively through broadcast events.
    pub async fn run(self: Arc<Self>, mut commands: mpsc::Receiver<ClientMessage>) {
        while let Some(message) = commands.recv().await {
            match message {
                ClientMessage::CacheFiles { files, config } => {
                    populate::cache_files(&self, &files, &config).await;
                }
                ClientMessage::CacheTiles { tiles, base_path } => {
                    populate::cache_tiles(&self, &tiles, &base_path).await;
                }
                ClientMessage::UpdateAppFiles { files } => {
                    update::update_app_files(&self, &files).await;
                }
                ClientMessage::StoreTracklog { tracklog, date } => {
                    if let Err(e) = self.store_tracklog(&tracklog, &date) {
                        error!(date, error = %e, "Failed to store tracklog");
                    }
                }
                ClientMessage::SkipWaiting => {
                    debug!("skip-waiting acknowledged");
                }
            }
        }
        debug!("Worker command channel closed, shutting down");
    }
}
