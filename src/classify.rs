//! Resource classification.
//!
//! Maps a requested URL to the cache class that decides which store and
//! which get-or-populate policy apply. Classification is a pure function
//! of the URL; the runtime upgrades static GeoJSON to dynamic when the
//! dynamic store holds the key (see `WorkerRuntime::effective_class`).

use reqwest::Url;

/// Hosts outside the app origin that are still intercepted and cached.
const EXTERNAL_HOSTS: &[&str] = &[
    "cdn.jsdelivr.net",
    "demotiles.maplibre.org",
    "fonts.googleapis.com",
    "fonts.gstatic.com",
];

/// Host serving map font glyph shards.
pub const GLYPH_HOST: &str = "demotiles.maplibre.org";

/// The airspace dataset gets its own isolated store.
const AIRSPACE_FILE: &str = "airspace.geojson";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceClass {
    CoreAsset,
    Tile,
    GeojsonStatic,
    GeojsonDynamic,
    GeojsonAirspace,
    FontGlyph,
}

impl ResourceClass {
    /// GeoJSON classes degrade to an empty FeatureCollection on fetch
    /// failure and drive the loading-indicator lifecycle events.
    pub fn is_geojson(self) -> bool {
        matches!(
            self,
            ResourceClass::GeojsonStatic
                | ResourceClass::GeojsonDynamic
                | ResourceClass::GeojsonAirspace
        )
    }
}

/// Classifies URLs by shape: app-scope paths, tiles directories,
/// GeoJSON suffixes, and the glyph/CDN host allow-list.
#[derive(Debug, Clone)]
pub struct Classifier {
    origin_host: String,
    base_path: String,
}

impl Classifier {
    /// Build a classifier scoped to a base URL such as
    /// `https://charts.example.org/glidecache`.
    pub fn for_base_url(base_url: &str) -> anyhow::Result<Self> {
        let url = Url::parse(base_url)?;
        let origin_host = url
            .host_str()
            .ok_or_else(|| anyhow::anyhow!("Base URL has no host: {}", base_url))?
            .to_string();
        let base_path = url.path().trim_end_matches('/').to_string();
        Ok(Self {
            origin_host,
            base_path,
        })
    }

    /// Classify a URL. `None` means the request is out of scope and is
    /// not intercepted at all.
    pub fn classify(&self, url: &str) -> Option<ResourceClass> {
        let url = Url::parse(url).ok()?;
        if !matches!(url.scheme(), "http" | "https") {
            return None;
        }
        let host = url.host_str()?;
        let path = url.path();

        let in_scope = (host == self.origin_host && path.starts_with(&self.base_path))
            || EXTERNAL_HOSTS.contains(&host);
        if !in_scope {
            return None;
        }

        if path.contains("/tiles/") {
            return Some(ResourceClass::Tile);
        }
        if path.ends_with(AIRSPACE_FILE) {
            return Some(ResourceClass::GeojsonAirspace);
        }
        if path.ends_with(".geojson") {
            return Some(ResourceClass::GeojsonStatic);
        }
        if host == GLYPH_HOST && path.contains("/font/") {
            return Some(ResourceClass::FontGlyph);
        }
        Some(ResourceClass::CoreAsset)
    }
}
