//! Application configuration management.
//!
//! This module handles loading and saving the application configuration,
//! which includes the chart server base URL, the policy table, map bounds
//! and tile precache settings.
//!
//! Configuration is stored at `~/.config/glidecache/config.json`.

use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::tiles::BoundingBox;

/// Application name used for config/cache directory paths
const APP_NAME: &str = "glidecache";

/// Config file name
const CONFIG_FILE: &str = "config.json";

/// File listing the core app files, fetched fresh at update time.
/// This manifest is the single source of truth for what an app update covers.
pub const CORE_FILE_MANIFEST: &str = "core-files.json";

/// Default policy and configuration. These are the hardcoded fallbacks
/// restored by a state reset and by the startup integrity check.
pub const DEFAULT_POLICY: &str = "alps";
pub const DEFAULT_CONFIG_PARAMS: &str = "10-100-250-4200";

/// Client gives up waiting for a bulk/tile cache job after this long.
/// The worker-side job is not cancelled and may still finish afterwards.
pub const CACHE_TIMEOUT_SECS: u64 = 5 * 60;

/// Client-side watchdog for the app update interaction.
pub const UPDATE_TIMEOUT_SECS: u64 = 60;

/// External resources cached alongside the app but never updated with it.
pub const EXTERNAL_RESOURCES: &[&str] = &[
    "https://cdn.jsdelivr.net/npm/maplibre-gl@latest/dist/maplibre-gl.js",
    "https://cdn.jsdelivr.net/npm/maplibre-gl@latest/dist/maplibre-gl.css",
    "https://fonts.googleapis.com/icon?family=Material+Icons+Round",
    "https://demotiles.maplibre.org/font/Open%20Sans%20Regular,Arial%20Unicode%20MS%20Regular/0-255.pbf",
    "https://demotiles.maplibre.org/font/Open%20Sans%20Regular,Arial%20Unicode%20MS%20Regular/256-511.pbf",
];

/// The hardcoded default full configuration path.
pub fn default_configuration() -> String {
    format!("{}/{}", DEFAULT_POLICY, DEFAULT_CONFIG_PARAMS)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TileCacheSettings {
    pub min_zoom: u8,
    pub max_zoom: u8,
    pub base_path: String,
}

impl Default for TileCacheSettings {
    fn default() -> Self {
        Self {
            min_zoom: 1,
            max_zoom: 12,
            base_path: "tiles".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    /// Absolute base URL of the chart server, e.g. `https://charts.example.org/glidecache`.
    /// All relative resource paths resolve against it.
    pub base_url: String,
    /// Policy name to available configuration parameter sets.
    pub policies: BTreeMap<String, Vec<String>>,
    /// Geographic bounding box covered by the tile precache planner.
    pub map_bounds: BoundingBox,
    pub tile_cache: TileCacheSettings,
}

impl Default for Config {
    fn default() -> Self {
        let params = vec![
            "10-100-250-4200".to_string(),
            "20-100-250-4200".to_string(),
            "25-100-250-4200".to_string(),
            "30-100-250-4200".to_string(),
        ];
        let mut policies = BTreeMap::new();
        policies.insert("alps".to_string(), params.clone());
        policies.insert("West_alps_with_fields".to_string(), params);

        Self {
            base_url: "http://localhost:8000".to_string(),
            policies,
            // Alps coverage, [lon, lat] corners
            map_bounds: BoundingBox([[4.9698169, 43.6088902], [13.696105, 47.5644488]]),
            tile_cache: TileCacheSettings::default(),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        if path.exists() {
            let contents = std::fs::read_to_string(&path)?;
            Ok(serde_json::from_str(&contents)?)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self) -> Result<()> {
        let path = Self::config_path()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    pub fn cache_root(&self) -> Result<PathBuf> {
        let cache_dir = dirs::cache_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find cache directory"))?;
        Ok(cache_dir.join(APP_NAME))
    }

    /// Resolve a relative resource path against the configured base URL.
    pub fn resolve(&self, relative: &str) -> String {
        let rel = relative.trim_start_matches("./").trim_start_matches('/');
        format!("{}/{}", self.base_url.trim_end_matches('/'), rel)
    }

    pub fn manifest_url(&self) -> String {
        self.resolve(CORE_FILE_MANIFEST)
    }
}

/// Checks the shape of a full configuration path: `policy/A-B-C-D` with
/// four numeric, dash-separated parameter groups. A malformed active
/// configuration could misrepresent clearance data, so callers surface
/// a warning when this fails and fall back to the hardcoded defaults.
pub fn is_valid_configuration(configuration: &str) -> bool {
    let Some((policy, params)) = configuration.split_once('/') else {
        return false;
    };
    if policy.is_empty() || params.contains('/') {
        return false;
    }
    let groups: Vec<&str> = params.split('-').collect();
    groups.len() == 4
        && groups
            .iter()
            .all(|g| !g.is_empty() && g.chars().all(|c| c.is_ascii_digit()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_configuration_is_valid() {
        assert!(is_valid_configuration(&default_configuration()));
    }

    #[test]
    fn test_configuration_validation() {
        assert!(is_valid_configuration("alps/10-100-250-4200"));
        assert!(is_valid_configuration("West_alps_with_fields/30-100-250-4200"));

        assert!(!is_valid_configuration(""));
        assert!(!is_valid_configuration("alps")); // no params
        assert!(!is_valid_configuration("/10-100-250-4200")); // empty policy
        assert!(!is_valid_configuration("alps/10-100-250")); // three groups
        assert!(!is_valid_configuration("alps/10-100-250-4200-1")); // five groups
        assert!(!is_valid_configuration("alps/10-100-abc-4200")); // non-numeric
        assert!(!is_valid_configuration("alps/10-100-250-4200/extra")); // nested path
    }

    #[test]
    fn test_resolve_relative_paths() {
        let config = Config {
            base_url: "https://charts.example.org/glidecache/".to_string(),
            ..Config::default()
        };
        assert_eq!(
            config.resolve("alps/10-100-250-4200/a.geojson"),
            "https://charts.example.org/glidecache/alps/10-100-250-4200/a.geojson"
        );
        assert_eq!(
            config.resolve("./tiles/3/4/2.png"),
            "https://charts.example.org/glidecache/tiles/3/4/2.png"
        );
        assert_eq!(
            config.resolve("/index.html"),
            "https://charts.example.org/glidecache/index.html"
        );
    }

    #[test]
    fn test_config_roundtrip_serde() {
        let config = Config::default();
        let json = serde_json::to_string(&config).expect("serialize config");
        let back: Config = serde_json::from_str(&json).expect("parse config");
        assert_eq!(back.base_url, config.base_url);
        assert_eq!(back.tile_cache.max_zoom, 12);
        assert_eq!(back.policies.len(), 2);
    }
}
