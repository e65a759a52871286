//! Persisted application state.
//!
//! A small durable key-value snapshot of user settings and session
//! data, kept in memory and mirrored to a dedicated single-entry cache
//! store. Only the fields of `PersistedAppState` are ever persisted;
//! unknown keys found in a stored snapshot are ignored so older
//! snapshots survive schema growth. Every mutation re-serializes and
//! overwrites the whole snapshot exactly once.

use std::collections::BTreeSet;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::{self, default_configuration, DEFAULT_POLICY};
use crate::store::{CacheGeneration, CacheStore, CachedResponse, StoreClass};

/// Current snapshot schema. Snapshots written by a different schema
/// are discarded in favor of defaults rather than partially migrated.
pub const SCHEMA_VERSION: u32 = 1;

/// Synthetic request key for the single snapshot entry.
const STATE_KEY: &str = "/app-state";

/// One recorded tracklog position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackPoint {
    pub lon: f64,
    pub lat: f64,
    #[serde(default)]
    pub altitude: Option<f64>,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
}

/// The full set of persisted settings. The field list is the allow-list:
/// nothing else is ever written to the snapshot store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PersistedAppState {
    pub schema_version: u32,
    pub base_text_size: u32,
    pub peaks_visible: bool,
    pub passes_visible: bool,
    pub polygon_opacity: f64,
    pub layers_toggle_state: bool,
    /// Active policy - safety-relevant, reset to the hardcoded default
    /// by `StateStore::reset`.
    pub current_policy: String,
    /// Active full configuration path - safety-relevant, same reset rule.
    pub current_config: String,
    pub airspace_visible: bool,
    /// Enabled airspace type names; `None` means "all types enabled".
    /// Serialized as a plain array.
    pub enabled_airspace_types: Option<BTreeSet<String>>,
    pub geolocation_enabled: bool,
    pub navboxes_enabled: bool,
    pub tracklog: Vec<TrackPoint>,
    pub last_tracklog_date: Option<String>,
}

impl Default for PersistedAppState {
    fn default() -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            base_text_size: 14,
            peaks_visible: true,
            passes_visible: true,
            polygon_opacity: 0.1,
            layers_toggle_state: true,
            current_policy: DEFAULT_POLICY.to_string(),
            current_config: default_configuration(),
            airspace_visible: true,
            enabled_airspace_types: None,
            // Disabled by default for privacy
            geolocation_enabled: false,
            // Depends on geolocation
            navboxes_enabled: false,
            tracklog: Vec::new(),
            last_tracklog_date: None,
        }
    }
}

/// A partial update to the persisted state. `None` fields are left
/// untouched; applying a patch performs exactly one snapshot save.
#[derive(Debug, Clone, Default)]
pub struct StatePatch {
    pub base_text_size: Option<u32>,
    pub peaks_visible: Option<bool>,
    pub passes_visible: Option<bool>,
    pub polygon_opacity: Option<f64>,
    pub layers_toggle_state: Option<bool>,
    pub current_policy: Option<String>,
    pub current_config: Option<String>,
    pub airspace_visible: Option<bool>,
    pub enabled_airspace_types: Option<BTreeSet<String>>,
    pub geolocation_enabled: Option<bool>,
    pub navboxes_enabled: Option<bool>,
    pub tracklog: Option<Vec<TrackPoint>>,
    pub last_tracklog_date: Option<String>,
}

/// In-memory mirror of the persisted snapshot, backed by a dedicated
/// single-entry store. `&mut self` on every mutator gives single-writer
/// sequencing: a save completes before the next mutation can start.
pub struct StateStore {
    store: CacheStore,
    state: PersistedAppState,
}

impl StateStore {
    /// Open the state store and load the snapshot. Load failures degrade
    /// to defaults rather than blocking startup.
    pub fn open(cache_root: &Path) -> Result<Self> {
        let store = CacheStore::open(cache_root, CacheGeneration::current(StoreClass::State))?;
        let state = Self::load_snapshot(&store);
        Ok(Self { store, state })
    }

    fn load_snapshot(store: &CacheStore) -> PersistedAppState {
        let entry = match store.get(STATE_KEY) {
            Ok(Some(entry)) => entry,
            Ok(None) => return PersistedAppState::default(),
            Err(e) => {
                warn!(error = %e, "Failed to read state snapshot, using defaults");
                return PersistedAppState::default();
            }
        };

        match serde_json::from_slice::<PersistedAppState>(&entry.body) {
            Ok(state) if state.schema_version == SCHEMA_VERSION => state,
            Ok(state) => {
                warn!(
                    found = state.schema_version,
                    expected = SCHEMA_VERSION,
                    "State snapshot schema mismatch, using defaults"
                );
                PersistedAppState::default()
            }
            Err(e) => {
                warn!(error = %e, "Failed to parse state snapshot, using defaults");
                PersistedAppState::default()
            }
        }
    }

    pub fn state(&self) -> &PersistedAppState {
        &self.state
    }

    /// Apply a patch and persist the full snapshot once.
    pub fn mutate(&mut self, patch: StatePatch) -> Result<()> {
        let s = &mut self.state;
        if let Some(v) = patch.base_text_size {
            s.base_text_size = v;
        }
        if let Some(v) = patch.peaks_visible {
            s.peaks_visible = v;
        }
        if let Some(v) = patch.passes_visible {
            s.passes_visible = v;
        }
        if let Some(v) = patch.polygon_opacity {
            s.polygon_opacity = v;
        }
        if let Some(v) = patch.layers_toggle_state {
            s.layers_toggle_state = v;
        }
        if let Some(v) = patch.current_policy {
            s.current_policy = v;
        }
        if let Some(v) = patch.current_config {
            s.current_config = v;
        }
        if let Some(v) = patch.airspace_visible {
            s.airspace_visible = v;
        }
        if let Some(v) = patch.enabled_airspace_types {
            s.enabled_airspace_types = Some(v);
        }
        if let Some(v) = patch.geolocation_enabled {
            s.geolocation_enabled = v;
        }
        if let Some(v) = patch.navboxes_enabled {
            s.navboxes_enabled = v;
        }
        if let Some(v) = patch.tracklog {
            s.tracklog = v;
        }
        if let Some(v) = patch.last_tracklog_date {
            s.last_tracklog_date = Some(v);
        }
        self.save()
    }

    fn save(&self) -> Result<()> {
        let body = serde_json::to_vec(&self.state).context("Failed to serialize state snapshot")?;
        self.store
            .put(STATE_KEY, &CachedResponse::ok("application/json", body))
            .context("Failed to persist state snapshot")
    }

    /// Emergency reset: drop the persisted snapshot and restore the
    /// safety-critical policy and configuration to hardcoded defaults.
    pub fn reset(&mut self) -> Result<()> {
        self.store
            .delete(STATE_KEY)
            .context("Failed to clear state snapshot")?;
        self.state.current_policy = DEFAULT_POLICY.to_string();
        self.state.current_config = default_configuration();
        info!("Persisted state cleared, policy and configuration reset to defaults");
        Ok(())
    }

    /// Geolocation permission revoked is a hard state transition: the
    /// feature is forcibly disabled and navboxes cascade off with it.
    pub fn apply_geolocation_permission(&mut self, granted: bool) -> Result<()> {
        if granted || !self.state.geolocation_enabled {
            return Ok(());
        }
        self.mutate(StatePatch {
            geolocation_enabled: Some(false),
            navboxes_enabled: Some(false),
            ..StatePatch::default()
        })
    }

    /// Startup integrity check on the active configuration. Returns a
    /// user-facing warning and falls back to defaults when the stored
    /// configuration is malformed; the app proceeds either way.
    pub fn check_configuration_integrity(&mut self) -> Result<Option<String>> {
        if config::is_valid_configuration(&self.state.current_config) {
            return Ok(None);
        }
        let message = format!(
            "Stored configuration \"{}\" is invalid; falling back to \"{}\". \
             Verify your policy and configuration before relying on clearance data.",
            self.state.current_config,
            default_configuration()
        );
        warn!(%message, "Configuration integrity check failed");
        self.mutate(StatePatch {
            current_policy: Some(DEFAULT_POLICY.to_string()),
            current_config: Some(default_configuration()),
            ..StatePatch::default()
        })?;
        Ok(Some(message))
    }
}
