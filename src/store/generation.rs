use std::fs;
use std::path::Path;

use anyhow::Result;
use tracing::info;

/// Prefix shared by every store directory this app owns. Cleanup only
/// ever touches directories under this prefix.
pub const STORE_PREFIX: &str = "glidecache-";

/// The logical cache stores, one per resource class plus the
/// state-snapshot and tracklog stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreClass {
    CoreAsset,
    Tile,
    GeojsonStatic,
    GeojsonDynamic,
    Airspace,
    Tracklog,
    State,
}

impl StoreClass {
    pub fn all() -> [StoreClass; 7] {
        [
            StoreClass::CoreAsset,
            StoreClass::Tile,
            StoreClass::GeojsonStatic,
            StoreClass::GeojsonDynamic,
            StoreClass::Airspace,
            StoreClass::Tracklog,
            StoreClass::State,
        ]
    }

    fn slug(self) -> &'static str {
        match self {
            StoreClass::CoreAsset => "core",
            StoreClass::Tile => "tiles",
            StoreClass::GeojsonStatic => "geojson",
            StoreClass::GeojsonDynamic => "dynamic",
            StoreClass::Airspace => "airspace",
            StoreClass::Tracklog => "tracklog",
            StoreClass::State => "state",
        }
    }

    /// Live generation number for this class. Bumping a version here
    /// retires the previous store directory at the next startup.
    fn current_version(self) -> u32 {
        match self {
            StoreClass::CoreAsset => 2,
            _ => 1,
        }
    }
}

/// A (class, version) pair naming one store directory. At most one
/// generation per class is live at any time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheGeneration {
    pub class: StoreClass,
    pub version: u32,
}

impl CacheGeneration {
    pub fn current(class: StoreClass) -> Self {
        Self {
            class,
            version: class.current_version(),
        }
    }

    pub fn store_name(&self) -> String {
        format!("{}{}-v{}", STORE_PREFIX, self.class.slug(), self.version)
    }
}

/// Delete every store directory under the app prefix that is not a
/// live generation. Run once at worker startup, mirroring the
/// activation-time cleanup of the cache namespace.
pub fn clean_stale_generations(root: &Path) -> Result<usize> {
    if !root.exists() {
        return Ok(0);
    }

    let live: Vec<String> = StoreClass::all()
        .iter()
        .map(|class| CacheGeneration::current(*class).store_name())
        .collect();

    let mut removed = 0;
    for entry in fs::read_dir(root)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        if name.starts_with(STORE_PREFIX) && !live.contains(&name) {
            fs::remove_dir_all(entry.path())?;
            info!(store = %name, "Removed stale cache store generation");
            removed += 1;
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_store_names_are_versioned() {
        assert_eq!(
            CacheGeneration::current(StoreClass::CoreAsset).store_name(),
            "glidecache-core-v2"
        );
        assert_eq!(
            CacheGeneration::current(StoreClass::GeojsonDynamic).store_name(),
            "glidecache-dynamic-v1"
        );
    }

    #[test]
    fn test_one_live_generation_per_class() {
        let names: Vec<String> = StoreClass::all()
            .iter()
            .map(|c| CacheGeneration::current(*c).store_name())
            .collect();
        let mut deduped = names.clone();
        deduped.sort();
        deduped.dedup();
        assert_eq!(deduped.len(), names.len());
    }

    #[test]
    fn test_cleanup_removes_only_stale_prefixed_dirs() {
        let root = TempDir::new().expect("tempdir");
        let live = CacheGeneration::current(StoreClass::Tile).store_name();
        let stale = format!("{}core-v1", STORE_PREFIX);
        let foreign = "someone-elses-cache";

        for name in [live.as_str(), stale.as_str(), foreign] {
            fs::create_dir(root.path().join(name)).expect("mkdir");
        }

        let removed = clean_stale_generations(root.path()).expect("cleanup");
        assert_eq!(removed, 1);
        assert!(root.path().join(&live).exists());
        assert!(!root.path().join(&stale).exists());
        assert!(root.path().join(foreign).exists());
    }

    #[test]
    fn test_cleanup_tolerates_missing_root() {
        let root = TempDir::new().expect("tempdir");
        let missing = root.path().join("does-not-exist");
        assert_eq!(clean_stale_generations(&missing).expect("cleanup"), 0);
    }
}
