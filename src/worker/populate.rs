//! Bulk cache population for offline preparation.
//!
//! Configuration files go to the dynamic GeoJSON store so they shadow
//! anything opportunistically cached; tiles go to the tile store in
//! concurrent batches. Both tolerate individual failures and report
//! progress through broadcast events.

use futures::future::join_all;
use tracing::{debug, info, warn};

use crate::tiles::TileCoord;

use super::messages::WorkerEvent;
use super::runtime::WorkerRuntime;

/// Tiles fetched concurrently per batch.
const TILE_BATCH_SIZE: usize = 50;

/// Download a configuration's file list into the dynamic store.
/// Failures are logged per file and skipped; the completion event
/// reports how many made it.
pub(crate) async fn cache_files(rt: &WorkerRuntime, files: &[String], config: &str) {
    let total = files.len();
    rt.emit(WorkerEvent::CacheStart {
        message: format!("Starting to cache {} files", total),
    });

    let mut completed = 0;
    for file in files {
        rt.emit(WorkerEvent::CacheProgress {
            message: format!("Caching: {}", file),
            completed,
            total,
            current_file: file.clone(),
        });

        let url = rt.resolve(file);
        match rt.fetcher.get(&url).await {
            Ok(response) if response.is_success() => match rt.stores.dynamic.put(&url, &response) {
                Ok(()) => completed += 1,
                Err(e) => {
                    warn!(file, error = %e, "Failed to store configuration file");
                    rt.emit(WorkerEvent::CacheError {
                        message: format!("Failed to cache {}: {}", file, e),
                    });
                }
            },
            Ok(response) => {
                warn!(file, status = response.status, "Configuration file fetch failed");
                rt.emit(WorkerEvent::CacheError {
                    message: format!("Failed to cache {}: HTTP {}", file, response.status),
                });
            }
            Err(e) => {
                warn!(file, error = %e, "Configuration file fetch failed");
                rt.emit(WorkerEvent::CacheError {
                    message: format!("Failed to cache {}: {}", file, e),
                });
            }
        }
    }

    info!(config, completed, total, "Configuration caching finished");
    rt.emit(WorkerEvent::CacheComplete {
        message: format!("Successfully cached {} of {} files", completed, total),
        completed,
        total,
    });
}

/// Download a planned tile set in batches. Tiles already present are
/// skipped, so re-running a plan only fetches what is missing. Every
/// tile broadcasts one completion event - success, already cached, or
/// tolerated failure alike - so progress trackers advance per tile.
pub(crate) async fn cache_tiles(rt: &WorkerRuntime, tiles: &[TileCoord], base_path: &str) {
    for batch in tiles.chunks(TILE_BATCH_SIZE) {
        let fetches = batch.iter().map(|tile| {
            let url = rt.resolve(&tile.path(base_path));
            async move {
                if !rt.stores.tiles.contains(&url) {
                    match rt.fetcher.get(&url).await {
                        Ok(response) if response.is_success() => {
                            if let Err(e) = rt.stores.tiles.put(&url, &response) {
                                warn!(url, error = %e, "Failed to store tile");
                            }
                        }
                        Ok(response) => debug!(url, status = response.status, "Tile fetch failed"),
                        Err(e) => debug!(url, error = %e, "Tile fetch failed"),
                    }
                }
                rt.emit(WorkerEvent::CacheTileComplete);
            }
        });
        join_all(fetches).await;
    }

    info!(total = tiles.len(), "Tile caching finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::testutil::TestServer;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn runtime_for(base_url: &str, root: &TempDir) -> Arc<WorkerRuntime> {
        let config = Config {
            base_url: base_url.to_string(),
            ..Config::default()
        };
        Arc::new(WorkerRuntime::new(&config, root.path()).expect("runtime"))
    }

    fn drain(events: &mut tokio::sync::broadcast::Receiver<WorkerEvent>) -> Vec<WorkerEvent> {
        let mut out = Vec::new();
        while let Ok(event) = events.try_recv() {
            out.push(event);
        }
        out
    }

    #[tokio::test]
    async fn test_cache_files_tolerates_partial_failure() {
        let server = TestServer::start(|path| {
            if path.ends_with("missing.geojson") {
                Some((404, "text/plain", b"missing".to_vec()))
            } else {
                Some((200, "application/json", b"{}".to_vec()))
            }
        })
        .await;
        let root = TempDir::new().expect("tempdir");
        let rt = runtime_for(&format!("{}/app", server.url()), &root);
        let mut events = rt.subscribe();

        let files = vec![
            "alps/aa_alps_10-100-250.geojson".to_string(),
            "alps/missing.geojson".to_string(),
            "alps/field.geojson".to_string(),
        ];
        cache_files(&rt, &files, "alps/10-100-250-4200").await;

        let events = drain(&mut events);
        let errors = events
            .iter()
            .filter(|e| matches!(e, WorkerEvent::CacheError { .. }))
            .count();
        assert_eq!(errors, 1);

        let complete = events.iter().find_map(|e| match e {
            WorkerEvent::CacheComplete {
                message,
                completed,
                total,
            } => Some((message.clone(), *completed, *total)),
            _ => None,
        });
        let (message, completed, total) = complete.expect("cacheComplete");
        assert_eq!((completed, total), (2, 3));
        assert_eq!(message, "Successfully cached 2 of 3 files");

        // Successful files land in the dynamic store
        assert_eq!(rt.stores.dynamic.len().expect("len"), 2);
    }

    fn tile_completions(events: &mut tokio::sync::broadcast::Receiver<WorkerEvent>) -> usize {
        drain(events)
            .iter()
            .filter(|e| matches!(e, WorkerEvent::CacheTileComplete))
            .count()
    }

    #[tokio::test]
    async fn test_cache_tiles_emits_one_completion_per_tile() {
        let server = TestServer::start(|path| {
            if path.ends_with(".png") {
                Some((200, "image/png", b"tile".to_vec()))
            } else {
                None
            }
        })
        .await;
        let root = TempDir::new().expect("tempdir");
        let rt = runtime_for(&format!("{}/app", server.url()), &root);
        let mut events = rt.subscribe();

        let tiles = vec![
            TileCoord { x: 530, y: 362, z: 10 },
            TileCoord { x: 531, y: 362, z: 10 },
        ];
        cache_tiles(&rt, &tiles, "tiles").await;
        assert_eq!(tile_completions(&mut events), 2);
        assert_eq!(rt.stores.tiles.len().expect("len"), 2);

        // Second run is a no-op against the store, but the
        // already-cached path still reports each tile
        cache_tiles(&rt, &tiles, "tiles").await;
        assert_eq!(tile_completions(&mut events), 2);
        assert_eq!(rt.stores.tiles.len().expect("len"), 2);
    }

    #[tokio::test]
    async fn test_cache_tiles_reports_failed_tiles_too() {
        let root = TempDir::new().expect("tempdir");
        // Connection-refused base: every tile fetch fails
        let rt = runtime_for("http://127.0.0.1:9/app", &root);
        let mut events = rt.subscribe();

        let tiles = vec![
            TileCoord { x: 1, y: 1, z: 5 },
            TileCoord { x: 2, y: 1, z: 5 },
            TileCoord { x: 3, y: 1, z: 5 },
        ];
        cache_tiles(&rt, &tiles, "tiles").await;

        assert_eq!(tile_completions(&mut events), 3);
        assert!(rt.stores.tiles.is_empty().expect("is_empty"));
    }
}
