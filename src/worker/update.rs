//! Two-phase application update.
//!
//! Phase 1 downloads every file in the manifest into memory, aborting
//! on the first failure. Phase 2 commits all downloads to the core
//! store. The live cache is never touched before phase 1 completes, so
//! a failed update leaves the installed app byte-for-byte unchanged.

use chrono::Utc;
use tracing::{info, warn};

use crate::store::CachedResponse;

use super::messages::WorkerEvent;
use super::runtime::WorkerRuntime;

pub(crate) async fn update_app_files(rt: &WorkerRuntime, files: &[String]) {
    if files.is_empty() {
        rt.emit(WorkerEvent::AppUpdateFailed {
            message: "Update failed: No files list provided. Your app is unchanged.".to_string(),
        });
        return;
    }

    let total = files.len();
    rt.emit(WorkerEvent::AppUpdateStart {
        message: format!("Starting to update {} app files", total),
    });

    // Phase 1: download everything, commit nothing.
    let mut downloads: Vec<(String, CachedResponse)> = Vec::with_capacity(total);
    for (index, file) in files.iter().enumerate() {
        rt.emit(WorkerEvent::AppUpdateProgress {
            message: format!("Downloading: {}", file),
            completed: index,
            total,
            current_file: file.clone(),
        });

        let url = rt.resolve(file);
        match rt.fetcher.get_no_store(&url).await {
            Ok(response) if response.is_success() => {
                rt.emit(WorkerEvent::AppUpdateProgress {
                    message: format!("Downloaded: {}", file),
                    completed: index + 1,
                    total,
                    current_file: file.clone(),
                });
                downloads.push((url, response));
            }
            Ok(response) => {
                warn!(file, status = response.status, "Update download failed");
                rt.emit(WorkerEvent::AppUpdateError {
                    message: format!("Failed to download {}: HTTP {}", file, response.status),
                });
                rt.emit(WorkerEvent::AppUpdateFailed {
                    message: "Update aborted: Some files could not be downloaded. \
                              Your app is unchanged."
                        .to_string(),
                });
                return;
            }
            Err(e) => {
                warn!(file, error = %e, "Update download failed");
                rt.emit(WorkerEvent::AppUpdateError {
                    message: format!("Failed to download {}: {}", file, e),
                });
                rt.emit(WorkerEvent::AppUpdateFailed {
                    message: "Update aborted: Some files could not be downloaded. \
                              Your app is unchanged."
                        .to_string(),
                });
                return;
            }
        }
    }

    // Phase 2: every download succeeded, commit the full set. Entries
    // are rebuilt with a fresh timestamp so the staleness clock resets.
    for (url, response) in &downloads {
        let entry = CachedResponse {
            status: 200,
            content_type: content_type_for(url).to_string(),
            body: response.body.clone(),
            stored_at: Utc::now(),
        };
        if let Err(e) = rt.stores.core.put(url, &entry) {
            warn!(url, error = %e, "Update commit failed");
            // Earlier commit iterations may already have landed
            rt.emit(WorkerEvent::AppUpdateFailed {
                message: format!(
                    "Cache update failed: {}. The update may be partially applied; \
                     run the update again.",
                    e
                ),
            });
            return;
        }
    }

    info!(total, "App update committed");
    rt.emit(WorkerEvent::AppUpdateComplete {
        message: format!("Successfully updated {} app files", total),
        needs_reload: true,
    });
}

/// Content type by file extension, for rebuilding committed entries.
fn content_type_for(url: &str) -> &'static str {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    match path.rsplit('.').next() {
        Some("html") => "text/html",
        Some("css") => "text/css",
        Some("js") => "application/javascript",
        Some("json" | "geojson") => "application/json",
        Some("png") => "image/png",
        Some("svg") => "image/svg+xml",
        Some("webmanifest") => "application/manifest+json",
        _ => "application/octet-stream",
    }
}
