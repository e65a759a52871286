//! Client/worker message protocol.
//!
//! Structured, JSON-serializable messages in both directions. The
//! wire tags match the protocol exactly, including the legacy
//! `store-tracklog` and `SKIP_WAITING` spellings.

use serde::{Deserialize, Serialize};

use crate::state::TrackPoint;
use crate::tiles::TileCoord;

/// Commands a client sends to the worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    /// Trigger the bulk cache populator for one configuration.
    #[serde(rename = "cacheFiles")]
    CacheFiles { files: Vec<String>, config: String },

    /// Trigger tile precaching for a planned tile list.
    #[serde(rename = "cacheTiles")]
    CacheTiles {
        tiles: Vec<TileCoord>,
        #[serde(rename = "basePath")]
        base_path: String,
    },

    /// Trigger the two-phase app updater.
    #[serde(rename = "updateAppFiles")]
    UpdateAppFiles { files: Vec<String> },

    /// Persist a day's recorded path.
    #[serde(rename = "store-tracklog")]
    StoreTracklog {
        tracklog: Vec<TrackPoint>,
        date: String,
    },

    /// Force immediate worker activation. Activation is immediate in
    /// this runtime; the command is acknowledged for protocol parity.
    #[serde(rename = "SKIP_WAITING")]
    SkipWaiting,
}

/// Notifications the worker broadcasts to all connected clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum WorkerEvent {
    /// A GeoJSON fetch left the cache and hit the network path.
    FetchStart { url: String },
    FetchComplete { url: String },

    /// Non-terminal: the fetch is still running but slow.
    LoadWarning { url: String, message: String },
    LoadError { url: String, message: String },

    CacheStart {
        message: String,
    },
    CacheProgress {
        message: String,
        completed: usize,
        total: usize,
        #[serde(rename = "currentFile")]
        current_file: String,
    },
    CacheError {
        message: String,
    },
    CacheComplete {
        message: String,
        completed: usize,
        total: usize,
    },

    /// One tile finished - success or tolerated failure alike.
    CacheTileComplete,

    AppUpdateStart {
        message: String,
    },
    AppUpdateProgress {
        message: String,
        completed: usize,
        total: usize,
        #[serde(rename = "currentFile")]
        current_file: String,
    },
    AppUpdateError {
        message: String,
    },
    AppUpdateFailed {
        message: String,
    },
    AppUpdateComplete {
        message: String,
        #[serde(rename = "needsReload")]
        needs_reload: bool,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_message_wire_tags() {
        let msg = ClientMessage::CacheFiles {
            files: vec!["alps/10-100-250-4200/a.geojson".to_string()],
            config: "alps/10-100-250-4200".to_string(),
        };
        let json = serde_json::to_value(&msg).expect("serialize");
        assert_eq!(json["type"], "cacheFiles");

        let msg = ClientMessage::StoreTracklog {
            tracklog: vec![],
            date: "2026-08-30".to_string(),
        };
        let json = serde_json::to_value(&msg).expect("serialize");
        assert_eq!(json["type"], "store-tracklog");

        let json = serde_json::to_value(ClientMessage::SkipWaiting).expect("serialize");
        assert_eq!(json["type"], "SKIP_WAITING");
    }

    #[test]
    fn test_cache_tiles_payload_shape() {
        let msg = ClientMessage::CacheTiles {
            tiles: vec![TileCoord::new(530, 362, 10)],
            base_path: "tiles".to_string(),
        };
        let json = serde_json::to_value(&msg).expect("serialize");
        assert_eq!(json["type"], "cacheTiles");
        assert_eq!(json["basePath"], "tiles");
        assert_eq!(json["tiles"][0]["x"], 530);
        assert_eq!(json["tiles"][0]["z"], 10);

        let back: ClientMessage = serde_json::from_value(json).expect("parse");
        assert_eq!(back, msg);
    }

    #[test]
    fn test_worker_event_wire_tags() {
        let event = WorkerEvent::AppUpdateComplete {
            message: "Successfully updated 3 app files".to_string(),
            needs_reload: true,
        };
        let json = serde_json::to_value(&event).expect("serialize");
        assert_eq!(json["type"], "appUpdateComplete");
        assert_eq!(json["needsReload"], true);

        let json = serde_json::to_value(WorkerEvent::CacheTileComplete).expect("serialize");
        assert_eq!(json["type"], "cacheTileComplete");

        let event = WorkerEvent::CacheProgress {
            message: "Attempting to fetch: x".to_string(),
            completed: 1,
            total: 4,
            current_file: "x".to_string(),
        };
        let json = serde_json::to_value(&event).expect("serialize");
        assert_eq!(json["type"], "cacheProgress");
        assert_eq!(json["currentFile"], "x");
    }

    #[test]
    fn test_event_roundtrip() {
        let events = vec![
            WorkerEvent::FetchStart {
                url: "https://charts.example.org/x.geojson".to_string(),
            },
            WorkerEvent::LoadWarning {
                url: "https://charts.example.org/x.geojson".to_string(),
                message: "slow".to_string(),
            },
            WorkerEvent::CacheComplete {
                message: "Successfully cached 3 of 4 files".to_string(),
                completed: 3,
                total: 4,
            },
            WorkerEvent::AppUpdateFailed {
                message: "Your app is unchanged.".to_string(),
            },
        ];
        for event in events {
            let json = serde_json::to_string(&event).expect("serialize");
            let back: WorkerEvent = serde_json::from_str(&json).expect("parse");
            assert_eq!(back, event);
        }
    }
}
