use axum::extract::FromRef;
use chrono::TimeDelta;
use shared::Config;
use shared::telemetry::TelemetryCache;
use shared::tiles::TileStore;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Clone, FromRef)]
pub struct AppState {
    pub telemetry: TelemetryCache,
    pub history: HistoryFile,
    pub tile_sets: TileSets,
    pub freshness: Freshness,
}

impl AppState {
    pub fn new(config: &Config, telemetry: TelemetryCache) -> Self {
        Self {
            telemetry,
            history: HistoryFile {
                path: Arc::new(config.history.path.clone()),
            },
            tile_sets: TileSets::from_config(config),
            freshness: Freshness {
                stale_after: TimeDelta::seconds(
                    i64::try_from(config.server.stale_after_seconds).unwrap_or(i64::MAX),
                ),
            },
        }
    }
}

#[derive(Clone)]
pub struct HistoryFile {
    pub path: Arc<PathBuf>,
}

impl HistoryFile {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Name offered to the browser when the file is downloaded.
    pub fn download_name(&self) -> String {
        self.path
            .file_name()
            .map_or_else(|| "track.csv".to_string(), |n| n.to_string_lossy().into_owned())
    }
}

#[derive(Clone, Default)]
pub struct TileSets {
    stores: Arc<HashMap<String, TileStore>>,
}

impl TileSets {
    pub fn from_config(config: &Config) -> Self {
        let stores = config
            .tile_sets
            .0
            .iter()
            .map(|set| {
                (
                    set.name.clone(),
                    TileStore::new(set.root.clone(), set.extension.clone()),
                )
            })
            .collect();
        Self {
            stores: Arc::new(stores),
        }
    }

    pub fn get(&self, name: &str) -> Option<&TileStore> {
        self.stores.get(name)
    }
}

#[derive(Clone, Copy)]
pub struct Freshness {
    pub stale_after: TimeDelta,
}
