use crate::error::ApiError;
use crate::state::{AppState, Freshness, HistoryFile, TileSets};
use axum::extract::{Path, State};
use axum::http::{StatusCode, header};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use chrono::Utc;
use serde::Serialize;
use shared::telemetry::{TelemetryCache, TelemetrySnapshot};
use shared::tiles::TileKey;
use std::io;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/gps", get(get_gps))
        .route("/track.csv", get(download_history))
        .route("/{tile_set}/{z}/{x}/{file}", get(get_tile))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

#[derive(Debug, Serialize)]
pub struct GpsResponse {
    #[serde(flatten)]
    pub snapshot: TelemetrySnapshot,
    pub stale: bool,
}

pub async fn get_gps(
    State(telemetry): State<TelemetryCache>,
    State(freshness): State<Freshness>,
) -> Json<GpsResponse> {
    let snapshot = telemetry.read();
    Json(GpsResponse {
        stale: snapshot.is_stale(Utc::now(), freshness.stale_after),
        snapshot,
    })
}

pub async fn download_history(
    State(history): State<HistoryFile>,
) -> Result<impl IntoResponse, ApiError> {
    let bytes = match tokio::fs::read(history.path()).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(ApiError::HistoryNotFound),
        Err(e) => return Err(e.into()),
    };

    let disposition = format!("attachment; filename=\"{}\"", history.download_name());
    Ok((
        [
            (header::CONTENT_TYPE, "text/csv; charset=utf-8".to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        bytes,
    ))
}

pub async fn get_tile(
    State(tile_sets): State<TileSets>,
    Path((tile_set, z, x, file)): Path<(String, u8, u32, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let store = tile_sets
        .get(&tile_set)
        .ok_or_else(|| ApiError::UnknownTileSet(tile_set.clone()))?;
    let y = store
        .parse_file_name(&file)
        .ok_or_else(|| ApiError::MalformedTileName(file.clone()))?;

    let key = TileKey::new(z, x, y);
    let bytes = store.get(key).await?.ok_or(ApiError::TileNotFound(key))?;
    Ok(([(header::CONTENT_TYPE, content_type(store.extension()))], bytes))
}

fn content_type(extension: &str) -> &'static str {
    match extension.to_ascii_lowercase().as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "webp" => "image/webp",
        "pbf" | "mvt" => "application/vnd.mapbox-vector-tile",
        _ => "application/octet-stream",
    }
}

pub async fn health_check(
    State(telemetry): State<TelemetryCache>,
    State(freshness): State<Freshness>,
) -> impl IntoResponse {
    let snapshot = telemetry.read();
    let now = Utc::now();

    let Some(updated_at) = snapshot.updated_at else {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            "No position report has been received from gpsd".to_string(),
        );
    };

    if snapshot.is_stale(now, freshness.stale_after) {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!(
                "Position not updated in the last {} seconds. Last update: {updated_at}",
                freshness.stale_after.num_seconds()
            ),
        )
    } else {
        (
            StatusCode::OK,
            format!("Position last updated: {updated_at}"),
        )
    }
}
