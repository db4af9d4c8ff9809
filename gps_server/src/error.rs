use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Serialize, Serializer};
use shared::tiles::TileKey;
use std::io;
use std::path::PathBuf;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Csv(#[from] csv::Error),
    #[error("history file {path} has header [{found}] but the configured columns are [{expected}]")]
    HeaderMismatch {
        path: PathBuf,
        expected: String,
        found: String,
    },
}

/// Local write failures. These are never skipped over.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("failed to append to audit log: {0}")]
    Audit(#[source] io::Error),
    #[error("failed to append to history log: {0}")]
    History(#[from] HistoryError),
}

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("failed to connect to gpsd at {address}: {source}")]
    Connect {
        address: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to read from gpsd: {0}")]
    Read(#[source] io::Error),
    #[error("gpsd closed the connection")]
    Disconnected,
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("stream reader worker failed: {0}")]
    Worker(#[from] tokio::task::JoinError),
}

impl StreamError {
    /// Fatal errors end the process instead of triggering a reconnect.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Storage(_) | Self::Worker(_))
    }
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("unknown tile set {0}")]
    UnknownTileSet(String),
    #[error("malformed tile name {0}")]
    MalformedTileName(String),
    #[error("tile {0} is not cached")]
    TileNotFound(TileKey),
    #[error("history file has not been created yet")]
    HistoryNotFound,
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::UnknownTileSet(name) => {
                ErrorMessage::from((StatusCode::NOT_FOUND, format!("unknown tile set {name}")))
                    .into_response()
            }
            ApiError::MalformedTileName(name) => ErrorMessage::from((
                StatusCode::BAD_REQUEST,
                format!("malformed tile name {name}"),
            ))
            .into_response(),
            ApiError::TileNotFound(key) => {
                ErrorMessage::from((StatusCode::NOT_FOUND, format!("tile {key} not found")))
                    .into_response()
            }
            ApiError::HistoryNotFound => {
                ErrorMessage::from((StatusCode::NOT_FOUND, "no history has been recorded"))
                    .into_response()
            }
            ApiError::Io(e) => {
                warn!(error = ?e, "filesystem error while serving request");
                ErrorMessage::from((StatusCode::INTERNAL_SERVER_ERROR, "")).into_response()
            }
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorMessage {
    #[serde(serialize_with = "serialize_status")]
    pub status_code: StatusCode,
    pub message: String,
}

fn serialize_status<S>(value: &StatusCode, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_u16(value.as_u16())
}

impl From<(StatusCode, String)> for ErrorMessage {
    fn from((status_code, message): (StatusCode, String)) -> Self {
        Self {
            status_code,
            message,
        }
    }
}

impl From<(StatusCode, &str)> for ErrorMessage {
    fn from((status_code, message): (StatusCode, &str)) -> Self {
        Self {
            status_code,
            message: message.into(),
        }
    }
}

impl IntoResponse for ErrorMessage {
    fn into_response(self) -> Response {
        (self.status_code, Json(self)).into_response()
    }
}

#[derive(Debug, Error)]
pub enum MainError {
    #[error(transparent)]
    Init(#[from] shared::error::InitializationError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Stream(#[from] StreamError),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Join(#[from] tokio::task::JoinError),
}
