use shared::tiles::{ProjectionError, TileKey};
use std::io;
use thiserror::Error;

/// Failure to retrieve one tile. Never aborts a fill.
#[derive(Debug, Error)]
pub enum TileFetchError {
    #[error("upstream responded with status {0}")]
    Status(reqwest::StatusCode),
    #[error(transparent)]
    Transport(#[from] reqwest::Error),
}

#[derive(Debug, Error)]
pub enum FillError {
    #[error(transparent)]
    Projection(#[from] ProjectionError),
    #[error("failed to write tile {key} to the store: {source}")]
    Store {
        key: TileKey,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Error)]
pub enum MainError {
    #[error(transparent)]
    Init(#[from] shared::error::InitializationError),
    #[error("invalid arguments: {0}")]
    Usage(#[from] ProjectionError),
    #[error("failed to build http client: {0}")]
    Client(#[source] reqwest::Error),
    #[error(transparent)]
    Fill(#[from] FillError),
    #[error(transparent)]
    Join(#[from] tokio::task::JoinError),
}
