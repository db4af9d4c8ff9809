pub mod gpsd;
pub mod telemetry;
pub mod tiles;

use crate::error::{ConfigError, InitializationError};
use figment::Figment;
use figment::providers::{Env, Format, Toml};
use serde::Deserialize;
use std::path::PathBuf;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

pub const ENV_VAR_PREFIX: &str = "GPS_TRACKER__";
pub const SETTINGS_FILE: &str = "Settings.toml";

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub gpsd: GpsdConfig,
    pub history: HistoryConfig,
    pub audit: AuditConfig,
    pub server: ServerConfig,
    pub tile_sets: TileSetsConfig,
    pub tile_fetcher: TileFetcherConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct GpsdConfig {
    pub address: String,
    /// Zero disables reconnecting; the first connection failure ends the process.
    pub reconnect_delay_seconds: u64,
    pub channel_capacity: usize,
    /// Longer lines are discarded unread.
    pub max_line_bytes: usize,
}

impl Default for GpsdConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:2947".to_string(),
            reconnect_delay_seconds: 5,
            channel_capacity: 64,
            max_line_bytes: 64 * 1024,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct HistoryConfig {
    pub path: PathBuf,
    pub min_interval_seconds: u64,
    pub columns: Vec<HistoryColumn>,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("track.csv"),
            min_interval_seconds: 5,
            columns: HistoryColumn::ALL.to_vec(),
        }
    }
}

/// One column of the summary history file.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum HistoryColumn {
    Timestamp,
    Latitude,
    Longitude,
    Speed,
    Heading,
    Epx,
    Epy,
    Epv,
    Eps,
}

impl HistoryColumn {
    pub const ALL: [HistoryColumn; 9] = [
        Self::Timestamp,
        Self::Latitude,
        Self::Longitude,
        Self::Speed,
        Self::Heading,
        Self::Epx,
        Self::Epy,
        Self::Epv,
        Self::Eps,
    ];

    pub const fn header(self) -> &'static str {
        match self {
            Self::Timestamp => "timestamp",
            Self::Latitude => "latitude",
            Self::Longitude => "longitude",
            Self::Speed => "speed (m/s)",
            Self::Heading => "heading (°)",
            Self::Epx => "epx",
            Self::Epy => "epy",
            Self::Epv => "epv",
            Self::Eps => "eps",
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct AuditConfig {
    pub directory: PathBuf,
    pub file_name: String,
    /// One file per run, named after the process start time.
    pub timestamped: bool,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("."),
            file_name: "raw_gps_log.json".to_string(),
            timestamped: false,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub listen_addr: String,
    pub stale_after_seconds: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:5000".to_string(),
            stale_after_seconds: 10,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(transparent)]
pub struct TileSetsConfig(pub Vec<TileSetConfig>);

impl Default for TileSetsConfig {
    fn default() -> Self {
        Self(vec![
            TileSetConfig {
                name: "tiles_osm".to_string(),
                root: PathBuf::from("tiles_osm"),
                extension: default_tile_extension(),
            },
            TileSetConfig {
                name: "tiles_satellite".to_string(),
                root: PathBuf::from("tiles_sat"),
                extension: default_tile_extension(),
            },
        ])
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct TileSetConfig {
    /// First path segment the set is served under.
    pub name: String,
    pub root: PathBuf,
    #[serde(default = "default_tile_extension")]
    pub extension: String,
}

fn default_tile_extension() -> String {
    "png".to_string()
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct TileFetcherConfig {
    pub url_template: String,
    pub user_agent: String,
    pub delay_ms: u64,
    pub timeout_seconds: u64,
}

impl Default for TileFetcherConfig {
    fn default() -> Self {
        Self {
            url_template: "https://tile.openstreetmap.org/{z}/{x}/{y}.png".to_string(),
            user_agent: concat!(
                "gps-tracker-tile-fetcher/",
                env!("CARGO_PKG_VERSION"),
                " (offline tile cache)"
            )
            .to_string(),
            delay_ms: 200,
            timeout_seconds: 10,
        }
    }
}

pub fn load_config() -> Result<Config, ConfigError> {
    let config = Figment::new()
        .merge(Toml::file(SETTINGS_FILE))
        .merge(Env::prefixed(ENV_VAR_PREFIX).split("__"))
        .extract::<Config>()?;
    validate_history_columns(&config.history.columns)?;
    Ok(config)
}

fn validate_history_columns(columns: &[HistoryColumn]) -> Result<(), ConfigError> {
    if columns.is_empty() {
        return Err(ConfigError::InvalidHistoryColumns(
            "at least one column is required".to_string(),
        ));
    }
    for (i, column) in columns.iter().enumerate() {
        if columns[..i].contains(column) {
            return Err(ConfigError::InvalidHistoryColumns(format!(
                "column {} listed more than once",
                column.header()
            )));
        }
    }
    Ok(())
}

pub mod error {
    use thiserror::Error;
    use tracing::dispatcher::SetGlobalDefaultError;

    #[derive(Debug, Error)]
    pub enum ConfigError {
        #[error("failed to load configuration: {0}")]
        Figment(#[from] figment::Error),
        #[error("invalid history columns: {0}")]
        InvalidHistoryColumns(String),
    }

    #[derive(Debug, Error)]
    pub enum InitializationError {
        #[error(transparent)]
        Tracing(#[from] SetGlobalDefaultError),
        #[error(transparent)]
        Config(#[from] ConfigError),
    }
}

pub fn init_tracing() -> Result<(), InitializationError> {
    let subscriber = tracing_subscriber::fmt()
        .compact()
        .with_file(true)
        .with_line_number(true)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

pub async fn shutdown_listener(token: Option<CancellationToken>) {
    let ctrl_c = signal::ctrl_c();
    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::warn!(name: "signal.sigterm.unavailable", error = ?e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!(name: "signal.ctrlc.received", "received Ctrl+C signal, shutting down"),
        _ = terminate => info!(name: "signal.sigterm.received", "received SIGTERM signal, shutting down"),
    }

    if let Some(token) = token {
        token.cancel();
    }
}
