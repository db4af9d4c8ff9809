use crate::gpsd::Tpv;
use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum InvalidReport {
    #[error("report has no latitude")]
    MissingLatitude,
    #[error("report has no longitude")]
    MissingLongitude,
    #[error("latitude {0} is outside [-90, 90]")]
    LatitudeOutOfRange(f64),
    #[error("longitude {0} is outside [-180, 180]")]
    LongitudeOutOfRange(f64),
}

/// One accepted observation. Construction validates the position, so a
/// `PositionReport` always carries an in-range latitude and longitude.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PositionReport {
    pub latitude: f64,
    pub longitude: f64,
    pub speed: Option<f64>,
    pub heading: Option<f64>,
    pub err_east: Option<f64>,
    pub err_north: Option<f64>,
    pub err_vertical: Option<f64>,
    pub err_speed: Option<f64>,
}

impl TryFrom<&Tpv> for PositionReport {
    type Error = InvalidReport;

    fn try_from(tpv: &Tpv) -> Result<Self, Self::Error> {
        let latitude = tpv.lat.ok_or(InvalidReport::MissingLatitude)?;
        let longitude = tpv.lon.ok_or(InvalidReport::MissingLongitude)?;
        // NaN fails both range checks
        if !(-90.0..=90.0).contains(&latitude) {
            return Err(InvalidReport::LatitudeOutOfRange(latitude));
        }
        if !(-180.0..=180.0).contains(&longitude) {
            return Err(InvalidReport::LongitudeOutOfRange(longitude));
        }

        Ok(Self {
            latitude,
            longitude,
            speed: tpv.speed,
            heading: tpv.track,
            err_east: tpv.epx,
            err_north: tpv.epy,
            err_vertical: tpv.epv,
            err_speed: tpv.eps,
        })
    }
}

/// The latest accepted report as served to queriers. Every field is absent
/// until the first report is published.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetrySnapshot {
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub speed: Option<f64>,
    pub track: Option<f64>,
    pub epx: Option<f64>,
    pub epy: Option<f64>,
    pub epv: Option<f64>,
    pub eps: Option<f64>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl TelemetrySnapshot {
    fn from_report(report: &PositionReport, received_at: DateTime<Utc>) -> Self {
        Self {
            lat: Some(report.latitude),
            lon: Some(report.longitude),
            speed: report.speed,
            track: report.heading,
            epx: report.err_east,
            epy: report.err_north,
            epv: report.err_vertical,
            eps: report.err_speed,
            updated_at: Some(received_at),
        }
    }

    /// A snapshot that has never been updated is always stale.
    pub fn is_stale(&self, now: DateTime<Utc>, max_age: TimeDelta) -> bool {
        self.updated_at.is_none_or(|updated_at| now - updated_at > max_age)
    }
}

/// Shared handle to the latest-value cache. Clones point at the same value.
///
/// The whole snapshot is replaced under the write lock and copied out under
/// the read lock, so a reader never sees fields from two different reports.
#[derive(Clone, Default)]
pub struct TelemetryCache {
    inner: Arc<RwLock<TelemetrySnapshot>>,
}

impl TelemetryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, report: &PositionReport, received_at: DateTime<Utc>) {
        let snapshot = TelemetrySnapshot::from_report(report, received_at);
        *self.inner.write() = snapshot;
    }

    pub fn read(&self) -> TelemetrySnapshot {
        *self.inner.read()
    }
}
