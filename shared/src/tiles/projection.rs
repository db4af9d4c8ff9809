//! Spherical Web-Mercator tiling: (lat, lon, zoom) to a 2^zoom x 2^zoom grid
//! with x growing east and y growing south.

use super::TileKey;
use std::f64::consts::PI;
use thiserror::Error;

/// Projectable latitudes are strictly inside (-MAX_LATITUDE, MAX_LATITUDE).
pub const MAX_LATITUDE: f64 = 85.05;
pub const MAX_ZOOM: u8 = 30;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ProjectionError {
    #[error("latitude {0} is outside the projectable range (-85.05, 85.05)")]
    LatitudeOutOfRange(f64),
    #[error("longitude {0} is outside [-180, 180]")]
    LongitudeOutOfRange(f64),
    #[error("zoom level {0} exceeds the maximum of 30")]
    ZoomTooLarge(u8),
    #[error("bounding box is inverted: {0}")]
    InvertedBoundingBox(String),
    #[error("at least one zoom level is required")]
    NoZoomLevels,
}

fn check_latitude(lat: f64) -> Result<(), ProjectionError> {
    if lat > -MAX_LATITUDE && lat < MAX_LATITUDE {
        Ok(())
    } else {
        Err(ProjectionError::LatitudeOutOfRange(lat))
    }
}

fn check_longitude(lon: f64) -> Result<(), ProjectionError> {
    if (-180.0..=180.0).contains(&lon) {
        Ok(())
    } else {
        Err(ProjectionError::LongitudeOutOfRange(lon))
    }
}

/// Returns the `(x, y)` index of the tile containing the point.
pub fn project(lat: f64, lon: f64, zoom: u8) -> Result<(u32, u32), ProjectionError> {
    check_latitude(lat)?;
    check_longitude(lon)?;
    if zoom > MAX_ZOOM {
        return Err(ProjectionError::ZoomTooLarge(zoom));
    }

    let n = 2f64.powi(i32::from(zoom));
    let max_index = (1u32 << zoom) - 1;
    let lat_rad = lat.to_radians();
    let x = ((lon + 180.0) / 360.0 * n).floor();
    let y = ((1.0 - (lat_rad.tan() + 1.0 / lat_rad.cos()).ln() / PI) / 2.0 * n).floor();

    // lon = 180 falls on the east edge of the grid, one past the last column
    Ok((to_index(x, max_index), to_index(y, max_index)))
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn to_index(value: f64, max_index: u32) -> u32 {
    value.clamp(0.0, f64::from(max_index)) as u32
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    min_lat: f64,
    min_lon: f64,
    max_lat: f64,
    max_lon: f64,
}

impl BoundingBox {
    pub fn new(
        min_lat: f64,
        min_lon: f64,
        max_lat: f64,
        max_lon: f64,
    ) -> Result<Self, ProjectionError> {
        check_latitude(min_lat)?;
        check_latitude(max_lat)?;
        check_longitude(min_lon)?;
        check_longitude(max_lon)?;
        if min_lat > max_lat {
            return Err(ProjectionError::InvertedBoundingBox(format!(
                "min latitude {min_lat} is north of max latitude {max_lat}"
            )));
        }
        if min_lon > max_lon {
            return Err(ProjectionError::InvertedBoundingBox(format!(
                "min longitude {min_lon} is east of max longitude {max_lon}"
            )));
        }

        Ok(Self {
            min_lat,
            min_lon,
            max_lat,
            max_lon,
        })
    }

    pub fn min_lat(&self) -> f64 {
        self.min_lat
    }

    pub fn min_lon(&self) -> f64 {
        self.min_lon
    }

    pub fn max_lat(&self) -> f64 {
        self.max_lat
    }

    pub fn max_lon(&self) -> f64 {
        self.max_lon
    }

    /// Tiles covering the box at `zoom`, from the northwest corner to the
    /// southeast corner. y grows southward, so the north edge gives the
    /// smallest y.
    pub fn tile_range(&self, zoom: u8) -> Result<TileRange, ProjectionError> {
        let (x_start, y_start) = project(self.max_lat, self.min_lon, zoom)?;
        let (x_end, y_end) = project(self.min_lat, self.max_lon, zoom)?;
        Ok(TileRange {
            zoom,
            x_start,
            x_end,
            y_start,
            y_end,
        })
    }
}

pub fn tile_ranges(bbox: &BoundingBox, zooms: &[u8]) -> Result<Vec<TileRange>, ProjectionError> {
    if zooms.is_empty() {
        return Err(ProjectionError::NoZoomLevels);
    }
    zooms.iter().map(|&zoom| bbox.tile_range(zoom)).collect()
}

/// Inclusive rectangle of tiles at one zoom level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileRange {
    zoom: u8,
    x_start: u32,
    x_end: u32,
    y_start: u32,
    y_end: u32,
}

impl TileRange {
    pub fn zoom(&self) -> u8 {
        self.zoom
    }

    pub fn x(&self) -> std::ops::RangeInclusive<u32> {
        self.x_start..=self.x_end
    }

    pub fn y(&self) -> std::ops::RangeInclusive<u32> {
        self.y_start..=self.y_end
    }

    pub fn len(&self) -> u64 {
        u64::from(self.x_end - self.x_start + 1) * u64::from(self.y_end - self.y_start + 1)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Column by column, north to south within each column.
    pub fn keys(&self) -> impl Iterator<Item = TileKey> + use<> {
        let Self {
            zoom,
            x_start,
            x_end,
            y_start,
            y_end,
        } = *self;
        (x_start..=x_end)
            .flat_map(move |x| (y_start..=y_end).map(move |y| TileKey::new(zoom, x, y)))
    }
}
