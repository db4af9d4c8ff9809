mod projection;
mod store;

pub use projection::{
    BoundingBox, MAX_LATITUDE, MAX_ZOOM, ProjectionError, TileRange, project, tile_ranges,
};
pub use store::TileStore;

use std::fmt::{Display, Formatter};

/// Identifies one cached tile image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TileKey {
    pub zoom: u8,
    pub x: u32,
    pub y: u32,
}

impl TileKey {
    pub const fn new(zoom: u8, x: u32, y: u32) -> Self {
        Self { zoom, x, y }
    }
}

impl Display for TileKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.zoom, self.x, self.y)
    }
}
