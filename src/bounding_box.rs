use serde::{Deserialize, Serialize};
use std::fmt;

use crate::range::TileRange;

/// A geographic bounding box in degrees, stored the way task descriptors
/// write it: `[min_lon, min_lat, max_lon, max_lat]`.
///
/// The corners are taken as given. Tile rows grow southwards, so a box that
/// should produce a non-empty range lists its northern latitude as `min_lat`.
///
/// # Example
/// ```rust
/// # use tile_harvester::GeoBounds;
/// let world = GeoBounds::new(-180.0, 85.0511, 179.999999, -85.0511);
/// let range = world.range(1);
/// assert_eq!((range.min_x, range.min_y, range.max_x, range.max_y), (0, 0, 1, 1));
/// ```
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(from = "[f64; 4]", into = "[f64; 4]")]
pub struct GeoBounds {
    pub min_lon: f64,
    pub min_lat: f64,
    pub max_lon: f64,
    pub max_lat: f64,
}

impl GeoBounds {
    pub fn new(min_lon: f64, min_lat: f64, max_lon: f64, max_lat: f64) -> Self {
        GeoBounds {
            min_lon,
            min_lat,
            max_lon,
            max_lat,
        }
    }

    /// The tile index range covered by this box at `zoom`.
    pub fn range(&self, zoom: u8) -> TileRange {
        TileRange::from_bounds(self, zoom)
    }

    /// Creates an iterator over the tile ranges of every zoom level in
    /// `min_zoom..=max_zoom`.
    pub fn ranges(
        &self,
        min_zoom: u8,
        max_zoom: u8,
    ) -> impl Iterator<Item = TileRange> + fmt::Debug {
        let bounds = *self;
        (min_zoom..=max_zoom).map(move |zoom| bounds.range(zoom))
    }

    /// Midpoint of the box, used for the archive's `center` metadata.
    pub fn center(&self) -> (f64, f64) {
        (
            (self.min_lon + self.max_lon) / 2_f64,
            (self.min_lat + self.max_lat) / 2_f64,
        )
    }
}

impl From<[f64; 4]> for GeoBounds {
    fn from([min_lon, min_lat, max_lon, max_lat]: [f64; 4]) -> Self {
        Self::new(min_lon, min_lat, max_lon, max_lat)
    }
}

impl From<GeoBounds> for [f64; 4] {
    fn from(b: GeoBounds) -> Self {
        [b.min_lon, b.min_lat, b.max_lon, b.max_lat]
    }
}

impl fmt::Display for GeoBounds {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{},{},{},{}",
            self.min_lon, self.min_lat, self.max_lon, self.max_lat
        )
    }
}
