use serde::{Deserialize, Serialize};
use std::{f64::consts::PI, fmt};

/// Deepest zoom level whose tile indices (and row-major offsets) fit the
/// integer types used here.
pub const MAX_ZOOM: u8 = 30;

/// An OSM slippy-map tile with x, y and z-coordinate.
///
/// `y` counts from the northern edge of the map. How that row ends up in an
/// archive is decided by the task's [`TilingScheme`].
/// ref: https://wiki.openstreetmap.org/wiki/Slippy_map_tilenames
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct TileCoord {
    pub zoom: u8,
    pub x: u32,
    pub y: u32,
}

impl TileCoord {
    pub fn new(zoom: u8, x: u32, y: u32) -> Self {
        Self { zoom, x, y }
    }

    /// Projects a longitude/latitude pair (in degrees) onto the tile grid at
    /// `zoom`.
    ///
    /// Indices are clamped into the grid, so the poles and `lon = 180` map to
    /// the edge tiles instead of falling off the map.
    pub fn from_lon_lat(lon: f64, lat: f64, zoom: u8) -> Self {
        debug_assert!(zoom <= MAX_ZOOM);

        // scale factor
        let n = 2_f64.powi(zoom as i32);
        let lat_rad = lat * PI / 180_f64;

        let x = (lon + 180_f64) / 360_f64 * n;
        let y = (1_f64 - lat_rad.tan().asinh() / PI) / 2_f64 * n;

        Self::new(zoom, clamp_index(x, zoom), clamp_index(y, zoom))
    }

    /// Number of tiles along one axis at this tile's zoom level.
    pub fn grid_size(&self) -> u64 {
        1_u64 << self.zoom
    }
}

impl fmt::Display for TileCoord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.zoom, self.x, self.y)
    }
}

fn clamp_index(v: f64, zoom: u8) -> u32 {
    let max = (1_u64 << zoom) - 1;
    if v.is_nan() || v <= 0_f64 {
        return 0;
    }

    (v.floor() as u64).min(max) as u32
}

/// Row numbering convention of a tile archive.
///
/// Selected once per task; every read and write against the archive goes
/// through [`TilingScheme::row`], so the two conventions never mix within one
/// file.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub enum TilingScheme {
    /// Row 0 is the northernmost row (XYZ numbering).
    #[default]
    #[serde(rename = "xyz")]
    TopLeftOrigin,

    /// Row 0 is the southernmost row (TMS numbering).
    #[serde(rename = "tms")]
    InvertedRowOrigin,
}

impl TilingScheme {
    /// The row under which `coord` is stored.
    pub fn row(self, coord: &TileCoord) -> u32 {
        match self {
            TilingScheme::TopLeftOrigin => coord.y,
            TilingScheme::InvertedRowOrigin => (coord.grid_size() - 1 - coord.y as u64) as u32,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TilingScheme::TopLeftOrigin => "xyz",
            TilingScheme::InvertedRowOrigin => "tms",
        }
    }
}

impl fmt::Display for TilingScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tile_index() {
        let tile = TileCoord::from_lon_lat(6.0402, 50.7929, 18);
        assert_eq!((tile.x, tile.y), (135470, 87999));
    }

    #[test]
    fn equator_prime_meridian() {
        let tile = TileCoord::from_lon_lat(0.0, 0.0, 1);
        assert_eq!((tile.x, tile.y), (1, 1));
    }

    #[test]
    fn poles_and_antimeridian_clamp_to_edges() {
        assert_eq!(TileCoord::from_lon_lat(180.0, 90.0, 3), TileCoord::new(3, 7, 0));
        assert_eq!(TileCoord::from_lon_lat(-180.0, -90.0, 3), TileCoord::new(3, 0, 7));
        assert_eq!(TileCoord::from_lon_lat(-200.0, 0.0, 0), TileCoord::new(0, 0, 0));
    }

    #[test]
    fn inverted_rows() {
        let tile = TileCoord::new(2, 1, 0);
        assert_eq!(TilingScheme::TopLeftOrigin.row(&tile), 0);
        assert_eq!(TilingScheme::InvertedRowOrigin.row(&tile), 3);
        assert_eq!(TilingScheme::InvertedRowOrigin.row(&TileCoord::new(0, 0, 0)), 0);
    }

    #[test]
    fn scheme_names() {
        let scheme: TilingScheme = serde_json::from_str("\"tms\"").unwrap();
        assert_eq!(scheme, TilingScheme::InvertedRowOrigin);
        assert_eq!(TilingScheme::default().to_string(), "xyz");
    }
}
