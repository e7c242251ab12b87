//! Row-major enumeration of the tiles of one zoom level.
//!
//! A [`TileRange`] is flattened into offsets `0..len()`, row by row from the
//! north-west corner. Resuming "after" a tile means starting at the offset
//! right behind it, so batches cut from a checkpoint never re-emit the
//! checkpointed tile and never skip the one following it.

use std::fmt;
use thiserror::Error;

use crate::bounding_box::GeoBounds;
use crate::tile::TileCoord;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RangeError {
    #[error("resume position ({x}, {y}) lies outside tile range {range}")]
    OutsideRange { x: u32, y: u32, range: TileRange },
}

/// Inclusive tile index bounds at one zoom level.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct TileRange {
    pub zoom: u8,
    pub min_x: u32,
    pub min_y: u32,
    pub max_x: u32,
    pub max_y: u32,
}

impl TileRange {
    /// Converts both corners of `bounds` independently and takes them as
    /// given. A box listed in the wrong orientation yields an empty range.
    pub fn from_bounds(bounds: &GeoBounds, zoom: u8) -> Self {
        let min = TileCoord::from_lon_lat(bounds.min_lon, bounds.min_lat, zoom);
        let max = TileCoord::from_lon_lat(bounds.max_lon, bounds.max_lat, zoom);

        TileRange {
            zoom,
            min_x: min.x,
            min_y: min.y,
            max_x: max.x,
            max_y: max.y,
        }
    }

    pub fn width(&self) -> u64 {
        span(self.min_x, self.max_x)
    }

    pub fn height(&self) -> u64 {
        span(self.min_y, self.max_y)
    }

    /// Number of tiles in the range.
    pub fn len(&self) -> u64 {
        self.width() * self.height()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, x: u32, y: u32) -> bool {
        !self.is_empty()
            && (self.min_x..=self.max_x).contains(&x)
            && (self.min_y..=self.max_y).contains(&y)
    }

    /// Row-major offset of `(x, y)`, or `None` if it lies outside the range.
    pub fn position(&self, x: u32, y: u32) -> Option<u64> {
        if !self.contains(x, y) {
            return None;
        }

        let row = (y - self.min_y) as u64;
        let col = (x - self.min_x) as u64;
        Some(row * self.width() + col)
    }

    /// The tile at row-major `offset`.
    pub fn coord_at(&self, offset: u64) -> Option<TileCoord> {
        if offset >= self.len() {
            return None;
        }

        let w = self.width();
        let x = self.min_x as u64 + offset % w;
        let y = self.min_y as u64 + offset / w;
        Some(TileCoord::new(self.zoom, x as u32, y as u32))
    }

    /// Offset of the first tile that still has to be processed when `after`
    /// was the last one completed.
    pub fn offset_after(&self, after: Option<(u32, u32)>) -> Result<u64, RangeError> {
        match after {
            None => Ok(0),
            Some((x, y)) => self
                .position(x, y)
                .map(|p| p + 1)
                .ok_or(RangeError::OutsideRange { x, y, range: *self }),
        }
    }

    /// Up to `size` tiles starting right after `after` (or at the start of
    /// the range). An empty batch means the range is exhausted.
    pub fn batch_after(
        &self,
        after: Option<(u32, u32)>,
        size: usize,
    ) -> Result<Vec<TileCoord>, RangeError> {
        let start = self.offset_after(after)?;
        let end = start.saturating_add(size as u64).min(self.len());

        Ok((start..end).filter_map(|offset| self.coord_at(offset)).collect())
    }

    /// Iterates the consecutive batches of the whole range.
    pub fn batches(&self, size: usize) -> Batches {
        Batches {
            range: *self,
            after: None,
            size,
            done: size == 0,
        }
    }

    /// Every tile of the range in row-major order.
    pub fn iter(&self) -> impl Iterator<Item = TileCoord> {
        let r = *self;
        let ys = if r.is_empty() { 1..=0 } else { r.min_y..=r.max_y };

        ys.flat_map(move |y| (r.min_x..=r.max_x).map(move |x| TileCoord::new(r.zoom, x, y)))
    }
}

fn span(min: u32, max: u32) -> u64 {
    if max < min {
        0
    } else {
        (max - min) as u64 + 1
    }
}

impl fmt::Display for TileRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "z{} x {}..={} y {}..={} ({} tiles)",
            self.zoom,
            self.min_x,
            self.max_x,
            self.min_y,
            self.max_y,
            self.len()
        )
    }
}

/// Iterator over the batches of a [`TileRange`], each one resumed from the
/// last tile of its predecessor.
#[derive(Debug)]
pub struct Batches {
    range: TileRange,
    after: Option<(u32, u32)>,
    size: usize,
    done: bool,
}

impl Iterator for Batches {
    type Item = Vec<TileCoord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        let batch = self.range.batch_after(self.after, self.size).ok()?;
        match batch.last() {
            Some(last) => {
                self.after = Some((last.x, last.y));
                Some(batch)
            }
            None => {
                self.done = true;
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn range(zoom: u8, min_x: u32, min_y: u32, max_x: u32, max_y: u32) -> TileRange {
        TileRange {
            zoom,
            min_x,
            min_y,
            max_x,
            max_y,
        }
    }

    #[test]
    fn world_at_zoom_one() {
        let world = GeoBounds::new(-180.0, 85.0511, 179.999999, -85.0511);
        assert_eq!(TileRange::from_bounds(&world, 1), range(1, 0, 0, 1, 1));
        assert_eq!(TileRange::from_bounds(&world, 1), TileRange::from_bounds(&world, 1));
    }

    #[test]
    fn china_at_zoom_nine() {
        let china = GeoBounds::new(72.86133, 53.80065, 145.81055, 1.1425);
        assert_eq!(TileRange::from_bounds(&china, 9), range(9, 359, 164, 463, 254));
    }

    #[test]
    fn inverted_bounds_are_empty() {
        let upside_down = GeoBounds::new(-180.0, -85.0511, 179.999999, 85.0511);
        let r = TileRange::from_bounds(&upside_down, 3);
        assert!(r.is_empty());
        assert_eq!(r.iter().count(), 0);
        assert!(r.batch_after(None, 10).unwrap().is_empty());
        assert_eq!(r.batches(10).count(), 0);
    }

    #[test]
    fn batches_visit_every_tile_once() {
        let r = range(7, 10, 20, 16, 24);
        for size in [1, 3, 7, 35, 36, 100] {
            let mut seen = HashSet::new();
            let flat: Vec<TileCoord> = r.batches(size).flatten().collect();
            for coord in &flat {
                assert!(seen.insert(*coord), "duplicate {} for size {}", coord, size);
            }
            assert_eq!(flat, r.iter().collect::<Vec<_>>(), "size {}", size);
            assert_eq!(flat.len() as u64, r.len());
        }
    }

    #[test]
    fn batch_sizes_shrink_at_the_end() {
        let r = range(1, 0, 0, 1, 1);
        let sizes: Vec<usize> = r.batches(3).map(|b| b.len()).collect();
        assert_eq!(sizes, vec![3, 1]);
    }

    #[test]
    fn resume_starts_after_checkpoint() {
        let r = range(5, 8, 10, 14, 15);
        let batch = r.batch_after(Some((10, 12)), 4).unwrap();
        assert_eq!(
            batch,
            vec![
                TileCoord::new(5, 11, 12),
                TileCoord::new(5, 12, 12),
                TileCoord::new(5, 13, 12),
                TileCoord::new(5, 14, 12),
            ]
        );

        // wraps onto the next row
        let batch = r.batch_after(Some((14, 12)), 2).unwrap();
        assert_eq!(batch, vec![TileCoord::new(5, 8, 13), TileCoord::new(5, 9, 13)]);
    }

    #[test]
    fn resume_after_last_tile_is_exhausted() {
        let r = range(5, 8, 10, 14, 15);
        assert!(r.batch_after(Some((14, 15)), 16).unwrap().is_empty());
    }

    #[test]
    fn resume_outside_range_is_rejected() {
        let r = range(5, 8, 10, 14, 15);
        assert_eq!(
            r.batch_after(Some((3, 12)), 4),
            Err(RangeError::OutsideRange { x: 3, y: 12, range: r })
        );
    }

    #[test]
    fn offsets_round_trip_on_deep_zoom() {
        let r = range(18, 201536, 104384, 211391, 115455);
        let last = r.coord_at(r.len() - 1).unwrap();
        assert_eq!((last.x, last.y), (211391, 115455));
        assert_eq!(r.position(last.x, last.y), Some(r.len() - 1));
        assert_eq!(r.coord_at(r.len()), None);
        assert_eq!(r.len(), 109_125_632);
    }
}
