//! MBTiles archive access.
//!
//! The archive is a single SQLite file with a `metadata` key/value table and
//! a `tiles` table unique on `(zoom_level, tile_column, tile_row)`. Tiles are
//! only ever inserted, one transaction per downloaded batch.

use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use std::{collections::BTreeMap, path::Path};
use thiserror::Error;
use tracing::debug;

use crate::task::TilesetMetadata;
use crate::tile::{TileCoord, TilingScheme};

const SQL_CREATE_METADATA: &str = "CREATE TABLE IF NOT EXISTS metadata (name TEXT, value TEXT)";
const SQL_CREATE_TILES: &str = "CREATE TABLE IF NOT EXISTS tiles (
    zoom_level INTEGER,
    tile_column INTEGER,
    tile_row INTEGER,
    tile_data BLOB
)";
const SQL_CREATE_TILES_INDEX: &str =
    "CREATE UNIQUE INDEX IF NOT EXISTS tile_index ON tiles (zoom_level, tile_column, tile_row)";
const SQL_INSERT_TILE: &str =
    "INSERT INTO tiles (zoom_level, tile_column, tile_row, tile_data) VALUES (?1, ?2, ?3, ?4)";
const SQL_QUERY_TILE: &str =
    "SELECT tile_data FROM tiles WHERE zoom_level = ?1 AND tile_column = ?2 AND tile_row = ?3";
const SQL_HAS_TILE: &str =
    "SELECT 1 FROM tiles WHERE zoom_level = ?1 AND tile_column = ?2 AND tile_row = ?3";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("tile archive error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("failed preparing archive location: {0}")]
    Io(#[from] std::io::Error),
}

/// How hard the archive pushes writes to disk.
///
/// The checkpoint is only advanced after a batch commit, so losing the last
/// few transactions on power loss costs a re-download, not consistency.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum Durability {
    /// WAL with `synchronous = NORMAL`: no fsync per commit.
    #[default]
    Relaxed,
    /// WAL with `synchronous = FULL`.
    Full,
    /// WAL with `synchronous = OFF`.
    Off,
}

impl Durability {
    fn synchronous(self) -> &'static str {
        match self {
            Durability::Relaxed => "NORMAL",
            Durability::Full => "FULL",
            Durability::Off => "OFF",
        }
    }
}

/// A tile archive opened for one task.
pub struct TileStore {
    conn: Connection,
    scheme: TilingScheme,
}

impl TileStore {
    /// Opens (creating if necessary) the archive at `path`.
    pub fn open(
        path: impl AsRef<Path>,
        scheme: TilingScheme,
        durability: Durability,
    ) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        conn.execute_batch(&format!(
            "PRAGMA journal_mode = WAL; PRAGMA synchronous = {};",
            durability.synchronous()
        ))?;

        debug!(path = %path.display(), %scheme, ?durability, "opened tile archive");
        Ok(Self { conn, scheme })
    }

    /// Opens an existing archive without creating or modifying anything.
    pub fn open_read_only(path: impl AsRef<Path>, scheme: TilingScheme) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;

        debug!(path = %path.display(), %scheme, "opened tile archive read-only");
        Ok(Self { conn, scheme })
    }

    pub fn scheme(&self) -> TilingScheme {
        self.scheme
    }

    /// Creates the metadata and tile tables and the tile index. Safe to call
    /// on an archive that already has them.
    pub fn init_schema(&self) -> Result<(), StoreError> {
        self.conn.execute_batch(&format!(
            "{}; {}; {};",
            SQL_CREATE_METADATA, SQL_CREATE_TILES, SQL_CREATE_TILES_INDEX
        ))?;
        Ok(())
    }

    /// Replaces the descriptive metadata of the archive.
    pub fn write_metadata(&mut self, metadata: &TilesetMetadata) -> Result<(), StoreError> {
        let tx = self.conn.transaction()?;
        tx.execute("DELETE FROM metadata", [])?;
        {
            let mut stmt = tx.prepare("INSERT INTO metadata (name, value) VALUES (?1, ?2)")?;
            for (name, value) in metadata.pairs(self.scheme) {
                stmt.execute(params![name, value])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn metadata(&self) -> Result<BTreeMap<String, String>, StoreError> {
        let mut stmt = self.conn.prepare("SELECT name, value FROM metadata")?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;

        let mut map = BTreeMap::new();
        for row in rows {
            let (name, value): (String, String) = row?;
            map.insert(name, value);
        }
        Ok(map)
    }

    pub fn has(&self, coord: &TileCoord) -> Result<bool, StoreError> {
        let mut stmt = self.conn.prepare_cached(SQL_HAS_TILE)?;
        let found = stmt.exists(params![coord.zoom, coord.x, self.scheme.row(coord)])?;
        Ok(found)
    }

    pub fn tile(&self, coord: &TileCoord) -> Result<Option<Vec<u8>>, StoreError> {
        let mut stmt = self.conn.prepare_cached(SQL_QUERY_TILE)?;
        let data = stmt
            .query_row(params![coord.zoom, coord.x, self.scheme.row(coord)], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(data)
    }

    /// Inserts all `tiles` in one transaction. Either every row is written or,
    /// if any insert fails, none of them are.
    pub fn save_batch(&mut self, tiles: &[(TileCoord, Vec<u8>)]) -> Result<usize, StoreError> {
        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(SQL_INSERT_TILE)?;
            for (coord, data) in tiles {
                stmt.execute(params![coord.zoom, coord.x, self.scheme.row(coord), data])?;
            }
        }
        tx.commit()?;

        Ok(tiles.len())
    }

    /// Number of stored tiles at `zoom`.
    pub fn count_tiles(&self, zoom: u8) -> Result<u64, StoreError> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM tiles WHERE zoom_level = ?1",
            params![zoom],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bounding_box::GeoBounds;

    fn open(dir: &tempfile::TempDir, scheme: TilingScheme) -> TileStore {
        let store = TileStore::open(dir.path().join("test.mbtiles"), scheme, Durability::Relaxed)
            .unwrap();
        store.init_schema().unwrap();
        store
    }

    fn metadata() -> TilesetMetadata {
        TilesetMetadata::new(
            GeoBounds::new(-180.0, 85.0511, 179.999999, -85.0511),
            1,
            3,
            "https://t{s}.example.com/{z}/{x}/{y}?tk={key}",
        )
    }

    #[test]
    fn schema_init_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = open(&dir, TilingScheme::TopLeftOrigin);
        store.save_batch(&[(TileCoord::new(1, 0, 0), vec![1])]).unwrap();
        store.init_schema().unwrap();
        assert!(store.has(&TileCoord::new(1, 0, 0)).unwrap());
    }

    #[test]
    fn uses_write_ahead_log() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir, TilingScheme::TopLeftOrigin);
        let mode: String = store
            .conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap();
        assert_eq!(mode.to_lowercase(), "wal");
    }

    #[test]
    fn saves_and_reads_back_tiles() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = open(&dir, TilingScheme::TopLeftOrigin);
        let coord = TileCoord::new(2, 1, 3);
        assert!(!store.has(&coord).unwrap());

        store.save_batch(&[(coord, b"png".to_vec())]).unwrap();
        assert!(store.has(&coord).unwrap());
        assert_eq!(store.tile(&coord).unwrap(), Some(b"png".to_vec()));
        assert_eq!(store.count_tiles(2).unwrap(), 1);
        assert_eq!(store.count_tiles(3).unwrap(), 0);
    }

    #[test]
    fn inverted_scheme_flips_stored_row() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = open(&dir, TilingScheme::InvertedRowOrigin);
        store.save_batch(&[(TileCoord::new(2, 1, 0), vec![7])]).unwrap();

        let row: u32 = store
            .conn
            .query_row("SELECT tile_row FROM tiles", [], |row| row.get(0))
            .unwrap();
        assert_eq!(row, 3);
        assert!(store.has(&TileCoord::new(2, 1, 0)).unwrap());
        assert!(!store.has(&TileCoord::new(2, 1, 3)).unwrap());
    }

    #[test]
    fn failed_batch_leaves_nothing_behind() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = open(&dir, TilingScheme::TopLeftOrigin);
        store.save_batch(&[(TileCoord::new(3, 4, 4), vec![0])]).unwrap();

        // the duplicate of (3, 4, 4) fails after two rows were inserted
        let batch = vec![
            (TileCoord::new(3, 1, 1), vec![1]),
            (TileCoord::new(3, 2, 1), vec![2]),
            (TileCoord::new(3, 4, 4), vec![3]),
        ];
        assert!(store.save_batch(&batch).is_err());

        assert!(!store.has(&TileCoord::new(3, 1, 1)).unwrap());
        assert!(!store.has(&TileCoord::new(3, 2, 1)).unwrap());
        assert_eq!(store.tile(&TileCoord::new(3, 4, 4)).unwrap(), Some(vec![0]));
        assert_eq!(store.count_tiles(3).unwrap(), 1);
    }

    #[test]
    fn read_only_archive_rejects_writes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.mbtiles");
        let mut writer = open(&dir, TilingScheme::TopLeftOrigin);
        writer.save_batch(&[(TileCoord::new(1, 1, 0), vec![1])]).unwrap();

        let mut reader = TileStore::open_read_only(&path, TilingScheme::TopLeftOrigin).unwrap();
        assert_eq!(reader.count_tiles(1).unwrap(), 1);
        assert!(reader.save_batch(&[(TileCoord::new(1, 0, 0), vec![2])]).is_err());
    }

    #[test]
    fn read_only_open_of_missing_archive_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.mbtiles");
        assert!(TileStore::open_read_only(&path, TilingScheme::TopLeftOrigin).is_err());
        assert!(!path.exists());
    }

    #[test]
    fn metadata_is_replaced_not_appended() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = open(&dir, TilingScheme::InvertedRowOrigin);
        store.write_metadata(&metadata()).unwrap();
        store.write_metadata(&metadata()).unwrap();

        let stored = store.metadata().unwrap();
        assert_eq!(stored["minzoom"], "1");
        assert_eq!(stored["maxzoom"], "3");
        assert_eq!(stored["scheme"], "tms");
        assert_eq!(stored["format"], "png");
        assert_eq!(stored["bounds"], "-180,85.0511,179.999999,-85.0511");

        let rows: i64 = store
            .conn
            .query_row("SELECT COUNT(*) FROM metadata WHERE name = 'minzoom'", [], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(rows, 1);
    }
}
