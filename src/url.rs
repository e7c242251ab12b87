use maplit::hashmap;
use rand::seq::SliceRandom;
use std::fmt;
use strfmt::strfmt;

use crate::tile::{TileCoord, TilingScheme};

/// Shards substituted for `{s}` when a task doesn't name its own.
const DEFAULT_SHARDS: &[&str] = &["0", "1", "2", "3", "4", "5", "6", "7"];

/// A tile URL template.
///
/// Supported specifiers: `{s}` (a shard picked at random per request to
/// spread the load between servers), `{key}` (the access credential), `{z}`,
/// `{x}`, `{y}` (row counted from the north) and `{tms_y}` (row counted from
/// the south).
#[derive(Clone, PartialEq)]
pub struct UrlFormat {
    format_str: String,
    shards: Vec<String>,
}

impl UrlFormat {
    pub fn from_str(format_str: impl Into<String>) -> Self {
        Self {
            format_str: format_str.into(),
            shards: DEFAULT_SHARDS.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// Replaces the shard pool. An empty pool keeps the default one.
    pub fn with_shards(mut self, shards: Vec<String>) -> Self {
        if !shards.is_empty() {
            self.shards = shards;
        }
        self
    }

    pub fn as_str(&self) -> &str {
        &self.format_str
    }

    fn shard(&self) -> &str {
        self.shards
            .choose(&mut rand::thread_rng())
            .map(String::as_str)
            .unwrap_or_default()
    }

    pub fn tile_url(&self, tile: &TileCoord, credential: &str) -> Result<String, strfmt::FmtError> {
        let vars = hashmap! {
            "s".to_owned() => self.shard().to_owned(),
            "key".to_owned() => credential.to_owned(),
            "x".to_owned() => tile.x.to_string(),
            "y".to_owned() => tile.y.to_string(),
            "tms_y".to_owned() => TilingScheme::InvertedRowOrigin.row(tile).to_string(),
            "z".to_owned() => tile.zoom.to_string(),
        };

        strfmt(&self.format_str, &vars)
    }
}

impl fmt::Debug for UrlFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UrlFormat")
            .field("format_str", &self.format_str)
            .field("shards", &self.shards.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn substitutes_every_specifier() {
        let fmt = UrlFormat::from_str("https://t{s}.example.com/{z}/{x}/{y}/{tms_y}?tk={key}")
            .with_shards(vec!["3".into()]);
        let url = fmt.tile_url(&TileCoord::new(3, 5, 1), "abc").unwrap();
        assert_eq!(url, "https://t3.example.com/3/5/1/6?tk=abc");
    }

    #[test]
    fn shard_comes_from_the_pool() {
        let fmt = UrlFormat::from_str("{s}");
        for _ in 0..32 {
            let url = fmt.tile_url(&TileCoord::new(0, 0, 0), "").unwrap();
            assert!(DEFAULT_SHARDS.contains(&url.as_str()), "unexpected shard {}", url);
        }
    }

    #[test]
    fn unknown_specifier_fails() {
        let fmt = UrlFormat::from_str("https://example.com/{zoom}/{x}/{y}");
        assert!(fmt.tile_url(&TileCoord::new(1, 0, 0), "k").is_err());
    }
}
