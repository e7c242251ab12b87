//! Task descriptors and the checkpoint they carry.
//!
//! A descriptor file holds a list of tasks. The file is read completely on
//! startup and rewritten completely (and atomically) whenever a task's
//! progress changes; fields this crate does not know about are kept as they
//! are.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::{
    fmt, fs,
    io::Write,
    path::{Path, PathBuf},
    str::FromStr,
};
use thiserror::Error;
use tracing::debug;

use crate::bounding_box::GeoBounds;
use crate::range::TileRange;
use crate::tile::{TilingScheme, MAX_ZOOM};

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("failed accessing task file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed task file {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid checkpoint {value:?}: expected \"zoom-x-y\"")]
pub struct ParseCheckpointError {
    value: String,
}

/// The last tile of the most recently committed batch.
///
/// Serialized as `"zoom-x-y"`.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Checkpoint {
    pub zoom: u8,
    pub x: u32,
    pub y: u32,
}

impl Checkpoint {
    pub fn new(zoom: u8, x: u32, y: u32) -> Self {
        Self { zoom, x, y }
    }
}

impl FromStr for Checkpoint {
    type Err = ParseCheckpointError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ParseCheckpointError {
            value: s.to_owned(),
        };

        let mut parts = s.trim().split('-');
        let (zoom, x, y) = match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(zoom), Some(x), Some(y), None) => (zoom, x, y),
            _ => return Err(invalid()),
        };

        Ok(Checkpoint {
            zoom: zoom.parse().map_err(|_| invalid())?,
            x: x.parse().map_err(|_| invalid())?,
            y: y.parse().map_err(|_| invalid())?,
        })
    }
}

impl TryFrom<String> for Checkpoint {
    type Error = ParseCheckpointError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Checkpoint> for String {
    fn from(c: Checkpoint) -> Self {
        c.to_string()
    }
}

impl fmt::Display for Checkpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}-{}", self.zoom, self.x, self.y)
    }
}

/// Descriptive record of a tileset, also written into the archive's
/// `metadata` table.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TilesetMetadata {
    pub bounds: GeoBounds,
    pub minzoom: u8,
    pub maxzoom: u8,

    /// Tile URL template, see [`UrlFormat`](crate::UrlFormat).
    pub url: String,

    #[serde(default)]
    pub scheme: TilingScheme,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub layer_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub center: Option<Vec<f64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attribution: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Values substituted for `{s}` in the URL.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subdomains: Vec<String>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl TilesetMetadata {
    pub fn new(bounds: GeoBounds, minzoom: u8, maxzoom: u8, url: impl Into<String>) -> Self {
        Self {
            bounds,
            minzoom,
            maxzoom,
            url: url.into(),
            scheme: TilingScheme::default(),
            name: None,
            version: None,
            layer_type: None,
            format: None,
            center: None,
            attribution: None,
            description: None,
            subdomains: Vec::new(),
            extra: Map::new(),
        }
    }

    /// The `metadata` table rows for this tileset.
    pub fn pairs(&self, scheme: TilingScheme) -> Vec<(&'static str, String)> {
        let center = match &self.center {
            Some(c) => join(c),
            None => {
                let (lon, lat) = self.bounds.center();
                join(&[lon, lat, self.minzoom as f64])
            }
        };

        let mut pairs = vec![
            ("version", self.version.clone().unwrap_or_else(|| "1.0.0".to_owned())),
            ("type", self.layer_type.clone().unwrap_or_else(|| "baselayer".to_owned())),
            ("format", self.format.clone().unwrap_or_else(|| "png".to_owned())),
            ("minzoom", self.minzoom.to_string()),
            ("maxzoom", self.maxzoom.to_string()),
            ("center", center),
            ("bounds", self.bounds.to_string()),
            ("scheme", scheme.as_str().to_owned()),
            ("url", self.url.clone()),
        ];

        let optional = [
            ("name", &self.name),
            ("attribution", &self.attribution),
            ("description", &self.description),
        ];
        for (name, value) in optional {
            if let Some(value) = value {
                pairs.push((name, value.clone()));
            }
        }

        pairs
    }

    /// Tile ranges of every zoom level of the tileset.
    pub fn ranges(&self) -> impl Iterator<Item = TileRange> + fmt::Debug {
        self.bounds.ranges(self.minzoom, self.maxzoom)
    }
}

fn join(values: &[f64]) -> String {
    values
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

/// One download task.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,

    /// Location of the MBTiles archive.
    pub file_path: PathBuf,

    pub metadata: TilesetMetadata,

    /// Credentials substituted for `{key}`, tried in order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub credential_list: Vec<String>,

    #[serde(
        rename = "currentGroupId",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub checkpoint: Option<Checkpoint>,

    #[serde(default, alias = "dbInit")]
    pub storage_initialized: bool,

    #[serde(default)]
    pub complete: bool,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Task {
    /// Checks the invariants the runner relies on.
    pub fn validate(&self) -> Result<(), String> {
        let md = &self.metadata;
        if md.minzoom > md.maxzoom {
            return Err(format!(
                "minzoom {} is greater than maxzoom {}",
                md.minzoom, md.maxzoom
            ));
        }
        if md.maxzoom > MAX_ZOOM {
            return Err(format!("maxzoom {} exceeds {}", md.maxzoom, MAX_ZOOM));
        }

        let bounds: [f64; 4] = md.bounds.into();
        if bounds.iter().any(|v| !v.is_finite()) {
            return Err(format!("bounds {} are not finite", md.bounds));
        }

        if let Some(cp) = &self.checkpoint {
            if cp.zoom < md.minzoom || cp.zoom > md.maxzoom {
                return Err(format!(
                    "checkpoint {} is outside zoom levels {}..={}",
                    cp, md.minzoom, md.maxzoom
                ));
            }
        }

        Ok(())
    }
}

/// The whole descriptor document.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskDocument {
    /// Credentials shared by tasks that don't list their own.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub key_list: Vec<String>,

    #[serde(default)]
    pub task_list: Vec<Task>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl TaskDocument {
    /// The named task, or the first one that isn't complete yet.
    pub fn select(&self, id: Option<&str>) -> Option<usize> {
        match id {
            Some(id) => self.task_list.iter().position(|t| t.id == id),
            None => self.task_list.iter().position(|t| !t.complete),
        }
    }

    /// Credentials for the task at `index`.
    pub fn credentials(&self, index: usize) -> Vec<String> {
        match self.task_list.get(index) {
            Some(task) if !task.credential_list.is_empty() => task.credential_list.clone(),
            _ => self.key_list.clone(),
        }
    }
}

/// A task descriptor file on disk.
#[derive(Debug)]
pub struct TaskFile {
    path: PathBuf,
    pub document: TaskDocument,
}

impl TaskFile {
    pub fn new(path: impl Into<PathBuf>, document: TaskDocument) -> Self {
        Self {
            path: path.into(),
            document,
        }
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, CheckpointError> {
        let path = path.as_ref().to_path_buf();
        let contents = fs::read_to_string(&path).map_err(|source| CheckpointError::Io {
            path: path.clone(),
            source,
        })?;

        let document = serde_json::from_str(&contents).map_err(|source| CheckpointError::Json {
            path: path.clone(),
            source,
        })?;

        debug!(path = %path.display(), "loaded task file");
        Ok(Self { path, document })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Rewrites the whole file. The new contents are written to a temporary
    /// file next to the target, synced, and renamed over it, so a crash
    /// leaves either the old or the new document behind.
    pub fn save(&self) -> Result<(), CheckpointError> {
        let io_err = |source| CheckpointError::Io {
            path: self.path.clone(),
            source,
        };

        let json = serde_json::to_string_pretty(&self.document).map_err(|source| {
            CheckpointError::Json {
                path: self.path.clone(),
                source,
            }
        })?;

        let parent = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        fs::create_dir_all(parent).map_err(io_err)?;

        let mut temp = tempfile::NamedTempFile::new_in(parent).map_err(io_err)?;
        temp.write_all(json.as_bytes()).map_err(io_err)?;
        temp.flush().map_err(io_err)?;
        temp.as_file().sync_all().map_err(io_err)?;
        temp.persist(&self.path).map_err(|e| io_err(e.error))?;

        debug!(path = %self.path.display(), "saved task file");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DESCRIPTOR: &str = r#"{
        "keyList": ["shared-key"],
        "taskList": [
            {
                "id": "1723002553436",
                "filePath": "files/done.mbtiles",
                "metadata": {
                    "bounds": [-180, 85.0511, 179.999999, -85.0511],
                    "minzoom": 1,
                    "maxzoom": 2,
                    "url": "http://t{s}.example.com/{z}/{x}/{y}?tk={key}"
                },
                "complete": true
            },
            {
                "id": "1724202471924",
                "filePath": "files/vec.mbtiles",
                "metadata": {
                    "name": "vec",
                    "bounds": [72.86133, 53.80065, 145.81055, 1.1425],
                    "minzoom": 5,
                    "maxzoom": 9,
                    "url": "http://t{s}.example.com/{z}/{x}/{y}?tk={key}",
                    "scheme": "tms",
                    "tileSize": 256
                },
                "credentialList": ["a", "b"],
                "currentGroupId": "5-10-12",
                "dbInit": true,
                "complete": false,
                "note": "kept"
            }
        ]
    }"#;

    #[test]
    fn checkpoint_round_trips() {
        let cp: Checkpoint = "5-10-12".parse().unwrap();
        assert_eq!(cp, Checkpoint::new(5, 10, 12));
        assert_eq!(cp.to_string(), "5-10-12");
    }

    #[test]
    fn malformed_checkpoints_are_rejected() {
        for s in ["", "5-10", "5-10-12-1", "a-1-2", "5--12", "5-10-x"] {
            assert!(s.parse::<Checkpoint>().is_err(), "{:?} parsed", s);
        }
    }

    #[test]
    fn parses_descriptor() {
        let doc: TaskDocument = serde_json::from_str(DESCRIPTOR).unwrap();
        assert_eq!(doc.select(None), Some(1));
        assert_eq!(doc.select(Some("1723002553436")), Some(0));
        assert_eq!(doc.select(Some("missing")), None);

        let task = &doc.task_list[1];
        assert_eq!(task.checkpoint, Some(Checkpoint::new(5, 10, 12)));
        assert!(task.storage_initialized);
        assert_eq!(task.metadata.scheme, TilingScheme::InvertedRowOrigin);
        assert_eq!(task.metadata.extra["tileSize"], 256);
        assert_eq!(task.extra["note"], "kept");
        assert!(task.validate().is_ok());

        assert_eq!(doc.credentials(1), vec!["a", "b"]);
        assert_eq!(doc.credentials(0), vec!["shared-key"]);
    }

    #[test]
    fn rejects_inconsistent_tasks() {
        let doc: TaskDocument = serde_json::from_str(DESCRIPTOR).unwrap();

        let mut task = doc.task_list[1].clone();
        task.checkpoint = Some(Checkpoint::new(12, 0, 0));
        assert!(task.validate().is_err());

        let mut task = doc.task_list[1].clone();
        task.metadata.minzoom = 10;
        assert!(task.validate().is_err());
    }

    #[test]
    fn save_preserves_unknown_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tasks.json");
        fs::write(&path, DESCRIPTOR).unwrap();

        let mut file = TaskFile::load(&path).unwrap();
        let task = &mut file.document.task_list[1];
        task.checkpoint = Some(Checkpoint::new(6, 1, 2));
        file.save().unwrap();

        let raw: Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        let task = &raw["taskList"][1];
        assert_eq!(task["currentGroupId"], "6-1-2");
        assert_eq!(task["storageInitialized"], true);
        assert_eq!(task["note"], "kept");
        assert_eq!(task["metadata"]["tileSize"], 256);
        assert_eq!(raw["keyList"][0], "shared-key");

        let reloaded = TaskFile::load(&path).unwrap();
        assert_eq!(reloaded.document, file.document);
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = TaskFile::load(dir.path().join("nope.json")).unwrap_err();
        assert!(matches!(err, CheckpointError::Io { .. }));
    }
}
