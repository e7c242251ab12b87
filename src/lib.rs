//! Download map tiles into MBTiles archives, resumably.
//!
//! A task descriptor file lists download tasks: a bounding box, a zoom span,
//! a tile URL template and a list of credentials. Tiles are requested in
//! batches, every tile of a batch in parallel, and each batch is committed to
//! the task's SQLite archive in one transaction. After every commit the
//! task's checkpoint is written back to the descriptor, so an interrupted run
//! picks up right after the last stored batch.
//!
//! **Use with caution.** Downloading tiles en-masse can hog down a tile
//! server easily. Respect the usage policy of the server you point this at.
//!
//! # Task file
//!
//! ```json
//! {
//!   "keyList": ["shared-key"],
//!   "taskList": [{
//!     "id": "china-vec",
//!     "filePath": "files/china-vec.mbtiles",
//!     "metadata": {
//!       "bounds": [72.86133, 53.80065, 145.81055, 1.1425],
//!       "minzoom": 1,
//!       "maxzoom": 9,
//!       "url": "http://t{s}.example.com/vec_w/{z}/{x}/{y}?tk={key}",
//!       "subdomains": ["0", "1", "2", "3"]
//!     },
//!     "credentialList": ["key-a", "key-b"]
//!   }]
//! }
//! ```
//!
//! # Library Example
//! ```no_run
//! use tile_harvester::{run_task, Config};
//!
//! # #[tokio::main]
//! # async fn main() {
//! let config = Config {
//!     batch_size: 128,
//!     ..Config::default()
//! };
//!
//! let summary = run_task("config/tasks.json", None, config)
//!     .await
//!     .expect("failed downloading tiles");
//! println!("fetched {} tiles", summary.fetched);
//! # }
//! ```

mod batch;
mod bounding_box;
mod config;
mod fetch;
mod range;
mod runner;
mod store;
mod task;
mod tile;
mod url;

pub use batch::{BatchDownloader, BatchError, BatchReport, TileOutcome};
pub use bounding_box::GeoBounds;
pub use config::{Config, RetryPolicy, DEFAULT_BATCH_SIZE};
pub use fetch::{FailureReason, FetchClient, FetchError, TileSource};
pub use range::{Batches, RangeError, TileRange};
pub use runner::{run_task, verify, ExitKind, RunSummary, TaskError, TaskRunner, ZoomCoverage};
pub use store::{Durability, StoreError, TileStore};
pub use task::{
    Checkpoint, CheckpointError, ParseCheckpointError, Task, TaskDocument, TaskFile,
    TilesetMetadata,
};
pub use tile::{TileCoord, TilingScheme, MAX_ZOOM};
pub use url::UrlFormat;
