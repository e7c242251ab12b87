use indicatif::{ProgressBar, ProgressStyle};
use std::time::Instant;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::batch::{BatchDownloader, BatchError};
use crate::config::Config;
use crate::fetch::{FetchClient, TileSource};
use crate::range::{RangeError, TileRange};
use crate::store::{StoreError, TileStore};
use crate::task::{Checkpoint, CheckpointError, Task, TaskFile};
use crate::url::UrlFormat;

#[derive(Debug, Error)]
pub enum TaskError {
    #[error("no task with id {0:?}")]
    UnknownTask(String),

    #[error("every task in the task file is complete")]
    NoPendingTask,

    #[error("task {id} is invalid: {reason}")]
    InvalidTask { id: String, reason: String },

    #[error("task {id} has no credentials")]
    NoCredentials { id: String },

    #[error("cannot resume zoom {zoom}: {source}")]
    Resume {
        zoom: u8,
        #[source]
        source: RangeError,
    },

    #[error("failed creating HTTP client: {0}")]
    Client(#[from] reqwest::Error),

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("zoom {zoom}: {source}")]
    Batch {
        zoom: u8,
        #[source]
        source: BatchError,
    },
}

/// Coarse classification of why a run stopped.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ExitKind {
    /// Every credential got throttled; new ones are needed.
    CredentialsExhausted,
    /// The archive or the task file could not be written.
    StorageFailure,
    Other,
}

impl TaskError {
    pub fn exit_kind(&self) -> ExitKind {
        match self {
            TaskError::Batch {
                source: BatchError::CredentialsExhausted { .. },
                ..
            } => ExitKind::CredentialsExhausted,
            TaskError::Batch {
                source: BatchError::Storage(_),
                ..
            }
            | TaskError::Store(_)
            | TaskError::Checkpoint(_) => ExitKind::StorageFailure,
            _ => ExitKind::Other,
        }
    }
}

/// Totals of one run.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct RunSummary {
    pub fetched: u64,
    pub existing: u64,
    pub batches: u64,
}

/// Downloads one task to completion.
///
/// The runner owns the task file for the duration of the run. The task's
/// checkpoint only moves after a batch has been committed to the archive, so
/// when a run is interrupted the checkpoint always names a tile whose batch
/// is fully stored.
pub struct TaskRunner<S> {
    file: TaskFile,
    index: usize,
    config: Config,
    downloader: BatchDownloader<S>,
}

impl TaskRunner<FetchClient> {
    /// Prepares the task `id` (or the first incomplete one) of `file` for a
    /// run against its HTTP tile source.
    pub fn from_file(file: TaskFile, id: Option<&str>, config: Config) -> Result<Self, TaskError> {
        let index = select(&file, id)?;
        let md = &file.document.task_list[index].metadata;
        let url = UrlFormat::from_str(md.url.clone()).with_shards(md.subdomains.clone());
        let client = FetchClient::new(url, config.timeout)?;

        Self::new(file, index, config, client)
    }
}

impl<S: TileSource> TaskRunner<S> {
    pub fn new(file: TaskFile, index: usize, config: Config, source: S) -> Result<Self, TaskError> {
        let task = file
            .document
            .task_list
            .get(index)
            .ok_or_else(|| TaskError::UnknownTask(format!("#{}", index)))?;
        task.validate().map_err(|reason| TaskError::InvalidTask {
            id: task.id.clone(),
            reason,
        })?;

        if config.batch_size == 0 {
            return Err(TaskError::InvalidTask {
                id: task.id.clone(),
                reason: "batch size must be at least 1".to_owned(),
            });
        }

        let credentials = file.document.credentials(index);
        if credentials.is_empty() {
            return Err(TaskError::NoCredentials {
                id: task.id.clone(),
            });
        }

        let downloader = BatchDownloader::new(source, credentials, config.retry);
        Ok(Self {
            file,
            index,
            config,
            downloader,
        })
    }

    pub fn task(&self) -> &Task {
        &self.file.document.task_list[self.index]
    }

    fn task_mut(&mut self) -> &mut Task {
        &mut self.file.document.task_list[self.index]
    }

    /// Gives the task file back, e.g. to inspect the final checkpoint.
    pub fn into_file(self) -> TaskFile {
        self.file
    }

    /// Runs the task until every zoom level is downloaded or a fatal error
    /// occurs. Fatal errors leave the last written checkpoint in place.
    pub async fn run(&mut self) -> Result<RunSummary, TaskError> {
        let mut summary = RunSummary::default();
        if self.task().complete {
            info!(task = %self.task().id, "task already complete");
            return Ok(summary);
        }

        let task = self.task().clone();
        let mut store = TileStore::open(&task.file_path, task.metadata.scheme, self.config.durability)?;
        if !task.storage_initialized {
            store.init_schema()?;
            store.write_metadata(&task.metadata)?;
            self.task_mut().storage_initialized = true;
            self.file.save()?;
            info!(path = %task.file_path.display(), "initialized tile archive");
        }

        let start_zoom = task
            .checkpoint
            .map(|c| c.zoom)
            .unwrap_or(task.metadata.minzoom);
        let mut resume = task.checkpoint;

        for zoom in start_zoom..=task.metadata.maxzoom {
            let range = task.metadata.bounds.range(zoom);
            let after = resume.take().map(|c| (c.x, c.y));
            self.download_level(&range, after, &mut store, &mut summary)
                .await
                .map_err(|e| {
                    error!(
                        task = %task.id,
                        zoom,
                        checkpoint = ?self.task().checkpoint.map(|c| c.to_string()),
                        credential = self.downloader.active_credential(),
                        error = %e,
                        "task stopped"
                    );
                    e
                })?;
        }

        let task = self.task_mut();
        task.checkpoint = None;
        task.complete = true;
        self.file.save()?;

        info!(
            task = %self.task().id,
            fetched = summary.fetched,
            existing = summary.existing,
            batches = summary.batches,
            "task complete"
        );
        Ok(summary)
    }

    async fn download_level(
        &mut self,
        range: &TileRange,
        after: Option<(u32, u32)>,
        store: &mut TileStore,
        summary: &mut RunSummary,
    ) -> Result<(), TaskError> {
        let zoom = range.zoom;
        let started = Instant::now();
        if range.is_empty() {
            warn!(zoom, %range, "tile range is empty, check the orientation of the bounds");
        }

        let mut done = range
            .offset_after(after)
            .map_err(|source| TaskError::Resume { zoom, source })?;
        let pb = self.progress_bar(range, done);
        let mut after = after;

        loop {
            let batch = range
                .batch_after(after, self.config.batch_size)
                .map_err(|source| TaskError::Resume { zoom, source })?;
            let (first, last) = match (batch.first(), batch.last()) {
                (Some(first), Some(last)) => (*first, *last),
                _ => break,
            };

            let t = Instant::now();
            let report = self
                .downloader
                .run(&batch, store)
                .await
                .map_err(|source| TaskError::Batch { zoom, source })?;

            // the batch is committed, only now may the checkpoint move past it
            self.task_mut().checkpoint = Some(Checkpoint::new(zoom, last.x, last.y));
            self.file.save()?;

            done += batch.len() as u64;
            summary.batches += 1;
            summary.fetched += report.fetched as u64;
            summary.existing += report.existing as u64;
            after = Some((last.x, last.y));
            pb.set_position(done);

            info!(
                zoom,
                x = first.x,
                y = first.y,
                tiles = batch.len(),
                fetched = report.fetched,
                existing = report.existing,
                rounds = report.rounds,
                elapsed_ms = t.elapsed().as_millis() as u64,
                progress = %format!("{:.2}%", percent(done, range.len())),
                "batch done ({}/{})",
                done,
                range.len()
            );
        }

        pb.finish_and_clear();
        info!(
            zoom,
            %range,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "zoom level done"
        );
        Ok(())
    }

    fn progress_bar(&self, range: &TileRange, position: u64) -> ProgressBar {
        if !self.config.show_progress {
            return ProgressBar::hidden();
        }

        let pb = ProgressBar::new(range.len());
        let style = ProgressStyle::default_bar()
            .template("z{msg} [{elapsed_precise}] {bar:60.cyan/blue} {pos:>7}/{len:7} ETA: {eta}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("##-");
        pb.set_style(style);
        pb.set_message(range.zoom.to_string());
        pb.set_position(position);
        pb
    }
}

fn select(file: &TaskFile, id: Option<&str>) -> Result<usize, TaskError> {
    file.document.select(id).ok_or_else(|| match id {
        Some(id) => TaskError::UnknownTask(id.to_owned()),
        None => TaskError::NoPendingTask,
    })
}

fn percent(done: u64, total: u64) -> f64 {
    if total == 0 {
        return 100_f64;
    }
    done as f64 / total as f64 * 100_f64
}

/// Stored versus expected tile count of one zoom level.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ZoomCoverage {
    pub zoom: u8,
    pub expected: u64,
    pub stored: u64,
}

impl ZoomCoverage {
    pub fn is_complete(&self) -> bool {
        self.stored == self.expected
    }
}

/// Compares what the task's archive holds with what its bounds call for.
///
/// The archive is only read. One that doesn't exist yet holds no tiles.
pub fn verify(task: &Task) -> Result<Vec<ZoomCoverage>, TaskError> {
    let store = if task.file_path.exists() {
        Some(TileStore::open_read_only(&task.file_path, task.metadata.scheme)?)
    } else {
        warn!(path = %task.file_path.display(), "tile archive does not exist");
        None
    };

    let mut coverage = Vec::new();
    for range in task.metadata.ranges() {
        let stored = match &store {
            Some(store) => store.count_tiles(range.zoom)?,
            None => 0,
        };
        let zoom = ZoomCoverage {
            zoom: range.zoom,
            expected: range.len(),
            stored,
        };
        if !zoom.is_complete() {
            warn!(zoom = range.zoom, expected = zoom.expected, stored, "zoom level incomplete");
        }
        coverage.push(zoom);
    }

    Ok(coverage)
}

/// Runs the selected task of the task file at `path` with its HTTP tile
/// source.
pub async fn run_task(
    path: impl AsRef<std::path::Path>,
    id: Option<&str>,
    config: Config,
) -> Result<RunSummary, TaskError> {
    let file = TaskFile::load(path)?;
    let mut runner = TaskRunner::from_file(file, id, config)?;
    runner.run().await
}
