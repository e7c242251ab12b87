//! Downloading one batch of tiles.
//!
//! A batch is fetched in rounds. Every round requests all outstanding tiles
//! at once and waits for all of them to settle; tiles that failed make up the
//! next round. A round in which every request was throttled retires the
//! active credential. Once nothing is outstanding the downloaded tiles are
//! committed to the archive in a single transaction.

use futures::{prelude::*, stream};
use std::collections::HashMap;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::RetryPolicy;
use crate::fetch::{FailureReason, TileSource};
use crate::store::{StoreError, TileStore};
use crate::tile::TileCoord;

#[derive(Debug, Error)]
pub enum BatchError {
    #[error(
        "all {credentials} credentials are rate limited (batch starting at {first}); \
         supply new credentials and restart"
    )]
    CredentialsExhausted { first: TileCoord, credentials: usize },

    #[error("tile {coord} still failing after {attempts} attempts, last error: {reason}")]
    RetriesExhausted {
        coord: TileCoord,
        attempts: u32,
        reason: FailureReason,
    },

    #[error(transparent)]
    Storage(#[from] StoreError),
}

/// Per-tile result of one fetch round.
#[derive(Debug, PartialEq, Eq)]
pub enum TileOutcome {
    Success(Vec<u8>),
    Failed(FailureReason),
}

/// What happened to a committed batch.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct BatchReport {
    /// Tiles downloaded and written.
    pub fetched: usize,
    /// Tiles skipped because the archive already had them.
    pub existing: usize,
    /// Fetch rounds needed.
    pub rounds: u32,
    /// Credentials retired while working on the batch.
    pub rotations: usize,
}

/// Drives batches through a [`TileSource`] and into a [`TileStore`].
///
/// The active credential is kept between batches, so a credential retired
/// once is not tried again for the rest of the run.
pub struct BatchDownloader<S> {
    source: S,
    credentials: Vec<String>,
    active: usize,
    retry: RetryPolicy,
}

impl<S: TileSource> BatchDownloader<S> {
    pub fn new(source: S, credentials: Vec<String>, retry: RetryPolicy) -> Self {
        Self {
            source,
            credentials,
            active: 0,
            retry,
        }
    }

    /// Index of the credential used for the next request.
    pub fn active_credential(&self) -> usize {
        self.active
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    /// Fetches every tile of `batch` that `store` doesn't have yet and
    /// commits them together.
    ///
    /// Individual tile failures are retried. Only credential exhaustion, an
    /// exceeded retry ceiling and storage errors end the batch early, in which
    /// case nothing of it is written.
    pub async fn run(
        &mut self,
        batch: &[TileCoord],
        store: &mut TileStore,
    ) -> Result<BatchReport, BatchError> {
        let mut report = BatchReport::default();
        let first = match batch.first() {
            Some(first) => *first,
            None => return Ok(report),
        };

        let mut pending = Vec::with_capacity(batch.len());
        for coord in batch {
            match store.has(coord)? {
                true => report.existing += 1,
                false => pending.push(*coord),
            }
        }

        let mut attempts: HashMap<TileCoord, u32> = HashMap::new();
        let mut downloaded = Vec::with_capacity(pending.len());
        let mut retry_round = 0;

        while !pending.is_empty() {
            let credential = match self.credentials.get(self.active) {
                Some(c) => c.as_str(),
                None => {
                    return Err(BatchError::CredentialsExhausted {
                        first,
                        credentials: self.credentials.len(),
                    })
                }
            };

            report.rounds += 1;
            let outcomes = fetch_round(&self.source, &pending, credential).await;

            let dispatched = outcomes.len();
            let mut failed = Vec::new();
            let mut rate_limited = 0;
            for (coord, outcome) in outcomes {
                match outcome {
                    TileOutcome::Success(data) => downloaded.push((coord, data)),
                    TileOutcome::Failed(reason) => {
                        if reason == FailureReason::RateLimited {
                            rate_limited += 1;
                        }
                        failed.push((coord, reason));
                    }
                }
            }

            if rate_limited > 0 && rate_limited == dispatched {
                warn!(
                    zoom = first.zoom,
                    x = first.x,
                    y = first.y,
                    credential = self.active,
                    tiles = dispatched,
                    "credential rate limited on every request, switching to the next one"
                );
                self.active += 1;
                report.rotations += 1;
                pending = failed.into_iter().map(|(coord, _)| coord).collect();
                continue;
            }

            if failed.is_empty() {
                break;
            }

            for (coord, reason) in &failed {
                let count = attempts.entry(*coord).or_insert(0);
                *count += 1;
                if !self.retry.allows(*count) {
                    return Err(BatchError::RetriesExhausted {
                        coord: *coord,
                        attempts: *count,
                        reason: *reason,
                    });
                }
            }

            retry_round += 1;
            warn!(
                zoom = first.zoom,
                x = first.x,
                y = first.y,
                failed = failed.len(),
                rate_limited,
                credential = self.active,
                "tiles failed, retrying"
            );

            let delay = self.retry.delay(retry_round);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            pending = failed.into_iter().map(|(coord, _)| coord).collect();
        }

        report.fetched = store.save_batch(&downloaded)?;
        debug!(
            zoom = first.zoom,
            fetched = report.fetched,
            existing = report.existing,
            rounds = report.rounds,
            "committed batch"
        );

        Ok(report)
    }
}

/// Requests all `tiles` concurrently and waits for every one of them.
async fn fetch_round<S: TileSource>(
    source: &S,
    tiles: &[TileCoord],
    credential: &str,
) -> Vec<(TileCoord, TileOutcome)> {
    stream::iter(tiles.iter().copied())
        .map(|coord| async move {
            let outcome = match source.fetch(coord, credential).await {
                Ok(data) => TileOutcome::Success(data),
                Err(e) => {
                    debug!(error = %e, "tile request failed");
                    TileOutcome::Failed(e.reason)
                }
            };
            (coord, outcome)
        })
        .buffer_unordered(tiles.len())
        .collect()
        .await
}
