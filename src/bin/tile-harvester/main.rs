mod args;
mod validators;

use anyhow::{anyhow, bail, Context, Result};
use args::{Args, Mode};
use std::process::ExitCode;
use tracing::error;
use tracing_subscriber::EnvFilter;

use tile_harvester::{verify, Config, ExitKind, TaskError, TaskFile, TaskRunner};

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("tile_harvester=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            let kind = e
                .downcast_ref::<TaskError>()
                .map(TaskError::exit_kind)
                .unwrap_or(ExitKind::Other);

            match kind {
                ExitKind::CredentialsExhausted => ExitCode::from(2),
                ExitKind::StorageFailure => ExitCode::from(3),
                ExitKind::Other => ExitCode::FAILURE,
            }
        }
    }
}

async fn run(args: Args) -> Result<()> {
    let config = Config::from(&args);
    let file = TaskFile::load(&args.config_path)?;

    match args.mode {
        Mode::Download => {
            let mut runner = TaskRunner::from_file(file, args.task.as_deref(), config)?;
            let summary = runner.run().await?;
            eprintln!(
                "task {} done: {} tiles fetched, {} already stored, {} batches",
                runner.task().id,
                summary.fetched,
                summary.existing,
                summary.batches
            );
            Ok(())
        }
        Mode::DryRun => {
            let task = &file.document.task_list[select(&file, args.task.as_deref())?];
            let mut tile_count = 0u64;
            for range in task.metadata.ranges() {
                eprintln!("{}", range);
                tile_count += range.len();
            }

            eprintln!(
                "would download {} tiles (approx {}, assuming 10 kb per tile)",
                tile_count,
                pretty_bytes::converter::convert((tile_count as f64) * 10_000f64)
            );
            Ok(())
        }
        Mode::Verify => {
            let task = &file.document.task_list[select(&file, args.task.as_deref())?];
            let coverage = verify(task)
                .with_context(|| format!("failed verifying {}", task.file_path.display()))?;

            let mut missing = 0u64;
            for zoom in &coverage {
                eprintln!(
                    "zoom {:>2}: {}/{} tiles{}",
                    zoom.zoom,
                    zoom.stored,
                    zoom.expected,
                    if zoom.is_complete() { "" } else { " (incomplete)" }
                );
                missing += zoom.expected.saturating_sub(zoom.stored);
            }

            if missing > 0 {
                bail!("{} tiles missing from {}", missing, task.file_path.display());
            }
            Ok(())
        }
    }
}

/// Index of the requested task, accepting completed tasks when named.
fn select(file: &TaskFile, id: Option<&str>) -> Result<usize> {
    file.document.select(id).ok_or_else(|| match id {
        Some(id) => anyhow!(TaskError::UnknownTask(id.to_owned())),
        None => anyhow!(TaskError::NoPendingTask),
    })
}
