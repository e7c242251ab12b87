use clap::{command, Arg, ArgAction, ArgMatches};
use std::{path::PathBuf, time::Duration};

use crate::validators::*;
use tile_harvester::{Config, Durability, RetryPolicy};

const CONFIG_ARG: &str = "config";
const TASK_ARG: &str = "task";
const BATCH_SIZE_ARG: &str = "batch_size";
const RETRIES_ARG: &str = "num_retries";
const BACKOFF_ARG: &str = "backoff";
const TIMEOUT_ARG: &str = "timeout";
const FULL_SYNC_ARG: &str = "full_sync";
const NO_PROGRESS_ARG: &str = "no_progress";
const DRY_RUN_ARG: &str = "dry_run";
const VERIFY_ARG: &str = "verify";

/// What the binary was asked to do with the selected task.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Mode {
    Download,
    DryRun,
    Verify,
}

pub struct Args {
    pub config_path: PathBuf,
    pub task: Option<String>,
    pub batch_size: usize,
    pub retries: u32,
    pub backoff: Duration,
    pub timeout: Duration,
    pub full_sync: bool,
    pub show_progress: bool,
    pub mode: Mode,
}

impl From<&Args> for Config {
    fn from(args: &Args) -> Self {
        Self {
            batch_size: args.batch_size,
            retry: RetryPolicy {
                max_attempts: args.retries,
                backoff: args.backoff,
                ..RetryPolicy::default()
            },
            timeout: args.timeout,
            durability: match args.full_sync {
                true => Durability::Full,
                false => Durability::Relaxed,
            },
            show_progress: args.show_progress,
        }
    }
}

impl Args {
    pub fn parse() -> Self {
        Self::from_matches(&get_matches())
    }

    fn from_matches(matches: &ArgMatches) -> Self {
        let mode = if matches.get_flag(DRY_RUN_ARG) {
            Mode::DryRun
        } else if matches.get_flag(VERIFY_ARG) {
            Mode::Verify
        } else {
            Mode::Download
        };

        let usize_arg = |name: &str| matches.get_one::<usize>(name).copied().unwrap_or_default();
        let secs_arg = |name: &str| {
            matches
                .get_one::<Duration>(name)
                .copied()
                .unwrap_or_default()
        };

        Self {
            config_path: matches
                .get_one::<PathBuf>(CONFIG_ARG)
                .cloned()
                .unwrap_or_else(|| PathBuf::from("config/tasks.json")),
            task: matches.get_one::<String>(TASK_ARG).cloned(),
            batch_size: usize_arg(BATCH_SIZE_ARG),
            retries: u32::try_from(usize_arg(RETRIES_ARG)).unwrap_or(u32::MAX),
            backoff: secs_arg(BACKOFF_ARG),
            timeout: secs_arg(TIMEOUT_ARG),
            full_sync: matches.get_flag(FULL_SYNC_ARG),
            show_progress: !matches.get_flag(NO_PROGRESS_ARG),
            mode,
        }
    }
}

fn command() -> clap::Command {
    command!()
        .arg(
            Arg::new(CONFIG_ARG)
                .help("The task descriptor file. Progress is written back into it after every batch.")
                .value_parser(clap::value_parser!(PathBuf))
                .default_value("config/tasks.json"),
        )
        .arg(
            Arg::new(TASK_ARG)
                .help("The id of the task to run. Defaults to the first task that isn't complete.")
                .short('t')
                .long("task"),
        )
        .arg(
            Arg::new(BATCH_SIZE_ARG)
                .help("The amount of tiles fetched in parallel and committed together.")
                .value_parser(is_numeric_min(1))
                .default_value("256")
                .short('b')
                .long("batch-size"),
        )
        .arg(
            Arg::new(RETRIES_ARG)
                .help("The amount of failed rounds a single tile may go through before giving up. Pass 0 to retry forever.")
                .value_parser(is_numeric_min(0))
                .default_value("20")
                .long("retries"),
        )
        .arg(
            Arg::new(BACKOFF_ARG)
                .help("The delay (in seconds) before the first retry round, growing linearly with every further round.")
                .value_parser(is_seconds)
                .default_value("0")
                .long("backoff"),
        )
        .arg(
            Arg::new(TIMEOUT_ARG)
                .help("The timeout (in seconds) for fetching a single tile. Pass 0 for no timeout.")
                .value_parser(is_seconds)
                .default_value("30")
                .long("timeout"),
        )
        .arg(
            Arg::new(FULL_SYNC_ARG)
                .help("Sync the archive to disk on every commit (slower, survives power loss).")
                .action(ArgAction::SetTrue)
                .long("full-sync"),
        )
        .arg(
            Arg::new(NO_PROGRESS_ARG)
                .help("Don't draw progress bars.")
                .action(ArgAction::SetTrue)
                .long("no-progress"),
        )
        .arg(
            Arg::new(DRY_RUN_ARG)
                .help("Don't actually fetch anything, just determine how many tiles would be fetched.")
                .action(ArgAction::SetTrue)
                .conflicts_with(VERIFY_ARG)
                .long("dry-run"),
        )
        .arg(
            Arg::new(VERIFY_ARG)
                .help("Don't fetch anything, compare the archive's tile count per zoom level with the task's bounds.")
                .action(ArgAction::SetTrue)
                .long("verify"),
        )
}

fn get_matches() -> ArgMatches {
    command().get_matches()
}
