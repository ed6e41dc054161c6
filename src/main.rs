//! Dataset Reaper
//!
//! Command line front end for deleting datasets and collecting orphaned files.
//! Interrupting a run is safe: every delete is idempotent, so running the same
//! command again resumes where the previous run stopped.

use std::future::Future;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use common::cli::{CommonArgs, CommonCommands, utils};
use reaper::{DatasetId, Reaper, SweepError};

#[derive(Parser, Debug)]
#[command(author, version, about = "Delete datasets and collect orphaned files", long_about = None)]
struct Cli {
    #[command(flatten)]
    common: CommonArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Delete every key belonging to the given datasets
    Delete {
        #[arg(required = true, value_parser = parse_dataset_id)]
        datasets: Vec<DatasetId>,

        /// Report what would be deleted without deleting
        #[arg(long)]
        dry_run: bool,
    },
    /// Delete files of the given datasets that their metadata no longer references
    Gc {
        #[arg(required = true, value_parser = parse_dataset_id)]
        datasets: Vec<DatasetId>,

        /// Report orphans without deleting them
        #[arg(long)]
        dry_run: bool,
    },
    /// List orphaned files of a dataset without deleting anything
    Orphans {
        #[arg(value_parser = parse_dataset_id)]
        dataset: DatasetId,
    },
    /// List datasets present in the store
    List,
    #[command(flatten)]
    Common(CommonCommands),
}

fn parse_dataset_id(raw: &str) -> Result<DatasetId, String> {
    DatasetId::new(raw).map_err(|e| e.to_string())
}

/// Waits for a shutdown signal (SIGINT or SIGTERM)
async fn wait_for_shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sigint =
            signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;
        let mut sigterm =
            signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;

        tokio::select! {
            _ = sigint.recv() => log::info!("Received SIGINT"),
            _ = sigterm.recv() => log::info!("Received SIGTERM"),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .context("Failed to listen for shutdown signal")?;
        log::info!("Received Ctrl+C");
    }

    Ok(())
}

/// Runs `operation` unless a shutdown signal arrives first.
async fn until_shutdown<T>(operation: impl Future<Output = T>) -> Result<T> {
    tokio::select! {
        result = operation => Ok(result),
        signal = wait_for_shutdown_signal() => {
            signal?;
            anyhow::bail!("Interrupted; run the same command again to resume")
        }
    }
}

fn report_failure(dataset_id: &DatasetId, error: &SweepError) {
    log::error!("{dataset_id}: {error}");
    if let Some(failure) = error.partial_failure() {
        for key_failure in &failure.failures {
            log::error!("  {key_failure}");
        }
    }
}

async fn delete(reaper: &Reaper, datasets: &[DatasetId]) -> Result<bool> {
    let results = until_shutdown(reaper.delete_datasets(datasets)).await?;

    let mut ok = true;
    for (dataset_id, result) in results {
        match result {
            Ok(report) if report.dry_run => {
                for key in &report.deleted_keys {
                    println!("{key}");
                }
                log::info!(
                    "{dataset_id}: would delete {} keys",
                    report.deleted_count()
                );
            }
            Ok(report) => log::info!("{dataset_id}: deleted {} keys", report.deleted_count()),
            Err(e) => {
                report_failure(&dataset_id, &e);
                ok = false;
            }
        }
    }
    Ok(ok)
}

async fn garbage_collect(reaper: &Reaper, datasets: &[DatasetId]) -> Result<bool> {
    let results = until_shutdown(reaper.garbage_collect_datasets(datasets)).await?;

    let mut ok = true;
    for (dataset_id, result) in results {
        match result {
            Ok(report) => {
                for key in &report.deleted {
                    println!("{key}");
                }
                let verb = if report.dry_run { "would delete" } else { "deleted" };
                log::info!(
                    "{dataset_id}: {verb} {} of {} keys ({} referenced)",
                    report.deleted_count(),
                    report.present_count,
                    report.referenced_count
                );
            }
            Err(e) => {
                report_failure(&dataset_id, &e);
                ok = false;
            }
        }
    }
    Ok(ok)
}

async fn run(cli: Cli) -> Result<bool> {
    let mut config = utils::load_config(cli.common.config.as_ref())?;

    let command = match cli.command {
        Command::Common(command) => {
            utils::handle_common_command(&command, &config)?;
            return Ok(true);
        }
        command => command,
    };

    if let Command::Delete { dry_run: true, .. } | Command::Gc { dry_run: true, .. } = command {
        config.sweep.dry_run = true;
    }
    config.validate().context("Invalid configuration")?;

    let reaper = Reaper::from_config(&config)?;

    let ok = match command {
        Command::Delete { datasets, .. } => delete(&reaper, &datasets).await?,
        Command::Gc { datasets, .. } => garbage_collect(&reaper, &datasets).await?,
        Command::Orphans { dataset } => {
            let plan = until_shutdown(reaper.find_orphans(&dataset)).await??;
            for key in &plan.orphans {
                println!("{key}");
            }
            log::info!(
                "{dataset}: {} orphans among {} keys ({} referenced)",
                plan.orphan_count(),
                plan.present_count,
                plan.referenced_count
            );
            true
        }
        Command::List => {
            let datasets = reaper
                .list_datasets()
                .await
                .context("Failed to list datasets")?;
            for dataset_id in &datasets {
                println!("{dataset_id}");
            }
            true
        }
        Command::Common(_) => unreachable!("handled before the store is opened"),
    };

    reaper.metrics().summary().log();
    Ok(ok)
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    utils::init_logging(&cli.common);

    match run(cli).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            log::error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_delete() {
        let cli = Cli::try_parse_from(["dataset-reaper", "delete", "a", "b", "--dry-run"]).unwrap();
        match cli.command {
            Command::Delete { datasets, dry_run } => {
                assert_eq!(datasets.len(), 2);
                assert_eq!(datasets[0].as_str(), "a");
                assert!(dry_run);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_invalid_dataset_id_is_rejected() {
        assert!(Cli::try_parse_from(["dataset-reaper", "gc", "a//b"]).is_err());
        assert!(Cli::try_parse_from(["dataset-reaper", "delete"]).is_err());
    }

    #[test]
    fn test_common_commands_and_global_flags() {
        let cli = Cli::try_parse_from(["dataset-reaper", "config", "--json", "-v"]).unwrap();
        assert!(cli.common.verbose);
        assert!(matches!(
            cli.command,
            Command::Common(CommonCommands::Config { json: true })
        ));
    }

    #[tokio::test]
    async fn test_list_against_memory_store() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("reaper.toml");
        std::fs::write(&path, "[storage]\ndsn = \"memory://\"\n")?;

        let cli = Cli::try_parse_from([
            "dataset-reaper",
            "--config",
            path.to_str().context("non-utf8 temp path")?,
            "list",
        ])?;
        assert!(run(cli).await?);
        Ok(())
    }
}
