//! CLI command implementations
//!
//! Commands only read local state: the topology snapshot, the outbox it
//! carries, and the migration job documents. Mutations go through the
//! library API.

use std::fs;
use std::path::Path;

use serde_json::json;

use crate::config::ControlPlaneConfig;
use crate::migration::{FileMigrationStore, MigrationStore, MIGRATION_DIR_NAME};
use crate::observability::Logger;
use crate::topology::{ClusterSummary, TopologyStore};

use super::args::Command;
use super::errors::{CliError, CliResult};
use super::io::{write_error, write_records, write_response};

/// Main CLI entry point
///
/// Parses arguments and dispatches to the appropriate command.
/// This is the only function that main.rs should call.
pub fn run() -> CliResult<()> {
    let cli = super::args::Cli::parse_args();
    let result = run_command(cli.command);
    if let Err(e) = &result {
        // Best effort; the caller reports the error on stderr as well.
        let _ = write_error(e.code_str(), e.message());
    }
    result
}

/// Run the appropriate command based on CLI args
pub fn run_command(cmd: Command) -> CliResult<()> {
    match cmd {
        Command::Init { config } => init(&config),
        Command::Inspect { config, cluster } => inspect(&config, cluster.as_deref()),
        Command::Outbox { config, dead_letters } => outbox(&config, dead_letters),
        Command::Jobs { config } => jobs(&config),
    }
}

/// Initialize a data directory
///
/// Writes a default config when `config_path` does not exist, then creates
/// the data directory and the migration job directory. The topology
/// snapshot is written on the first commit.
pub fn init(config_path: &Path) -> CliResult<()> {
    if !config_path.exists() {
        ControlPlaneConfig::default().save(config_path)?;
    }
    let config = ControlPlaneConfig::load(config_path)?;
    let data_dir = config.data_dir.as_path();

    if is_initialized(data_dir) {
        return Err(CliError::already_initialized());
    }

    let jobs_dir = data_dir.join(MIGRATION_DIR_NAME);
    fs::create_dir_all(&jobs_dir).map_err(|e| {
        CliError::config_error(format!("Failed to create directory {}: {}", jobs_dir.display(), e))
    })?;

    let data_dir_field = data_dir.display().to_string();
    Logger::info("DATA_DIR_INITIALIZED", &[("data_dir", data_dir_field.as_str())]);
    write_response(json!({"initialized": true, "data_dir": data_dir_field}))
}

/// Print derived summaries of every cluster, or of one.
pub fn inspect(config_path: &Path, cluster: Option<&str>) -> CliResult<()> {
    let store = open_topology(config_path)?;
    let summaries = store.read(|graph| -> CliResult<Vec<ClusterSummary>> {
        match cluster {
            Some(domain) => {
                let record = graph
                    .cluster_by_domain(domain)
                    .ok_or_else(|| CliError::not_found(format!("cluster {}", domain)))?;
                Ok(vec![graph.summary(record.id)?])
            }
            None => graph
                .clusters()
                .map(|c| graph.summary(c.id).map_err(CliError::from))
                .collect(),
        }
    })??;
    write_records(&summaries)
}

/// Print outbox records waiting for delivery, or the dead-lettered ones.
pub fn outbox(config_path: &Path, dead_letters: bool) -> CliResult<()> {
    let store = open_topology(config_path)?;
    let records = if dead_letters {
        store.dead_letters()?
    } else {
        store.pending_effects()?
    };
    write_records(&records)
}

/// Print one line per migration job with its task phase counts.
pub fn jobs(config_path: &Path) -> CliResult<()> {
    let config = load_initialized(config_path)?;
    let store = FileMigrationStore::open(&config.data_dir);
    let lines: Vec<_> = store
        .list()?
        .iter()
        .map(|job| {
            json!({
                "id": job.id,
                "source": job.request.source_domain,
                "destination": job.request.destination_domain,
                "state": job.state,
                "tasks": job.phase_counts(),
                "checks": job.checks.len(),
                "stalled_since": job.stalled_since,
                "updated_at": job.updated_at,
            })
        })
        .collect();
    write_records(&lines)
}

fn load_initialized(config_path: &Path) -> CliResult<ControlPlaneConfig> {
    let config = ControlPlaneConfig::load(config_path)?;
    if !is_initialized(&config.data_dir) {
        return Err(CliError::not_initialized());
    }
    Ok(config)
}

fn open_topology(config_path: &Path) -> CliResult<TopologyStore> {
    let config = load_initialized(config_path)?;
    Ok(TopologyStore::open(&config.data_dir)?)
}

/// Check if a data directory is initialized
fn is_initialized(data_dir: &Path) -> bool {
    data_dir.join(MIGRATION_DIR_NAME).is_dir()
}
