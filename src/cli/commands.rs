//! CLI command implementations
//!
//! Each command loads the config, opens what it needs, does one thing
//! and prints one JSON response. Commands that touch the live dataset
//! (`backup`, `restore`, `watch`) open it through `host::Server`.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use crate::backup::scheduler;
use crate::backup::{BackupDatabaseService, BackupError, LiveDataset, RestoreOptions};
use crate::catalog::{Backup, Catalog};
use crate::config::Config;
use crate::content_store::ContentStore;
use crate::host::Server;
use crate::partition::{ChunkPos, RestoreScope};

use super::args::{Cli, Command};
use super::errors::{CliError, CliResult};
use super::io::write_response;

/// Main CLI entry point. The only function `main.rs` calls.
pub fn run() -> CliResult<()> {
    let cli = Cli::parse_args();
    run_command(&cli.config, cli.command)
}

pub fn run_command(config_path: &Path, cmd: Command) -> CliResult<()> {
    let config = Config::load(config_path)?;
    match cmd {
        Command::Init => init(&config),
        Command::Backup { comment } => backup(&config, comment),
        Command::List { offset, limit } => list(&config, offset, limit),
        Command::Info { id } => info(&config, id),
        Command::Check { id } => check(&config, id),
        Command::Restore {
            id,
            force,
            world,
            from,
            to,
            no_safety_backup,
        } => {
            let scope = restore_scope(world, from, to)?;
            let options = RestoreOptions {
                force,
                scope,
                safety_backup: if no_safety_backup { Some(false) } else { None },
            };
            restore(&config, id, &options)
        }
        Command::Delete { id } => delete(&config, id),
        Command::Export { id, output } => export(&config, id, &output),
        Command::Import { file } => import(&config, &file),
        Command::Gc => gc(&config),
        Command::Status => status(&config),
        Command::Watch { tick_secs } => watch(&config, tick_secs),
    }
}

/// Creates the state directory, blob store and an empty catalog.
pub fn init(config: &Config) -> CliResult<()> {
    if is_initialized(config) {
        return Err(CliError::already_initialized());
    }

    fs::create_dir_all(&config.data_dir).map_err(|e| {
        CliError::config_error(format!("Failed to create {}: {}", config.data_dir.display(), e))
    })?;
    ContentStore::open(config.blob_path()).map_err(BackupError::from)?;
    Catalog::open(config.catalog_path())
        .and_then(|catalog| catalog.save())
        .map_err(BackupError::from)?;

    write_response(json!({
        "initialized": true,
        "state_dir": config.state_path().display().to_string(),
    }))
}

pub fn backup(config: &Config, comment: Option<String>) -> CliResult<()> {
    let service = open_service(config)?;
    let server = Server::open(config, Arc::clone(service.metrics()))?;
    let backup = service.create_backup(&server, comment)?;
    write_response(summary(&backup))
}

pub fn list(config: &Config, offset: usize, limit: usize) -> CliResult<()> {
    let service = open_service(config)?;
    let backups: Vec<Value> = service.list_backups(offset, limit).iter().map(|b| summary(b)).collect();
    write_response(json!({
        "total": service.backup_count(),
        "backups": backups,
    }))
}

pub fn info(config: &Config, id: u64) -> CliResult<()> {
    let service = open_service(config)?;
    let backup = require(&service, id)?;
    let mut data = summary(&backup);
    data["worlds"] = json!(backup.worlds());
    data["unique_blobs"] = json!(backup.unique_hashes().len());
    data["cloud_url"] = json!(backup.cloud_url);
    write_response(data)
}

pub fn check(config: &Config, id: u64) -> CliResult<()> {
    let service = open_service(config)?;
    let backup = require(&service, id)?;
    let ok = service.check(&backup)?;
    write_response(json!({ "id": id, "ok": ok }))
}

pub fn restore(config: &Config, id: u64, options: &RestoreOptions) -> CliResult<()> {
    let service = open_service(config)?;
    let server = Server::open(config, Arc::clone(service.metrics()))?;
    let report = service.restore_backup(id, &server, options)?;
    write_response(json!({
        "backup_id": report.backup_id,
        "components": report.components,
        "writes_drained": report.writes_drained,
        "transient_absorbed": report.transient_absorbed,
        "replaced": report.swap.replaced,
        "created": report.swap.created,
        "deleted": report.swap.deleted,
        "partitions": report.swap.partitions,
    }))
}

pub fn delete(config: &Config, id: u64) -> CliResult<()> {
    let service = open_service(config)?;
    let backup = service.delete_backup(id)?;
    write_response(json!({ "deleted": backup.id }))
}

pub fn export(config: &Config, id: u64, output: &Path) -> CliResult<()> {
    let service = open_service(config)?;
    let file = File::create(output)?;
    let (writer, summary) = service.export_archive(id, BufWriter::new(file))?;
    let file = writer.into_inner().map_err(|e| CliError::io_error(e.to_string()))?;
    file.sync_all()?;
    write_response(json!({
        "id": id,
        "output": output.display().to_string(),
        "blobs": summary.blobs,
        "bytes": summary.bytes,
    }))
}

pub fn import(config: &Config, input: &Path) -> CliResult<()> {
    let service = open_service(config)?;
    let file = File::open(input)?;
    let backup = service.import_archive(BufReader::new(file))?;
    write_response(summary(&backup))
}

pub fn gc(config: &Config) -> CliResult<()> {
    let service = open_service(config)?;
    let report = service.collect_garbage()?;
    write_response(json!({
        "removed": report.removed,
        "bytes_freed": report.bytes_freed,
    }))
}

pub fn status(config: &Config) -> CliResult<()> {
    let service = open_service(config)?;
    let status = service.status()?;
    write_response(serde_json::to_value(status)?)
}

/// Runs the scheduler until Ctrl-C.
pub fn watch(config: &Config, tick_secs: u64) -> CliResult<()> {
    if tick_secs == 0 {
        return Err(CliError::invalid_argument("tick_secs must be > 0"));
    }
    let service = Arc::new(open_service(config)?);
    let server = Server::open(config, Arc::clone(service.metrics()))?;
    let dataset: Arc<dyn LiveDataset> = Arc::new(server);

    let rt = tokio::runtime::Runtime::new()
        .map_err(|e| CliError::io_error(format!("Failed to create tokio runtime: {}", e)))?;

    let created = rt.block_on(async {
        let (tx, rx) = tokio::sync::watch::channel(false);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                let _ = tx.send(true);
            }
        });
        scheduler::run_scheduled(
            service,
            dataset,
            config.backup_interval(),
            Duration::from_secs(tick_secs),
            rx,
        )
        .await
    });

    write_response(json!({ "created": created }))
}

fn open_service(config: &Config) -> CliResult<BackupDatabaseService> {
    if !is_initialized(config) {
        return Err(CliError::not_initialized());
    }
    Ok(BackupDatabaseService::open(config)?)
}

fn is_initialized(config: &Config) -> bool {
    config.catalog_path().is_file()
}

fn require(service: &BackupDatabaseService, id: u64) -> CliResult<Arc<Backup>> {
    service
        .get_backup(id)
        .ok_or_else(|| BackupError::not_found(format!("backup #{} not found", id)).into())
}

fn restore_scope(world: Option<String>, from: Option<ChunkPos>, to: Option<ChunkPos>) -> CliResult<RestoreScope> {
    match (world, from, to) {
        (None, None, None) => Ok(RestoreScope::Full),
        (Some(world), Some(from), Some(to)) => Ok(RestoreScope::area(world, from, to)),
        _ => Err(CliError::invalid_argument("--world, --from and --to go together")),
    }
}

fn summary(backup: &Backup) -> Value {
    json!({
        "id": backup.id,
        "created_at": backup.created_at.to_rfc3339(),
        "comment": backup.comment,
        "temporary": backup.temporary,
        "partitions": backup.partition_count(),
        "total_size": backup.total_size,
        "stored_size": backup.stored_size,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup_config() -> (TempDir, Config) {
        let dir = TempDir::new().unwrap();
        let config = Config::for_data_dir(dir.path().join("world"));
        (dir, config)
    }

    #[test]
    fn test_init_twice_fails() {
        let (_dir, config) = setup_config();
        init(&config).unwrap();
        assert!(is_initialized(&config));
        assert_eq!(init(&config).unwrap_err().code_str(), "RV_CLI_ALREADY_INITIALIZED");
    }

    #[test]
    fn test_commands_require_init() {
        let (_dir, config) = setup_config();
        assert_eq!(list(&config, 0, 10).unwrap_err().code_str(), "RV_CLI_NOT_INITIALIZED");
    }

    #[test]
    fn test_unknown_backup_keeps_backup_code() {
        let (_dir, config) = setup_config();
        init(&config).unwrap();
        assert_eq!(info(&config, 42).unwrap_err().code_str(), "RV_BACKUP_NOT_FOUND");
    }

    #[test]
    fn test_restore_scope() {
        assert_eq!(restore_scope(None, None, None).unwrap(), RestoreScope::Full);
        let area = restore_scope(Some("overworld".into()), Some(ChunkPos::new(0, 0)), Some(ChunkPos::new(3, 3)));
        assert!(matches!(area.unwrap(), RestoreScope::Area { .. }));
        assert!(restore_scope(Some("overworld".into()), None, None).is_err());
    }
}
