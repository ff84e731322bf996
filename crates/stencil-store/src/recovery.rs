//! Corruption recovery.
//!
//! Two escalating strategies run while no connection to the damaged file is
//! held: `DumpReload` moves the file aside and copies every readable row of
//! the known tables into a fresh store; `Recreate` backs the file up and
//! starts from an empty schema. Both leave timestamped `.bak` files next to
//! the store.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::Local;
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, OpenFlags};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use stencil_core::{Result, StencilError};

use crate::index;
use crate::migrate::{column_exists, initialize_schema, table_exists};
use crate::schema::TABLES;
use crate::sqlite::{open_connection, open_verified, StoreOptions};

const SIDE_SUFFIXES: &[&str] = &["-wal", "-shm", "-journal"];

/// What recovery did when the store was opened.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RecoveryReport {
    /// Why recovery started.
    pub reason: String,

    /// Strategy that produced the working store.
    pub strategy: Option<String>,

    /// Backup copies written, oldest first.
    pub backups: Vec<PathBuf>,

    /// Rows carried over from the damaged file.
    pub rows_salvaged: u64,
}

impl RecoveryReport {
    /// True when cached data was lost and the caller should re-scan.
    pub fn needs_rescan(&self) -> bool {
        self.strategy.as_deref() != Some(DumpReload.name()) || self.rows_salvaged == 0
    }
}

/// One way of turning a damaged store file into a usable one.
pub trait RecoveryStrategy {
    fn name(&self) -> &'static str;

    /// Leave a schema-complete store at `path`. Backups made along the way
    /// are recorded in `report` even when the strategy then fails.
    fn recover(&self, path: &Path, options: &StoreOptions, report: &mut RecoveryReport)
        -> Result<()>;
}

/// Move aside, dump readable rows, reload into a fresh store.
pub struct DumpReload;

/// Back up, delete, start empty.
pub struct Recreate;

impl RecoveryStrategy for DumpReload {
    fn name(&self) -> &'static str {
        "dump_reload"
    }

    fn recover(
        &self,
        path: &Path,
        options: &StoreOptions,
        report: &mut RecoveryReport,
    ) -> Result<()> {
        let backup = backup_path(path, "corrupt");
        move_aside(path, &backup, report)?;
        info!("Moved damaged store to {}", backup.display());

        let source = Connection::open_with_flags(&backup, OpenFlags::SQLITE_OPEN_READ_ONLY)
            .map_err(|e| StencilError::corrupted(format!("Cannot open backup: {}", e)))?;
        source
            .query_row("SELECT COUNT(*) FROM sqlite_master", [], |row| row.get::<_, i64>(0))
            .map_err(|e| StencilError::corrupted(format!("Dump failed: {}", e)))?;

        let salvaged = match reload(&source, path, options) {
            Ok(rows) if rows > 0 => rows,
            Ok(_) => {
                remove_store_files(path)?;
                return Err(StencilError::corrupted("Dump produced no rows"));
            }
            Err(e) => {
                remove_store_files(path)?;
                return Err(e);
            }
        };

        report.rows_salvaged = salvaged;
        info!("Reloaded {} rows from {}", salvaged, backup.display());
        Ok(())
    }
}

impl RecoveryStrategy for Recreate {
    fn name(&self) -> &'static str {
        "recreate"
    }

    fn recover(
        &self,
        path: &Path,
        options: &StoreOptions,
        report: &mut RecoveryReport,
    ) -> Result<()> {
        if path.exists() {
            let backup = backup_path(path, "recreate");
            fs::copy(path, &backup)?;
            let wal = with_suffix(path, "-wal");
            if wal.exists() {
                fs::copy(&wal, with_suffix(&backup, "-wal"))?;
            }
            info!("Backed up damaged store to {}", backup.display());
            report.backups.push(backup);
        }

        remove_store_files(path)?;

        let conn = open_connection(path, options)?;
        initialize_schema(&conn, options.schema)?;
        warn!("Recreated empty store at {} - a re-scan is required", path.display());
        Ok(())
    }
}

/// Strategies in escalation order.
pub fn strategies() -> Vec<Box<dyn RecoveryStrategy>> {
    vec![Box::new(DumpReload), Box::new(Recreate)]
}

/// Run strategies in order until one leaves a store that passes the
/// integrity check, and return a connection to it.
pub fn recover(
    path: &Path,
    options: &StoreOptions,
    reason: String,
) -> Result<(Connection, RecoveryReport)> {
    error!("Store at {} is corrupted: {}", path.display(), reason);

    let mut report = RecoveryReport {
        reason,
        ..Default::default()
    };

    for strategy in strategies() {
        if let Err(e) = strategy.recover(path, options, &mut report) {
            warn!("Recovery strategy {} failed: {}", strategy.name(), e);
            continue;
        }

        match open_verified(path, options) {
            Ok(conn) => {
                report.strategy = Some(strategy.name().to_string());
                info!("Store recovered using {}", strategy.name());
                return Ok((conn, report));
            }
            Err(e) => warn!("Store still failing after {}: {}", strategy.name(), e),
        }
    }

    Err(StencilError::corrupted(format!(
        "All recovery strategies failed for {}",
        path.display()
    )))
}

/// Create a fresh store at `path` and copy every readable row into it.
fn reload(source: &Connection, path: &Path, options: &StoreOptions) -> Result<u64> {
    let target = open_connection(path, options)?;
    initialize_schema(&target, options.schema)?;

    let tx = target
        .unchecked_transaction()
        .map_err(|e| StencilError::database(e.to_string()))?;

    let mut total = 0;
    for table in TABLES {
        match copy_table(source, &tx, table) {
            Ok(rows) => {
                debug!("Salvaged {} rows from {}", rows, table);
                total += rows;
            }
            Err(e) => warn!("Could not salvage {}: {}", table, e),
        }
    }

    tx.commit()
        .map_err(|e| StencilError::database(e.to_string()))?;

    index::rebuild(&target)?;
    Ok(total)
}

/// Copy the columns both sides share. Rows that fail to insert are skipped;
/// a read error ends the table at the last readable row.
fn copy_table(source: &Connection, target: &Connection, table: &str) -> Result<u64> {
    if !table_exists(source, table)? {
        return Ok(0);
    }

    let mut stmt = source
        .prepare(&format!("PRAGMA table_info({})", table))
        .map_err(|e| StencilError::database(e.to_string()))?;
    let source_columns = stmt
        .query_map([], |row| row.get::<_, String>(1))
        .map_err(|e| StencilError::database(e.to_string()))?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| StencilError::database(e.to_string()))?;

    let mut columns = Vec::new();
    for column in source_columns {
        if column_exists(target, table, &column)? {
            columns.push(column);
        }
    }
    if columns.is_empty() {
        return Ok(0);
    }

    let column_list = columns.join(", ");
    let placeholders = vec!["?"; columns.len()].join(", ");
    let mut select = source
        .prepare(&format!("SELECT {} FROM {}", column_list, table))
        .map_err(|e| StencilError::database(e.to_string()))?;
    let mut insert = target
        .prepare(&format!(
            "INSERT OR IGNORE INTO {} ({}) VALUES ({})",
            table, column_list, placeholders
        ))
        .map_err(|e| StencilError::database(e.to_string()))?;

    let mut rows = select
        .query([])
        .map_err(|e| StencilError::database(e.to_string()))?;

    let mut copied = 0;
    loop {
        let row = match rows.next() {
            Ok(Some(row)) => row,
            Ok(None) => break,
            Err(e) => {
                warn!("Stopped reading {} after {} rows: {}", table, copied, e);
                break;
            }
        };

        let values = (0..columns.len())
            .map(|i| row.get::<_, Value>(i))
            .collect::<std::result::Result<Vec<_>, _>>();
        let values = match values {
            Ok(values) => values,
            Err(e) => {
                debug!("Skipping unreadable row in {}: {}", table, e);
                continue;
            }
        };

        match insert.execute(params_from_iter(values)) {
            Ok(n) => copied += n as u64,
            Err(e) => debug!("Skipping row in {}: {}", table, e),
        }
    }

    Ok(copied)
}

/// `<file>.<label>-<YYYYmmdd_HHMMSS>.bak` next to the store, never reusing
/// an existing name.
pub fn backup_path(path: &Path, label: &str) -> PathBuf {
    let stamp = Local::now().format("%Y%m%d_%H%M%S");
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "store".to_string());

    let mut candidate = path.with_file_name(format!("{}.{}-{}.bak", file_name, label, stamp));
    let mut n = 1;
    while candidate.exists() {
        candidate = path.with_file_name(format!("{}.{}-{}-{}.bak", file_name, label, stamp, n));
        n += 1;
    }
    candidate
}

/// Rename the store and its side files to `backup`. The backup is recorded
/// as soon as the main file has moved, so a failing side-file rename still
/// leaves it in the report.
fn move_aside(path: &Path, backup: &Path, report: &mut RecoveryReport) -> Result<()> {
    fs::rename(path, backup)?;
    report.backups.push(backup.to_path_buf());

    for suffix in SIDE_SUFFIXES {
        let side = with_suffix(path, suffix);
        if side.exists() {
            fs::rename(&side, with_suffix(backup, suffix))?;
        }
    }
    Ok(())
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

/// Delete the store file and its side files; missing files are fine.
pub fn remove_store_files(path: &Path) -> Result<()> {
    let mut targets = vec![path.to_path_buf()];
    targets.extend(SIDE_SUFFIXES.iter().map(|s| with_suffix(path, s)));

    for target in targets {
        match fs::remove_file(&target) {
            Ok(()) => debug!("Removed {}", target.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bak_files(dir: &Path) -> Vec<PathBuf> {
        fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().path())
            .filter(|p| p.extension().map(|e| e == "bak").unwrap_or(false))
            .collect()
    }

    #[test]
    fn test_backup_path_is_unique() {
        let dir = tempfile::tempdir().unwrap();
        let store = dir.path().join("cache.db");

        let first = backup_path(&store, "corrupt");
        assert!(first
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("cache.db.corrupt-"));

        fs::write(&first, b"x").unwrap();
        let second = backup_path(&store, "corrupt");
        assert_ne!(first, second);
    }

    #[test]
    fn test_backup_recorded_when_side_file_cannot_move() {
        let dir = tempfile::tempdir().unwrap();
        let store = dir.path().join("cache.db");
        fs::write(&store, b"damaged").unwrap();
        fs::write(with_suffix(&store, "-wal"), b"wal").unwrap();

        let backup = dir.path().join("cache.db.corrupt-fixed.bak");
        let blocked = with_suffix(&backup, "-wal");
        fs::create_dir(&blocked).unwrap();
        fs::write(blocked.join("occupied"), b"x").unwrap();

        let mut report = RecoveryReport::default();
        assert!(move_aside(&store, &backup, &mut report).is_err());

        assert_eq!(report.backups, vec![backup.clone()]);
        assert_eq!(fs::read(&backup).unwrap(), b"damaged");
        assert!(!store.exists());
    }

    #[test]
    fn test_recreate_backs_up_and_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = dir.path().join("cache.db");
        fs::write(&store, b"definitely not sqlite").unwrap();
        fs::write(with_suffix(&store, "-shm"), b"stale").unwrap();

        let mut report = RecoveryReport::default();
        Recreate
            .recover(&store, &StoreOptions::default(), &mut report)
            .unwrap();

        assert_eq!(report.backups.len(), 1);
        assert_eq!(fs::read(&report.backups[0]).unwrap(), b"definitely not sqlite");

        let conn = Connection::open(&store).unwrap();
        assert!(table_exists(&conn, "collection_shapes").unwrap());
        let stencils: i64 = conn
            .query_row("SELECT COUNT(*) FROM stencils", [], |row| row.get(0))
            .unwrap();
        assert_eq!(stencils, 0);
    }

    #[test]
    fn test_dump_reload_salvages_rows() {
        let dir = tempfile::tempdir().unwrap();
        let store = dir.path().join("cache.db");
        {
            let conn = open_connection(&store, &StoreOptions::default()).unwrap();
            initialize_schema(&conn, Default::default()).unwrap();
            conn.execute_batch(
                r#"
                INSERT INTO stencils (path, name, extension, shape_count, last_scan, last_modified)
                    VALUES ('/s/a.vssx', 'a', '.vssx', 1, '2024-01-01', '2024-01-01');
                INSERT INTO shapes (stencil_path, name) VALUES ('/s/a.vssx', 'Router');
                INSERT INTO saved_searches (name, search_term, filters, created_at)
                    VALUES ('routers', 'router', '{}', '2024-01-01');
                "#,
            )
            .unwrap();
        }

        let mut report = RecoveryReport::default();
        DumpReload
            .recover(&store, &StoreOptions::default(), &mut report)
            .unwrap();

        assert_eq!(report.rows_salvaged, 3);
        assert_eq!(bak_files(dir.path()).len(), 1);

        let conn = Connection::open(&store).unwrap();
        let indexed: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM shapes_fts WHERE shapes_fts MATCH 'router'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(indexed, 1);
    }

    #[test]
    fn test_recover_escalates_on_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let store = dir.path().join("cache.db");
        fs::write(&store, vec![0x5Au8; 16384]).unwrap();

        let (conn, report) =
            recover(&store, &StoreOptions::default(), "test".to_string()).unwrap();

        assert_eq!(report.strategy.as_deref(), Some("recreate"));
        assert!(report.needs_rescan());
        assert!(!report.backups.is_empty());
        assert!(report.backups.iter().all(|b| b.exists()));
        assert!(table_exists(&conn, "favorites").unwrap());
    }
}
