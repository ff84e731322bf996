//! SQLite-backed stencil cache.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use rusqlite::{Connection, ErrorCode, OpenFlags};
use tracing::{debug, info, warn};

use stencil_core::{
    CacheStats, CachedStencil, DatabaseConfig, Result, SearchRequest, SearchRow, Shape, Stencil,
    StencilError, StencilRecord, StencilStore,
};

use crate::cache;
use crate::index::{self, IndexReport};
use crate::integrity::{self, Integrity};
use crate::migrate::{initialize_schema, SchemaOptions};
use crate::recovery::{self, RecoveryReport};

/// Connection settings applied on every open.
#[derive(Debug, Clone, Copy)]
pub struct StoreOptions {
    pub wal_mode: bool,
    pub busy_timeout_ms: u32,
    pub schema: SchemaOptions,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self::from(&DatabaseConfig::default())
    }
}

impl From<&DatabaseConfig> for StoreOptions {
    fn from(config: &DatabaseConfig) -> Self {
        Self {
            wal_mode: config.wal_mode,
            busy_timeout_ms: config.busy_timeout_ms,
            schema: SchemaOptions {
                fts_attempts: config.fts_attempts,
                fts_backoff: Duration::from_millis(config.fts_backoff_ms),
            },
        }
    }
}

/// Convert a rusqlite error at the store boundary.
pub(crate) fn db_err(e: rusqlite::Error) -> StencilError {
    StencilError::database(e.to_string())
}

/// True for UNIQUE / CHECK / FOREIGN KEY violations.
pub(crate) fn is_constraint(e: &rusqlite::Error) -> bool {
    matches!(e.sqlite_error_code(), Some(ErrorCode::ConstraintViolation))
}

/// Classify an open-time failure: damage becomes `Corrupted`, anything else
/// (busy, locked, can't open) stays a plain database error.
fn open_err(context: &str, e: rusqlite::Error) -> StencilError {
    let message = format!("{}: {}", context, e);
    if integrity::is_corruption(&e) {
        StencilError::corrupted(message)
    } else {
        StencilError::database(message)
    }
}

/// Open a connection and apply the per-connection pragmas.
pub(crate) fn open_connection(path: &Path, options: &StoreOptions) -> Result<Connection> {
    let conn = Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )
    .map_err(|e| open_err("Failed to open database", e))?;

    configure_connection(&conn, options)
        .map_err(|e| open_err("Failed to configure connection", e))?;
    Ok(conn)
}

/// Open and run the integrity check. Only real damage is reported as
/// `Corrupted`.
pub(crate) fn open_verified(path: &Path, options: &StoreOptions) -> Result<Connection> {
    let conn = open_connection(path, options)?;

    match integrity::check(&conn).map_err(|e| open_err("Integrity check failed", e))? {
        Integrity::Ok => Ok(conn),
        Integrity::Corrupt(reason) => Err(StencilError::corrupted(reason)),
    }
}

fn configure_connection(conn: &Connection, options: &StoreOptions) -> rusqlite::Result<()> {
    // Before anything that touches the file, so a held lock is waited on.
    conn.busy_timeout(Duration::from_millis(u64::from(options.busy_timeout_ms)))?;

    let journal = if options.wal_mode { "WAL" } else { "DELETE" };
    conn.execute_batch(&format!(
        r#"
        PRAGMA journal_mode = {};
        PRAGMA synchronous = NORMAL;
        PRAGMA cache_size = -64000;
        PRAGMA temp_store = MEMORY;
        PRAGMA foreign_keys = ON;
        "#,
        journal
    ))
}

/// The stencil cache.
///
/// One connection, one lock: every operation holds the mutex for its whole
/// duration, including any inline migration it triggers.
pub struct SqliteStore {
    /// `None` after `close()`; reopened on next use.
    conn: Mutex<Option<Connection>>,

    /// `None` for in-memory stores.
    path: Option<PathBuf>,

    options: StoreOptions,

    /// Cleared when the FTS5 index cannot be created or is disabled.
    full_text: AtomicBool,

    /// Set when the file was recovered at open.
    recovery: Option<RecoveryReport>,
}

impl SqliteStore {
    /// Open or create a store at the given path with default settings.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with(&DatabaseConfig::at(path.as_ref()))
    }

    /// Open or create a store, recovering a damaged file if needed.
    pub fn open_with(config: &DatabaseConfig) -> Result<Self> {
        let path = config.path.as_path();
        let options = StoreOptions::from(config);

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let (conn, recovery) = match open_verified(path, &options) {
            Ok(conn) => (conn, None),
            Err(e @ StencilError::Corrupted { .. }) => {
                let (conn, report) = recovery::recover(path, &options, e.to_string())?;
                (conn, Some(report))
            }
            Err(e) => return Err(e),
        };

        let full_text = initialize_schema(&conn, options.schema)?;
        info!("Stencil cache opened at {:?}", path);

        Ok(Self {
            conn: Mutex::new(Some(conn)),
            path: Some(path.to_path_buf()),
            options,
            full_text: AtomicBool::new(full_text),
            recovery,
        })
    }

    /// Open an in-memory store (for testing).
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|e| {
            StencilError::database(format!("Failed to open in-memory database: {}", e))
        })?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")
            .map_err(db_err)?;

        let options = StoreOptions::default();
        let full_text = initialize_schema(&conn, options.schema)?;

        Ok(Self {
            conn: Mutex::new(Some(conn)),
            path: None,
            options,
            full_text: AtomicBool::new(full_text),
            recovery: None,
        })
    }

    /// Run `f` on the connection while holding the store lock.
    pub(crate) fn with_conn<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Connection) -> Result<R>,
    {
        let mut guard = self
            .conn
            .lock()
            .map_err(|e| StencilError::database(e.to_string()))?;

        if let Some(conn) = guard.as_ref() {
            return f(conn);
        }

        let path = self
            .path
            .as_deref()
            .ok_or_else(|| StencilError::database("In-memory store has been closed"))?;
        let conn = open_connection(path, &self.options)?;
        if !initialize_schema(&conn, self.options.schema)? {
            self.full_text.store(false, Ordering::SeqCst);
        }
        debug!("Reopened stencil cache at {:?}", path);

        let conn = guard.insert(conn);
        f(conn)
    }

    /// Database file, `None` for in-memory stores.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Whether searches can use the full-text index.
    pub fn full_text_available(&self) -> bool {
        self.full_text.load(Ordering::SeqCst)
    }

    /// Route every later search through substring matching.
    pub fn disable_full_text(&self) {
        if self.full_text.swap(false, Ordering::SeqCst) {
            warn!("Full-text search disabled");
        }
    }

    /// What recovery did at open, if anything.
    pub fn recovery(&self) -> Option<&RecoveryReport> {
        self.recovery.as_ref()
    }

    /// True when the store was rebuilt empty and stencils must be scanned again.
    pub fn needs_rescan(&self) -> bool {
        self.recovery
            .as_ref()
            .map(RecoveryReport::needs_rescan)
            .unwrap_or(false)
    }

    /// Drop the connection. The next call reopens it.
    pub fn close(&self) -> Result<()> {
        let mut guard = self
            .conn
            .lock()
            .map_err(|e| StencilError::database(e.to_string()))?;

        if let Some(conn) = guard.take() {
            conn.close().map_err(|(_, e)| db_err(e))?;
            debug!("Stencil cache closed");
        }
        Ok(())
    }

    /// Delete every cached stencil and, through cascades, their shapes,
    /// favorites and collection memberships. Presets, saved searches and
    /// collections themselves are kept.
    pub fn clear_cache(&self) -> Result<u64> {
        self.with_conn(|conn| {
            let deleted = conn.execute("DELETE FROM stencils", []).map_err(db_err)?;
            info!("Cleared {} stencils from cache", deleted);
            Ok(deleted as u64)
        })
    }

    /// Compare the whole search index with `shapes`, rebuilding on drift.
    pub fn verify_search_index(&self) -> Result<IndexReport> {
        if !self.full_text_available() {
            return Err(StencilError::invalid_argument("Full-text search is unavailable"));
        }
        self.with_conn(index::verify)
    }

    /// (index rows, shape rows) for one stencil.
    pub fn index_counts_for_stencil(&self, path: &str) -> Result<(u64, u64)> {
        self.with_conn(|conn| index::counts_for_stencil(conn, path))
    }

    pub fn get_stats(&self) -> Result<CacheStats> {
        let full_text = self.full_text_available();

        self.with_conn(|conn| {
            let count = |table: &str| -> Result<u64> {
                conn.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| {
                    row.get::<_, i64>(0)
                })
                .map(|n| n as u64)
                .map_err(db_err)
            };

            let index_rows = if full_text {
                count("shapes_fts").unwrap_or(0)
            } else {
                0
            };

            let page_count: u64 = conn
                .query_row("PRAGMA page_count", [], |row| row.get(0))
                .unwrap_or(0);
            let page_size: u64 = conn
                .query_row("PRAGMA page_size", [], |row| row.get(0))
                .unwrap_or(4096);

            Ok(CacheStats {
                stencils: count("stencils")?,
                shapes: count("shapes")?,
                favorites: count("favorites")?,
                collections: count("collections")?,
                saved_searches: count("saved_searches")?,
                preset_directories: count("preset_directories")?,
                index_rows,
                storage_bytes: page_count * page_size,
                full_text_available: full_text,
            })
        })
    }
}

impl StencilStore for SqliteStore {
    fn cache_stencil(&self, record: &StencilRecord) -> Result<()> {
        let full_text = self.full_text_available();
        self.with_conn(|conn| cache::write_stencil(conn, record, full_text))
    }

    fn needs_update(&self, path: &str) -> Result<bool> {
        self.with_conn(|conn| cache::needs_update(conn, path))
    }

    fn get_cached_stencils(&self) -> Result<Vec<Stencil>> {
        self.with_conn(cache::list_stencils)
    }

    fn delete_stencil(&self, path: &str) -> Result<bool> {
        self.with_conn(|conn| cache::delete_stencil(conn, path))
    }

    fn get_stencil_by_path(&self, path: &str) -> Result<Option<CachedStencil>> {
        self.with_conn(|conn| cache::load_stencil(conn, path))
    }

    fn get_shape_by_id(&self, id: i64) -> Result<Option<Shape>> {
        self.with_conn(|conn| cache::load_shape(conn, id))
    }

    fn search(&self, request: &SearchRequest) -> Vec<SearchRow> {
        self.search_rows(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{seed, stencil_file};

    #[test]
    fn test_open_memory() {
        let store = SqliteStore::open_memory().unwrap();
        assert!(store.full_text_available());
        assert!(store.get_cached_stencils().unwrap().is_empty());
        assert!(store.recovery().is_none());
    }

    #[test]
    fn test_open_creates_parent_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data").join("stencil_cache.db");

        let store = SqliteStore::open(&path).unwrap();
        assert!(path.exists());
        assert_eq!(store.path(), Some(path.as_path()));
        assert!(!store.needs_rescan());
    }

    #[test]
    fn test_corrupted_file_is_recovered() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stencil_cache.db");
        std::fs::write(&path, vec![0xC3u8; 32 * 1024]).unwrap();

        let store = SqliteStore::open(&path).unwrap();

        let report = store.recovery().unwrap();
        assert!(store.needs_rescan());
        assert!(!report.backups.is_empty());
        for backup in &report.backups {
            assert!(backup.exists());
            assert!(backup.to_string_lossy().ends_with(".bak"));
        }

        let stats = store.get_stats().unwrap();
        assert_eq!(stats.stencils, 0);
        assert_eq!(stats.shapes, 0);
        assert!(store
            .with_conn(|conn| Ok(integrity::check(conn).map_err(db_err)?.is_ok()))
            .unwrap());
        assert!(store.add_saved_search("after", "x", &Default::default()).is_ok());
    }

    #[test]
    fn test_locked_file_fails_without_recovery() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stencil_cache.db");
        {
            let store = SqliteStore::open(&path).unwrap();
            seed(&store, dir.path(), "Network Shapes", &["Router", "Switch"]);
        }

        let holder = Connection::open(&path).unwrap();
        holder
            .execute_batch(
                "PRAGMA locking_mode = EXCLUSIVE;
                 BEGIN EXCLUSIVE;
                 UPDATE stencils SET shape_count = shape_count;",
            )
            .unwrap();

        let config = DatabaseConfig {
            busy_timeout_ms: 50,
            ..DatabaseConfig::at(&path)
        };
        let err = SqliteStore::open_with(&config).err().unwrap();
        assert!(matches!(err, StencilError::Database { .. }), "{:?}", err);
        drop(holder);

        let store = SqliteStore::open(&path).unwrap();
        assert!(store.recovery().is_none());
        let stats = store.get_stats().unwrap();
        assert_eq!(stats.stencils, 1);
        assert_eq!(stats.shapes, 2);

        let backups = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_name().to_string_lossy().ends_with(".bak"))
            .count();
        assert_eq!(backups, 0);
    }

    #[test]
    fn test_close_reopens_lazily() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open(dir.path().join("cache.db")).unwrap();
        let path = seed(&store, dir.path(), "Network Shapes", &["Router"]);

        store.close().unwrap();
        store.close().unwrap();

        let cached = store.get_stencil_by_path(&path).unwrap().unwrap();
        assert_eq!(cached.shapes.len(), 1);
    }

    #[test]
    fn test_closed_memory_store_errors() {
        let store = SqliteStore::open_memory().unwrap();
        store.close().unwrap();
        assert!(store.get_cached_stencils().is_err());
    }

    #[test]
    fn test_stats_and_clear() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open_memory().unwrap();
        let path = seed(&store, dir.path(), "Network Shapes", &["Router", "Switch"]);
        store.add_favorite_stencil(&path).unwrap();
        store.add_preset_directory("/stencils", None).unwrap();

        let stats = store.get_stats().unwrap();
        assert_eq!(stats.stencils, 1);
        assert_eq!(stats.shapes, 2);
        assert_eq!(stats.index_rows, 2);
        assert_eq!(stats.favorites, 1);
        assert!(stats.full_text_available);

        assert_eq!(store.clear_cache().unwrap(), 1);
        let stats = store.get_stats().unwrap();
        assert_eq!(stats.shapes, 0);
        assert_eq!(stats.index_rows, 0);
        assert_eq!(stats.favorites, 0);
        assert_eq!(stats.preset_directories, 1);
    }

    #[test]
    fn test_verify_search_index() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open_memory().unwrap();
        let file = stencil_file(dir.path(), "Basic.vssx", 10);
        let record = StencilRecord::from_path(&file, vec!["Box".into(), "Circle".into()]);
        store.cache_stencil(&record).unwrap();

        store
            .with_conn(|conn| {
                conn.execute("DELETE FROM shapes_fts", []).map_err(db_err)?;
                Ok(())
            })
            .unwrap();

        let report = store.verify_search_index().unwrap();
        assert!(report.rebuilt);
        assert_eq!(report.index_rows, 2);

        store.disable_full_text();
        assert!(store.verify_search_index().is_err());
    }
}
