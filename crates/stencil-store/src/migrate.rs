//! Schema creation and column-level migrations.

use std::thread;
use std::time::Duration;

use rusqlite::{params, Connection};
use tracing::{debug, info, warn};

use stencil_core::{Result, StencilError};

use crate::index;
use crate::schema::{COLUMN_MIGRATIONS, FTS_SCHEMA, SCHEMA};

/// Settings for bringing a connection up to the current schema.
#[derive(Debug, Clone, Copy)]
pub struct SchemaOptions {
    pub fts_attempts: u32,
    pub fts_backoff: Duration,
}

impl Default for SchemaOptions {
    fn default() -> Self {
        Self {
            fts_attempts: 3,
            fts_backoff: Duration::from_millis(100),
        }
    }
}

/// Bring a connection to the current schema.
///
/// Returns whether the full-text index is usable. Column migrations are
/// best-effort; a failure creating the base tables is returned as an error.
pub fn initialize_schema(conn: &Connection, options: SchemaOptions) -> Result<bool> {
    apply_column_migrations(conn);

    conn.execute_batch(SCHEMA)
        .map_err(|e| StencilError::database(format!("Failed to initialize schema: {}", e)))?;

    let fts_available = create_search_index(conn, options.fts_attempts, options.fts_backoff);
    if fts_available {
        match index::verify(conn) {
            Ok(report) if report.rebuilt => {
                info!("Search index rebuilt ({} rows)", report.shape_rows)
            }
            Ok(_) => {}
            Err(e) => warn!("Search index verification failed: {}", e),
        }
    } else {
        warn!("FTS5 unavailable - search will use substring matching");
    }

    Ok(fts_available)
}

/// Add any columns introduced after a table was first created.
pub fn apply_column_migrations(conn: &Connection) {
    for (table, column, decl) in COLUMN_MIGRATIONS {
        if let Err(e) = ensure_column(conn, table, column, decl) {
            warn!("Migration of {}.{} failed (continuing): {}", table, column, e);
        }
    }
}

/// Add `column` to `table` if the table exists and lacks it.
/// Returns whether the column was added.
pub fn ensure_column(conn: &Connection, table: &str, column: &str, decl: &str) -> Result<bool> {
    if !table_exists(conn, table)? || column_exists(conn, table, column)? {
        return Ok(false);
    }

    conn.execute(&format!("ALTER TABLE {} ADD COLUMN {} {}", table, column, decl), [])
        .map_err(|e| StencilError::database(e.to_string()))?;

    info!("Added column {}.{}", table, column);
    Ok(true)
}

/// Apply every pending column migration; used inline before queries that
/// depend on newer columns.
pub fn ensure_columns(conn: &Connection) -> Result<()> {
    for (table, column, decl) in COLUMN_MIGRATIONS {
        ensure_column(conn, table, column, decl)?;
    }
    Ok(())
}

pub fn table_exists(conn: &Connection, table: &str) -> Result<bool> {
    conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
        params![table],
        |row| row.get::<_, i64>(0),
    )
    .map(|count| count > 0)
    .map_err(|e| StencilError::database(e.to_string()))
}

pub fn column_exists(conn: &Connection, table: &str, column: &str) -> Result<bool> {
    let mut stmt = conn
        .prepare(&format!("PRAGMA table_info({})", table))
        .map_err(|e| StencilError::database(e.to_string()))?;

    let names = stmt
        .query_map([], |row| row.get::<_, String>(1))
        .map_err(|e| StencilError::database(e.to_string()))?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| StencilError::database(e.to_string()))?;

    Ok(names.iter().any(|name| name == column))
}

/// Create the FTS5 table and its triggers, retrying with a linear backoff.
pub fn create_search_index(conn: &Connection, attempts: u32, backoff: Duration) -> bool {
    let attempts = attempts.max(1);

    for attempt in 1..=attempts {
        match conn.execute_batch(FTS_SCHEMA) {
            Ok(()) => {
                debug!("Search index ready (attempt {})", attempt);
                return true;
            }
            Err(e) => {
                warn!(
                    "Failed to create search index (attempt {}/{}): {}",
                    attempt, attempts, e
                );
                if attempt < attempts {
                    thread::sleep(backoff * attempt);
                }
            }
        }
    }

    false
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use stencil_core::{DatabaseConfig, SearchRequest, StencilStore};

    use crate::test_support::seed;
    use crate::SqliteStore;

    use super::*;

    fn legacy_connection() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            r#"
            CREATE TABLE stencils (
                path TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                extension TEXT NOT NULL,
                shape_count INTEGER NOT NULL,
                last_scan TIMESTAMP NOT NULL,
                last_modified TIMESTAMP NOT NULL
            );
            CREATE TABLE shapes (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                stencil_path TEXT NOT NULL,
                name TEXT NOT NULL
            );
            INSERT INTO stencils VALUES ('/s/net.vssx', 'net', '.vssx', 2, '2024-01-01T00:00:00', '2024-01-01T00:00:00');
            INSERT INTO shapes (stencil_path, name) VALUES ('/s/net.vssx', 'Router'), ('/s/net.vssx', 'Switch');
            "#,
        )
        .unwrap();
        conn
    }

    #[test]
    fn test_ensure_column_adds_once() {
        let conn = legacy_connection();
        assert!(!column_exists(&conn, "stencils", "file_size").unwrap());
        assert!(ensure_column(&conn, "stencils", "file_size", "INTEGER").unwrap());
        assert!(column_exists(&conn, "stencils", "file_size").unwrap());
        assert!(!ensure_column(&conn, "stencils", "file_size", "INTEGER").unwrap());
    }

    #[test]
    fn test_ensure_column_skips_missing_table() {
        let conn = Connection::open_in_memory().unwrap();
        assert!(!ensure_column(&conn, "stencils", "file_size", "INTEGER").unwrap());
    }

    #[test]
    fn test_initialize_legacy_store() {
        let conn = legacy_connection();
        let fts = initialize_schema(&conn, SchemaOptions::default()).unwrap();
        assert!(fts);

        for (table, column, _) in COLUMN_MIGRATIONS {
            assert!(column_exists(&conn, table, column).unwrap(), "{}.{}", table, column);
        }

        // Existing shapes are indexed once the index is created.
        let indexed: i64 = conn
            .query_row("SELECT COUNT(*) FROM shapes_fts", [], |row| row.get(0))
            .unwrap();
        assert_eq!(indexed, 2);
    }

    #[test]
    fn test_initialize_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        assert!(initialize_schema(&conn, SchemaOptions::default()).unwrap());
        assert!(initialize_schema(&conn, SchemaOptions::default()).unwrap());
        assert!(table_exists(&conn, "collection_shapes").unwrap());
    }

    /// An index named `shapes_fts` occupies the name the search table needs.
    fn block_search_index(conn: &Connection) {
        conn.execute_batch(SCHEMA).unwrap();
        conn.execute_batch("CREATE INDEX shapes_fts ON stencils(name);")
            .unwrap();
    }

    #[test]
    fn test_search_index_retries_then_gives_up() {
        let conn = Connection::open_in_memory().unwrap();
        block_search_index(&conn);

        let backoff = Duration::from_millis(20);
        let started = Instant::now();
        assert!(!create_search_index(&conn, 3, backoff));
        // Two waits between three attempts: 20ms then 40ms.
        assert!(started.elapsed() >= backoff * 3);

        let options = SchemaOptions {
            fts_attempts: 1,
            fts_backoff: backoff,
        };
        assert!(!initialize_schema(&conn, options).unwrap());
        assert!(table_exists(&conn, "shapes").unwrap());
    }

    #[test]
    fn test_store_without_search_index_uses_substring_search() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.db");
        block_search_index(&Connection::open(&path).unwrap());

        let config = DatabaseConfig {
            fts_attempts: 2,
            fts_backoff_ms: 1,
            ..DatabaseConfig::at(&path)
        };
        let store = SqliteStore::open_with(&config).unwrap();
        assert!(!store.full_text_available());
        assert!(store.recovery().is_none());

        seed(&store, dir.path(), "Network", &["Router", "Switch"]);
        let rows = store.search(&SearchRequest::new("rout"));
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].shape_name, "Router");
        assert!(rows[0].highlighted_name.is_none());
    }
}
