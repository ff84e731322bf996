//! Consistency checks and repair for the full-text shape index.

use rusqlite::{params, Connection};
use serde::Serialize;
use tracing::{debug, warn};

use stencil_core::{Result, StencilError};

/// Outcome of a whole-index verification.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IndexReport {
    pub shape_rows: u64,
    pub index_rows: u64,
    pub rebuilt: bool,
}

fn count(conn: &Connection, sql: &str, path: Option<&str>) -> Result<u64> {
    let result = match path {
        Some(p) => conn.query_row(sql, params![p], |row| row.get::<_, i64>(0)),
        None => conn.query_row(sql, [], |row| row.get::<_, i64>(0)),
    };
    result
        .map(|n| n as u64)
        .map_err(|e| StencilError::database(e.to_string()))
}

/// (index rows, shape rows) for one stencil.
pub fn counts_for_stencil(conn: &Connection, path: &str) -> Result<(u64, u64)> {
    let indexed = count(
        conn,
        "SELECT COUNT(*) FROM shapes_fts WHERE stencil_path = ?1",
        Some(path),
    )?;
    let shapes = count(
        conn,
        "SELECT COUNT(*) FROM shapes WHERE stencil_path = ?1",
        Some(path),
    )?;
    Ok((indexed, shapes))
}

/// Replace the index rows of one stencil with its current shapes.
pub fn repair_stencil(conn: &Connection, path: &str) -> Result<()> {
    let tx = conn
        .unchecked_transaction()
        .map_err(|e| StencilError::database(e.to_string()))?;

    tx.execute("DELETE FROM shapes_fts WHERE stencil_path = ?1", params![path])
        .map_err(|e| StencilError::database(e.to_string()))?;
    tx.execute(
        r#"
        INSERT INTO shapes_fts(rowid, name, stencil_path)
        SELECT id, name, stencil_path FROM shapes WHERE stencil_path = ?1
        "#,
        params![path],
    )
    .map_err(|e| StencilError::database(e.to_string()))?;

    tx.commit()
        .map_err(|e| StencilError::database(e.to_string()))?;

    debug!("Re-indexed shapes for {}", path);
    Ok(())
}

/// After a stencil write, compare its index rows with its shapes and
/// repair on mismatch. Never fails the caller.
pub fn heal_stencil(conn: &Connection, path: &str) {
    match counts_for_stencil(conn, path) {
        Ok((indexed, shapes)) if indexed != shapes => {
            warn!(
                "Search index drift for {}: {} indexed, {} shapes - repairing",
                path, indexed, shapes
            );
            if let Err(e) = repair_stencil(conn, path) {
                warn!("Search index repair failed for {}: {}", path, e);
            }
        }
        Ok(_) => {}
        Err(e) => warn!("Search index check failed for {}: {}", path, e),
    }
}

/// Drop and repopulate the whole index from `shapes`.
pub fn rebuild(conn: &Connection) -> Result<u64> {
    let tx = conn
        .unchecked_transaction()
        .map_err(|e| StencilError::database(e.to_string()))?;

    tx.execute("DELETE FROM shapes_fts", [])
        .map_err(|e| StencilError::database(e.to_string()))?;
    let inserted = tx
        .execute(
            "INSERT INTO shapes_fts(rowid, name, stencil_path) SELECT id, name, stencil_path FROM shapes",
            [],
        )
        .map_err(|e| StencilError::database(e.to_string()))?;

    tx.commit()
        .map_err(|e| StencilError::database(e.to_string()))?;

    Ok(inserted as u64)
}

/// Check the whole index against `shapes`, rebuilding it on any drift.
pub fn verify(conn: &Connection) -> Result<IndexReport> {
    let shape_rows = count(conn, "SELECT COUNT(*) FROM shapes", None)?;
    let index_rows = count(conn, "SELECT COUNT(*) FROM shapes_fts", None)?;
    let orphans = count(
        conn,
        "SELECT COUNT(*) FROM shapes_fts WHERE rowid NOT IN (SELECT id FROM shapes)",
        None,
    )?;

    if shape_rows == index_rows && orphans == 0 {
        return Ok(IndexReport {
            shape_rows,
            index_rows,
            rebuilt: false,
        });
    }

    warn!(
        "Search index out of sync ({} shapes, {} indexed, {} orphaned) - rebuilding",
        shape_rows, index_rows, orphans
    );
    let index_rows = rebuild(conn)?;

    Ok(IndexReport {
        shape_rows,
        index_rows,
        rebuilt: true,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrate::{initialize_schema, SchemaOptions};

    fn seeded() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("PRAGMA foreign_keys = ON;").unwrap();
        initialize_schema(&conn, SchemaOptions::default()).unwrap();
        conn.execute_batch(
            r#"
            INSERT INTO stencils (path, name, extension, shape_count, last_scan, last_modified)
                VALUES ('/s/a.vssx', 'a', '.vssx', 2, '2024-01-01', '2024-01-01');
            INSERT INTO shapes (stencil_path, name) VALUES ('/s/a.vssx', 'Router'), ('/s/a.vssx', 'Switch');
            "#,
        )
        .unwrap();
        conn
    }

    #[test]
    fn test_triggers_keep_index_in_step() {
        let conn = seeded();
        assert_eq!(counts_for_stencil(&conn, "/s/a.vssx").unwrap(), (2, 2));

        conn.execute("UPDATE shapes SET name = 'Core Router' WHERE name = 'Router'", [])
            .unwrap();
        let hits: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM shapes_fts WHERE shapes_fts MATCH 'core'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(hits, 1);

        conn.execute("DELETE FROM stencils WHERE path = '/s/a.vssx'", [])
            .unwrap();
        assert_eq!(counts_for_stencil(&conn, "/s/a.vssx").unwrap(), (0, 0));
    }

    #[test]
    fn test_heal_repairs_drift() {
        let conn = seeded();
        conn.execute("DELETE FROM shapes_fts", []).unwrap();
        assert_eq!(counts_for_stencil(&conn, "/s/a.vssx").unwrap(), (0, 2));

        heal_stencil(&conn, "/s/a.vssx");
        assert_eq!(counts_for_stencil(&conn, "/s/a.vssx").unwrap(), (2, 2));
    }

    #[test]
    fn test_verify_rebuilds_orphans() {
        let conn = seeded();
        conn.execute(
            "INSERT INTO shapes_fts(rowid, name, stencil_path) VALUES (999, 'Ghost', '/s/a.vssx')",
            [],
        )
        .unwrap();
        conn.execute("DELETE FROM shapes_fts WHERE name = 'Router'", [])
            .unwrap();

        let report = verify(&conn).unwrap();
        assert!(report.rebuilt);
        assert_eq!(report.index_rows, 2);

        let again = verify(&conn).unwrap();
        assert!(!again.rebuilt);
    }
}
