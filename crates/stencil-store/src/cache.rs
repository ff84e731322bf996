//! Stencil write path, staleness check and lookups.

use std::fs;

use chrono::Duration;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use stencil_core::time::{now_iso, parse_iso, to_iso, to_naive};
use stencil_core::{
    CachedStencil, Result, Shape, ShapeEntry, ShapeRecord, Stencil, StencilError, StencilRecord,
};

use crate::index;
use crate::sqlite::db_err;

const STENCIL_COLUMNS: &str =
    "path, name, extension, shape_count, file_size, last_scan, last_modified";

const SHAPE_COLUMNS: &str = "id, stencil_path, name, width, height, geometry, properties";

/// Modification times within this window count as unchanged.
const MTIME_TOLERANCE_SECS: i64 = 1;

/// Replace everything cached for one stencil in a single transaction.
///
/// Size and modification time come from the file on disk. After commit the
/// stencil's index rows are compared with its shapes and repaired on drift.
pub(crate) fn write_stencil(conn: &Connection, record: &StencilRecord, full_text: bool) -> Result<()> {
    let path = record.path.as_str();
    let metadata = fs::metadata(path)
        .map_err(|e| StencilError::cache_write(path, format!("Cannot read file metadata: {}", e)))?;
    let modified = metadata
        .modified()
        .map_err(|e| StencilError::cache_write(path, format!("Cannot read modification time: {}", e)))?;

    let shapes: Vec<ShapeRecord> = record
        .shapes
        .iter()
        .cloned()
        .map(ShapeEntry::into_record)
        .collect();

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| StencilError::cache_write(path, e.to_string()))?;

    replace_rows(&tx, record, &shapes, metadata.len(), &to_iso(modified))
        .map_err(|e| StencilError::cache_write(path, e.to_string()))?;

    tx.commit()
        .map_err(|e| StencilError::cache_write(path, e.to_string()))?;

    debug!("Cached {} ({} shapes)", path, shapes.len());

    if full_text {
        index::heal_stencil(conn, path);
    }
    Ok(())
}

fn replace_rows(
    conn: &Connection,
    record: &StencilRecord,
    shapes: &[ShapeRecord],
    file_size: u64,
    last_modified: &str,
) -> Result<()> {
    conn.execute(
        r#"
        INSERT INTO stencils (path, name, extension, shape_count, file_size, last_scan, last_modified)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
        ON CONFLICT(path) DO UPDATE SET
            name = excluded.name,
            extension = excluded.extension,
            shape_count = excluded.shape_count,
            file_size = excluded.file_size,
            last_scan = excluded.last_scan,
            last_modified = excluded.last_modified
        "#,
        params![
            record.path,
            record.name,
            record.extension,
            shapes.len() as i64,
            file_size as i64,
            now_iso(),
            last_modified,
        ],
    )
    .map_err(db_err)?;

    conn.execute("DELETE FROM shapes WHERE stencil_path = ?1", params![record.path])
        .map_err(db_err)?;

    let mut stmt = conn
        .prepare(
            r#"
            INSERT INTO shapes (stencil_path, name, width, height, geometry, properties)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
        )
        .map_err(db_err)?;

    for shape in shapes {
        let geometry = shape.geometry.as_ref().map(serde_json::to_string).transpose()?;
        let properties = shape
            .properties
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        stmt.execute(params![
            record.path,
            shape.name,
            shape.width,
            shape.height,
            geometry,
            properties,
        ])
        .map_err(db_err)?;
    }

    Ok(())
}

/// True when the file is uncached, gone from disk, or modified more than a
/// second after the cached timestamp.
pub(crate) fn needs_update(conn: &Connection, path: &str) -> Result<bool> {
    let cached: Option<String> = conn
        .query_row(
            "SELECT last_modified FROM stencils WHERE path = ?1",
            params![path],
            |row| row.get(0),
        )
        .optional()
        .map_err(db_err)?;

    let Some(cached) = cached else {
        return Ok(true);
    };

    let modified = match fs::metadata(path).and_then(|m| m.modified()) {
        Ok(modified) => to_naive(modified),
        Err(_) => return Ok(true),
    };

    match parse_iso(&cached) {
        Some(cached) => Ok(modified > cached + Duration::seconds(MTIME_TOLERANCE_SECS)),
        None => {
            warn!("Unparseable last_modified {:?} for {}", cached, path);
            Ok(true)
        }
    }
}

pub(crate) fn list_stencils(conn: &Connection) -> Result<Vec<Stencil>> {
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {} FROM stencils ORDER BY name, path",
            STENCIL_COLUMNS
        ))
        .map_err(db_err)?;

    let stencils = stmt
        .query_map([], row_to_stencil)
        .map_err(db_err)?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(db_err)?;

    Ok(stencils)
}

pub(crate) fn load_stencil(conn: &Connection, path: &str) -> Result<Option<CachedStencil>> {
    let stencil = conn
        .query_row(
            &format!("SELECT {} FROM stencils WHERE path = ?1", STENCIL_COLUMNS),
            params![path],
            row_to_stencil,
        )
        .optional()
        .map_err(db_err)?;

    let Some(stencil) = stencil else {
        return Ok(None);
    };

    let mut stmt = conn
        .prepare(&format!(
            "SELECT {} FROM shapes WHERE stencil_path = ?1 ORDER BY id",
            SHAPE_COLUMNS
        ))
        .map_err(db_err)?;

    let shapes = stmt
        .query_map(params![path], row_to_shape)
        .map_err(db_err)?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(db_err)?;

    Ok(Some(CachedStencil { stencil, shapes }))
}

pub(crate) fn load_shape(conn: &Connection, id: i64) -> Result<Option<Shape>> {
    conn.query_row(
        &format!("SELECT {} FROM shapes WHERE id = ?1", SHAPE_COLUMNS),
        params![id],
        row_to_shape,
    )
    .optional()
    .map_err(db_err)
}

/// Remove one stencil and everything hanging off it.
pub(crate) fn delete_stencil(conn: &Connection, path: &str) -> Result<bool> {
    let deleted = conn
        .execute("DELETE FROM stencils WHERE path = ?1", params![path])
        .map_err(db_err)?;

    if deleted > 0 {
        debug!("Evicted stencil {}", path);
    }
    Ok(deleted > 0)
}

pub(crate) fn row_to_stencil(row: &Row<'_>) -> rusqlite::Result<Stencil> {
    Ok(Stencil {
        path: row.get(0)?,
        name: row.get(1)?,
        extension: row.get(2)?,
        shape_count: row.get::<_, i64>(3)? as u32,
        file_size: row.get::<_, Option<i64>>(4)?.map(|n| n as u64),
        last_scan: row.get(5)?,
        last_modified: row.get(6)?,
    })
}

fn row_to_shape(row: &Row<'_>) -> rusqlite::Result<Shape> {
    Ok(Shape {
        id: row.get(0)?,
        stencil_path: row.get(1)?,
        name: row.get(2)?,
        width: row.get::<_, Option<f64>>(3)?.unwrap_or(0.0),
        height: row.get::<_, Option<f64>>(4)?.unwrap_or(0.0),
        geometry: decode_json(row.get(5)?),
        properties: decode_json(row.get(6)?),
    })
}

/// Parse a stored JSON column; unreadable values are treated as absent.
pub(crate) fn decode_json<T: DeserializeOwned>(raw: Option<String>) -> Option<T> {
    let raw = raw?;
    if raw.trim().is_empty() {
        return None;
    }
    match serde_json::from_str(&raw) {
        Ok(value) => Some(value),
        Err(e) => {
            debug!("Ignoring malformed JSON column: {}", e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::fs::File;
    use std::time::{Duration as StdDuration, SystemTime};

    use stencil_core::{PathCommand, StencilStore};

    use crate::test_support::{seed, stencil_file};
    use crate::SqliteStore;

    use super::*;

    #[test]
    fn test_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open_memory().unwrap();
        let file = stencil_file(dir.path(), "Network Shapes.vssx", 1234);

        let mut props = BTreeMap::new();
        props.insert("Manufacturer".to_string(), "Cisco".to_string());
        let router = ShapeRecord {
            name: "Router".to_string(),
            width: 1.25,
            height: 0.75,
            geometry: Some(vec![
                PathCommand::MoveTo { x: 0.0, y: 0.0 },
                PathCommand::LineTo { x: 1.25, y: 0.0 },
                PathCommand::Close,
            ]),
            properties: Some(props.clone()),
        };
        let record = StencilRecord::from_path(
            &file,
            vec![router.into(), "Switch".into(), "Firewall".into()],
        );
        store.cache_stencil(&record).unwrap();

        let cached = store.get_stencil_by_path(&record.path).unwrap().unwrap();
        assert_eq!(cached.stencil.name, "Network Shapes");
        assert_eq!(cached.stencil.extension, ".vssx");
        assert_eq!(cached.stencil.shape_count, 3);
        assert_eq!(cached.stencil.file_size, Some(1234));

        let mut names: Vec<_> = cached.shapes.iter().map(|s| s.name.as_str()).collect();
        names.sort();
        assert_eq!(names, vec!["Firewall", "Router", "Switch"]);

        let router = cached.shapes.iter().find(|s| s.name == "Router").unwrap();
        assert_eq!(router.width, 1.25);
        assert_eq!(router.geometry.as_ref().map(Vec::len), Some(3));
        assert_eq!(router.properties.as_ref(), Some(&props));

        let by_id = store.get_shape_by_id(router.id).unwrap().unwrap();
        assert_eq!(&by_id, router);
    }

    #[test]
    fn test_rewrite_replaces_shapes() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open_memory().unwrap();
        let path = seed(&store, dir.path(), "Basic", &["Box", "Circle", "Star"]);

        let record = StencilRecord {
            path: path.clone(),
            name: "Basic".to_string(),
            extension: ".vssx".to_string(),
            shapes: vec!["Triangle".into()],
        };
        store.cache_stencil(&record).unwrap();

        let cached = store.get_stencil_by_path(&path).unwrap().unwrap();
        assert_eq!(cached.stencil.shape_count, 1);
        assert_eq!(cached.shapes[0].name, "Triangle");
        assert_eq!(store.index_counts_for_stencil(&path).unwrap(), (1, 1));
    }

    #[test]
    fn test_missing_file_is_write_error() {
        let store = SqliteStore::open_memory().unwrap();
        let record = StencilRecord::from_path(
            std::path::Path::new("/definitely/not/here.vssx"),
            vec!["Router".into()],
        );

        let err = store.cache_stencil(&record).unwrap_err();
        assert!(matches!(err, StencilError::CacheWrite { ref path, .. } if path.ends_with("here.vssx")));
        assert!(store.get_cached_stencils().unwrap().is_empty());
    }

    #[test]
    fn test_failed_write_rolls_back() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open_memory().unwrap();
        let path = seed(&store, dir.path(), "Basic", &["Box", "Circle"]);

        store
            .with_conn(|conn| {
                conn.execute_batch(
                    r#"
                    CREATE TRIGGER reject_bad BEFORE INSERT ON shapes
                    WHEN NEW.name = 'Bad'
                    BEGIN SELECT RAISE(ABORT, 'rejected'); END;
                    "#,
                )
                .map_err(db_err)
            })
            .unwrap();

        let record = StencilRecord {
            path: path.clone(),
            name: "Renamed".to_string(),
            extension: ".vssx".to_string(),
            shapes: vec!["Good".into(), "Bad".into()],
        };
        assert!(store.cache_stencil(&record).is_err());

        let cached = store.get_stencil_by_path(&path).unwrap().unwrap();
        assert_eq!(cached.stencil.name, "Basic");
        assert_eq!(cached.shapes.len(), 2);
        assert_eq!(store.index_counts_for_stencil(&path).unwrap(), (2, 2));
    }

    #[test]
    fn test_needs_update() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open_memory().unwrap();
        let file = stencil_file(dir.path(), "Basic.vssx", 64);
        let path = file.to_string_lossy().into_owned();

        assert!(store.needs_update(&path).unwrap());

        let record = StencilRecord::from_path(&file, vec!["Box".into()]);
        store.cache_stencil(&record).unwrap();
        assert!(!store.needs_update(&path).unwrap());

        let later = SystemTime::now() + StdDuration::from_secs(5);
        File::options()
            .write(true)
            .open(&file)
            .unwrap()
            .set_modified(later)
            .unwrap();
        assert!(store.needs_update(&path).unwrap());

        store.cache_stencil(&record).unwrap();
        assert!(!store.needs_update(&path).unwrap());

        std::fs::remove_file(&file).unwrap();
        assert!(store.needs_update(&path).unwrap());
    }

    #[test]
    fn test_delete_stencil() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open_memory().unwrap();
        let path = seed(&store, dir.path(), "Basic", &["Box"]);

        assert!(store.delete_stencil(&path).unwrap());
        assert!(!store.delete_stencil(&path).unwrap());
        assert!(store.get_stencil_by_path(&path).unwrap().is_none());
        assert_eq!(store.index_counts_for_stencil(&path).unwrap(), (0, 0));
    }

    #[test]
    fn test_decode_json_tolerates_garbage() {
        assert_eq!(decode_json::<Vec<i32>>(Some("[1,2]".into())), Some(vec![1, 2]));
        assert_eq!(decode_json::<Vec<i32>>(Some("{oops".into())), None);
        assert_eq!(decode_json::<Vec<i32>>(Some("".into())), None);
        assert_eq!(decode_json::<Vec<i32>>(None), None);
    }
}
