//! User-defined shape collections.

use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::{debug, warn};

use stencil_core::time::now_iso;
use stencil_core::{CollectionDetail, Result, ShapeCollection, StencilError};

use crate::search::{row_to_search_row, ROW_COLUMNS};
use crate::sqlite::db_err;
use crate::SqliteStore;

const COLLECTION_SELECT: &str = r#"
    SELECT c.id, c.name, COUNT(cs.shape_id), c.created_at, c.updated_at
    FROM collections c
    LEFT JOIN collection_shapes cs ON cs.collection_id = c.id
"#;

fn row_to_collection(row: &Row<'_>) -> rusqlite::Result<ShapeCollection> {
    Ok(ShapeCollection {
        id: row.get(0)?,
        name: row.get(1)?,
        shape_count: row.get::<_, i64>(2)? as u32,
        created_at: row.get(3)?,
        updated_at: row.get(4)?,
    })
}

fn load_collection(conn: &Connection, id: i64) -> Result<Option<ShapeCollection>> {
    conn.query_row(
        &format!("{} WHERE c.id = ?1 GROUP BY c.id", COLLECTION_SELECT),
        params![id],
        row_to_collection,
    )
    .optional()
    .map_err(db_err)
}

fn require_collection(conn: &Connection, id: i64) -> Result<()> {
    let exists = conn
        .query_row("SELECT 1 FROM collections WHERE id = ?1", params![id], |_| Ok(()))
        .optional()
        .map_err(db_err)?
        .is_some();

    if exists {
        Ok(())
    } else {
        Err(StencilError::CollectionNotFound { id })
    }
}

fn touch(conn: &Connection, id: i64) -> Result<()> {
    conn.execute(
        "UPDATE collections SET updated_at = ?1 WHERE id = ?2",
        params![now_iso(), id],
    )
    .map_err(db_err)?;
    Ok(())
}

fn valid_name(name: &str) -> Result<&str> {
    let name = name.trim();
    if name.is_empty() {
        Err(StencilError::invalid_argument("Collection name is empty"))
    } else {
        Ok(name)
    }
}

fn insert_collection(conn: &Connection, name: &str) -> Result<i64> {
    let now = now_iso();
    conn.execute(
        "INSERT INTO collections (name, created_at, updated_at) VALUES (?1, ?2, ?2)",
        params![name, now],
    )
    .map_err(db_err)?;

    let id = conn.last_insert_rowid();
    debug!("Created collection {} ({:?})", id, name);
    Ok(id)
}

/// Insert memberships, skipping unknown shapes and existing members.
fn insert_members(conn: &Connection, id: i64, shape_ids: &[i64]) -> Result<u32> {
    let mut exists = conn
        .prepare("SELECT 1 FROM shapes WHERE id = ?1")
        .map_err(db_err)?;
    let mut insert = conn
        .prepare(
            "INSERT OR IGNORE INTO collection_shapes (collection_id, shape_id, added_at) VALUES (?1, ?2, ?3)",
        )
        .map_err(db_err)?;

    let mut added = 0;
    for &shape_id in shape_ids {
        if !exists.exists(params![shape_id]).map_err(db_err)? {
            warn!("Skipping unknown shape {} for collection {}", shape_id, id);
            continue;
        }
        added += insert
            .execute(params![id, shape_id, now_iso()])
            .map_err(db_err)? as u32;
    }
    Ok(added)
}

fn load_detail(conn: &Connection, id: i64) -> Result<Option<CollectionDetail>> {
    let Some(collection) = load_collection(conn, id)? else {
        return Ok(None);
    };

    let mut stmt = conn
        .prepare(&format!(
            r#"
            SELECT {}, NULL
            FROM collection_shapes cs
            JOIN shapes sh ON sh.id = cs.shape_id
            JOIN stencils st ON st.path = sh.stencil_path
            WHERE cs.collection_id = ?1
            ORDER BY cs.added_at, sh.id
            "#,
            ROW_COLUMNS
        ))
        .map_err(db_err)?;

    let shapes = stmt
        .query_map(params![id], row_to_search_row)
        .map_err(db_err)?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(db_err)?;

    Ok(Some(CollectionDetail { collection, shapes }))
}

impl SqliteStore {
    pub fn create_collection(&self, name: &str) -> Result<ShapeCollection> {
        let name = valid_name(name)?;

        self.with_conn(|conn| {
            let id = insert_collection(conn, name)?;
            load_collection(conn, id)?
                .ok_or_else(|| StencilError::internal("Collection vanished after insert"))
        })
    }

    /// Create a collection already holding `shape_ids`, in one transaction.
    /// Unknown shape ids are skipped.
    pub fn create_collection_with_shapes(
        &self,
        name: &str,
        shape_ids: &[i64],
    ) -> Result<CollectionDetail> {
        let name = valid_name(name)?;

        self.with_conn(|conn| {
            let tx = conn.unchecked_transaction().map_err(db_err)?;
            let id = insert_collection(&tx, name)?;
            insert_members(&tx, id, shape_ids)?;
            let detail = load_detail(&tx, id)?
                .ok_or_else(|| StencilError::internal("Collection vanished after insert"))?;
            tx.commit().map_err(db_err)?;
            Ok(detail)
        })
    }

    /// All collections with their member counts, by name.
    pub fn list_collections(&self) -> Result<Vec<ShapeCollection>> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare(&format!("{} GROUP BY c.id ORDER BY c.name, c.id", COLLECTION_SELECT))
                .map_err(db_err)?;

            let collections = stmt
                .query_map([], row_to_collection)
                .map_err(db_err)?
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(db_err)?;

            Ok(collections)
        })
    }

    /// A collection with its shapes in the order they were added.
    pub fn get_collection(&self, id: i64) -> Result<Option<CollectionDetail>> {
        self.with_conn(|conn| load_detail(conn, id))
    }

    pub fn rename_collection(&self, id: i64, name: &str) -> Result<ShapeCollection> {
        let name = valid_name(name)?;

        self.with_conn(|conn| {
            let updated = conn
                .execute(
                    "UPDATE collections SET name = ?1, updated_at = ?2 WHERE id = ?3",
                    params![name, now_iso(), id],
                )
                .map_err(db_err)?;
            if updated == 0 {
                return Err(StencilError::CollectionNotFound { id });
            }

            load_collection(conn, id)?.ok_or(StencilError::CollectionNotFound { id })
        })
    }

    /// Delete a collection; its shapes are untouched.
    pub fn delete_collection(&self, id: i64) -> Result<bool> {
        self.with_conn(|conn| {
            let deleted = conn
                .execute("DELETE FROM collections WHERE id = ?1", params![id])
                .map_err(db_err)?;
            Ok(deleted > 0)
        })
    }

    /// Add shapes to a collection. Unknown shape ids and shapes already in
    /// the collection are skipped. Returns how many were added.
    pub fn add_shapes_to_collection(&self, id: i64, shape_ids: &[i64]) -> Result<u32> {
        self.with_conn(|conn| {
            require_collection(conn, id)?;

            let tx = conn.unchecked_transaction().map_err(db_err)?;
            let added = insert_members(&tx, id, shape_ids)?;
            touch(&tx, id)?;
            tx.commit().map_err(db_err)?;
            Ok(added)
        })
    }

    /// Remove shapes from a collection. Returns how many were removed.
    pub fn remove_shapes_from_collection(&self, id: i64, shape_ids: &[i64]) -> Result<u32> {
        self.with_conn(|conn| {
            require_collection(conn, id)?;

            let tx = conn.unchecked_transaction().map_err(db_err)?;
            let mut removed = 0;
            {
                let mut delete = tx
                    .prepare("DELETE FROM collection_shapes WHERE collection_id = ?1 AND shape_id = ?2")
                    .map_err(db_err)?;
                for &shape_id in shape_ids {
                    removed += delete.execute(params![id, shape_id]).map_err(db_err)? as u32;
                }
            }

            touch(&tx, id)?;
            tx.commit().map_err(db_err)?;
            Ok(removed)
        })
    }
}

#[cfg(test)]
mod tests {
    use crate::test_support::{seed, shape_id};

    use super::*;

    #[test]
    fn test_collection_crud() {
        let store = SqliteStore::open_memory().unwrap();

        let created = store.create_collection("  Core network ").unwrap();
        assert_eq!(created.name, "Core network");
        assert_eq!(created.shape_count, 0);

        let renamed = store.rename_collection(created.id, "Edge").unwrap();
        assert_eq!(renamed.name, "Edge");
        assert!(renamed.updated_at >= created.updated_at);

        assert_eq!(store.list_collections().unwrap().len(), 1);
        assert!(store.delete_collection(created.id).unwrap());
        assert!(store.get_collection(created.id).unwrap().is_none());
        assert!(!store.delete_collection(created.id).unwrap());
    }

    #[test]
    fn test_membership_skips_unknown_shapes() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open_memory().unwrap();
        let path = seed(&store, dir.path(), "Network", &["Router", "Switch"]);
        let router = shape_id(&store, &path, "Router");
        let switch = shape_id(&store, &path, "Switch");

        let collection = store.create_collection("Core").unwrap();
        let added = store
            .add_shapes_to_collection(collection.id, &[router, 9999, switch, router])
            .unwrap();
        assert_eq!(added, 2);

        let detail = store.get_collection(collection.id).unwrap().unwrap();
        assert_eq!(detail.collection.shape_count, 2);
        let names: Vec<_> = detail.shapes.iter().map(|s| s.shape_name.as_str()).collect();
        assert_eq!(names, vec!["Router", "Switch"]);
        assert_eq!(detail.shapes[0].stencil_name, "Network");

        assert_eq!(
            store
                .remove_shapes_from_collection(collection.id, &[router, 9999])
                .unwrap(),
            1
        );
        assert_eq!(store.list_collections().unwrap()[0].shape_count, 1);
    }

    #[test]
    fn test_create_with_shapes() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open_memory().unwrap();
        let path = seed(&store, dir.path(), "Network", &["Router", "Switch"]);
        let router = shape_id(&store, &path, "Router");

        let detail = store
            .create_collection_with_shapes(" Core ", &[router, 4242])
            .unwrap();
        assert_eq!(detail.collection.name, "Core");
        assert_eq!(detail.collection.shape_count, 1);
        assert_eq!(detail.shapes[0].shape_name, "Router");
    }

    #[test]
    fn test_create_with_shapes_is_all_or_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open_memory().unwrap();
        let path = seed(&store, dir.path(), "Network", &["Router"]);
        let router = shape_id(&store, &path, "Router");

        store
            .with_conn(|conn| {
                conn.execute_batch("DROP TABLE collection_shapes;")
                    .map_err(db_err)
            })
            .unwrap();

        assert!(store.create_collection_with_shapes("Core", &[router]).is_err());
        let count: i64 = store
            .with_conn(|conn| {
                conn.query_row("SELECT COUNT(*) FROM collections", [], |row| row.get(0))
                    .map_err(db_err)
            })
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn test_unknown_collection() {
        let store = SqliteStore::open_memory().unwrap();
        assert!(matches!(
            store.add_shapes_to_collection(7, &[1]),
            Err(StencilError::CollectionNotFound { id: 7 })
        ));
        assert!(matches!(
            store.rename_collection(7, "x"),
            Err(StencilError::CollectionNotFound { id: 7 })
        ));
        assert!(matches!(
            store.create_collection(" "),
            Err(StencilError::InvalidArgument { .. })
        ));
    }
}
