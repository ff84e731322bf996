//! Favorite stencils and shapes.

use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::debug;

use stencil_core::time::now_iso;
use stencil_core::{Favorite, FavoriteItem, FavoriteKind, Result, StencilError};

use crate::sqlite::db_err;
use crate::SqliteStore;

const FAVORITE_COLUMNS: &str = "f.id, f.item_type, f.stencil_path, f.shape_id, f.added_at";

fn row_to_favorite(row: &Row<'_>) -> rusqlite::Result<Favorite> {
    let kind: String = row.get(1)?;
    Ok(Favorite {
        id: row.get(0)?,
        kind: FavoriteKind::parse(&kind).unwrap_or(FavoriteKind::Stencil),
        stencil_path: row.get(2)?,
        shape_id: row.get(3)?,
        added_at: row.get(4)?,
    })
}

fn find_favorite(conn: &Connection, kind: FavoriteKind, key: &dyn rusqlite::ToSql) -> Result<Option<Favorite>> {
    let column = match kind {
        FavoriteKind::Stencil => "stencil_path",
        FavoriteKind::Shape => "shape_id",
    };
    conn.query_row(
        &format!(
            "SELECT {} FROM favorites f WHERE f.item_type = ?1 AND f.{} = ?2",
            FAVORITE_COLUMNS, column
        ),
        params![kind.as_str(), key],
        row_to_favorite,
    )
    .optional()
    .map_err(db_err)
}

/// Insert unless present, then return whichever row exists.
fn insert_favorite(
    conn: &Connection,
    kind: FavoriteKind,
    stencil_path: &str,
    shape_id: Option<i64>,
) -> Result<Favorite> {
    let inserted = conn
        .execute(
            "INSERT OR IGNORE INTO favorites (item_type, stencil_path, shape_id, added_at) VALUES (?1, ?2, ?3, ?4)",
            params![kind.as_str(), stencil_path, shape_id, now_iso()],
        )
        .map_err(db_err)?;

    let existing = match shape_id {
        Some(id) => find_favorite(conn, kind, &id)?,
        None => find_favorite(conn, kind, &stencil_path)?,
    };

    if inserted == 0 {
        debug!("{} already a favorite: {}", kind, stencil_path);
    }
    existing.ok_or_else(|| StencilError::internal("Favorite vanished after insert"))
}

impl SqliteStore {
    /// Favorite a stencil. Favoriting it again returns the existing row.
    pub fn add_favorite_stencil(&self, stencil_path: &str) -> Result<Favorite> {
        self.with_conn(|conn| {
            let exists = conn
                .query_row(
                    "SELECT 1 FROM stencils WHERE path = ?1",
                    params![stencil_path],
                    |_| Ok(()),
                )
                .optional()
                .map_err(db_err)?
                .is_some();
            if !exists {
                return Err(StencilError::StencilNotFound {
                    path: stencil_path.to_string(),
                });
            }

            insert_favorite(conn, FavoriteKind::Stencil, stencil_path, None)
        })
    }

    /// Favorite a shape. Favoriting it again returns the existing row.
    pub fn add_favorite_shape(&self, shape_id: i64) -> Result<Favorite> {
        self.with_conn(|conn| {
            let stencil_path: String = conn
                .query_row(
                    "SELECT stencil_path FROM shapes WHERE id = ?1",
                    params![shape_id],
                    |row| row.get(0),
                )
                .optional()
                .map_err(db_err)?
                .ok_or(StencilError::ShapeNotFound { id: shape_id })?;

            insert_favorite(conn, FavoriteKind::Shape, &stencil_path, Some(shape_id))
        })
    }

    pub fn get_favorite(&self, id: i64) -> Result<Option<Favorite>> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {} FROM favorites f WHERE f.id = ?1", FAVORITE_COLUMNS),
                params![id],
                row_to_favorite,
            )
            .optional()
            .map_err(db_err)
        })
    }

    /// All favorites with stencil and shape names, newest first.
    pub fn get_favorites(&self) -> Result<Vec<FavoriteItem>> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare(&format!(
                    r#"
                    SELECT {}, st.name, sh.name
                    FROM favorites f
                    JOIN stencils st ON st.path = f.stencil_path
                    LEFT JOIN shapes sh ON sh.id = f.shape_id AND f.item_type = 'shape'
                    ORDER BY f.added_at DESC, f.id DESC
                    "#,
                    FAVORITE_COLUMNS
                ))
                .map_err(db_err)?;

            let items = stmt
                .query_map([], |row| {
                    Ok(FavoriteItem {
                        favorite: row_to_favorite(row)?,
                        stencil_name: row.get(5)?,
                        shape_name: row.get(6)?,
                    })
                })
                .map_err(db_err)?
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(db_err)?;

            Ok(items)
        })
    }

    pub fn remove_favorite(&self, id: i64) -> Result<bool> {
        self.with_conn(|conn| {
            let deleted = conn
                .execute("DELETE FROM favorites WHERE id = ?1", params![id])
                .map_err(db_err)?;
            Ok(deleted > 0)
        })
    }

    pub fn remove_favorite_stencil(&self, stencil_path: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let deleted = conn
                .execute(
                    "DELETE FROM favorites WHERE item_type = 'stencil' AND stencil_path = ?1",
                    params![stencil_path],
                )
                .map_err(db_err)?;
            Ok(deleted > 0)
        })
    }

    pub fn remove_favorite_shape(&self, shape_id: i64) -> Result<bool> {
        self.with_conn(|conn| {
            let deleted = conn
                .execute(
                    "DELETE FROM favorites WHERE item_type = 'shape' AND shape_id = ?1",
                    params![shape_id],
                )
                .map_err(db_err)?;
            Ok(deleted > 0)
        })
    }

    /// Whether the stencil itself is favorited; shape favorites don't count.
    pub fn is_favorite_stencil(&self, stencil_path: &str) -> Result<bool> {
        self.with_conn(|conn| {
            Ok(find_favorite(conn, FavoriteKind::Stencil, &stencil_path)?.is_some())
        })
    }

    /// Whether the shape itself is favorited; a favorited stencil doesn't count.
    pub fn is_favorite_shape(&self, shape_id: i64) -> Result<bool> {
        self.with_conn(|conn| Ok(find_favorite(conn, FavoriteKind::Shape, &shape_id)?.is_some()))
    }
}
