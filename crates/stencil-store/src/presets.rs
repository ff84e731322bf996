//! Preset scan directories. At most one is active at a time.

use rusqlite::{params, OptionalExtension, Row};
use tracing::{debug, info};

use stencil_core::time::now_iso;
use stencil_core::{PresetDirectory, Result};

use crate::sqlite::{db_err, is_constraint};
use crate::SqliteStore;

const PRESET_COLUMNS: &str = "id, path, name, is_active, created_at";

fn row_to_preset(row: &Row<'_>) -> rusqlite::Result<PresetDirectory> {
    Ok(PresetDirectory {
        id: row.get(0)?,
        path: row.get(1)?,
        name: row.get(2)?,
        is_active: row.get::<_, i64>(3)? != 0,
        created_at: row.get(4)?,
    })
}

/// Final path component, or the whole path when there is none.
fn default_name(path: &str) -> String {
    path.split(['/', '\\'])
        .filter(|segment| !segment.is_empty())
        .last()
        .map(String::from)
        .unwrap_or_else(|| path.to_string())
}

impl SqliteStore {
    /// Add a directory. Returns `None` when the path is already a preset.
    pub fn add_preset_directory(
        &self,
        path: &str,
        name: Option<&str>,
    ) -> Result<Option<PresetDirectory>> {
        let name = name
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .map(String::from)
            .unwrap_or_else(|| default_name(path));

        self.with_conn(|conn| {
            let result = conn.execute(
                "INSERT INTO preset_directories (path, name, is_active, created_at) VALUES (?1, ?2, 0, ?3)",
                params![path, name, now_iso()],
            );

            match result {
                Ok(_) => {}
                Err(e) if is_constraint(&e) => {
                    debug!("Directory already in presets: {}", path);
                    return Ok(None);
                }
                Err(e) => return Err(db_err(e)),
            }

            let id = conn.last_insert_rowid();
            conn.query_row(
                &format!("SELECT {} FROM preset_directories WHERE id = ?1", PRESET_COLUMNS),
                params![id],
                row_to_preset,
            )
            .optional()
            .map_err(db_err)
        })
    }

    /// All presets, newest first.
    pub fn get_preset_directories(&self) -> Result<Vec<PresetDirectory>> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {} FROM preset_directories ORDER BY created_at DESC, id DESC",
                    PRESET_COLUMNS
                ))
                .map_err(db_err)?;

            let presets = stmt
                .query_map([], row_to_preset)
                .map_err(db_err)?
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(db_err)?;

            Ok(presets)
        })
    }

    /// The active preset; having none is normal.
    pub fn get_active_directory(&self) -> Result<Option<PresetDirectory>> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!(
                    "SELECT {} FROM preset_directories WHERE is_active = 1 LIMIT 1",
                    PRESET_COLUMNS
                ),
                [],
                row_to_preset,
            )
            .optional()
            .map_err(db_err)
        })
    }

    /// Make one preset active and every other inactive. Returns `false`,
    /// changing nothing, when the id is unknown.
    pub fn set_active_directory(&self, id: i64) -> Result<bool> {
        self.with_conn(|conn| {
            let tx = conn.unchecked_transaction().map_err(db_err)?;

            tx.execute("UPDATE preset_directories SET is_active = 0", [])
                .map_err(db_err)?;
            let updated = tx
                .execute(
                    "UPDATE preset_directories SET is_active = 1 WHERE id = ?1",
                    params![id],
                )
                .map_err(db_err)?;

            if updated == 0 {
                return Ok(false);
            }

            tx.commit().map_err(db_err)?;
            info!("Active directory set to preset {}", id);
            Ok(true)
        })
    }

    /// Remove a preset. Removing the active one leaves none active.
    pub fn remove_preset_directory(&self, id: i64) -> Result<bool> {
        self.with_conn(|conn| {
            let deleted = conn
                .execute("DELETE FROM preset_directories WHERE id = ?1", params![id])
                .map_err(db_err)?;
            Ok(deleted > 0)
        })
    }
}
