//! Named searches.

use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::debug;

use stencil_core::time::now_iso;
use stencil_core::{Result, SavedSearch, SearchFilters, StencilError};

use crate::cache::decode_json;
use crate::sqlite::{db_err, is_constraint};
use crate::SqliteStore;

const SAVED_SEARCH_COLUMNS: &str = "id, name, search_term, filters, created_at";

fn row_to_saved_search(row: &Row<'_>) -> rusqlite::Result<SavedSearch> {
    Ok(SavedSearch {
        id: row.get(0)?,
        name: row.get(1)?,
        search_term: row.get(2)?,
        filters: decode_json::<SearchFilters>(row.get(3)?).unwrap_or_default(),
        created_at: row.get(4)?,
    })
}

fn find_by(conn: &Connection, column: &str, key: &dyn rusqlite::ToSql) -> Result<Option<SavedSearch>> {
    conn.query_row(
        &format!(
            "SELECT {} FROM saved_searches WHERE {} = ?1",
            SAVED_SEARCH_COLUMNS, column
        ),
        params![key],
        row_to_saved_search,
    )
    .optional()
    .map_err(db_err)
}

impl SqliteStore {
    /// Save a search. A name already in use is rejected with
    /// [`StencilError::SavedSearchExists`].
    pub fn add_saved_search(
        &self,
        name: &str,
        search_term: &str,
        filters: &SearchFilters,
    ) -> Result<SavedSearch> {
        let name = name.trim();
        if name.is_empty() {
            return Err(StencilError::invalid_argument("Saved search name is empty"));
        }
        let filters_json = serde_json::to_string(filters)?;

        self.with_conn(|conn| {
            let result = conn.execute(
                "INSERT INTO saved_searches (name, search_term, filters, created_at) VALUES (?1, ?2, ?3, ?4)",
                params![name, search_term, filters_json, now_iso()],
            );

            match result {
                Ok(_) => {}
                Err(e) if is_constraint(&e) => {
                    return Err(StencilError::SavedSearchExists {
                        name: name.to_string(),
                    })
                }
                Err(e) => return Err(db_err(e)),
            }

            debug!("Saved search {:?}", name);
            find_by(conn, "id", &conn.last_insert_rowid())?
                .ok_or_else(|| StencilError::internal("Saved search vanished after insert"))
        })
    }

    /// All saved searches by name.
    pub fn get_saved_searches(&self) -> Result<Vec<SavedSearch>> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {} FROM saved_searches ORDER BY name",
                    SAVED_SEARCH_COLUMNS
                ))
                .map_err(db_err)?;

            let searches = stmt
                .query_map([], row_to_saved_search)
                .map_err(db_err)?
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(db_err)?;

            Ok(searches)
        })
    }

    pub fn get_saved_search_by_name(&self, name: &str) -> Result<Option<SavedSearch>> {
        self.with_conn(|conn| find_by(conn, "name", &name.trim()))
    }

    pub fn delete_saved_search(&self, id: i64) -> Result<bool> {
        self.with_conn(|conn| {
            let deleted = conn
                .execute("DELETE FROM saved_searches WHERE id = ?1", params![id])
                .map_err(db_err)?;
            Ok(deleted > 0)
        })
    }
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::*;

    #[test]
    fn test_save_and_load_filters() {
        let store = SqliteStore::open_memory().unwrap();
        let filters = SearchFilters {
            date_start: NaiveDate::from_ymd_opt(2024, 1, 1),
            max_size: Some(1024 * 1024),
            min_shapes: Some(5),
            ..Default::default()
        };

        let saved = store.add_saved_search("Small recent", "router", &filters).unwrap();
        assert_eq!(saved.filters, filters);

        let loaded = store.get_saved_search_by_name("Small recent").unwrap().unwrap();
        assert_eq!(loaded.id, saved.id);
        assert_eq!(loaded.search_term, "router");
        assert_eq!(loaded.filters, filters);
    }

    #[test]
    fn test_duplicate_name_is_conflict() {
        let store = SqliteStore::open_memory().unwrap();
        store
            .add_saved_search("routers", "router", &SearchFilters::default())
            .unwrap();

        let err = store
            .add_saved_search("routers", "switch", &SearchFilters::default())
            .unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(store.get_saved_searches().unwrap().len(), 1);
    }

    #[test]
    fn test_list_and_delete() {
        let store = SqliteStore::open_memory().unwrap();
        let b = store.add_saved_search("b", "", &SearchFilters::default()).unwrap();
        store.add_saved_search("a", "", &SearchFilters::default()).unwrap();

        let names: Vec<_> = store
            .get_saved_searches()
            .unwrap()
            .into_iter()
            .map(|s| s.name)
            .collect();
        assert_eq!(names, vec!["a", "b"]);

        assert!(store.delete_saved_search(b.id).unwrap());
        assert!(!store.delete_saved_search(b.id).unwrap());
        assert!(store.get_saved_search_by_name("b").unwrap().is_none());
    }

    #[test]
    fn test_blank_name_rejected() {
        let store = SqliteStore::open_memory().unwrap();
        assert!(matches!(
            store.add_saved_search("  ", "x", &SearchFilters::default()),
            Err(StencilError::InvalidArgument { .. })
        ));
    }

    #[test]
    fn test_unreadable_filters_default() {
        let store = SqliteStore::open_memory().unwrap();
        store
            .with_conn(|conn| {
                conn.execute(
                    "INSERT INTO saved_searches (name, search_term, filters, created_at) VALUES ('old', 'x', 'not json', '2024-01-01')",
                    [],
                )
                .map_err(db_err)
            })
            .unwrap();

        let loaded = store.get_saved_search_by_name("old").unwrap().unwrap();
        assert!(loaded.filters.is_unrestricted());
    }
}
