//! Store-open integrity check.

use rusqlite::{Connection, ErrorCode};

/// Result of `PRAGMA integrity_check`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Integrity {
    Ok,
    Corrupt(String),
}

impl Integrity {
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok)
    }
}

/// SQLITE_CORRUPT or SQLITE_NOTADB. Busy, locked and can't-open errors are
/// not damage and must never trigger recovery.
pub fn is_corruption(e: &rusqlite::Error) -> bool {
    matches!(
        e.sqlite_error_code(),
        Some(ErrorCode::DatabaseCorrupt | ErrorCode::NotADatabase)
    )
}

/// Run SQLite's built-in consistency check.
///
/// A check that fails with a corruption code counts as `Corrupt`; any other
/// error (the file is locked, say) is returned to the caller.
pub fn check(conn: &Connection) -> rusqlite::Result<Integrity> {
    let lines = conn
        .prepare("PRAGMA integrity_check")
        .and_then(|mut stmt| {
            let lines = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<rusqlite::Result<Vec<_>>>();
            lines
        });

    match lines {
        Ok(lines) if lines.len() == 1 && lines[0] == "ok" => Ok(Integrity::Ok),
        Ok(lines) if lines.is_empty() => {
            Ok(Integrity::Corrupt("integrity check returned nothing".into()))
        }
        Ok(lines) => Ok(Integrity::Corrupt(lines.join("; "))),
        Err(e) if is_corruption(&e) => Ok(Integrity::Corrupt(e.to_string())),
        Err(e) => Err(e),
    }
}
