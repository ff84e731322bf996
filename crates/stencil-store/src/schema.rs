//! Database schema definitions.

/// Base tables and indexes. Every statement is safe to repeat.
pub const SCHEMA: &str = r#"
-- Stencil files, keyed by path
CREATE TABLE IF NOT EXISTS stencils (
    path TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    extension TEXT NOT NULL,
    shape_count INTEGER NOT NULL,
    file_size INTEGER,
    last_scan TEXT NOT NULL,
    last_modified TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_stencils_path ON stencils(path);
CREATE INDEX IF NOT EXISTS idx_stencils_last_modified ON stencils(last_modified);
CREATE INDEX IF NOT EXISTS idx_stencils_file_size ON stencils(file_size);
CREATE INDEX IF NOT EXISTS idx_stencils_shape_count ON stencils(shape_count);

-- Shape masters
CREATE TABLE IF NOT EXISTS shapes (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    stencil_path TEXT NOT NULL REFERENCES stencils(path) ON DELETE CASCADE,
    name TEXT NOT NULL,
    width REAL NOT NULL DEFAULT 0,
    height REAL NOT NULL DEFAULT 0,
    geometry TEXT,
    properties TEXT
);

CREATE INDEX IF NOT EXISTS idx_shapes_stencil_path_name ON shapes(stencil_path, name);

-- Favorites: one row per stencil or per shape
CREATE TABLE IF NOT EXISTS favorites (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    item_type TEXT NOT NULL CHECK(item_type IN ('stencil', 'shape')),
    stencil_path TEXT NOT NULL REFERENCES stencils(path) ON DELETE CASCADE,
    shape_id INTEGER REFERENCES shapes(id) ON DELETE CASCADE,
    added_at TEXT NOT NULL
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_favorites_stencil_unique
    ON favorites(stencil_path) WHERE item_type = 'stencil';
CREATE UNIQUE INDEX IF NOT EXISTS idx_favorites_shape_unique
    ON favorites(shape_id) WHERE item_type = 'shape';
CREATE INDEX IF NOT EXISTS idx_favorites_stencil_path ON favorites(stencil_path);

-- Scan directories
CREATE TABLE IF NOT EXISTS preset_directories (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    path TEXT UNIQUE NOT NULL,
    name TEXT NOT NULL,
    is_active INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL
);

-- Saved searches; filters are a JSON object
CREATE TABLE IF NOT EXISTS saved_searches (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT UNIQUE NOT NULL,
    search_term TEXT NOT NULL DEFAULT '',
    filters TEXT NOT NULL,
    created_at TEXT NOT NULL
);

-- Shape collections
CREATE TABLE IF NOT EXISTS collections (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS collection_shapes (
    collection_id INTEGER NOT NULL REFERENCES collections(id) ON DELETE CASCADE,
    shape_id INTEGER NOT NULL REFERENCES shapes(id) ON DELETE CASCADE,
    added_at TEXT NOT NULL,
    PRIMARY KEY (collection_id, shape_id)
);

CREATE INDEX IF NOT EXISTS idx_collection_shapes_shape_id ON collection_shapes(shape_id);
"#;

/// FTS5 index over shape names. The rowid is the shape id; triggers keep it
/// in step with `shapes`, including rows removed by FK cascades.
pub const FTS_SCHEMA: &str = r#"
CREATE VIRTUAL TABLE IF NOT EXISTS shapes_fts USING fts5(
    name,
    stencil_path UNINDEXED
);

CREATE TRIGGER IF NOT EXISTS shapes_ai AFTER INSERT ON shapes BEGIN
    INSERT INTO shapes_fts(rowid, name, stencil_path) VALUES (NEW.id, NEW.name, NEW.stencil_path);
END;

CREATE TRIGGER IF NOT EXISTS shapes_ad AFTER DELETE ON shapes BEGIN
    DELETE FROM shapes_fts WHERE rowid = OLD.id;
END;

CREATE TRIGGER IF NOT EXISTS shapes_au AFTER UPDATE ON shapes BEGIN
    DELETE FROM shapes_fts WHERE rowid = OLD.id;
    INSERT INTO shapes_fts(rowid, name, stencil_path) VALUES (NEW.id, NEW.name, NEW.stencil_path);
END;
"#;

/// Columns added after the first release: (table, column, declaration).
/// Applied before `SCHEMA` so indexes on new columns find them.
pub const COLUMN_MIGRATIONS: &[(&str, &str, &str)] = &[
    ("stencils", "file_size", "INTEGER"),
    ("shapes", "width", "REAL NOT NULL DEFAULT 0"),
    ("shapes", "height", "REAL NOT NULL DEFAULT 0"),
    ("shapes", "geometry", "TEXT"),
    ("shapes", "properties", "TEXT"),
];

/// Tables in dependency order, used when salvaging a damaged store.
pub const TABLES: &[&str] = &[
    "stencils",
    "shapes",
    "favorites",
    "preset_directories",
    "saved_searches",
    "collections",
    "collection_shapes",
];
