//! Core domain types for the stencil cache.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use crate::filters::SearchFilters;

/// Key/value property bag attached to a shape master.
pub type ShapeProperties = BTreeMap<String, String>;

/// One drawing command of a shape's vector outline, in shape-local inches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PathCommand {
    MoveTo { x: f64, y: f64 },
    LineTo { x: f64, y: f64 },
    ArcTo { x: f64, y: f64, bow: f64 },
    EllipticalArcTo {
        x: f64,
        y: f64,
        cx: f64,
        cy: f64,
        angle: f64,
        ratio: f64,
    },
    Close,
}

/// Stencil file extensions recognised by the scanner.
pub const STENCIL_EXTENSIONS: &[&str] = &[".vss", ".vssx", ".vssm", ".vst", ".vstx"];

/// Check whether `path` has one of `extensions` (case-insensitive, leading
/// dot optional).
pub fn is_stencil_path(path: &Path, extensions: &[String]) -> bool {
    let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
        return false;
    };
    extensions
        .iter()
        .any(|allowed| allowed.trim_start_matches('.').eq_ignore_ascii_case(ext))
}

/// A shape as produced by the stencil parser.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShapeRecord {
    pub name: String,

    #[serde(default)]
    pub width: f64,

    #[serde(default)]
    pub height: f64,

    #[serde(default)]
    pub geometry: Option<Vec<PathCommand>>,

    #[serde(default)]
    pub properties: Option<ShapeProperties>,
}

impl ShapeRecord {
    /// A shape that only carries a name.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            width: 0.0,
            height: 0.0,
            geometry: None,
            properties: None,
        }
    }
}

/// A shape entry in scanner output: either a bare name or a full record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ShapeEntry {
    Name(String),
    Record(ShapeRecord),
}

impl ShapeEntry {
    /// Normalize into a full record.
    pub fn into_record(self) -> ShapeRecord {
        match self {
            Self::Name(name) => ShapeRecord::named(name),
            Self::Record(record) => record,
        }
    }
}

impl From<&str> for ShapeEntry {
    fn from(name: &str) -> Self {
        Self::Name(name.to_string())
    }
}

impl From<ShapeRecord> for ShapeEntry {
    fn from(record: ShapeRecord) -> Self {
        Self::Record(record)
    }
}

/// A parsed stencil handed to the cache by the scanner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StencilRecord {
    /// Absolute path of the stencil file (natural key).
    pub path: String,

    /// Display name, usually the file stem.
    pub name: String,

    /// File extension including the dot.
    pub extension: String,

    /// Shapes found in the stencil.
    #[serde(default)]
    pub shapes: Vec<ShapeEntry>,
}

impl StencilRecord {
    /// Build a record from a path, deriving name and extension.
    pub fn from_path(path: &Path, shapes: Vec<ShapeEntry>) -> Self {
        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let extension = path
            .extension()
            .map(|e| format!(".{}", e.to_string_lossy()))
            .unwrap_or_default();

        Self {
            path: path.to_string_lossy().into_owned(),
            name,
            extension,
            shapes,
        }
    }
}

/// Cached stencil metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stencil {
    pub path: String,
    pub name: String,
    pub extension: String,
    pub shape_count: u32,

    /// File size in bytes, `None` for rows written before sizes were tracked.
    pub file_size: Option<u64>,

    /// When the cache last refreshed this stencil (ISO-8601).
    pub last_scan: String,

    /// Source file modification time (ISO-8601).
    pub last_modified: String,
}

/// A cached shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Shape {
    pub id: i64,
    pub stencil_path: String,
    pub name: String,
    pub width: f64,
    pub height: f64,
    pub geometry: Option<Vec<PathCommand>>,
    pub properties: Option<ShapeProperties>,
}

/// A stencil together with its shapes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedStencil {
    #[serde(flatten)]
    pub stencil: Stencil,
    pub shapes: Vec<Shape>,
}

/// What a favorite points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FavoriteKind {
    Stencil,
    Shape,
}

impl FavoriteKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stencil => "stencil",
            Self::Shape => "shape",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "stencil" => Some(Self::Stencil),
            "shape" => Some(Self::Shape),
            _ => None,
        }
    }
}

impl std::fmt::Display for FavoriteKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A favorite row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Favorite {
    pub id: i64,
    pub kind: FavoriteKind,
    pub stencil_path: String,
    pub shape_id: Option<i64>,
    pub added_at: String,
}

/// A favorite with display names resolved.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FavoriteItem {
    #[serde(flatten)]
    pub favorite: Favorite,
    pub stencil_name: String,
    pub shape_name: Option<String>,
}

/// A saved scan directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresetDirectory {
    pub id: i64,
    pub path: String,
    pub name: String,
    pub is_active: bool,
    pub created_at: String,
}

/// A named search with its filters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SavedSearch {
    pub id: i64,
    pub name: String,
    pub search_term: String,
    pub filters: SearchFilters,
    pub created_at: String,
}

/// A user-defined group of shapes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShapeCollection {
    pub id: i64,
    pub name: String,
    pub shape_count: u32,
    pub created_at: String,
    pub updated_at: String,
}

/// A collection with its member shapes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionDetail {
    #[serde(flatten)]
    pub collection: ShapeCollection,
    pub shapes: Vec<SearchRow>,
}

/// One row of search output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchRow {
    pub shape_id: i64,
    pub shape_name: String,
    pub stencil_name: String,
    pub stencil_path: String,
    pub width: f64,
    pub height: f64,
    pub geometry: Option<Vec<PathCommand>>,
    pub properties: Option<ShapeProperties>,

    /// Shape name with `<mark>` around matched tokens; `None` for substring search.
    pub highlighted_name: Option<String>,
}

/// One page of search output plus the number of rows across all pages.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchPage {
    pub rows: Vec<SearchRow>,
    pub total: u64,
}

/// Statistics about the cache.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheStats {
    pub stencils: u64,
    pub shapes: u64,
    pub favorites: u64,
    pub collections: u64,
    pub saved_searches: u64,
    pub preset_directories: u64,

    /// Rows in the full-text index (0 when unavailable).
    pub index_rows: u64,

    /// Database size in bytes.
    pub storage_bytes: u64,

    pub full_text_available: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shape_entry_untagged() {
        let json = r#"["Router", {"name": "Switch", "width": 1.5, "height": 0.5}]"#;
        let entries: Vec<ShapeEntry> = serde_json::from_str(json).unwrap();
        let records: Vec<ShapeRecord> = entries.into_iter().map(ShapeEntry::into_record).collect();
        assert_eq!(records[0], ShapeRecord::named("Router"));
        assert_eq!(records[1].name, "Switch");
        assert_eq!(records[1].width, 1.5);
        assert!(records[1].geometry.is_none());
    }

    #[test]
    fn test_path_command_tagging() {
        let cmds = vec![
            PathCommand::MoveTo { x: 0.0, y: 0.0 },
            PathCommand::LineTo { x: 1.0, y: 0.0 },
            PathCommand::Close,
        ];
        let json = serde_json::to_string(&cmds).unwrap();
        assert!(json.contains(r#""type":"move_to""#));
        assert!(json.contains(r#""type":"close""#));
    }

    #[test]
    fn test_record_from_path() {
        let record = StencilRecord::from_path(Path::new("/lib/Network Shapes.vssx"), vec![]);
        assert_eq!(record.name, "Network Shapes");
        assert_eq!(record.extension, ".vssx");
    }

    #[test]
    fn test_stencil_extensions() {
        let defaults: Vec<String> = STENCIL_EXTENSIONS.iter().map(|e| e.to_string()).collect();
        assert!(is_stencil_path(Path::new("a/b/Basic.VSSX"), &defaults));
        assert!(is_stencil_path(Path::new("legacy.vss"), &defaults));
        assert!(!is_stencil_path(Path::new("drawing.vsdx"), &defaults));
        assert!(!is_stencil_path(Path::new("noext"), &defaults));

        let custom = vec!["vsdx".to_string()];
        assert!(is_stencil_path(Path::new("drawing.VSDX"), &custom));
        assert!(!is_stencil_path(Path::new("legacy.vss"), &custom));
    }
}
