//! Fixtures shared by the store tests.

use std::fs::File;
use std::path::{Path, PathBuf};

use stencil_core::{ShapeEntry, StencilRecord, StencilStore};

use crate::SqliteStore;

/// Create a stencil file of `size` bytes under `dir`.
pub(crate) fn stencil_file(dir: &Path, file_name: &str, size: u64) -> PathBuf {
    let path = dir.join(file_name);
    let file = File::create(&path).unwrap();
    file.set_len(size).unwrap();
    path
}

/// Cache a `<name>.vssx` stencil of `size` bytes holding the named shapes.
pub(crate) fn seed_sized(
    store: &SqliteStore,
    dir: &Path,
    name: &str,
    shapes: &[&str],
    size: u64,
) -> String {
    let file = stencil_file(dir, &format!("{}.vssx", name), size);
    let entries = shapes.iter().map(|s| ShapeEntry::from(*s)).collect();
    let record = StencilRecord::from_path(&file, entries);
    store.cache_stencil(&record).unwrap();
    record.path
}

pub(crate) fn seed(store: &SqliteStore, dir: &Path, name: &str, shapes: &[&str]) -> String {
    seed_sized(store, dir, name, shapes, 1000)
}

/// Id of the named shape in a cached stencil.
pub(crate) fn shape_id(store: &SqliteStore, path: &str, name: &str) -> i64 {
    store
        .get_stencil_by_path(path)
        .unwrap()
        .unwrap()
        .shapes
        .into_iter()
        .find(|s| s.name == name)
        .unwrap()
        .id
}
