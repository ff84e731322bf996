//! stencil-store - SQLite cache and search engine for stencils
//!
//! This crate persists stencils, shapes, favorites, presets, saved searches
//! and collections in a single SQLite file, keeps an FTS5 index of shape
//! names in step through triggers, and recovers damaged files at open.

mod cache;
mod collections;
mod favorites;
mod index;
mod integrity;
mod migrate;
mod presets;
mod recovery;
mod saved_searches;
mod schema;
mod search;
mod sqlite;

#[cfg(test)]
mod test_support;

pub use index::IndexReport;
pub use recovery::{DumpReload, Recreate, RecoveryReport, RecoveryStrategy};
pub use search::{
    directory_predicate, exclusion_predicate, filter_predicates, property_predicate, Predicate,
};
pub use sqlite::{SqliteStore, StoreOptions};

