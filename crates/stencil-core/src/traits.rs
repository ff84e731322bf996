//! Interfaces between the cache and its callers.

use crate::error::Result;
use crate::types::{CachedStencil, SearchRow, Shape, Stencil, StencilRecord};
use crate::filters::SearchFilters;

/// One search call: a term, its filters and the page to return.
#[derive(Debug, Clone)]
pub struct SearchRequest {
    /// Free text. An empty term yields no rows.
    pub term: String,

    pub filters: SearchFilters,

    /// Query the full-text index; falls back to substring matching on failure.
    pub use_full_text: bool,

    pub limit: u32,
    pub offset: u32,

    /// Restrict to stencils whose path starts with this directory.
    pub directory_filter: Option<String>,
}

impl SearchRequest {
    /// A full-text request with no filters and the default page.
    pub fn new(term: impl Into<String>) -> Self {
        Self {
            term: term.into(),
            filters: SearchFilters::default(),
            use_full_text: true,
            limit: 1000,
            offset: 0,
            directory_filter: None,
        }
    }

    pub fn with_filters(mut self, filters: SearchFilters) -> Self {
        self.filters = filters;
        self
    }

    pub fn full_text(mut self, enabled: bool) -> Self {
        self.use_full_text = enabled;
        self
    }

    pub fn page(mut self, limit: u32, offset: u32) -> Self {
        self.limit = limit;
        self.offset = offset;
        self
    }

    pub fn in_directory(mut self, directory: impl Into<String>) -> Self {
        self.directory_filter = Some(directory.into());
        self
    }
}

/// The cache surface used by the scanner and by search consumers.
///
/// Implementations serialize every call through a single connection; all
/// methods block until the store is available.
pub trait StencilStore: Send + Sync {
    // Scanner operations
    fn cache_stencil(&self, record: &StencilRecord) -> Result<()>;
    fn needs_update(&self, path: &str) -> Result<bool>;
    fn get_cached_stencils(&self) -> Result<Vec<Stencil>>;
    fn delete_stencil(&self, path: &str) -> Result<bool>;

    // Lookup operations
    fn get_stencil_by_path(&self, path: &str) -> Result<Option<CachedStencil>>;
    fn get_shape_by_id(&self, id: i64) -> Result<Option<Shape>>;

    /// Never fails: errors degrade to an empty result.
    fn search(&self, request: &SearchRequest) -> Vec<SearchRow>;
}
