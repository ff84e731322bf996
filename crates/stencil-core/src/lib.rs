//! stencil-core - Core types and traits for the stencil explorer
//!
//! This crate provides the domain types, search filters, query syntax,
//! configuration and error handling shared by the cache, the bridge and the CLI.

pub mod config;
pub mod error;
pub mod filters;
pub mod query;
pub mod time;
pub mod traits;
pub mod types;

pub use config::*;
pub use error::{Result, StencilError};
pub use filters::{SearchFilters, MAX_FILE_SIZE_BYTES, MAX_SHAPE_COUNT};
pub use query::ParsedQuery;
pub use traits::*;
pub use types::*;
