//! stencil-api - local bridge over the stencil cache
//!
//! This crate exposes the cache to local consumers (browser extension, MCP
//! wrapper) as a small set of JSON routes. It carries no business logic:
//! every route maps to one store operation.
//!
//! # Routes
//!
//! - `GET /health` - Bridge and cache status (no key required)
//! - `GET /search` - Search shapes
//! - `GET /stencils`, `GET|DELETE /stencils/{path}` - Cached stencils
//! - `GET /shapes/{id}` - A single shape
//! - `GET|POST /favorites`, `DELETE /favorites/{id}` - Favorites
//! - `GET|POST /collections`, `GET /collections/{id}` - Collections

mod service;

pub use service::{
    ApiRequest, ApiResponse, CollectionParams, FavoriteParams, Method, Route, RouteInfo,
    ServiceInfo, StencilApi, API_KEY_HEADER, MAX_PAGE_SIZE,
};
