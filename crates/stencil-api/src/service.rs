//! Bridge facade over the cache.
//!
//! Requests arrive already split into method, target and headers; the
//! transport that produced them is not this crate's concern. Every route maps
//! to exactly one store operation.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, error, info, warn};

use stencil_core::{
    ApiConfig, ExplorerConfig, Result, SearchPage, SearchRequest, StencilError, StencilStore,
};
use stencil_store::SqliteStore;

/// Header carrying the shared secret.
pub const API_KEY_HEADER: &str = "x-api-key";

/// Largest page the search route hands out.
pub const MAX_PAGE_SIZE: u32 = 100;

const DEFAULT_PAGE_SIZE: u32 = 20;

/// HTTP method of a bridge request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    Get,
    Post,
    Delete,
    Options,
}

impl Method {
    pub fn parse(method: &str) -> Option<Self> {
        match method.to_ascii_uppercase().as_str() {
            "GET" => Some(Self::Get),
            "POST" => Some(Self::Post),
            "DELETE" => Some(Self::Delete),
            "OPTIONS" => Some(Self::Options),
            _ => None,
        }
    }
}

/// A bridge route with its path parameters decoded.
#[derive(Debug, Clone, PartialEq)]
pub enum Route {
    Health,
    Search,
    ListStencils,
    GetStencil(String),
    DeleteStencil(String),
    GetShape(i64),
    ListFavorites,
    AddFavorite,
    RemoveFavorite(i64),
    ListCollections,
    CreateCollection,
    GetCollection(i64),
    Preflight,
}

impl Route {
    /// Resolve a method and path (without query string). Unknown paths,
    /// unsupported methods and malformed ids resolve to `None`.
    pub fn parse(method: Method, path: &str) -> Option<Self> {
        if method == Method::Options {
            return Some(Self::Preflight);
        }

        let trimmed = path.strip_prefix('/').unwrap_or(path);
        if let Some(raw) = trimmed.strip_prefix("stencils/") {
            let stencil_path = percent_decode(raw);
            if stencil_path.is_empty() {
                return None;
            }
            return match method {
                Method::Get => Some(Self::GetStencil(stencil_path)),
                Method::Delete => Some(Self::DeleteStencil(stencil_path)),
                _ => None,
            };
        }

        let segments: Vec<&str> = trimmed.trim_end_matches('/').split('/').collect();
        match (method, segments.as_slice()) {
            (Method::Get, ["health"]) => Some(Self::Health),
            (Method::Get, ["search"]) => Some(Self::Search),
            (Method::Get, ["stencils"]) => Some(Self::ListStencils),
            (Method::Get, ["shapes", id]) => id.parse().ok().map(Self::GetShape),
            (Method::Get, ["favorites"]) => Some(Self::ListFavorites),
            (Method::Post, ["favorites"]) => Some(Self::AddFavorite),
            (Method::Delete, ["favorites", id]) => id.parse().ok().map(Self::RemoveFavorite),
            (Method::Get, ["collections"]) => Some(Self::ListCollections),
            (Method::Post, ["collections"]) => Some(Self::CreateCollection),
            (Method::Get, ["collections", id]) => id.parse().ok().map(Self::GetCollection),
            _ => None,
        }
    }

    /// Routes reachable without the shared secret.
    pub fn is_public(&self) -> bool {
        matches!(self, Self::Health | Self::Preflight)
    }
}

/// An incoming bridge request.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    pub path: String,
    pub query: BTreeMap<String, String>,

    /// Header names are stored lowercase.
    pub headers: BTreeMap<String, String>,
    pub body: Option<Value>,
}

impl ApiRequest {
    /// Build a request from a method and a target such as `/search?q=router`.
    pub fn new(method: Method, target: &str) -> Self {
        let (path, query) = match target.split_once('?') {
            Some((path, query)) => (path, parse_query(query)),
            None => (target, BTreeMap::new()),
        };

        Self {
            method,
            path: path.to_string(),
            query,
            headers: BTreeMap::new(),
            body: None,
        }
    }

    pub fn get(target: &str) -> Self {
        Self::new(Method::Get, target)
    }

    pub fn post(target: &str, body: Value) -> Self {
        Self::new(Method::Post, target).json(body)
    }

    pub fn delete(target: &str) -> Self {
        Self::new(Method::Delete, target)
    }

    pub fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    pub fn json(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    fn query_flag(&self, name: &str) -> Option<bool> {
        self.query
            .get(name)
            .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
    }

    fn query_number(&self, name: &str) -> Result<Option<u32>> {
        match self.query.get(name) {
            None => Ok(None),
            Some(raw) => raw.parse().map(Some).map_err(|_| {
                StencilError::invalid_argument(format!("Query parameter '{}' is not a number", name))
            }),
        }
    }

    fn body_as<T: for<'de> Deserialize<'de>>(&self) -> Result<T> {
        let body = self
            .body
            .clone()
            .ok_or_else(|| StencilError::invalid_argument("Request body is required"))?;
        Ok(serde_json::from_value(body)?)
    }
}

/// A bridge response.
#[derive(Debug, Clone, Serialize)]
pub struct ApiResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Value,
}

impl ApiResponse {
    pub fn ok(body: Value) -> Self {
        Self::with_status(200, body)
    }

    pub fn created(body: Value) -> Self {
        Self::with_status(201, body)
    }

    pub fn error(status: u16, code: &str, message: impl Into<String>) -> Self {
        Self::with_status(
            status,
            json!({ "error": code, "message": message.into() }),
        )
    }

    fn with_status(status: u16, body: Value) -> Self {
        Self {
            status,
            headers: cors_headers(),
            body,
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

impl From<StencilError> for ApiResponse {
    fn from(err: StencilError) -> Self {
        let status = if err.is_not_found() {
            404
        } else if err.is_conflict() {
            409
        } else {
            match &err {
                StencilError::InvalidArgument { .. } | StencilError::Serialization(_) => 400,
                _ => 500,
            }
        };

        if status == 500 {
            error!("Bridge request failed: {}", err);
        }
        Self::error(status, err.error_code(), err.to_string())
    }
}

fn cors_headers() -> Vec<(String, String)> {
    [
        ("Access-Control-Allow-Origin", "*"),
        ("Access-Control-Allow-Methods", "GET, POST, DELETE, OPTIONS"),
        ("Access-Control-Allow-Headers", "*"),
        ("Content-Type", "application/json"),
    ]
    .into_iter()
    .map(|(n, v)| (n.to_string(), v.to_string()))
    .collect()
}

/// Body of `POST /favorites`: exactly one of the two keys.
#[derive(Debug, Deserialize, Serialize)]
pub struct FavoriteParams {
    pub stencil_path: Option<String>,
    pub shape_id: Option<i64>,
}

/// Body of `POST /collections`.
#[derive(Debug, Deserialize, Serialize)]
pub struct CollectionParams {
    pub name: String,

    /// Shapes to add right away.
    #[serde(default)]
    pub shape_ids: Vec<i64>,
}

/// Bridge info.
#[derive(Debug, Serialize)]
pub struct ServiceInfo {
    pub name: String,
    pub version: String,
    pub description: String,
}

/// One documented route.
#[derive(Debug, Serialize)]
pub struct RouteInfo {
    pub method: Method,
    pub path: String,
    pub description: String,
}

fn route(method: Method, path: &str, description: &str) -> RouteInfo {
    RouteInfo {
        method,
        path: path.to_string(),
        description: description.to_string(),
    }
}

/// The bridge: a store handle plus the shared secret.
pub struct StencilApi {
    store: Arc<SqliteStore>,
    config: ApiConfig,
    use_full_text: bool,
}

impl StencilApi {
    pub fn new(store: Arc<SqliteStore>, config: &ExplorerConfig) -> Self {
        info!(
            "Bridge configured (auth {})",
            if config.api.api_key.is_some() { "on" } else { "off" }
        );

        Self {
            store,
            config: config.api.clone(),
            use_full_text: config.search.use_full_text,
        }
    }

    pub fn info() -> ServiceInfo {
        ServiceInfo {
            name: "stencil-api".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            description: "Local bridge over the stencil cache".to_string(),
        }
    }

    pub fn routes() -> Vec<RouteInfo> {
        vec![
            route(Method::Get, "/health", "Bridge and cache status"),
            route(Method::Get, "/search", "Search shapes (q, page, size, full_text, advanced, directory)"),
            route(Method::Get, "/stencils", "List cached stencils"),
            route(Method::Get, "/stencils/{path}", "A stencil with its shapes"),
            route(Method::Delete, "/stencils/{path}", "Evict a stencil from the cache"),
            route(Method::Get, "/shapes/{id}", "A single shape"),
            route(Method::Get, "/favorites", "List favorites"),
            route(Method::Post, "/favorites", "Favorite a stencil or a shape"),
            route(Method::Delete, "/favorites/{id}", "Remove a favorite"),
            route(Method::Get, "/collections", "List collections"),
            route(Method::Post, "/collections", "Create a collection"),
            route(Method::Get, "/collections/{id}", "A collection with its shapes"),
        ]
    }

    pub fn store(&self) -> &Arc<SqliteStore> {
        &self.store
    }

    /// Handle one request. Never fails; errors become error responses.
    pub async fn handle(&self, request: ApiRequest) -> ApiResponse {
        let Some(route) = Route::parse(request.method, &request.path) else {
            debug!("No route for {:?} {}", request.method, request.path);
            return ApiResponse::error(404, "NOT_FOUND", format!("No route for {}", request.path));
        };

        if !route.is_public() && !self.authorized(&request) {
            warn!("Rejected unauthenticated request to {}", request.path);
            return ApiResponse::error(401, "UNAUTHORIZED", "Missing or invalid API key");
        }

        debug!("Dispatching {:?}", route);
        match self.dispatch(route, &request).await {
            Ok(response) => response,
            Err(err) => err.into(),
        }
    }

    fn authorized(&self, request: &ApiRequest) -> bool {
        match &self.config.api_key {
            None => true,
            Some(expected) => request.headers.get(API_KEY_HEADER) == Some(expected),
        }
    }

    async fn dispatch(&self, route: Route, request: &ApiRequest) -> Result<ApiResponse> {
        match route {
            Route::Preflight => Ok(ApiResponse::ok(Value::Null)),
            Route::Health => {
                let (full_text, needs_rescan) = self
                    .blocking(|store| Ok((store.full_text_available(), store.needs_rescan())))
                    .await?;
                Ok(ApiResponse::ok(json!({
                    "status": "ok",
                    "version": env!("CARGO_PKG_VERSION"),
                    "full_text": full_text,
                    "needs_rescan": needs_rescan,
                })))
            }
            Route::Search => self.search(request).await,
            Route::ListStencils => {
                let stencils = self.blocking(|store| store.get_cached_stencils()).await?;
                Ok(ApiResponse::ok(serde_json::to_value(stencils)?))
            }
            Route::GetStencil(path) => {
                let stencil = self
                    .blocking({
                        let path = path.clone();
                        move |store| store.get_stencil_by_path(&path)
                    })
                    .await?
                    .ok_or(StencilError::StencilNotFound { path })?;
                Ok(ApiResponse::ok(serde_json::to_value(stencil)?))
            }
            Route::DeleteStencil(path) => {
                let deleted = self
                    .blocking({
                        let path = path.clone();
                        move |store| store.delete_stencil(&path)
                    })
                    .await?;
                if !deleted {
                    return Err(StencilError::StencilNotFound { path });
                }
                Ok(ApiResponse::ok(json!({ "deleted": path })))
            }
            Route::GetShape(id) => {
                let shape = self
                    .blocking(move |store| store.get_shape_by_id(id))
                    .await?
                    .ok_or(StencilError::ShapeNotFound { id })?;
                Ok(ApiResponse::ok(serde_json::to_value(shape)?))
            }
            Route::ListFavorites => {
                let favorites = self.blocking(|store| store.get_favorites()).await?;
                Ok(ApiResponse::ok(serde_json::to_value(favorites)?))
            }
            Route::AddFavorite => {
                let params: FavoriteParams = request.body_as()?;
                let favorite = match (params.stencil_path, params.shape_id) {
                    (Some(path), None) => {
                        self.blocking(move |store| store.add_favorite_stencil(&path))
                            .await?
                    }
                    (None, Some(id)) => {
                        self.blocking(move |store| store.add_favorite_shape(id))
                            .await?
                    }
                    _ => {
                        return Err(StencilError::invalid_argument(
                            "Provide exactly one of stencil_path or shape_id",
                        ))
                    }
                };
                Ok(ApiResponse::created(serde_json::to_value(favorite)?))
            }
            Route::RemoveFavorite(id) => {
                let removed = self.blocking(move |store| store.remove_favorite(id)).await?;
                if !removed {
                    return Ok(ApiResponse::error(
                        404,
                        "FAVORITE_NOT_FOUND",
                        format!("Favorite not found: {}", id),
                    ));
                }
                Ok(ApiResponse::ok(json!({ "deleted": id })))
            }
            Route::ListCollections => {
                let collections = self.blocking(|store| store.list_collections()).await?;
                Ok(ApiResponse::ok(serde_json::to_value(collections)?))
            }
            Route::CreateCollection => {
                let params: CollectionParams = request.body_as()?;
                let detail = self
                    .blocking(move |store| {
                        store.create_collection_with_shapes(&params.name, &params.shape_ids)
                    })
                    .await?;
                Ok(ApiResponse::created(serde_json::to_value(detail)?))
            }
            Route::GetCollection(id) => {
                let detail = self
                    .blocking(move |store| store.get_collection(id))
                    .await?
                    .ok_or(StencilError::CollectionNotFound { id })?;
                Ok(ApiResponse::ok(serde_json::to_value(detail)?))
            }
        }
    }

    async fn search(&self, request: &ApiRequest) -> Result<ApiResponse> {
        let term = request
            .query
            .get("q")
            .map(|q| q.trim().to_string())
            .filter(|q| !q.is_empty())
            .ok_or_else(|| StencilError::invalid_argument("No search query provided"))?;

        let page = request.query_number("page")?.unwrap_or(1).max(1);
        let size = request
            .query_number("size")?
            .unwrap_or(DEFAULT_PAGE_SIZE)
            .clamp(1, MAX_PAGE_SIZE);
        let use_full_text = request.query_flag("full_text").unwrap_or(self.use_full_text);
        let advanced = request.query_flag("advanced").unwrap_or(false);

        let offset = u64::from(page - 1)
            .checked_mul(u64::from(size))
            .and_then(|offset| u32::try_from(offset).ok())
            .ok_or_else(|| StencilError::invalid_argument(format!("Page out of range: {}", page)))?;

        let mut search = SearchRequest::new(term.clone())
            .full_text(use_full_text)
            .page(size, offset);
        if let Some(directory) = request.query.get("directory").filter(|d| !d.is_empty()) {
            search = search.in_directory(directory.clone());
        }

        info!("Bridge search for {:?} (advanced: {})", term, advanced);
        let SearchPage { rows: results, total } = self
            .blocking(move |store| {
                Ok(if advanced {
                    store.advanced_search_page(&search)
                } else {
                    store.search_page(&search)
                })
            })
            .await?;

        Ok(ApiResponse::ok(json!({
            "query": term,
            "total": total,
            "page": page,
            "size": size,
            "results": results,
        })))
    }

    /// Run a store call on the blocking pool.
    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&SqliteStore) -> Result<T> + Send + 'static,
    {
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || f(&store))
            .await
            .map_err(|e| StencilError::internal(format!("Store task failed: {}", e)))?
    }
}

fn parse_query(query: &str) -> BTreeMap<String, String> {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            (
                percent_decode(&key.replace('+', " ")),
                percent_decode(&value.replace('+', " ")),
            )
        })
        .collect()
}

/// Decode `%XX` escapes. Malformed escapes are kept verbatim.
fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).ok();
            if let Some(byte) = hex.and_then(|h| u8::from_str_radix(h, 16).ok()) {
                out.push(byte);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }

    String::from_utf8_lossy(&out).into_owned()
}
