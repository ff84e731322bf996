//! Shape search: full-text match over the index with a substring fallback.
//!
//! Filters compile into a list of [`Predicate`]s, each an SQL fragment with
//! its bound parameters, joined with `AND` into whichever query runs.

use std::path::MAIN_SEPARATOR;

use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, Row};
use tracing::{debug, warn};

use stencil_core::time::{date_lower_bound, date_upper_bound};
use stencil_core::{ParsedQuery, Result, SearchFilters, SearchPage, SearchRequest, SearchRow};

use crate::cache::decode_json;
use crate::migrate::ensure_columns;
use crate::sqlite::db_err;
use crate::SqliteStore;

pub(crate) const ROW_COLUMNS: &str =
    "sh.id, sh.name, st.name, st.path, sh.width, sh.height, sh.geometry, sh.properties";

/// One `AND`-ed condition of a search query.
#[derive(Debug, Clone, PartialEq)]
pub struct Predicate {
    pub sql: String,
    pub params: Vec<Value>,
}

impl Predicate {
    fn new(sql: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            sql: sql.into(),
            params,
        }
    }

    fn bound(sql: &str, value: impl Into<Value>) -> Self {
        Self::new(sql, vec![value.into()])
    }
}

/// The text part of a search.
#[derive(Debug, Clone, Copy)]
pub(crate) enum TextMatch<'a> {
    /// Free text; every token must prefix-match in the index, or the whole
    /// term must appear in the shape name.
    Term(&'a str),
    All(&'a [String]),
    Any(&'a [String]),
    /// No text constraint; only predicates apply.
    Everything,
}

impl TextMatch<'_> {
    fn is_empty(&self) -> bool {
        match self {
            Self::Term(term) => term.trim().is_empty(),
            Self::All(terms) | Self::Any(terms) => terms.is_empty(),
            Self::Everything => false,
        }
    }
}

/// Predicates for every filter whose bound actually narrows the results.
pub fn filter_predicates(filters: &SearchFilters) -> Vec<Predicate> {
    let mut predicates = Vec::new();

    if filters.favorites_only {
        predicates.push(Predicate::new(
            r#"(EXISTS (SELECT 1 FROM favorites f WHERE f.item_type = 'shape' AND f.shape_id = sh.id)
             OR EXISTS (SELECT 1 FROM favorites f WHERE f.item_type = 'stencil' AND f.stencil_path = st.path))"#,
            vec![],
        ));
    }

    if let Some(start) = filters.date_start {
        predicates.push(Predicate::bound("st.last_modified >= ?", date_lower_bound(start)));
    }
    if let Some(end) = filters.date_end {
        predicates.push(Predicate::bound("st.last_modified < ?", date_upper_bound(end)));
    }

    if let Some(min) = filters.min_size_bound() {
        predicates.push(Predicate::bound("st.file_size >= ?", min as i64));
    }
    if let Some(max) = filters.max_size_bound() {
        predicates.push(Predicate::bound("st.file_size <= ?", max as i64));
    }

    if let Some(min) = filters.min_shapes_bound() {
        predicates.push(Predicate::bound("st.shape_count >= ?", min as i64));
    }
    if let Some(max) = filters.max_shapes_bound() {
        predicates.push(Predicate::bound("st.shape_count <= ?", max as i64));
    }

    if let Some(min) = filters.min_width_bound() {
        predicates.push(Predicate::bound("sh.width >= ?", min));
    }
    if let Some(max) = filters.max_width_bound() {
        predicates.push(Predicate::bound("sh.width <= ?", max));
    }
    if let Some(min) = filters.min_height_bound() {
        predicates.push(Predicate::bound("sh.height >= ?", min));
    }
    if let Some(max) = filters.max_height_bound() {
        predicates.push(Predicate::bound("sh.height <= ?", max));
    }

    if filters.has_properties {
        predicates.push(Predicate::new(
            "(sh.properties IS NOT NULL AND sh.properties NOT IN ('', '{}', 'null'))",
            vec![],
        ));
    }
    if let Some(name) = filters.property_name_bound() {
        predicates.push(Predicate::bound(
            r"sh.properties LIKE ? ESCAPE '\'",
            contains_pattern(name),
        ));
    }
    if let Some(value) = filters.property_value_bound() {
        predicates.push(Predicate::bound(
            r"sh.properties LIKE ? ESCAPE '\'",
            contains_pattern(value),
        ));
    }

    predicates
}

/// Stencils under `directory`, with separators normalized for this OS.
///
/// Compared exactly against the start of the stored path, so `_`, `%`
/// and letter case in directory names are matched literally.
pub fn directory_predicate(directory: &str) -> Option<Predicate> {
    let normalized: String = directory
        .trim()
        .chars()
        .map(|c| if c == '/' || c == '\\' { MAIN_SEPARATOR } else { c })
        .collect();
    if normalized.is_empty() {
        return None;
    }

    let mut prefix = normalized.trim_end_matches(MAIN_SEPARATOR).to_string();
    prefix.push(MAIN_SEPARATOR);

    Some(Predicate::new(
        "substr(st.path, 1, length(?)) = ?",
        vec![prefix.clone().into(), prefix.into()],
    ))
}

/// Reject rows whose shape or stencil name contains `term`.
pub fn exclusion_predicate(term: &str) -> Predicate {
    let pattern = contains_pattern(term);
    Predicate::new(
        r"(sh.name NOT LIKE ? ESCAPE '\' AND st.name NOT LIKE ? ESCAPE '\')",
        vec![pattern.clone().into(), pattern.into()],
    )
}

/// Require property `key` (any case) to contain `value`.
pub fn property_predicate(key: &str, value: &str) -> Predicate {
    Predicate::new(
        r#"(CASE WHEN json_valid(sh.properties) THEN EXISTS (
                SELECT 1 FROM json_each(sh.properties) pe
                WHERE lower(pe.key) = ? AND pe.value LIKE ? ESCAPE '\'
            ) ELSE 0 END)"#,
        vec![key.to_lowercase().into(), contains_pattern(value).into()],
    )
}

/// FTS5 match expression, or `None` when there is nothing to match.
pub(crate) fn match_expression(text: &TextMatch<'_>) -> Option<String> {
    let expr = match text {
        TextMatch::Term(term) => term
            .split_whitespace()
            .map(prefix_token)
            .collect::<Vec<_>>()
            .join(" "),
        TextMatch::All(terms) => terms.iter().map(|t| query_term(t)).collect::<Vec<_>>().join(" "),
        TextMatch::Any(terms) => terms
            .iter()
            .map(|t| query_term(t))
            .collect::<Vec<_>>()
            .join(" OR "),
        TextMatch::Everything => return None,
    };

    if expr.is_empty() {
        None
    } else {
        Some(expr)
    }
}

fn quote(token: &str) -> String {
    format!("\"{}\"", token.replace('"', "\"\""))
}

fn prefix_token(token: &str) -> String {
    format!("{}*", quote(token))
}

/// Multi-word terms match as phrases; single words as prefixes.
fn query_term(term: &str) -> String {
    if term.split_whitespace().count() > 1 {
        quote(term)
    } else {
        prefix_token(term.trim())
    }
}

fn substring_predicate(text: &TextMatch<'_>) -> Option<Predicate> {
    let like = r"sh.name LIKE ? ESCAPE '\'";
    match text {
        TextMatch::Term(term) => Some(Predicate::bound(like, contains_pattern(term.trim()))),
        TextMatch::All(terms) | TextMatch::Any(terms) => {
            let joiner = if matches!(text, TextMatch::All(_)) {
                " AND "
            } else {
                " OR "
            };
            let sql = vec![like; terms.len()].join(joiner);
            let params = terms.iter().map(|t| contains_pattern(t).into()).collect();
            Some(Predicate::new(format!("({})", sql), params))
        }
        TextMatch::Everything => None,
    }
}

fn escape_like(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

fn contains_pattern(value: &str) -> String {
    format!("%{}%", escape_like(value))
}

fn where_clause(predicates: &[Predicate]) -> String {
    predicates
        .iter()
        .map(|p| p.sql.as_str())
        .collect::<Vec<_>>()
        .join(" AND ")
}

fn page_params(limit: u32, offset: u32) -> [Value; 2] {
    let limit = if limit == 0 { -1 } else { i64::from(limit) };
    [Value::Integer(limit), Value::Integer(i64::from(offset))]
}

/// `FROM ... WHERE ...` for an index match, with its parameters.
fn full_text_source(expr: &str, predicates: &[Predicate]) -> (String, Vec<Value>) {
    let mut sql = String::from(
        r#"
        FROM shapes_fts
        JOIN shapes sh ON sh.id = shapes_fts.rowid
        JOIN stencils st ON st.path = sh.stencil_path
        WHERE shapes_fts MATCH ?
        "#,
    );
    if !predicates.is_empty() {
        sql.push_str(" AND ");
        sql.push_str(&where_clause(predicates));
    }

    let mut params = vec![Value::Text(expr.to_string())];
    params.extend(predicates.iter().flat_map(|p| p.params.iter().cloned()));
    (sql, params)
}

fn substring_source(predicates: &[Predicate]) -> (String, Vec<Value>) {
    let mut sql = String::from(
        r#"
        FROM shapes sh
        JOIN stencils st ON st.path = sh.stencil_path
        "#,
    );
    if !predicates.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&where_clause(predicates));
    }

    let params = predicates
        .iter()
        .flat_map(|p| p.params.iter().cloned())
        .collect();
    (sql, params)
}

/// Which query shape a search runs.
#[derive(Debug, Clone, Copy)]
enum Plan<'a> {
    FullText(&'a str),
    Substring,
}

impl Plan<'_> {
    fn source(&self, predicates: &[Predicate]) -> (String, Vec<Value>) {
        match self {
            Self::FullText(expr) => full_text_source(expr, predicates),
            Self::Substring => substring_source(predicates),
        }
    }

    fn highlight(&self) -> &'static str {
        match self {
            Self::FullText(_) => "highlight(shapes_fts, 0, '<mark>', '</mark>')",
            Self::Substring => "NULL",
        }
    }

    fn order(&self) -> &'static str {
        match self {
            Self::FullText(_) => "bm25(shapes_fts), sh.id",
            Self::Substring => "st.name, sh.name, sh.id",
        }
    }
}

/// One page of rows, and the unpaged row count when `with_total` is set.
fn query_page(
    conn: &Connection,
    plan: Plan<'_>,
    predicates: &[Predicate],
    limit: u32,
    offset: u32,
    with_total: bool,
) -> Result<SearchPage> {
    ensure_columns(conn)?;

    let (source, params) = plan.source(predicates);
    let sql = format!(
        "SELECT {}, {} {} ORDER BY {} LIMIT ? OFFSET ?",
        ROW_COLUMNS,
        plan.highlight(),
        source,
        plan.order()
    );
    let mut paged = params.clone();
    paged.extend(page_params(limit, offset));
    let rows = collect_rows(conn, &sql, paged)?;

    let total = if with_total {
        let count: i64 = conn
            .query_row(
                &format!("SELECT COUNT(*) {}", source),
                params_from_iter(params),
                |row| row.get(0),
            )
            .map_err(db_err)?;
        count.max(0) as u64
    } else {
        rows.len() as u64
    };

    Ok(SearchPage { rows, total })
}

fn collect_rows(conn: &Connection, sql: &str, params: Vec<Value>) -> Result<Vec<SearchRow>> {
    let mut stmt = conn.prepare(sql).map_err(db_err)?;
    let rows = stmt
        .query_map(params_from_iter(params), row_to_search_row)
        .map_err(db_err)?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(db_err)?;
    Ok(rows)
}

pub(crate) fn row_to_search_row(row: &Row<'_>) -> rusqlite::Result<SearchRow> {
    Ok(SearchRow {
        shape_id: row.get(0)?,
        shape_name: row.get(1)?,
        stencil_name: row.get(2)?,
        stencil_path: row.get(3)?,
        width: row.get::<_, Option<f64>>(4)?.unwrap_or(0.0),
        height: row.get::<_, Option<f64>>(5)?.unwrap_or(0.0),
        geometry: decode_json(row.get(6)?),
        properties: decode_json(row.get(7)?),
        highlighted_name: row.get(8)?,
    })
}

impl SqliteStore {
    /// Run a search. Errors never reach the caller: a failing full-text
    /// query is retried once as a substring query, and a failing substring
    /// query yields no rows.
    pub fn search_rows(&self, request: &SearchRequest) -> Vec<SearchRow> {
        self.run_search(request, TextMatch::Term(request.term.trim()), Vec::new(), false)
            .rows
    }

    /// Like [`search_rows`](Self::search_rows), also counting every match
    /// beyond the requested page.
    pub fn search_page(&self, request: &SearchRequest) -> SearchPage {
        self.run_search(request, TextMatch::Term(request.term.trim()), Vec::new(), true)
    }

    /// Search with the advanced syntax (`OR`, quoted phrases, `-exclude`,
    /// `key:value`) in `request.term`.
    pub fn advanced_search(&self, request: &SearchRequest) -> Vec<SearchRow> {
        self.run_advanced(request, false).rows
    }

    pub fn advanced_search_page(&self, request: &SearchRequest) -> SearchPage {
        self.run_advanced(request, true)
    }

    fn run_advanced(&self, request: &SearchRequest, with_total: bool) -> SearchPage {
        let parsed = ParsedQuery::parse(&request.term);

        let text = if !parsed.all.is_empty() {
            TextMatch::All(&parsed.all)
        } else if !parsed.any.is_empty() {
            TextMatch::Any(&parsed.any)
        } else if !parsed.properties.is_empty() {
            TextMatch::Everything
        } else {
            return SearchPage::default();
        };

        let mut extra: Vec<Predicate> = parsed.exclude.iter().map(|t| exclusion_predicate(t)).collect();
        extra.extend(
            parsed
                .properties
                .iter()
                .map(|(key, value)| property_predicate(key, value)),
        );

        self.run_search(request, text, extra, with_total)
    }

    fn run_search(
        &self,
        request: &SearchRequest,
        text: TextMatch<'_>,
        extra: Vec<Predicate>,
        with_total: bool,
    ) -> SearchPage {
        if text.is_empty() {
            return SearchPage::default();
        }

        let mut predicates = filter_predicates(&request.filters);
        if let Some(directory) = request.directory_filter.as_deref() {
            predicates.extend(directory_predicate(directory));
        }
        predicates.extend(extra);

        let expr = match_expression(&text);
        if request.use_full_text && self.full_text_available() {
            if let Some(expr) = expr.as_deref() {
                match self.with_conn(|conn| {
                    query_page(
                        conn,
                        Plan::FullText(expr),
                        &predicates,
                        request.limit,
                        request.offset,
                        with_total,
                    )
                }) {
                    Ok(page) => {
                        debug!("Full-text search {:?}: {} rows", expr, page.rows.len());
                        return page;
                    }
                    Err(e) => warn!(
                        "Full-text search failed, retrying with substring match: {}",
                        e
                    ),
                }
            }
        }

        predicates.extend(substring_predicate(&text));
        match self.with_conn(|conn| {
            query_page(
                conn,
                Plan::Substring,
                &predicates,
                request.limit,
                request.offset,
                with_total,
            )
        }) {
            Ok(page) => page,
            Err(e) => {
                warn!("Search failed: {}", e);
                SearchPage::default()
            }
        }
    }
}
