//! Stencil CLI - Command-line administration of the stencil cache.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use tracing::{info, warn, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use stencil_api::{ApiRequest, Method, StencilApi};
use stencil_core::{
    is_stencil_path, ExplorerConfig, SearchFilters, SearchRequest, SearchRow, StencilRecord,
    StencilStore,
};
use stencil_store::SqliteStore;

type CliResult<T = ()> = Result<T, Box<dyn std::error::Error>>;

/// Stencil - Local cache and search for Visio stencils
#[derive(Parser)]
#[command(name = "stencil")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Config file (default: user config dir, then ./stencil-explorer.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Database path (overrides the config file)
    #[arg(short, long, global = true)]
    database: Option<PathBuf>,

    /// Print JSON instead of text
    #[arg(long, global = true)]
    json: bool,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the cache (or repair it) and report its state
    Init,

    /// Import scanner output: a JSON array of stencil records
    Import {
        /// JSON file produced by the scanner
        file: PathBuf,
    },

    /// Search shapes
    Search {
        /// Search term
        query: String,

        /// Use the advanced syntax (OR, "phrases", -exclude, key:value)
        #[arg(short, long)]
        advanced: bool,

        /// Skip the full-text index and match substrings
        #[arg(long)]
        substring: bool,

        /// Maximum number of results (0 for no limit)
        #[arg(short, long)]
        limit: Option<u32>,

        #[arg(long, default_value = "0")]
        offset: u32,

        /// Only stencils under this directory
        #[arg(long)]
        directory: Option<String>,

        #[command(flatten)]
        filters: FilterArgs,
    },

    /// List cached stencils
    Stencils,

    /// Show a cached stencil and its shapes
    Show {
        /// Stencil path
        path: String,
    },

    /// List cached stencils whose file changed or vanished
    Stale,

    /// Manage favorites
    Favorites {
        #[command(subcommand)]
        action: FavoriteAction,
    },

    /// Manage preset directories
    Presets {
        #[command(subcommand)]
        action: PresetAction,
    },

    /// Manage saved searches
    Saved {
        #[command(subcommand)]
        action: SavedAction,
    },

    /// Manage shape collections
    Collections {
        #[command(subcommand)]
        action: CollectionAction,
    },

    /// Show statistics
    Stats,

    /// Check the search index and rebuild it on drift
    Verify,

    /// Remove every cached stencil
    Clear {
        /// Do not ask for confirmation
        #[arg(long)]
        yes: bool,
    },

    /// Send one request through the bridge routes
    Api {
        /// GET, POST, DELETE or OPTIONS
        method: String,

        /// Target such as /search?q=router
        target: String,

        /// JSON body
        #[arg(long)]
        body: Option<String>,

        /// Value for the X-API-Key header
        #[arg(long)]
        key: Option<String>,
    },
}

#[derive(Args)]
struct FilterArgs {
    /// Only favorited shapes or stencils
    #[arg(long)]
    favorites: bool,

    /// Stencils modified on or after (YYYY-MM-DD)
    #[arg(long)]
    since: Option<NaiveDate>,

    /// Stencils modified on or before (YYYY-MM-DD)
    #[arg(long)]
    until: Option<NaiveDate>,

    /// Minimum stencil file size in bytes
    #[arg(long)]
    min_size: Option<u64>,

    /// Maximum stencil file size in bytes
    #[arg(long)]
    max_size: Option<u64>,

    #[arg(long)]
    min_shapes: Option<u32>,

    #[arg(long)]
    max_shapes: Option<u32>,

    /// Only shapes with properties
    #[arg(long)]
    has_properties: bool,

    #[arg(long)]
    property_name: Option<String>,

    #[arg(long)]
    property_value: Option<String>,
}

impl From<FilterArgs> for SearchFilters {
    fn from(args: FilterArgs) -> Self {
        SearchFilters {
            favorites_only: args.favorites,
            date_start: args.since,
            date_end: args.until,
            min_size: args.min_size,
            max_size: args.max_size,
            min_shapes: args.min_shapes,
            max_shapes: args.max_shapes,
            has_properties: args.has_properties,
            property_name: args.property_name,
            property_value: args.property_value,
            ..Default::default()
        }
    }
}

#[derive(Subcommand)]
enum FavoriteAction {
    /// List favorites, newest first
    List,

    /// Favorite a stencil
    AddStencil { path: String },

    /// Favorite a shape
    AddShape { id: i64 },

    /// Remove a favorite by id
    Remove { id: i64 },
}

#[derive(Subcommand)]
enum PresetAction {
    List,

    Add {
        path: String,

        /// Display name (default: last path component)
        #[arg(long)]
        name: Option<String>,
    },

    /// Make a preset the active directory
    Activate { id: i64 },

    Remove { id: i64 },
}

#[derive(Subcommand)]
enum SavedAction {
    List,

    Add {
        name: String,
        query: String,

        #[command(flatten)]
        filters: FilterArgs,
    },

    /// Run a saved search by name
    Run { name: String },

    Delete { id: i64 },
}

#[derive(Subcommand)]
enum CollectionAction {
    List,

    Create { name: String },

    /// Show a collection and its shapes
    Show { id: i64 },

    Rename { id: i64, name: String },

    Delete { id: i64 },

    /// Add shapes by id
    Add { id: i64, shape_ids: Vec<i64> },

    /// Remove shapes by id
    Remove { id: i64, shape_ids: Vec<i64> },
}

fn setup_logging(verbose: bool) {
    let level = if verbose { Level::DEBUG } else { Level::WARN };
    let filter = EnvFilter::try_from_env("STENCIL_LOG")
        .unwrap_or_else(|_| EnvFilter::new(level.to_string()));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber).ok();
}

fn load_config(cli: &Cli) -> CliResult<ExplorerConfig> {
    let mut config = match &cli.config {
        Some(path) => ExplorerConfig::load(path)?,
        None => ExplorerConfig::load_default()?,
    };
    if let Some(path) = &cli.database {
        config.database.path = path.clone();
    }
    Ok(config)
}

fn open_store(config: &ExplorerConfig) -> CliResult<SqliteStore> {
    let store = SqliteStore::open_with(&config.database)?;

    if let Some(report) = store.recovery() {
        eprintln!("Cache file was damaged and has been recovered ({}).", report.reason);
        for backup in &report.backups {
            eprintln!("  Backup: {}", backup.display());
        }
        if store.needs_rescan() {
            eprintln!("  Cached data was lost. Re-import your stencils.");
        }
    }
    if !store.full_text_available() {
        warn!("Full-text search unavailable; using substring matching");
    }

    Ok(store)
}

fn print_json<T: Serialize>(value: &T) -> CliResult {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn fail(message: impl std::fmt::Display) -> ! {
    eprintln!("Error: {}", message);
    std::process::exit(1);
}

#[tokio::main]
async fn main() -> CliResult {
    let cli = Cli::parse();

    setup_logging(cli.verbose);

    let config = load_config(&cli)?;
    let store = open_store(&config)?;
    let json = cli.json;

    match cli.command {
        Commands::Init => init(&store, &config)?,
        Commands::Import { file } => import(&store, &file, &config.scanner.extensions, json)?,
        Commands::Search {
            query,
            advanced,
            substring,
            limit,
            offset,
            directory,
            filters,
        } => {
            let mut request = SearchRequest::new(query)
                .with_filters(filters.into())
                .full_text(config.search.use_full_text && !substring)
                .page(limit.unwrap_or(config.search.default_limit), offset);
            if let Some(directory) = directory {
                request = request.in_directory(directory);
            }

            let rows = if advanced {
                store.advanced_search(&request)
            } else {
                store.search(&request)
            };
            print_rows(&rows, json)?;
        }
        Commands::Stencils => {
            let stencils = store.get_cached_stencils()?;
            if json {
                return print_json(&stencils);
            }
            if stencils.is_empty() {
                println!("No stencils cached.");
            }
            for s in stencils {
                println!("{:>5}  {}  ({})", s.shape_count, s.name, s.path);
            }
        }
        Commands::Show { path } => {
            let Some(cached) = store.get_stencil_by_path(&path)? else {
                fail(format!("Stencil not cached: {}", path));
            };
            if json {
                return print_json(&cached);
            }
            let favorite = store.is_favorite_stencil(&path)?;
            println!(
                "{}{}\n  Path: {}\n  Shapes: {}\n  Size: {} bytes\n  Modified: {}\n  Scanned: {}",
                cached.stencil.name,
                if favorite { " *" } else { "" },
                cached.stencil.path,
                cached.stencil.shape_count,
                cached.stencil.file_size.unwrap_or(0),
                cached.stencil.last_modified,
                cached.stencil.last_scan
            );
            for shape in cached.shapes {
                println!(
                    "  [{}] {} ({:.2} x {:.2})",
                    shape.id, shape.name, shape.width, shape.height
                );
            }
        }
        Commands::Stale => {
            let mut stale = Vec::new();
            for stencil in store.get_cached_stencils()? {
                if store.needs_update(&stencil.path)? {
                    stale.push(stencil);
                }
            }
            if json {
                return print_json(&stale);
            }
            if stale.is_empty() {
                println!("All cached stencils are up to date.");
            }
            for s in stale {
                let state = if Path::new(&s.path).exists() {
                    "modified"
                } else {
                    "missing"
                };
                println!("{:<9} {}", state, s.path);
            }
        }
        Commands::Favorites { action } => favorites(&store, action, json)?,
        Commands::Presets { action } => presets(&store, action, json)?,
        Commands::Saved { action } => saved(&store, &config, action, json)?,
        Commands::Collections { action } => collections(&store, action, json)?,
        Commands::Stats => {
            let stats = store.get_stats()?;
            if json {
                return print_json(&stats);
            }
            println!("Cache statistics:\n");
            println!("- Stencils: {}", stats.stencils);
            println!("- Shapes: {}", stats.shapes);
            println!("- Index rows: {}", stats.index_rows);
            println!("- Favorites: {}", stats.favorites);
            println!("- Collections: {}", stats.collections);
            println!("- Saved searches: {}", stats.saved_searches);
            println!("- Preset directories: {}", stats.preset_directories);
            println!(
                "- Full-text search: {}",
                if stats.full_text_available { "available" } else { "unavailable" }
            );
            println!(
                "- Storage: {:.2} MB",
                stats.storage_bytes as f64 / 1024.0 / 1024.0
            );
        }
        Commands::Verify => {
            let report = store.verify_search_index()?;
            if json {
                return print_json(&report);
            }
            println!(
                "Shapes: {}, index rows: {}{}",
                report.shape_rows,
                report.index_rows,
                if report.rebuilt { " (index rebuilt)" } else { "" }
            );
        }
        Commands::Clear { yes } => {
            if !yes {
                fail("Refusing to clear the cache without --yes");
            }
            let removed = store.clear_cache()?;
            println!("Removed {} stencil(s) from the cache.", removed);
        }
        Commands::Api {
            method,
            target,
            body,
            key,
        } => {
            let Some(method) = Method::parse(&method) else {
                fail(format!("Unsupported method: {}", method));
            };
            let mut request = ApiRequest::new(method, &target);
            if let Some(body) = body {
                request = request.json(serde_json::from_str(&body)?);
            }
            if let Some(key) = key {
                request = request.header(stencil_api::API_KEY_HEADER, key);
            }

            let api = StencilApi::new(Arc::new(store), &config);
            let response = api.handle(request).await;
            println!("{}", response.status);
            print_json(&response.body)?;
            if !response.is_success() {
                std::process::exit(1);
            }
        }
    }

    Ok(())
}

fn init(store: &SqliteStore, config: &ExplorerConfig) -> CliResult {
    let stats = store.get_stats()?;
    println!("Cache ready at: {}", config.database.path.display());
    println!(
        "  {} stencil(s), full-text search {}",
        stats.stencils,
        if stats.full_text_available { "on" } else { "off" }
    );
    Ok(())
}

#[derive(Debug, Default, Serialize)]
struct ImportSummary {
    cached: u32,
    unchanged: u32,
    evicted: u32,
    skipped: u32,
    failed: u32,
}

fn import(store: &SqliteStore, file: &Path, extensions: &[String], json: bool) -> CliResult {
    let content = fs::read_to_string(file)?;
    let records: Vec<StencilRecord> = serde_json::from_str(&content)?;
    info!("Importing {} record(s) from {}", records.len(), file.display());

    let summary = import_records(store, records, extensions)?;

    if json {
        return print_json(&summary);
    }
    println!(
        "Import complete: {} cached, {} unchanged, {} evicted, {} skipped, {} failed",
        summary.cached, summary.unchanged, summary.evicted, summary.skipped, summary.failed
    );
    Ok(())
}

/// Cache every record whose file still exists and has a stencil extension.
fn import_records(
    store: &SqliteStore,
    records: Vec<StencilRecord>,
    extensions: &[String],
) -> CliResult<ImportSummary> {
    let mut summary = ImportSummary::default();
    for record in records {
        let path = Path::new(&record.path);
        if !is_stencil_path(path, extensions) {
            warn!("Not a stencil file, skipping: {}", record.path);
            summary.skipped += 1;
            continue;
        }

        if !path.exists() {
            if store.delete_stencil(&record.path)? {
                summary.evicted += 1;
            }
            warn!("Stencil file vanished: {}", record.path);
            continue;
        }

        if !store.needs_update(&record.path)? {
            summary.unchanged += 1;
            continue;
        }

        match store.cache_stencil(&record) {
            Ok(()) => summary.cached += 1,
            Err(e) => {
                eprintln!("  {} - Error: {}", record.path, e);
                summary.failed += 1;
            }
        }
    }
    Ok(summary)
}

fn print_rows(rows: &[SearchRow], json: bool) -> CliResult {
    if json {
        return print_json(&rows);
    }
    if rows.is_empty() {
        println!("No shapes found.");
        return Ok(());
    }

    println!("Found {} shape(s):\n", rows.len());
    for row in rows {
        println!(
            "[{}] {} - {} ({})",
            row.shape_id,
            row.highlighted_name.as_deref().unwrap_or(&row.shape_name),
            row.stencil_name,
            row.stencil_path
        );
    }
    Ok(())
}

fn favorites(store: &SqliteStore, action: FavoriteAction, json: bool) -> CliResult {
    match action {
        FavoriteAction::List => {
            let items = store.get_favorites()?;
            if json {
                return print_json(&items);
            }
            if items.is_empty() {
                println!("No favorites.");
            }
            for item in items {
                match &item.shape_name {
                    Some(shape) => println!(
                        "[{}] shape   {} ({})",
                        item.favorite.id, shape, item.stencil_name
                    ),
                    None => println!("[{}] stencil {}", item.favorite.id, item.stencil_name),
                }
            }
        }
        FavoriteAction::AddStencil { path } => {
            let favorite = store.add_favorite_stencil(&path)?;
            println!("Favorite {} added for {}", favorite.id, path);
        }
        FavoriteAction::AddShape { id } => {
            let favorite = store.add_favorite_shape(id)?;
            println!("Favorite {} added for shape {}", favorite.id, id);
        }
        FavoriteAction::Remove { id } => {
            if !store.remove_favorite(id)? {
                fail(format!("Favorite not found: {}", id));
            }
            println!("Favorite {} removed.", id);
        }
    }
    Ok(())
}

fn presets(store: &SqliteStore, action: PresetAction, json: bool) -> CliResult {
    match action {
        PresetAction::List => {
            let presets = store.get_preset_directories()?;
            if json {
                return print_json(&presets);
            }
            if presets.is_empty() {
                println!("No preset directories.");
            }
            for p in presets {
                let marker = if p.is_active { "*" } else { " " };
                println!("{} [{}] {} ({})", marker, p.id, p.name, p.path);
            }
        }
        PresetAction::Add { path, name } => {
            match store.add_preset_directory(&path, name.as_deref())? {
                Some(preset) => println!("Preset {} added: {}", preset.id, preset.name),
                None => println!("Already a preset: {}", path),
            }
        }
        PresetAction::Activate { id } => {
            if !store.set_active_directory(id)? {
                fail(format!("Preset not found: {}", id));
            }
            println!("Preset {} is now active.", id);
        }
        PresetAction::Remove { id } => {
            if !store.remove_preset_directory(id)? {
                fail(format!("Preset not found: {}", id));
            }
            println!("Preset {} removed.", id);
        }
    }
    Ok(())
}

fn saved(
    store: &SqliteStore,
    config: &ExplorerConfig,
    action: SavedAction,
    json: bool,
) -> CliResult {
    match action {
        SavedAction::List => {
            let searches = store.get_saved_searches()?;
            if json {
                return print_json(&searches);
            }
            if searches.is_empty() {
                println!("No saved searches.");
            }
            for s in searches {
                println!("[{}] {}: {:?}", s.id, s.name, s.search_term);
            }
        }
        SavedAction::Add {
            name,
            query,
            filters,
        } => {
            let saved = store.add_saved_search(&name, &query, &filters.into())?;
            println!("Saved search {} stored as {:?}", saved.id, saved.name);
        }
        SavedAction::Run { name } => {
            let Some(saved) = store.get_saved_search_by_name(&name)? else {
                fail(format!("No saved search named {:?}", name));
            };
            let request = SearchRequest::new(saved.search_term)
                .with_filters(saved.filters)
                .full_text(config.search.use_full_text)
                .page(config.search.default_limit, 0);
            print_rows(&store.search(&request), json)?;
        }
        SavedAction::Delete { id } => {
            if !store.delete_saved_search(id)? {
                fail(format!("Saved search not found: {}", id));
            }
            println!("Saved search {} deleted.", id);
        }
    }
    Ok(())
}

fn collections(store: &SqliteStore, action: CollectionAction, json: bool) -> CliResult {
    match action {
        CollectionAction::List => {
            let collections = store.list_collections()?;
            if json {
                return print_json(&collections);
            }
            if collections.is_empty() {
                println!("No collections.");
            }
            for c in collections {
                println!("[{}] {} ({} shapes)", c.id, c.name, c.shape_count);
            }
        }
        CollectionAction::Create { name } => {
            let collection = store.create_collection(&name)?;
            println!("Collection {} created: {}", collection.id, collection.name);
        }
        CollectionAction::Show { id } => {
            let Some(detail) = store.get_collection(id)? else {
                fail(format!("Collection not found: {}", id));
            };
            if json {
                return print_json(&detail);
            }
            println!(
                "{} ({} shapes, updated {})",
                detail.collection.name, detail.collection.shape_count, detail.collection.updated_at
            );
            print_rows(&detail.shapes, false)?;
        }
        CollectionAction::Rename { id, name } => {
            let collection = store.rename_collection(id, &name)?;
            println!("Collection {} renamed to {}", id, collection.name);
        }
        CollectionAction::Delete { id } => {
            if !store.delete_collection(id)? {
                fail(format!("Collection not found: {}", id));
            }
            println!("Collection {} deleted.", id);
        }
        CollectionAction::Add { id, shape_ids } => {
            let added = store.add_shapes_to_collection(id, &shape_ids)?;
            println!("Added {} shape(s) to collection {}", added, id);
        }
        CollectionAction::Remove { id, shape_ids } => {
            let removed = store.remove_shapes_from_collection(id, &shape_ids)?;
            println!("Removed {} shape(s) from collection {}", removed, id);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use stencil_core::ScannerConfig;

    fn record(dir: &Path, file_name: &str, shapes: &[&str]) -> StencilRecord {
        let path = dir.join(file_name);
        fs::write(&path, b"stencil").unwrap();
        StencilRecord::from_path(&path, shapes.iter().map(|s| (*s).into()).collect())
    }

    #[test]
    fn test_import_skips_unlisted_extensions() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open_memory().unwrap();
        let extensions = ScannerConfig::default().extensions;

        let records = vec![
            record(dir.path(), "Network.vssx", &["Router"]),
            record(dir.path(), "Drawing.vsdx", &["Page"]),
            record(dir.path(), "notes.txt", &["Line"]),
        ];
        let summary = import_records(&store, records, &extensions).unwrap();

        assert_eq!(summary.cached, 1);
        assert_eq!(summary.skipped, 2);
        let cached = store.get_cached_stencils().unwrap();
        assert_eq!(cached.len(), 1);
        assert!(cached[0].path.ends_with("Network.vssx"));
    }

    #[test]
    fn test_import_honours_configured_extensions() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open_memory().unwrap();
        let only_legacy = vec![".vss".to_string()];

        let records = vec![
            record(dir.path(), "Modern.vssx", &["Router"]),
            record(dir.path(), "Legacy.VSS", &["Switch"]),
        ];
        let summary = import_records(&store, records, &only_legacy).unwrap();

        assert_eq!(summary.cached, 1);
        assert_eq!(summary.skipped, 1);

        let again = vec![record(dir.path(), "Legacy.VSS", &["Switch"])];
        let summary = import_records(&store, again, &only_legacy).unwrap();
        assert_eq!(summary.unchanged, 1);
    }
}
