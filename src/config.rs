//! Job configuration from environment variables
//!
//! Every setting has a compiled-in default so the job runs with no arguments
//! and no `.env` file against a local MongoDB.

use std::env;
use std::time::Duration;

pub const DEFAULT_MONGO_URI: &str = "mongodb://127.0.0.1:27017/DataSellingProject";
pub const DEFAULT_DATABASE: &str = "DataSellingProject";
pub const DEFAULT_SOURCE_COLLECTION: &str = "companies";
pub const DEFAULT_METADATA_COLLECTION: &str = "filterMetadata";
pub const DEFAULT_FILTERS_CACHE_COLLECTION: &str = "filtersCache";
pub const DEFAULT_BATCH_SIZE: usize = 10_000;
pub const DEFAULT_MEMORY_WARN_MB: u64 = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendType {
    Mongo,
    Sqlite,
}

impl BackendType {
    fn parse(raw: &str) -> Result<Self, ConfigError> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "mongo" | "mongodb" => Ok(BackendType::Mongo),
            "sqlite" => Ok(BackendType::Sqlite),
            other => Err(ConfigError::InvalidValue(format!(
                "FILTERS_BACKEND must be 'mongo' or 'sqlite', got '{}'",
                other
            ))),
        }
    }
}

/// How the destination collection is replaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplaceStrategy {
    /// Delete everything in the live collection, then insert batches into it.
    /// Readers can observe a partially repopulated collection mid-run.
    InPlace,
    /// Fill `<collection>_staging`, then atomically promote it over the live one.
    StagedSwap,
}

impl ReplaceStrategy {
    fn parse(raw: &str) -> Result<Self, ConfigError> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "in_place" | "inplace" => Ok(ReplaceStrategy::InPlace),
            "staged_swap" | "staged" => Ok(ReplaceStrategy::StagedSwap),
            other => Err(ConfigError::InvalidValue(format!(
                "REPLACE_STRATEGY must be 'in_place' or 'staged_swap', got '{}'",
                other
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ReplaceStrategy::InPlace => "in_place",
            ReplaceStrategy::StagedSwap => "staged_swap",
        }
    }
}

#[derive(Debug)]
pub enum ConfigError {
    InvalidValue(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::InvalidValue(msg) => write!(f, "Invalid configuration value: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Configuration for one precompute run
#[derive(Debug, Clone)]
pub struct PrecomputeConfig {
    pub backend: BackendType,

    /// MongoDB connection string
    pub mongo_uri: String,

    /// Database holding both the source and the metadata collections
    pub database: String,

    /// Connection-level only; the query and write batches are never timed out
    pub server_selection_timeout: Duration,

    /// SQLite database file (sqlite backend only)
    pub sqlite_path: String,

    pub source_collection: String,
    pub metadata_collection: String,

    /// Destination of the per-category facet cache pass
    pub filters_cache_collection: String,

    /// Documents per insert batch, also the memory-sampling block during the scan
    pub batch_size: usize,

    /// RSS above this triggers a warning
    pub memory_warn_mb: u64,

    pub replace_strategy: ReplaceStrategy,

    /// Stamp every document with `lastUpdated`
    pub stamp_last_updated: bool,
}

impl Default for PrecomputeConfig {
    fn default() -> Self {
        Self {
            backend: BackendType::Mongo,
            mongo_uri: DEFAULT_MONGO_URI.to_string(),
            database: DEFAULT_DATABASE.to_string(),
            server_selection_timeout: Duration::from_millis(5_000),
            sqlite_path: "data/filters.db".to_string(),
            source_collection: DEFAULT_SOURCE_COLLECTION.to_string(),
            metadata_collection: DEFAULT_METADATA_COLLECTION.to_string(),
            filters_cache_collection: DEFAULT_FILTERS_CACHE_COLLECTION.to_string(),
            batch_size: DEFAULT_BATCH_SIZE,
            memory_warn_mb: DEFAULT_MEMORY_WARN_MB,
            replace_strategy: ReplaceStrategy::InPlace,
            stamp_last_updated: false,
        }
    }
}

impl PrecomputeConfig {
    /// Load configuration from environment variables
    ///
    /// Environment variables:
    /// - `FILTERS_BACKEND` (default: mongo)
    /// - `MONGO_URI` (default: mongodb://127.0.0.1:27017/DataSellingProject)
    /// - `MONGO_DATABASE` (default: DataSellingProject)
    /// - `MONGO_SERVER_SELECTION_TIMEOUT_MS` (default: 5000)
    /// - `FILTERS_SQLITE_PATH` (default: data/filters.db)
    /// - `SOURCE_COLLECTION` (default: companies)
    /// - `METADATA_COLLECTION` (default: filterMetadata)
    /// - `FILTERS_CACHE_COLLECTION` (default: filtersCache)
    /// - `PRECOMPUTE_BATCH_SIZE` (default: 10000)
    /// - `MEMORY_WARN_THRESHOLD_MB` (default: 256)
    /// - `REPLACE_STRATEGY` (default: in_place)
    /// - `STAMP_LAST_UPDATED` (default: false)
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let backend = match env::var("FILTERS_BACKEND") {
            Ok(raw) => BackendType::parse(&raw)?,
            Err(_) => defaults.backend,
        };

        let replace_strategy = match env::var("REPLACE_STRATEGY") {
            Ok(raw) => ReplaceStrategy::parse(&raw)?,
            Err(_) => defaults.replace_strategy,
        };

        let batch_size: usize = parse_var("PRECOMPUTE_BATCH_SIZE")?.unwrap_or(defaults.batch_size);
        if batch_size == 0 {
            return Err(ConfigError::InvalidValue(
                "PRECOMPUTE_BATCH_SIZE must be greater than 0".to_string(),
            ));
        }

        let selection_ms: u64 = parse_var("MONGO_SERVER_SELECTION_TIMEOUT_MS")?.unwrap_or(5_000);

        Ok(Self {
            backend,
            mongo_uri: env::var("MONGO_URI").unwrap_or(defaults.mongo_uri),
            database: env::var("MONGO_DATABASE").unwrap_or(defaults.database),
            server_selection_timeout: Duration::from_millis(selection_ms),
            sqlite_path: env::var("FILTERS_SQLITE_PATH").unwrap_or(defaults.sqlite_path),
            source_collection: env::var("SOURCE_COLLECTION").unwrap_or(defaults.source_collection),
            metadata_collection: env::var("METADATA_COLLECTION")
                .unwrap_or(defaults.metadata_collection),
            filters_cache_collection: env::var("FILTERS_CACHE_COLLECTION")
                .unwrap_or(defaults.filters_cache_collection),
            batch_size,
            memory_warn_mb: parse_var("MEMORY_WARN_THRESHOLD_MB")?
                .unwrap_or(defaults.memory_warn_mb),
            replace_strategy,
            stamp_last_updated: parse_var("STAMP_LAST_UPDATED")?
                .unwrap_or(defaults.stamp_last_updated),
        })
    }

    /// Name of the collection that receives batches under the staged swap
    pub fn staging_collection(&self) -> String {
        format!("{}_staging", self.metadata_collection)
    }

    /// Staging counterpart of the facet cache collection
    pub fn cache_staging_collection(&self) -> String {
        format!("{}_staging", self.filters_cache_collection)
    }
}

fn parse_var<T: std::str::FromStr>(name: &str) -> Result<Option<T>, ConfigError> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue(format!("{}='{}'", name, raw))),
        Err(_) => Ok(None),
    }
}
