//! Precompute Filters Binary - full recompute of filter facet counts
//!
//! Scans the source collection, rolls counts up the category hierarchy and
//! replaces the metadata collection. Takes no arguments.
//!
//! ## Usage
//!
//! ```bash
//! cargo run --release --bin precompute_filters
//! ```
//!
//! ## Environment Variables
//!
//! - FILTERS_BACKEND - `mongo` or `sqlite` (default: mongo)
//! - MONGO_URI - MongoDB connection string (default: mongodb://127.0.0.1:27017/DataSellingProject)
//! - MONGO_DATABASE - Database name (default: DataSellingProject)
//! - FILTERS_SQLITE_PATH - SQLite database path (default: data/filters.db)
//! - SOURCE_COLLECTION / METADATA_COLLECTION - (default: companies / filterMetadata)
//! - PRECOMPUTE_BATCH_SIZE - Insert batch and memory sampling block (default: 10000)
//! - MEMORY_WARN_THRESHOLD_MB - Memory warning threshold (default: 256)
//! - REPLACE_STRATEGY - `in_place` or `staged_swap` (default: in_place)
//! - STAMP_LAST_UPDATED - Add lastUpdated to every document (default: false)
//! - RUST_LOG - Logging level (optional, default: info)

use precompute_filters::{
    run_and_close, BackendType, MongoFilterStore, PrecomputeConfig, PrecomputeError, RunSummary,
    SqliteFilterStore,
};
use std::process::ExitCode;

async fn run(config: &PrecomputeConfig) -> Result<RunSummary, PrecomputeError> {
    match config.backend {
        BackendType::Mongo => {
            let store = MongoFilterStore::connect(config)
                .await
                .map_err(PrecomputeError::Connect)?;
            run_and_close(store, config).await
        }
        BackendType::Sqlite => {
            let store = SqliteFilterStore::open(config).map_err(PrecomputeError::Connect)?;
            run_and_close(store, config).await
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenv::dotenv().ok();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(env_logger::Target::Stderr)
        .init();

    let config = match PrecomputeConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            log::error!("❌ {}", e);
            return ExitCode::FAILURE;
        }
    };

    log::info!("🚀 Starting precomputation of filters...");
    log::info!("   Backend: {:?}", config.backend);
    log::info!(
        "   Source: {} → {}",
        config.source_collection,
        config.metadata_collection
    );
    log::info!("   Batch size: {}", config.batch_size);
    log::info!("   Memory warning threshold: {}MB", config.memory_warn_mb);
    log::info!("   Replace strategy: {}", config.replace_strategy.as_str());

    match run(&config).await {
        Ok(summary) => {
            match serde_json::to_string(&summary) {
                Ok(json) => log::info!("📈 Run summary: {}", json),
                Err(e) => log::warn!("Could not serialize run summary: {}", e),
            }
            log::info!("✅ Precomputation completed successfully");
            ExitCode::SUCCESS
        }
        Err(e) => {
            log::error!("❌ Error during precomputation: {}", e);
            ExitCode::FAILURE
        }
    }
}
