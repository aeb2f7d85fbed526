//! Populate Filters Cache Binary - per-category facet label lists
//!
//! Collects, for every category, the distinct subcategories,
//! sub-subcategories, countries, states and cities seen on its records and
//! replaces the filters cache collection. Takes no arguments.
//!
//! ## Usage
//!
//! ```bash
//! cargo run --release --bin populate_filters_cache
//! ```
//!
//! ## Environment Variables
//!
//! Same as `precompute_filters`, plus:
//!
//! - FILTERS_CACHE_COLLECTION - Destination collection (default: filtersCache)

use precompute_filters::{
    run_filters_cache_and_close, BackendType, CacheRunSummary, MongoFilterStore, PrecomputeConfig,
    PrecomputeError, SqliteFilterStore,
};
use std::process::ExitCode;

async fn run(config: &PrecomputeConfig) -> Result<CacheRunSummary, PrecomputeError> {
    match config.backend {
        BackendType::Mongo => {
            let store = MongoFilterStore::connect(config)
                .await
                .map_err(PrecomputeError::Connect)?;
            run_filters_cache_and_close(store, config).await
        }
        BackendType::Sqlite => {
            let store = SqliteFilterStore::open(config).map_err(PrecomputeError::Connect)?;
            run_filters_cache_and_close(store, config).await
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

    log::info!("🚀 Populating filters cache...");
    log::info!("   Backend: {:?}", config.backend);
    log::info!(
        "   Source: {} → {}",
        config.source_collection,
        config.filters_cache_collection
    );
    log::info!("   Replace strategy: {}", config.replace_strategy.as_str());

    match run(&config).await {
        Ok(summary) => {
            match serde_json::to_string(&summary) {
                Ok(json) => log::info!("📈 Run summary: {}", json),
                Err(e) => log::warn!("Could not serialize run summary: {}", e),
            }
            log::info!("✅ Filters cache populated successfully");
            ExitCode::SUCCESS
        }
        Err(e) => {
            log::error!("❌ Error populating filters cache: {}", e);
            ExitCode::FAILURE
        }
    }
}
