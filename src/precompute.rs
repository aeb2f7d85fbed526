//! The precompute run: scan → rollup → replace
//!
//! ```text
//! FilterStore::open_hierarchy_cursor (grouped counts)
//!     ↓  one row at a time, memory sampled every batch_size rows
//! HierarchyRollup::add_row
//!     ↓
//! HierarchyRollup::into_documents
//!     ↓
//! MetadataWriter::replace_all (clear + unordered batches)
//! ```
//!
//! The facet cache pass has the same shape over `open_facet_cursor`,
//! `FacetRollup` and the `filtersCache` collection.
//!
//! Strictly sequential. Two runs against the same destination at once will
//! interleave deletes and inserts; the scheduler must not overlap them.

use crate::config::{PrecomputeConfig, ReplaceStrategy};
use crate::facets::FacetRollup;
use crate::memory_guard::MemoryGuard;
use crate::rollup::HierarchyRollup;
use crate::store::{CollectionTarget, FilterStore, StoreError};
use crate::writer::MetadataWriter;
use chrono::Utc;
use serde::Serialize;
use std::time::Instant;

/// Documents echoed at debug level before writing
const SAMPLE_DOCUMENTS: usize = 5;

#[derive(Debug)]
pub enum PrecomputeError {
    /// Could not reach the database
    Connect(StoreError),
    /// Aggregation or cursor failure; nothing has been written yet
    Scan(StoreError),
    Clear {
        target: CollectionTarget,
        source: StoreError,
    },
    /// A batch failed as a whole; earlier batches stay written
    Write {
        target: CollectionTarget,
        inserted: u64,
        source: StoreError,
    },
    /// Staging could not be promoted; the live collection is unchanged
    Promote(StoreError),
}

impl PrecomputeError {
    /// Whether the live metadata collection may have been modified.
    pub fn destination_touched(&self) -> bool {
        match self {
            PrecomputeError::Connect(_) | PrecomputeError::Scan(_) | PrecomputeError::Promote(_) => false,
            PrecomputeError::Clear { target, .. } | PrecomputeError::Write { target, .. } => {
                *target == CollectionTarget::Live
            }
        }
    }
}

impl std::fmt::Display for PrecomputeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PrecomputeError::Connect(e) => write!(f, "Connection failed: {}", e),
            PrecomputeError::Scan(e) => write!(f, "Source aggregation failed: {}", e),
            PrecomputeError::Clear { target, source } => {
                write!(f, "Clearing {} metadata failed: {}", target.as_str(), source)
            }
            PrecomputeError::Write {
                target,
                inserted,
                source,
            } => write!(
                f,
                "Writing {} metadata failed after {} documents: {}",
                target.as_str(),
                inserted,
                source
            ),
            PrecomputeError::Promote(e) => write!(f, "Promoting staging metadata failed: {}", e),
        }
    }
}

impl std::error::Error for PrecomputeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PrecomputeError::Connect(e) | PrecomputeError::Scan(e) | PrecomputeError::Promote(e) => Some(e),
            PrecomputeError::Clear { source, .. } | PrecomputeError::Write { source, .. } => Some(source),
        }
    }
}

/// Logged as one JSON line when a run completes
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub backend: &'static str,
    pub strategy: &'static str,
    pub rows_scanned: u64,
    pub categories: usize,
    pub subcategories: usize,
    pub sub_subcategories: usize,
    pub documents_cleared: u64,
    pub documents_written: u64,
    pub documents_failed: u64,
    pub batches: u64,
    pub peak_memory_mb: f64,
    pub memory_warnings: u64,
    pub elapsed_ms: u64,
}

/// Logged as one JSON line when a facet cache run completes
#[derive(Debug, Clone, Serialize)]
pub struct CacheRunSummary {
    pub backend: &'static str,
    pub strategy: &'static str,
    pub categories: usize,
    pub documents_cleared: u64,
    pub documents_written: u64,
    pub documents_failed: u64,
    pub batches: u64,
    pub peak_memory_mb: f64,
    pub memory_warnings: u64,
    pub elapsed_ms: u64,
}

/// Stream the grouping query into a rollup.
///
/// The cursor is dropped before returning, on success or error.
pub async fn scan_hierarchy<S: FilterStore>(
    store: &mut S,
    guard: &mut MemoryGuard,
) -> Result<(HierarchyRollup, u64), StoreError> {
    let mut cursor = store.open_hierarchy_cursor().await?;
    let mut rollup = HierarchyRollup::new();
    let mut rows_scanned = 0u64;

    while let Some(row) = cursor.next_row().await? {
        rollup.add_row(&row);
        rows_scanned += 1;
        guard.maybe_sample(rows_scanned);
    }

    guard.sample();
    Ok((rollup, rows_scanned))
}

/// Run one full recompute-and-replace against an open store.
pub async fn run_precompute<S: FilterStore>(
    store: &mut S,
    config: &PrecomputeConfig,
) -> Result<RunSummary, PrecomputeError> {
    let started = Instant::now();
    let mut guard = MemoryGuard::new(config.memory_warn_mb, config.batch_size as u64);

    log::info!("📊 Precomputing all counts in a single pass ({})...", store.backend_type());
    let (rollup, rows_scanned) = scan_hierarchy(store, &mut guard)
        .await
        .map_err(PrecomputeError::Scan)?;

    if rollup.is_empty() {
        log::warn!("⚠️  No categories found in the source collection; metadata will be emptied");
    }

    let categories = rollup.category_counts.len();
    let subcategories = rollup.subcategory_counts.len();
    let sub_subcategories = rollup.sub_subcategory_counts.len();
    log::info!(
        "✅ Scanned {} grouped rows: {} categories, {} subcategories, {} sub-subcategories",
        rows_scanned,
        categories,
        subcategories,
        sub_subcategories
    );
    if categories > 0 && sub_subcategories == 0 {
        log::warn!("⚠️  No sub-subcategories found in any category");
    }

    let stamp = config.stamp_last_updated.then(Utc::now);
    let docs = rollup.into_documents(stamp);
    log::info!("📦 Total documents to insert: {}", docs.len());
    log_sample("filter", &docs);

    let writer = MetadataWriter::new(config.batch_size, config.replace_strategy);
    let report = writer.replace_all(store, &docs, &mut guard).await?;

    Ok(RunSummary {
        backend: store.backend_type(),
        strategy: config.replace_strategy.as_str(),
        rows_scanned,
        categories,
        subcategories,
        sub_subcategories,
        documents_cleared: report.cleared,
        documents_written: report.inserted,
        documents_failed: report.failed,
        batches: report.batches,
        peak_memory_mb: guard.peak_mb(),
        memory_warnings: guard.warnings(),
        elapsed_ms: started.elapsed().as_millis() as u64,
    })
}

/// Run, then close the store whatever the outcome.
pub async fn run_and_close<S: FilterStore>(
    mut store: S,
    config: &PrecomputeConfig,
) -> Result<RunSummary, PrecomputeError> {
    let result = run_precompute(&mut store, config).await;
    close_store(store).await;
    warn_if_partial(&result, config, &config.metadata_collection);
    result
}

/// Stream the facet query into a per-category rollup.
pub async fn scan_facets<S: FilterStore>(
    store: &mut S,
    guard: &mut MemoryGuard,
) -> Result<FacetRollup, StoreError> {
    let mut cursor = store.open_facet_cursor().await?;
    let mut rollup = FacetRollup::new();
    let mut read = 0u64;

    while let Some(facets) = cursor.next_facets().await? {
        rollup.add(facets);
        read += 1;
        guard.maybe_sample(read);
    }

    guard.sample();
    Ok(rollup)
}

/// Rebuild the per-category facet cache against an open store.
///
/// Every entry carries the run's start time as `lastUpdated`.
pub async fn run_filters_cache<S: FilterStore>(
    store: &mut S,
    config: &PrecomputeConfig,
) -> Result<CacheRunSummary, PrecomputeError> {
    let started = Instant::now();
    let stamp = Utc::now();
    let mut guard = MemoryGuard::new(config.memory_warn_mb, config.batch_size as u64);

    log::info!("📊 Collecting facet labels per category ({})...", store.backend_type());
    let rollup = scan_facets(store, &mut guard)
        .await
        .map_err(PrecomputeError::Scan)?;

    let categories = rollup.len();
    log::info!("✅ Found {} unique categories", categories);
    if rollup.is_empty() {
        log::warn!("⚠️  No categories found in the source collection; filters cache will be emptied");
    } else if rollup.lacks_sub_subcategories() {
        log::warn!("⚠️  No sub-subcategories found in any category");
    }

    let entries = rollup.into_entries(stamp);
    log_sample("filters cache", &entries);

    let writer = MetadataWriter::new(config.batch_size, config.replace_strategy);
    let report = writer.replace_all(store, &entries, &mut guard).await?;

    Ok(CacheRunSummary {
        backend: store.backend_type(),
        strategy: config.replace_strategy.as_str(),
        categories,
        documents_cleared: report.cleared,
        documents_written: report.inserted,
        documents_failed: report.failed,
        batches: report.batches,
        peak_memory_mb: guard.peak_mb(),
        memory_warnings: guard.warnings(),
        elapsed_ms: started.elapsed().as_millis() as u64,
    })
}

/// Facet cache run, then close the store whatever the outcome.
pub async fn run_filters_cache_and_close<S: FilterStore>(
    mut store: S,
    config: &PrecomputeConfig,
) -> Result<CacheRunSummary, PrecomputeError> {
    let result = run_filters_cache(&mut store, config).await;
    close_store(store).await;
    warn_if_partial(&result, config, &config.filters_cache_collection);
    result
}

async fn close_store<S: FilterStore>(store: S) {
    if let Err(e) = store.close().await {
        log::warn!("Failed to close store cleanly: {}", e);
    }
}

fn warn_if_partial<T>(result: &Result<T, PrecomputeError>, config: &PrecomputeConfig, collection: &str) {
    if let Err(e) = result {
        if e.destination_touched() && config.replace_strategy == ReplaceStrategy::InPlace {
            log::error!("❌ {} may be partially populated; rerun the job", collection);
        }
    }
}

fn log_sample<T: Serialize>(label: &str, docs: &[T]) {
    if !log::log_enabled!(log::Level::Debug) {
        return;
    }
    match serde_json::to_string(&docs[..docs.len().min(SAMPLE_DOCUMENTS)]) {
        Ok(json) => log::debug!("Sample {} data: {}", label, json),
        Err(e) => log::debug!("Could not serialize sample documents: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::facets::{CategoryFacets, FacetField};
    use crate::hierarchy::HierarchyRow;
    use crate::store::{BatchOutcome, DocumentSink, FacetCursor, HierarchyCursor};
    use async_trait::async_trait;
    use std::collections::VecDeque;

    struct RowCursor(VecDeque<HierarchyRow>);

    #[async_trait]
    impl HierarchyCursor for RowCursor {
        async fn next_row(&mut self) -> Result<Option<HierarchyRow>, StoreError> {
            Ok(self.0.pop_front())
        }
    }

    struct FacetsCursor(VecDeque<CategoryFacets>);

    #[async_trait]
    impl FacetCursor for FacetsCursor {
        async fn next_facets(&mut self) -> Result<Option<CategoryFacets>, StoreError> {
            Ok(self.0.pop_front())
        }
    }

    /// Serves fixed scan results and rejects one document per write batch.
    #[derive(Default)]
    struct RejectingStore {
        rows: Vec<HierarchyRow>,
        facets: Vec<CategoryFacets>,
        stored: u64,
    }

    #[async_trait]
    impl<D: Sync> DocumentSink<D> for RejectingStore {
        async fn clear(&mut self, _target: CollectionTarget) -> Result<u64, StoreError> {
            Ok(std::mem::take(&mut self.stored))
        }

        async fn insert_batch(
            &mut self,
            _target: CollectionTarget,
            docs: &[D],
        ) -> Result<BatchOutcome, StoreError> {
            let failed = docs.len().min(1) as u64;
            let inserted = docs.len() as u64 - failed;
            self.stored += inserted;
            Ok(BatchOutcome { inserted, failed })
        }

        async fn promote_staging(&mut self) -> Result<(), StoreError> {
            Ok(())
        }
    }

    #[async_trait]
    impl FilterStore for RejectingStore {
        async fn open_hierarchy_cursor(&mut self) -> Result<Box<dyn HierarchyCursor>, StoreError> {
            Ok(Box::new(RowCursor(self.rows.clone().into())))
        }

        async fn open_facet_cursor(&mut self) -> Result<Box<dyn FacetCursor>, StoreError> {
            Ok(Box::new(FacetsCursor(self.facets.clone().into())))
        }

        async fn close(self) -> Result<(), StoreError> {
            Ok(())
        }

        fn backend_type(&self) -> &'static str {
            "Rejecting"
        }
    }

    fn config(batch_size: usize) -> PrecomputeConfig {
        PrecomputeConfig {
            batch_size,
            ..PrecomputeConfig::default()
        }
    }

    #[tokio::test]
    async fn test_rejected_documents_reach_run_summary() {
        let mut store = RejectingStore {
            rows: vec![
                HierarchyRow::new(Some("A"), Some("X"), Some("Q"), 2),
                HierarchyRow::new(Some("A"), Some("Y"), None, 1),
                HierarchyRow::new(Some("B"), None, None, 4),
            ],
            ..Default::default()
        };

        // 2 categories + 2 subcategories + 1 sub-subcategory, batches of 2
        let summary = run_precompute(&mut store, &config(2)).await.unwrap();
        assert_eq!(summary.rows_scanned, 3);
        assert_eq!(summary.batches, 3);
        assert_eq!(summary.documents_failed, 3);
        assert_eq!(summary.documents_written, 2);
        assert_eq!(store.stored, 2);
    }

    #[tokio::test]
    async fn test_filters_cache_run_summary() {
        let mut food = CategoryFacets::new("Food");
        food.insert(FacetField::Cities, Some("Leeds"));
        let store = RejectingStore {
            facets: vec![food, CategoryFacets::new("Auto"), CategoryFacets::new("N/A")],
            ..Default::default()
        };

        let summary = run_filters_cache_and_close(store, &config(10)).await.unwrap();
        assert_eq!(summary.categories, 2);
        assert_eq!(summary.batches, 1);
        assert_eq!(summary.documents_written, 1);
        assert_eq!(summary.documents_failed, 1);
        assert_eq!(summary.strategy, "in_place");
    }

    #[test]
    fn test_destination_touched_by_phase() {
        let err = || StoreError::Backend("boom".to_string());

        assert!(!PrecomputeError::Connect(err()).destination_touched());
        assert!(!PrecomputeError::Scan(err()).destination_touched());
        assert!(!PrecomputeError::Promote(err()).destination_touched());
        assert!(PrecomputeError::Clear {
            target: CollectionTarget::Live,
            source: err()
        }
        .destination_touched());
        assert!(!PrecomputeError::Write {
            target: CollectionTarget::Staging,
            inserted: 10,
            source: err()
        }
        .destination_touched());
    }

    #[test]
    fn test_write_error_message_reports_progress() {
        let e = PrecomputeError::Write {
            target: CollectionTarget::Live,
            inserted: 20_000,
            source: StoreError::Backend("socket closed".to_string()),
        };
        assert_eq!(
            e.to_string(),
            "Writing live metadata failed after 20000 documents: Backend error: socket closed"
        );
    }
}
