//! Filter metadata precompute
//!
//! Recomputes how source records distribute across the category →
//! subcategory → sub-subcategory hierarchy and materializes the counts as
//! `filterMetadata` documents for the facet UI.
//!
//! # Architecture
//!
//! ```text
//! companies ($match + $group, allowDiskUse) → HierarchyCursor
//!     ↓
//! HierarchyRollup (three keyed totals, MemoryGuard sampling)
//!     ↓
//! MetadataWriter → filterMetadata (clear + unordered batches)
//! ```
//!
//! A second pass (`populate_filters_cache`) collects the distinct
//! subcategory, sub-subcategory and location labels per category into
//! `filtersCache` through the same store and writer.

pub mod config;
pub mod facets;
pub mod hierarchy;
pub mod memory_guard;
pub mod metadata;
pub mod precompute;
pub mod rollup;
pub mod store;
pub mod writer;

pub use config::{BackendType, ConfigError, PrecomputeConfig, ReplaceStrategy};
pub use facets::{CategoryFacets, FacetField, FacetRollup, FiltersCacheEntry};
pub use hierarchy::HierarchyRow;
pub use memory_guard::MemoryGuard;
pub use metadata::{FilterKind, FilterMetadata};
pub use precompute::{
    run_and_close, run_filters_cache, run_filters_cache_and_close, run_precompute,
    CacheRunSummary, PrecomputeError, RunSummary,
};
pub use rollup::HierarchyRollup;
pub use store::{DocumentSink, FilterStore, MongoFilterStore, SqliteFilterStore, StoreError};
pub use writer::{MetadataWriter, WriteReport};
