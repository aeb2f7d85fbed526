//! Store backends for the precompute job
//!
//! A store owns the database handle and exposes what both passes need: lazy
//! cursors over the grouping queries, plus a `DocumentSink` per output
//! document type (destructive clear, unordered batch insert that tolerates
//! per-document failures, staging promotion).
//!
//! - `mongo` - production backend (`companies` → `filterMetadata`)
//! - `sqlite` - same contract over rusqlite tables, used for local runs and tests

pub mod mongo;
pub mod sqlite;

pub use mongo::MongoFilterStore;
pub use sqlite::SqliteFilterStore;

use crate::facets::{CategoryFacets, FiltersCacheEntry};
use crate::hierarchy::HierarchyRow;
use crate::metadata::FilterMetadata;
use async_trait::async_trait;

#[derive(Debug)]
pub enum StoreError {
    Mongo(mongodb::error::Error),
    Sqlite(rusqlite::Error),
    Decode(String),
    Backend(String),
}

impl From<mongodb::error::Error> for StoreError {
    fn from(err: mongodb::error::Error) -> Self {
        StoreError::Mongo(err)
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        StoreError::Sqlite(err)
    }
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Mongo(e) => write!(f, "MongoDB error: {}", e),
            StoreError::Sqlite(e) => write!(f, "SQLite error: {}", e),
            StoreError::Decode(msg) => write!(f, "Decode error: {}", msg),
            StoreError::Backend(msg) => write!(f, "Backend error: {}", msg),
        }
    }
}

impl std::error::Error for StoreError {}

/// Which metadata collection an operation targets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectionTarget {
    Live,
    Staging,
}

impl CollectionTarget {
    pub fn as_str(&self) -> &'static str {
        match self {
            CollectionTarget::Live => "live",
            CollectionTarget::Staging => "staging",
        }
    }
}

/// Result of one unordered batch insert
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    pub inserted: u64,
    pub failed: u64,
}

/// Lazy sequence of grouped-count rows. Dropping the cursor releases it.
#[async_trait]
pub trait HierarchyCursor: Send {
    /// Next row, or `None` once the result set is exhausted
    async fn next_row(&mut self) -> Result<Option<HierarchyRow>, StoreError>;
}

/// Lazy sequence of per-category label sets for the facet cache pass.
#[async_trait]
pub trait FacetCursor: Send {
    async fn next_facets(&mut self) -> Result<Option<CategoryFacets>, StoreError>;
}

/// Destination for one materialized document type, with a live and a
/// staging collection.
#[async_trait]
pub trait DocumentSink<D: Sync>: Send {
    /// Delete every document in the target collection. Returns how many went.
    async fn clear(&mut self, target: CollectionTarget) -> Result<u64, StoreError>;

    /// Insert without ordering guarantees. A document that fails to insert is
    /// counted in `failed` and does not stop the rest of the batch; only
    /// failures that affect the whole batch come back as `Err`.
    async fn insert_batch(&mut self, target: CollectionTarget, docs: &[D]) -> Result<BatchOutcome, StoreError>;

    /// Atomically replace the live collection with the staging collection.
    async fn promote_staging(&mut self) -> Result<(), StoreError>;
}

#[async_trait]
pub trait FilterStore: DocumentSink<FilterMetadata> + DocumentSink<FiltersCacheEntry> + Send {
    /// Run the grouping query over the source collection.
    ///
    /// Only records with at least one present hierarchy field are scanned;
    /// rows are grouped by equality on (category, subcategory, Categories).
    async fn open_hierarchy_cursor(&mut self) -> Result<Box<dyn HierarchyCursor>, StoreError>;

    /// Collect the distinct present labels per present category.
    async fn open_facet_cursor(&mut self) -> Result<Box<dyn FacetCursor>, StoreError>;

    /// Release the underlying connection.
    async fn close(self) -> Result<(), StoreError>
    where
        Self: Sized;

    /// Get backend type for logging
    fn backend_type(&self) -> &'static str;
}
