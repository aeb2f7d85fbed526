//! MongoDB store
//!
//! Reads grouped counts and per-category label sets from the source
//! collection with single `$match` + `$group` aggregations (disk spill
//! allowed) and writes both document sets with unordered `insert_many`.

use super::{
    BatchOutcome, CollectionTarget, DocumentSink, FacetCursor, FilterStore, HierarchyCursor,
    StoreError,
};
use crate::config::PrecomputeConfig;
use crate::facets::{CategoryFacets, FacetField, FiltersCacheEntry};
use crate::hierarchy::{
    HierarchyRow, ABSENT_SENTINEL, CATEGORY_FIELD, SUBCATEGORY_FIELD, SUB_SUBCATEGORY_FIELD,
};
use crate::metadata::FilterMetadata;
use async_trait::async_trait;
use futures::TryStreamExt;
use mongodb::bson::{self, doc, Bson, Document};
use mongodb::error::ErrorKind;
use mongodb::options::{AggregateOptions, ClientOptions, InsertManyOptions};
use mongodb::{Client, Collection, Cursor, Database};

const ID_CATEGORY: &str = "category";
const ID_SUBCATEGORY: &str = "subcategory";
const ID_SUB_SUBCATEGORY: &str = "subSubcategory";

/// Per-document failures logged individually before summarizing
const LOGGED_WRITE_ERRORS: usize = 5;

pub struct MongoFilterStore {
    client: Client,
    database: Database,
    source: Collection<Document>,
    live: Collection<Document>,
    staging: Collection<Document>,
    cache: Collection<Document>,
    cache_staging: Collection<Document>,
}

impl MongoFilterStore {
    /// Connect and ping the server so a bad endpoint fails before anything
    /// destructive happens.
    pub async fn connect(config: &PrecomputeConfig) -> Result<Self, StoreError> {
        let mut options = ClientOptions::parse(&config.mongo_uri).await?;
        options.server_selection_timeout = Some(config.server_selection_timeout);
        options.app_name = Some("precompute_filters".to_string());

        let client = Client::with_options(options)?;
        let database = client.database(&config.database);
        database.run_command(doc! { "ping": 1 }, None).await?;

        log::info!("✅ Connected to MongoDB database '{}'", config.database);

        Ok(Self {
            source: database.collection(&config.source_collection),
            live: database.collection(&config.metadata_collection),
            staging: database.collection(&config.staging_collection()),
            cache: database.collection(&config.filters_cache_collection),
            cache_staging: database.collection(&config.cache_staging_collection()),
            client,
            database,
        })
    }

    fn metadata_collection(&self, target: CollectionTarget) -> &Collection<Document> {
        match target {
            CollectionTarget::Live => &self.live,
            CollectionTarget::Staging => &self.staging,
        }
    }

    fn cache_collection(&self, target: CollectionTarget) -> &Collection<Document> {
        match target {
            CollectionTarget::Live => &self.cache,
            CollectionTarget::Staging => &self.cache_staging,
        }
    }

    async fn aggregate(&self, pipeline: Vec<Document>) -> Result<Cursor<Document>, StoreError> {
        let options = AggregateOptions::builder().allow_disk_use(true).build();
        Ok(self.source.aggregate(pipeline, options).await?)
    }

    /// `renameCollection` with `dropTarget`, atomic on the server.
    async fn rename_over(
        &self,
        staging: &Collection<Document>,
        live: &Collection<Document>,
    ) -> Result<(), StoreError> {
        let db_name = self.database.name();
        let command = doc! {
            "renameCollection": format!("{}.{}", db_name, staging.name()),
            "to": format!("{}.{}", db_name, live.name()),
            "dropTarget": true,
        };
        self.client.database("admin").run_command(command, None).await?;
        Ok(())
    }
}

/// `$match` on "at least one level present", then `$group` on the raw triple.
pub fn hierarchy_pipeline() -> Vec<Document> {
    let present = || doc! { "$nin": [Bson::Null, ABSENT_SENTINEL] };

    vec![
        doc! {
            "$match": {
                "$or": [
                    { CATEGORY_FIELD: present() },
                    { SUBCATEGORY_FIELD: present() },
                    { SUB_SUBCATEGORY_FIELD: present() },
                ]
            }
        },
        doc! {
            "$group": {
                "_id": {
                    ID_CATEGORY: format!("${}", CATEGORY_FIELD),
                    ID_SUBCATEGORY: format!("${}", SUBCATEGORY_FIELD),
                    ID_SUB_SUBCATEGORY: format!("${}", SUB_SUBCATEGORY_FIELD),
                },
                "count": { "$sum": 1 },
            }
        },
    ]
}

/// Decode one `$group` output document into a row.
pub fn decode_group_row(doc: &Document) -> Result<HierarchyRow, StoreError> {
    let id = doc
        .get_document("_id")
        .map_err(|e| StoreError::Decode(format!("group row without _id document: {}", e)))?;

    let count = match doc.get("count") {
        Some(Bson::Int32(n)) => i64::from(*n),
        Some(Bson::Int64(n)) => *n,
        Some(Bson::Double(n)) if n.fract() == 0.0 && n.abs() < i64::MAX as f64 => *n as i64,
        Some(Bson::Double(n)) => {
            return Err(StoreError::Decode(format!(
                "group row count is not a whole number: {}",
                n
            )))
        }
        other => {
            return Err(StoreError::Decode(format!(
                "group row count is not numeric: {:?}",
                other
            )))
        }
    };

    Ok(HierarchyRow {
        category: label(id, ID_CATEGORY),
        subcategory: label(id, ID_SUBCATEGORY),
        sub_subcategory: label(id, ID_SUB_SUBCATEGORY),
        count,
    })
}

// Non-string labels are treated like missing ones.
fn label(id: &Document, key: &str) -> Option<String> {
    match id.get(key) {
        Some(Bson::String(s)) => Some(s.clone()),
        None | Some(Bson::Null) | Some(Bson::Undefined) => None,
        Some(other) => {
            log::debug!("Ignoring non-string {} label: {:?}", key, other);
            None
        }
    }
}

/// Group by category, collect each label field as a set and strip absent
/// values from the sets.
pub fn facet_pipeline() -> Vec<Document> {
    let mut group = doc! { "_id": format!("${}", CATEGORY_FIELD) };
    let mut project = doc! { "_id": 0, "category": "$_id" };
    for field in FacetField::ALL {
        group.insert(field.as_str(), doc! { "$addToSet": format!("${}", field.source_field()) });
        project.insert(
            field.as_str(),
            doc! {
                "$filter": {
                    "input": format!("${}", field.as_str()),
                    "cond": {
                        "$and": [
                            { "$ne": ["$$this", Bson::Null] },
                            { "$ne": ["$$this", ABSENT_SENTINEL] },
                        ]
                    },
                }
            },
        );
    }

    vec![
        doc! { "$match": { CATEGORY_FIELD: { "$nin": [Bson::Null, ABSENT_SENTINEL], "$type": "string" } } },
        doc! { "$group": group },
        doc! { "$project": project },
    ]
}

/// Decode one projected facet document. Non-string labels are skipped.
pub fn decode_facets(doc: &Document) -> Result<CategoryFacets, StoreError> {
    let category = doc
        .get_str("category")
        .map_err(|e| StoreError::Decode(format!("facet row without string category: {}", e)))?;

    let mut facets = CategoryFacets::new(category);
    for field in FacetField::ALL {
        let Ok(values) = doc.get_array(field.as_str()) else {
            continue;
        };
        for value in values {
            facets.insert(field, value.as_str());
        }
    }
    Ok(facets)
}

pub fn to_bson_document(meta: &FilterMetadata) -> Document {
    let mut doc = doc! { "type": meta.kind.as_str() };
    if let Some(category) = &meta.category {
        doc.insert("category", category.as_str());
    }
    if let Some(subcategory) = &meta.subcategory {
        doc.insert("subcategory", subcategory.as_str());
    }
    doc.insert("value", meta.value.as_str());
    doc.insert("count", meta.count);
    if let Some(at) = meta.last_updated {
        doc.insert("lastUpdated", bson::DateTime::from_millis(at.timestamp_millis()));
    }
    doc
}

pub fn cache_to_bson_document(entry: &FiltersCacheEntry) -> Document {
    let mut doc = doc! { "category": entry.category.as_str() };
    for field in FacetField::ALL {
        doc.insert(field.as_str(), entry.values(field).to_vec());
    }
    doc.insert(
        "lastUpdated",
        bson::DateTime::from_millis(entry.last_updated.timestamp_millis()),
    );
    doc
}

/// Outcome of a batch where the server rejected `rejected` documents
/// individually; never reports more failures than documents sent.
pub fn partial_outcome(attempted: u64, rejected: usize) -> BatchOutcome {
    let failed = (rejected as u64).min(attempted);
    BatchOutcome {
        inserted: attempted - failed,
        failed,
    }
}

async fn insert_documents(
    collection: &Collection<Document>,
    documents: Vec<Document>,
) -> Result<BatchOutcome, StoreError> {
    if documents.is_empty() {
        return Ok(BatchOutcome::default());
    }

    let attempted = documents.len() as u64;
    let options = InsertManyOptions::builder().ordered(false).build();

    match collection.insert_many(documents, options).await {
        Ok(result) => Ok(BatchOutcome {
            inserted: result.inserted_ids.len() as u64,
            failed: 0,
        }),
        Err(e) => match e.kind.as_ref() {
            // Only per-document errors are tolerated; a write concern
            // failure says nothing reliable about what landed.
            ErrorKind::BulkWrite(failure) if failure.write_concern_error.is_none() => {
                let write_errors = failure.write_errors.as_deref().unwrap_or_default();
                for err in write_errors.iter().take(LOGGED_WRITE_ERRORS) {
                    log::warn!(
                        "⚠️  Document {} in batch rejected (code {}): {}",
                        err.index,
                        err.code,
                        err.message
                    );
                }
                Ok(partial_outcome(attempted, write_errors.len()))
            }
            _ => Err(StoreError::Mongo(e)),
        },
    }
}

struct MongoHierarchyCursor {
    cursor: Cursor<Document>,
}

#[async_trait]
impl HierarchyCursor for MongoHierarchyCursor {
    async fn next_row(&mut self) -> Result<Option<HierarchyRow>, StoreError> {
        match self.cursor.try_next().await? {
            Some(doc) => decode_group_row(&doc).map(Some),
            None => Ok(None),
        }
    }
}

struct MongoFacetCursor {
    cursor: Cursor<Document>,
}

#[async_trait]
impl FacetCursor for MongoFacetCursor {
    async fn next_facets(&mut self) -> Result<Option<CategoryFacets>, StoreError> {
        match self.cursor.try_next().await? {
            Some(doc) => decode_facets(&doc).map(Some),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl DocumentSink<FilterMetadata> for MongoFilterStore {
    async fn clear(&mut self, target: CollectionTarget) -> Result<u64, StoreError> {
        let result = self.metadata_collection(target).delete_many(doc! {}, None).await?;
        Ok(result.deleted_count)
    }

    async fn insert_batch(
        &mut self,
        target: CollectionTarget,
        docs: &[FilterMetadata],
    ) -> Result<BatchOutcome, StoreError> {
        let documents = docs.iter().map(to_bson_document).collect();
        insert_documents(self.metadata_collection(target), documents).await
    }

    async fn promote_staging(&mut self) -> Result<(), StoreError> {
        self.rename_over(&self.staging, &self.live).await
    }
}

#[async_trait]
impl DocumentSink<FiltersCacheEntry> for MongoFilterStore {
    async fn clear(&mut self, target: CollectionTarget) -> Result<u64, StoreError> {
        let result = self.cache_collection(target).delete_many(doc! {}, None).await?;
        Ok(result.deleted_count)
    }

    async fn insert_batch(
        &mut self,
        target: CollectionTarget,
        docs: &[FiltersCacheEntry],
    ) -> Result<BatchOutcome, StoreError> {
        let documents = docs.iter().map(cache_to_bson_document).collect();
        insert_documents(self.cache_collection(target), documents).await
    }

    async fn promote_staging(&mut self) -> Result<(), StoreError> {
        self.rename_over(&self.cache_staging, &self.cache).await
    }
}

#[async_trait]
impl FilterStore for MongoFilterStore {
    async fn open_hierarchy_cursor(&mut self) -> Result<Box<dyn HierarchyCursor>, StoreError> {
        let cursor = self.aggregate(hierarchy_pipeline()).await?;
        Ok(Box::new(MongoHierarchyCursor { cursor }))
    }

    async fn open_facet_cursor(&mut self) -> Result<Box<dyn FacetCursor>, StoreError> {
        let cursor = self.aggregate(facet_pipeline()).await?;
        Ok(Box::new(MongoFacetCursor { cursor }))
    }

    async fn close(self) -> Result<(), StoreError> {
        self.client.shutdown().await;
        log::info!("🔌 Disconnected from MongoDB");
        Ok(())
    }

    fn backend_type(&self) -> &'static str {
        "MongoDB"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pipeline_matches_any_present_level_and_groups_triple() {
        let pipeline = hierarchy_pipeline();
        assert_eq!(pipeline.len(), 2);

        let or = pipeline[0]
            .get_document("$match")
            .unwrap()
            .get_array("$or")
            .unwrap();
        assert_eq!(or.len(), 3);
        let first = or[0].as_document().unwrap();
        let nin = first.get_document("category").unwrap().get_array("$nin").unwrap();
        assert_eq!(nin, &vec![Bson::Null, Bson::String("N/A".to_string())]);

        let group = pipeline[1].get_document("$group").unwrap();
        let id = group.get_document("_id").unwrap();
        assert_eq!(id.get_str("category").unwrap(), "$category");
        assert_eq!(id.get_str("subcategory").unwrap(), "$subcategory");
        assert_eq!(id.get_str("subSubcategory").unwrap(), "$Categories");
        assert_eq!(group.get_document("count").unwrap().get_i32("$sum").unwrap(), 1);
    }

    #[test]
    fn test_decode_group_row() {
        let raw = doc! {
            "_id": { "category": "A", "subcategory": Bson::Null, "subSubcategory": 42 },
            "count": 7_i32,
        };
        let row = decode_group_row(&raw).unwrap();
        assert_eq!(row, HierarchyRow::new(Some("A"), None, None, 7));

        // Missing keys inside _id behave like nulls
        let sparse = doc! { "_id": { "subcategory": "X" }, "count": 3_i64 };
        let row = decode_group_row(&sparse).unwrap();
        assert_eq!(row, HierarchyRow::new(None, Some("X"), None, 3));
    }

    #[test]
    fn test_decode_rejects_malformed_rows() {
        assert!(decode_group_row(&doc! { "count": 1 }).is_err());
        assert!(decode_group_row(&doc! { "_id": {}, "count": "many" }).is_err());
    }

    #[test]
    fn test_decode_double_counts() {
        let whole = doc! { "_id": { "category": "A" }, "count": 4.0 };
        assert_eq!(decode_group_row(&whole).unwrap().count, 4);

        let fractional = doc! { "_id": { "category": "A" }, "count": 2.5 };
        assert!(matches!(decode_group_row(&fractional), Err(StoreError::Decode(_))));
        let huge = doc! { "_id": { "category": "A" }, "count": 1e300 };
        assert!(matches!(decode_group_row(&huge), Err(StoreError::Decode(_))));
        let nan = doc! { "_id": { "category": "A" }, "count": f64::NAN };
        assert!(matches!(decode_group_row(&nan), Err(StoreError::Decode(_))));
    }

    #[test]
    fn test_partial_outcome_counts_rejections() {
        assert_eq!(partial_outcome(10, 3), BatchOutcome { inserted: 7, failed: 3 });
        assert_eq!(partial_outcome(10, 0), BatchOutcome { inserted: 10, failed: 0 });
        // More reported errors than documents sent never underflows
        assert_eq!(partial_outcome(2, 5), BatchOutcome { inserted: 0, failed: 2 });
    }

    #[test]
    fn test_facet_pipeline_shape() {
        let pipeline = facet_pipeline();
        assert_eq!(pipeline.len(), 3);

        let matched = pipeline[0].get_document("$match").unwrap().get_document("category").unwrap();
        assert_eq!(matched.get_str("$type").unwrap(), "string");

        let group = pipeline[1].get_document("$group").unwrap();
        assert_eq!(group.get_str("_id").unwrap(), "$category");
        assert_eq!(
            group.get_document("countries").unwrap().get_str("$addToSet").unwrap(),
            "$Country"
        );
        assert_eq!(
            group.get_document("subSubCategories").unwrap().get_str("$addToSet").unwrap(),
            "$Categories"
        );

        let project = pipeline[2].get_document("$project").unwrap();
        assert_eq!(project.get_str("category").unwrap(), "$_id");
        for field in FacetField::ALL {
            assert!(project.get_document(field.as_str()).unwrap().contains_key("$filter"));
        }
    }

    #[test]
    fn test_decode_facets() {
        let raw = doc! {
            "category": "Food",
            "subCategories": ["Bakery", "N/A", Bson::Null],
            "countries": ["UK", 44],
            "cities": [],
        };
        let facets = decode_facets(&raw).unwrap();
        assert_eq!(facets.category, "Food");
        assert_eq!(facets.sub_categories.iter().collect::<Vec<_>>(), vec!["Bakery"]);
        assert_eq!(facets.countries.iter().collect::<Vec<_>>(), vec!["UK"]);
        assert!(facets.states.is_empty());

        assert!(decode_facets(&doc! { "category": 7 }).is_err());
    }

    #[test]
    fn test_bson_document_shape() {
        let doc = to_bson_document(&FilterMetadata::subcategory("A", "X", 2));
        assert_eq!(
            doc,
            doc! { "type": "subcategory", "category": "A", "value": "X", "count": 2_i64 }
        );

        let doc = to_bson_document(&FilterMetadata::category("A", 3));
        assert!(!doc.contains_key("category"));
        assert!(!doc.contains_key("lastUpdated"));
    }

    #[test]
    fn test_cache_bson_document_shape() {
        let at = chrono::DateTime::parse_from_rfc3339("2024-05-01T12:00:00Z")
            .unwrap()
            .with_timezone(&chrono::Utc);
        let entry = FiltersCacheEntry {
            category: "Food".to_string(),
            sub_categories: vec!["Bakery".to_string()],
            sub_sub_categories: Vec::new(),
            countries: vec!["UK".to_string()],
            states: Vec::new(),
            cities: vec!["Leeds".to_string()],
            last_updated: at,
        };
        assert_eq!(
            cache_to_bson_document(&entry),
            doc! {
                "category": "Food",
                "subCategories": ["Bakery"],
                "subSubCategories": [],
                "countries": ["UK"],
                "states": [],
                "cities": ["Leeds"],
                "lastUpdated": bson::DateTime::from_millis(at.timestamp_millis()),
            }
        );
    }
}
