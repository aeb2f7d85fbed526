//! SQLite store
//!
//! Same contract as the MongoDB store over plain tables: the source table
//! has nullable `category`, `subcategory`, `Categories`, `Country`, `State`
//! and `City` text columns, and each output table mirrors its document
//! fields one column each (facet lists as JSON arrays).
//!
//! Each grouping query runs exactly once, into a connection-local temp
//! table. The cursor then pages that snapshot by `rowid`, so it never holds
//! more than one page and later writes to the source cannot shift or repeat
//! rows mid-scan.

use super::{
    BatchOutcome, CollectionTarget, DocumentSink, FacetCursor, FilterStore, HierarchyCursor,
    StoreError,
};
use crate::config::PrecomputeConfig;
use crate::facets::{CategoryFacets, FacetField, FiltersCacheEntry};
use crate::hierarchy::{
    HierarchyRow, ABSENT_SENTINEL, CATEGORY_FIELD, SUBCATEGORY_FIELD, SUB_SUBCATEGORY_FIELD,
};
use crate::metadata::{FilterKind, FilterMetadata};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::types::Value;
use rusqlite::{params, CachedStatement, Connection, Row};
use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

const PAGE_SIZE: i64 = 1000;

const HIERARCHY_SNAPSHOT: &str = "hierarchy_scan";
const FACET_SNAPSHOT: &str = "facet_scan";

pub struct SqliteFilterStore {
    conn: Arc<Mutex<Connection>>,
    source_table: String,
    live_table: String,
    staging_table: String,
    cache_table: String,
    cache_staging_table: String,
}

impl SqliteFilterStore {
    /// Open the database and create the output tables if needed.
    ///
    /// The source table is not created here; it belongs to whatever loads
    /// the records.
    pub fn open(config: &PrecomputeConfig) -> Result<Self, StoreError> {
        let db_path = Path::new(&config.sqlite_path);
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    StoreError::Backend(format!(
                        "Failed to create database directory {}: {}",
                        parent.display(),
                        e
                    ))
                })?;
            }
        }

        let store = Self {
            conn: Arc::new(Mutex::new(Connection::open(db_path)?)),
            source_table: config.source_collection.clone(),
            live_table: config.metadata_collection.clone(),
            staging_table: config.staging_collection(),
            cache_table: config.filters_cache_collection.clone(),
            cache_staging_table: config.cache_staging_collection(),
        };

        {
            let conn = store.lock()?;
            conn.pragma_update(None, "journal_mode", "WAL")?;
            conn.execute_batch(&metadata_schema_sql(&store.live_table))?;
            conn.execute_batch(&metadata_schema_sql(&store.staging_table))?;
            conn.execute_batch(&cache_schema_sql(&store.cache_table))?;
            conn.execute_batch(&cache_schema_sql(&store.cache_staging_table))?;
        }

        log::info!("✅ SQLite store opened: {}", db_path.display());
        Ok(store)
    }

    fn metadata_table(&self, target: CollectionTarget) -> &str {
        match target {
            CollectionTarget::Live => &self.live_table,
            CollectionTarget::Staging => &self.staging_table,
        }
    }

    fn cache_table(&self, target: CollectionTarget) -> &str {
        match target {
            CollectionTarget::Live => &self.cache_table,
            CollectionTarget::Staging => &self.cache_staging_table,
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        lock_conn(&self.conn)
    }

    /// Read back every document in a metadata table, in insertion order.
    pub fn load_metadata(&self, target: CollectionTarget) -> Result<Vec<FilterMetadata>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT type, category, subcategory, value, count, lastUpdated FROM {} ORDER BY rowid",
            quote_ident(self.metadata_table(target))
        ))?;

        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, Option<String>>(1)?,
                row.get::<_, Option<String>>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, i64>(4)?,
                row.get::<_, Option<String>>(5)?,
            ))
        })?;

        let mut docs = Vec::new();
        for row in rows {
            let (kind, category, subcategory, value, count, last_updated) = row?;
            let kind = FilterKind::parse(&kind)
                .ok_or_else(|| StoreError::Decode(format!("unknown metadata type '{}'", kind)))?;
            docs.push(FilterMetadata {
                kind,
                category,
                subcategory,
                value,
                count,
                last_updated: last_updated.as_deref().map(parse_timestamp).transpose()?,
            });
        }
        Ok(docs)
    }

    /// Read back every facet cache entry, in insertion order.
    pub fn load_filters_cache(&self, target: CollectionTarget) -> Result<Vec<FiltersCacheEntry>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT category, {}, lastUpdated FROM {} ORDER BY rowid",
            facet_columns(),
            quote_ident(self.cache_table(target))
        ))?;

        let rows = stmt.query_map([], |row| {
            let mut lists = Vec::with_capacity(FacetField::ALL.len());
            for i in 0..FacetField::ALL.len() {
                lists.push(row.get::<_, String>(i + 1)?);
            }
            Ok((
                row.get::<_, String>(0)?,
                lists,
                row.get::<_, String>(FacetField::ALL.len() + 1)?,
            ))
        })?;

        let mut entries = Vec::new();
        for row in rows {
            let (category, lists, last_updated) = row?;
            let mut decoded = Vec::with_capacity(lists.len());
            for raw in &lists {
                let values: Vec<String> = serde_json::from_str(raw)
                    .map_err(|e| StoreError::Decode(format!("bad facet list '{}': {}", raw, e)))?;
                decoded.push(values);
            }
            let mut decoded = decoded.into_iter();
            let mut next = || decoded.next().unwrap_or_default();
            entries.push(FiltersCacheEntry {
                category,
                sub_categories: next(),
                sub_sub_categories: next(),
                countries: next(),
                states: next(),
                cities: next(),
                last_updated: parse_timestamp(&last_updated)?,
            });
        }
        Ok(entries)
    }

    fn clear_table(&self, table: &str) -> Result<u64, StoreError> {
        let conn = self.lock()?;
        let deleted = conn.execute(&format!("DELETE FROM {}", quote_ident(table)), [])?;
        Ok(deleted as u64)
    }

    /// Drop `live`, rename `staging` over it and recreate an empty staging
    /// table, all in one transaction.
    fn promote_table(&self, live: &str, staging: &str, schema: fn(&str) -> String) -> Result<(), StoreError> {
        let sql = format!(
            "BEGIN IMMEDIATE;
             DROP TABLE IF EXISTS {live};
             ALTER TABLE {staging} RENAME TO {live};
             DROP INDEX IF EXISTS {staging_index};
             {live_schema}
             {staging_schema}
             COMMIT;",
            live = quote_ident(live),
            staging = quote_ident(staging),
            staging_index = quote_ident(&format!("{}_key", staging)),
            live_schema = schema(live),
            staging_schema = schema(staging),
        );

        let conn = self.lock()?;
        if let Err(e) = conn.execute_batch(&sql) {
            // Leave the connection usable; the live table is untouched
            let _ = conn.execute_batch("ROLLBACK");
            return Err(e.into());
        }
        Ok(())
    }
}

fn lock_conn(conn: &Arc<Mutex<Connection>>) -> Result<MutexGuard<'_, Connection>, StoreError> {
    conn.lock()
        .map_err(|_| StoreError::Backend("SQLite connection mutex poisoned".to_string()))
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|at| at.with_timezone(&Utc))
        .map_err(|e| StoreError::Decode(format!("bad lastUpdated '{}': {}", raw, e)))
}

fn facet_columns() -> String {
    FacetField::ALL
        .iter()
        .map(|field| quote_ident(field.as_str()))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Table plus a uniqueness index on the document key, so a duplicate key is
/// rejected per row rather than silently doubled.
fn metadata_schema_sql(table: &str) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {table} (
            type TEXT NOT NULL,
            category TEXT,
            subcategory TEXT,
            value TEXT NOT NULL,
            count INTEGER NOT NULL,
            lastUpdated TEXT
        );
        CREATE UNIQUE INDEX IF NOT EXISTS {index} ON {table}
            (type, IFNULL(category, ''), IFNULL(subcategory, ''), value);",
        table = quote_ident(table),
        index = quote_ident(&format!("{}_key", table)),
    )
}

/// One row per category; facet lists are stored as JSON arrays.
fn cache_schema_sql(table: &str) -> String {
    let lists = FacetField::ALL
        .iter()
        .map(|field| format!("{} TEXT NOT NULL", quote_ident(field.as_str())))
        .collect::<Vec<_>>()
        .join(",\n            ");
    format!(
        "CREATE TABLE IF NOT EXISTS {table} (
            category TEXT NOT NULL,
            {lists},
            lastUpdated TEXT NOT NULL
        );
        CREATE UNIQUE INDEX IF NOT EXISTS {index} ON {table} (category);",
        table = quote_ident(table),
        lists = lists,
        index = quote_ident(&format!("{}_key", table)),
    )
}

fn present_sql(column: &str) -> String {
    format!(
        "({col} IS NOT NULL AND {col} <> '{sentinel}')",
        col = quote_ident(column),
        sentinel = ABSENT_SENTINEL
    )
}

fn hierarchy_query(source_table: &str) -> String {
    let group = format!(
        "{}, {}, {}",
        quote_ident(CATEGORY_FIELD),
        quote_ident(SUBCATEGORY_FIELD),
        quote_ident(SUB_SUBCATEGORY_FIELD)
    );

    format!(
        "SELECT {group}, COUNT(*) AS count FROM {table}
         WHERE {c} OR {s} OR {ss}
         GROUP BY {group}
         ORDER BY {group}",
        group = group,
        table = quote_ident(source_table),
        c = present_sql(CATEGORY_FIELD),
        s = present_sql(SUBCATEGORY_FIELD),
        ss = present_sql(SUB_SUBCATEGORY_FIELD),
    )
}

/// Distinct (category, field, value) triples, plus one `(category, NULL,
/// NULL)` row per category so categories without any labels still appear.
fn facet_query(source_table: &str) -> String {
    let table = quote_ident(source_table);
    let category = quote_ident(CATEGORY_FIELD);
    let mut branches = vec![format!(
        "SELECT DISTINCT {category} AS category, NULL AS field, NULL AS value
         FROM {table} WHERE {present}",
        category = category,
        table = table,
        present = present_sql(CATEGORY_FIELD),
    )];
    for field in FacetField::ALL {
        branches.push(format!(
            "SELECT DISTINCT {category}, '{name}', {column} FROM {table}
             WHERE {category_present} AND {column_present}",
            category = category,
            name = field.as_str(),
            column = quote_ident(field.source_field()),
            table = table,
            category_present = present_sql(CATEGORY_FIELD),
            column_present = present_sql(field.source_field()),
        ));
    }

    format!(
        "SELECT category, field, value FROM ({}) ORDER BY category, field, value",
        branches.join(" UNION ALL ")
    )
}

// Non-text labels are treated like NULL.
fn text_label(value: Value) -> Option<String> {
    match value {
        Value::Text(s) => Some(s),
        _ => None,
    }
}

/// Keyset pager over a temp-table snapshot of one query result.
struct SnapshotPager {
    conn: Arc<Mutex<Connection>>,
    table: String,
    last_rowid: i64,
    exhausted: bool,
}

impl SnapshotPager {
    /// Materialize `select` into a fresh temp table. A missing source table
    /// or bad query fails here, before any row is read.
    fn create(conn: &Arc<Mutex<Connection>>, name: &str, select: &str) -> Result<Self, StoreError> {
        let table = format!("temp.{}", quote_ident(name));
        lock_conn(conn)?.execute_batch(&format!(
            "DROP TABLE IF EXISTS {table};
             CREATE TEMP TABLE {name} AS {select};",
            table = table,
            name = quote_ident(name),
            select = select,
        ))?;

        Ok(Self {
            conn: Arc::clone(conn),
            table,
            last_rowid: 0,
            exhausted: false,
        })
    }

    /// Next page of rows; columns are offset by one for the leading rowid.
    fn next_page<T>(
        &mut self,
        map: impl Fn(&Row<'_>) -> rusqlite::Result<T>,
    ) -> Result<Vec<T>, StoreError> {
        if self.exhausted {
            return Ok(Vec::new());
        }

        let conn = lock_conn(&self.conn)?;
        let mut page = Vec::new();
        {
            let mut stmt = conn.prepare_cached(&format!(
                "SELECT rowid, * FROM {} WHERE rowid > ?1 ORDER BY rowid LIMIT ?2",
                self.table
            ))?;
            let rows = stmt.query_map(params![self.last_rowid, PAGE_SIZE], |row| {
                Ok((row.get::<_, i64>(0)?, map(row)?))
            })?;
            for row in rows {
                let (rowid, item) = row?;
                self.last_rowid = rowid;
                page.push(item);
            }
        }

        if (page.len() as i64) < PAGE_SIZE {
            self.exhausted = true;
            conn.execute_batch(&format!("DROP TABLE IF EXISTS {}", self.table))?;
        }
        log::debug!("📥 Read {} snapshot rows, cursor now rowid={}", page.len(), self.last_rowid);
        Ok(page)
    }
}

impl Drop for SnapshotPager {
    fn drop(&mut self) {
        if self.exhausted {
            return;
        }
        // Skip cleanup rather than block; the next scan replaces the table anyway
        if let Ok(conn) = self.conn.try_lock() {
            let _ = conn.execute_batch(&format!("DROP TABLE IF EXISTS {}", self.table));
        }
    }
}

struct SqliteHierarchyCursor {
    pager: SnapshotPager,
    page: VecDeque<HierarchyRow>,
}

#[async_trait]
impl HierarchyCursor for SqliteHierarchyCursor {
    async fn next_row(&mut self) -> Result<Option<HierarchyRow>, StoreError> {
        if self.page.is_empty() {
            self.page = self
                .pager
                .next_page(|row| {
                    Ok(HierarchyRow {
                        category: text_label(row.get(1)?),
                        subcategory: text_label(row.get(2)?),
                        sub_subcategory: text_label(row.get(3)?),
                        count: row.get(4)?,
                    })
                })?
                .into();
        }
        Ok(self.page.pop_front())
    }
}

/// Folds the ordered (category, field, value) snapshot back into one
/// `CategoryFacets` per category.
struct SqliteFacetCursor {
    pager: SnapshotPager,
    page: VecDeque<(Option<String>, Option<String>, Option<String>)>,
    current: Option<CategoryFacets>,
}

#[async_trait]
impl FacetCursor for SqliteFacetCursor {
    async fn next_facets(&mut self) -> Result<Option<CategoryFacets>, StoreError> {
        loop {
            if self.page.is_empty() {
                self.page = self
                    .pager
                    .next_page(|row| {
                        Ok((
                            text_label(row.get(1)?),
                            text_label(row.get(2)?),
                            text_label(row.get(3)?),
                        ))
                    })?
                    .into();
            }

            let Some((category, field, value)) = self.page.pop_front() else {
                return Ok(self.current.take());
            };
            let Some(category) = category else {
                continue;
            };
            let field = match field {
                Some(raw) => Some(
                    FacetField::parse(&raw)
                        .ok_or_else(|| StoreError::Decode(format!("unknown facet field '{}'", raw)))?,
                ),
                None => None,
            };

            let finished = match &self.current {
                Some(current) if current.category == category => None,
                _ => self.current.replace(CategoryFacets::new(&category)),
            };
            if let (Some(current), Some(field)) = (self.current.as_mut(), field) {
                current.insert(field, value.as_deref());
            }
            if finished.is_some() {
                return Ok(finished);
            }
        }
    }
}

/// Run each row insert inside one transaction, counting rows the database
/// rejects instead of failing the batch.
fn insert_each<D>(
    conn: &mut Connection,
    sql: &str,
    docs: &[D],
    insert: impl Fn(&mut CachedStatement<'_>, &D) -> rusqlite::Result<usize>,
    describe: impl Fn(&D) -> String,
) -> Result<BatchOutcome, StoreError> {
    let tx = conn.transaction()?;
    let mut outcome = BatchOutcome::default();
    {
        let mut stmt = tx.prepare_cached(sql)?;
        for doc in docs {
            match insert(&mut stmt, doc) {
                Ok(_) => outcome.inserted += 1,
                Err(e) => {
                    outcome.failed += 1;
                    log::warn!("⚠️  Rejected {}: {}", describe(doc), e);
                }
            }
        }
    }
    tx.commit()?;
    Ok(outcome)
}

#[async_trait]
impl DocumentSink<FilterMetadata> for SqliteFilterStore {
    async fn clear(&mut self, target: CollectionTarget) -> Result<u64, StoreError> {
        self.clear_table(self.metadata_table(target))
    }

    async fn insert_batch(
        &mut self,
        target: CollectionTarget,
        docs: &[FilterMetadata],
    ) -> Result<BatchOutcome, StoreError> {
        let sql = format!(
            "INSERT INTO {} (type, category, subcategory, value, count, lastUpdated)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            quote_ident(self.metadata_table(target))
        );

        let mut conn = self.lock()?;
        insert_each(
            &mut conn,
            &sql,
            docs,
            |stmt, doc| {
                stmt.execute(params![
                    doc.kind.as_str(),
                    doc.category,
                    doc.subcategory,
                    doc.value,
                    doc.count,
                    doc.last_updated.map(|at| at.to_rfc3339()),
                ])
            },
            |doc| {
                format!(
                    "{} '{}' ({:?}/{:?})",
                    doc.kind.as_str(),
                    doc.value,
                    doc.category,
                    doc.subcategory
                )
            },
        )
    }

    async fn promote_staging(&mut self) -> Result<(), StoreError> {
        self.promote_table(&self.live_table, &self.staging_table, metadata_schema_sql)
    }
}

#[async_trait]
impl DocumentSink<FiltersCacheEntry> for SqliteFilterStore {
    async fn clear(&mut self, target: CollectionTarget) -> Result<u64, StoreError> {
        self.clear_table(self.cache_table(target))
    }

    async fn insert_batch(
        &mut self,
        target: CollectionTarget,
        docs: &[FiltersCacheEntry],
    ) -> Result<BatchOutcome, StoreError> {
        let sql = format!(
            "INSERT INTO {} (category, {}, lastUpdated) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            quote_ident(self.cache_table(target)),
            facet_columns()
        );

        let mut conn = self.lock()?;
        insert_each(
            &mut conn,
            &sql,
            docs,
            |stmt, entry| {
                let mut lists = Vec::with_capacity(FacetField::ALL.len());
                for field in FacetField::ALL {
                    let json = serde_json::to_string(entry.values(field))
                        .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;
                    lists.push(json);
                }
                stmt.execute(params![
                    entry.category,
                    lists[0],
                    lists[1],
                    lists[2],
                    lists[3],
                    lists[4],
                    entry.last_updated.to_rfc3339(),
                ])
            },
            |entry| format!("filters cache entry '{}'", entry.category),
        )
    }

    async fn promote_staging(&mut self) -> Result<(), StoreError> {
        self.promote_table(&self.cache_table, &self.cache_staging_table, cache_schema_sql)
    }
}

#[async_trait]
impl FilterStore for SqliteFilterStore {
    async fn open_hierarchy_cursor(&mut self) -> Result<Box<dyn HierarchyCursor>, StoreError> {
        let pager = SnapshotPager::create(&self.conn, HIERARCHY_SNAPSHOT, &hierarchy_query(&self.source_table))?;
        Ok(Box::new(SqliteHierarchyCursor {
            pager,
            page: VecDeque::new(),
        }))
    }

    async fn open_facet_cursor(&mut self) -> Result<Box<dyn FacetCursor>, StoreError> {
        let pager = SnapshotPager::create(&self.conn, FACET_SNAPSHOT, &facet_query(&self.source_table))?;
        Ok(Box::new(SqliteFacetCursor {
            pager,
            page: VecDeque::new(),
            current: None,
        }))
    }

    async fn close(self) -> Result<(), StoreError> {
        let conn = Arc::try_unwrap(self.conn)
            .map_err(|_| StoreError::Backend("SQLite connection still shared at close".to_string()))?
            .into_inner()
            .map_err(|_| StoreError::Backend("SQLite connection mutex poisoned".to_string()))?;
        conn.close().map_err(|(_, e)| StoreError::Sqlite(e))?;
        log::info!("🔌 SQLite store closed");
        Ok(())
    }

    fn backend_type(&self) -> &'static str {
        "SQLite"
    }
}
