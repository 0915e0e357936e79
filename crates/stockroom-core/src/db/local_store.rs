//! Local document store: the device's authoritative copy of every table

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tokio::sync::Mutex;

use crate::error::Result;
use crate::models::{document_str, Document, FIELD_ID, FIELD_UPDATED_AT};
use crate::util::{parse_timestamp, provisional_id, timestamp_now};

use super::Database;

/// Field-equality filter over documents.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Query {
    filters: Vec<(String, Value)>,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    /// Require `field == value`.
    #[must_use]
    pub fn eq(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filters.push((field.into(), value.into()));
        self
    }

    /// Whether `document` satisfies every filter.
    pub fn matches(&self, document: &Document) -> bool {
        self.filters
            .iter()
            .all(|(field, value)| document.get(field) == Some(value))
    }

    pub fn filters(&self) -> &[(String, Value)] {
        &self.filters
    }
}

/// Storage the engine reads from and writes to on the device.
///
/// Every call is atomic on its own; there is no cross-call transaction.
#[async_trait]
pub trait LocalStore: Send + Sync {
    /// All documents of `table`, possibly served from a read cache.
    async fn get_all(&self, table: &str) -> Result<Vec<Document>>;

    async fn get_by_id(&self, table: &str, id: &str) -> Result<Option<Document>>;

    /// Insert `document`, minting a provisional id when it has none. Returns the id.
    async fn insert(&self, table: &str, document: Document) -> Result<String>;

    /// Merge `partial` into the document. Returns `false` when `id` is unknown.
    async fn update(&self, table: &str, id: &str, partial: Document) -> Result<bool>;

    /// Returns `false` when `id` is unknown.
    async fn delete(&self, table: &str, id: &str) -> Result<bool>;

    async fn query(&self, table: &str, query: &Query) -> Result<Vec<Document>> {
        Ok(self
            .get_all(table)
            .await?
            .into_iter()
            .filter(|document| query.matches(document))
            .collect())
    }

    /// Drop cached reads for `table`, or for every table.
    fn invalidate_cache(&self, table: Option<&str>);
}

struct CachedTable {
    loaded_at: Instant,
    documents: Vec<Document>,
}

/// libSQL implementation of `LocalStore`
pub struct LibSqlLocalStore {
    db: Arc<Mutex<Database>>,
    cache: StdMutex<HashMap<String, CachedTable>>,
    cache_ttl: Duration,
}

impl LibSqlLocalStore {
    /// Create a store over a shared database handle
    pub fn new(db: Arc<Mutex<Database>>, cache_ttl: Duration) -> Self {
        Self {
            db,
            cache: StdMutex::new(HashMap::new()),
            cache_ttl,
        }
    }

    /// Open an in-memory store (tests and throwaway sessions)
    pub async fn open_in_memory(cache_ttl: Duration) -> Result<Self> {
        let db = Database::open_in_memory().await?;
        Ok(Self::new(Arc::new(Mutex::new(db)), cache_ttl))
    }

    fn cached(&self, table: &str) -> Option<Vec<Document>> {
        let cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        cache
            .get(table)
            .filter(|entry| entry.loaded_at.elapsed() < self.cache_ttl)
            .map(|entry| entry.documents.clone())
    }

    fn remember(&self, table: &str, documents: &[Document]) {
        if self.cache_ttl.is_zero() {
            return;
        }
        let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        cache.insert(
            table.to_string(),
            CachedTable {
                loaded_at: Instant::now(),
                documents: documents.to_vec(),
            },
        );
    }
}

fn parse_row_data(data: &str) -> Result<Document> {
    Ok(serde_json::from_str(data)?)
}

fn updated_at_millis(document: &Document) -> i64 {
    document
        .get(FIELD_UPDATED_AT)
        .and_then(parse_timestamp)
        .unwrap_or_else(Utc::now)
        .timestamp_millis()
}

#[async_trait]
impl LocalStore for LibSqlLocalStore {
    async fn get_all(&self, table: &str) -> Result<Vec<Document>> {
        if let Some(documents) = self.cached(table) {
            return Ok(documents);
        }

        let db = self.db.lock().await;
        let mut rows = db
            .connection()
            .query(
                "SELECT data FROM documents WHERE table_name = ?1 ORDER BY rowid",
                [table],
            )
            .await?;

        let mut documents = Vec::new();
        while let Some(row) = rows.next().await? {
            let data: String = row.get(0)?;
            documents.push(parse_row_data(&data)?);
        }
        drop(db);

        self.remember(table, &documents);
        Ok(documents)
    }

    async fn get_by_id(&self, table: &str, id: &str) -> Result<Option<Document>> {
        let db = self.db.lock().await;
        let mut rows = db
            .connection()
            .query(
                "SELECT data FROM documents WHERE table_name = ?1 AND id = ?2",
                [table, id],
            )
            .await?;

        match rows.next().await? {
            Some(row) => {
                let data: String = row.get(0)?;
                Ok(Some(parse_row_data(&data)?))
            }
            None => Ok(None),
        }
    }

    async fn insert(&self, table: &str, mut document: Document) -> Result<String> {
        let id = document_str(&document, FIELD_ID).map_or_else(provisional_id, str::to_string);
        document.insert(FIELD_ID.to_string(), Value::String(id.clone()));
        let data = serde_json::to_string(&document)?;

        let db = self.db.lock().await;
        db.connection()
            .execute(
                "INSERT INTO documents (table_name, id, data, updated_at) VALUES (?1, ?2, ?3, ?4)",
                libsql::params![table, id.as_str(), data, updated_at_millis(&document)],
            )
            .await?;
        drop(db);

        self.invalidate_cache(Some(table));
        tracing::debug!(table, id = %id, "Inserted local document");
        Ok(id)
    }

    async fn update(&self, table: &str, id: &str, partial: Document) -> Result<bool> {
        let db = self.db.lock().await;
        let mut rows = db
            .connection()
            .query(
                "SELECT data FROM documents WHERE table_name = ?1 AND id = ?2",
                [table, id],
            )
            .await?;

        let Some(row) = rows.next().await? else {
            tracing::debug!(table, id, "Update ignored, document not found");
            return Ok(false);
        };
        let data: String = row.get(0)?;
        let mut document = parse_row_data(&data)?;

        let stamped = partial.contains_key(FIELD_UPDATED_AT);
        document.extend(partial);
        document.insert(FIELD_ID.to_string(), Value::String(id.to_string()));
        if !stamped {
            document.insert(FIELD_UPDATED_AT.to_string(), timestamp_now());
        }

        let data = serde_json::to_string(&document)?;
        db.connection()
            .execute(
                "UPDATE documents SET data = ?1, updated_at = ?2 WHERE table_name = ?3 AND id = ?4",
                libsql::params![data, updated_at_millis(&document), table, id],
            )
            .await?;
        drop(db);

        self.invalidate_cache(Some(table));
        Ok(true)
    }

    async fn delete(&self, table: &str, id: &str) -> Result<bool> {
        let db = self.db.lock().await;
        let affected = db
            .connection()
            .execute(
                "DELETE FROM documents WHERE table_name = ?1 AND id = ?2",
                [table, id],
            )
            .await?;
        drop(db);

        self.invalidate_cache(Some(table));
        Ok(affected > 0)
    }

    fn invalidate_cache(&self, table: Option<&str>) {
        let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        match table {
            Some(table) => {
                cache.remove(table);
            }
            None => cache.clear(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn document(value: Value) -> Document {
        value.as_object().cloned().unwrap()
    }

    async fn setup(cache_ttl: Duration) -> (LibSqlLocalStore, Arc<Mutex<Database>>) {
        let db = Arc::new(Mutex::new(Database::open_in_memory().await.unwrap()));
        (LibSqlLocalStore::new(db.clone(), cache_ttl), db)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn insert_mints_provisional_id() {
        let (store, _) = setup(Duration::ZERO).await;
        let id = store
            .insert("products", document(json!({ "name": "Widget" })))
            .await
            .unwrap();

        assert!(crate::util::is_provisional_id(&id));
        let stored = store.get_by_id("products", &id).await.unwrap().unwrap();
        assert_eq!(stored.get("id"), Some(&json!(id)));
        assert_eq!(stored.get("name"), Some(&json!("Widget")));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn insert_keeps_supplied_id() {
        let (store, _) = setup(Duration::ZERO).await;
        let id = store
            .insert("products", document(json!({ "id": "Xk2v9QpLm3RtYb7Wc1Nd" })))
            .await
            .unwrap();
        assert_eq!(id, "Xk2v9QpLm3RtYb7Wc1Nd");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn update_merges_and_stamps() {
        let (store, _) = setup(Duration::ZERO).await;
        let id = store
            .insert("products", document(json!({ "name": "Widget", "price": 100 })))
            .await
            .unwrap();

        let updated = store
            .update("products", &id, document(json!({ "price": 120 })))
            .await
            .unwrap();
        assert!(updated);

        let stored = store.get_by_id("products", &id).await.unwrap().unwrap();
        assert_eq!(stored.get("name"), Some(&json!("Widget")));
        assert_eq!(stored.get("price"), Some(&json!(120)));
        assert!(stored.get("updated_at").and_then(parse_timestamp).is_some());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn update_keeps_supplied_timestamp() {
        let (store, _) = setup(Duration::ZERO).await;
        let id = store
            .insert("stock", document(json!({ "quantity_current": 3 })))
            .await
            .unwrap();
        store
            .update(
                "stock",
                &id,
                document(json!({ "updated_at": "2024-01-01T00:00:00.000Z" })),
            )
            .await
            .unwrap();

        let stored = store.get_by_id("stock", &id).await.unwrap().unwrap();
        assert_eq!(stored.get("updated_at"), Some(&json!("2024-01-01T00:00:00.000Z")));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn update_and_delete_ignore_unknown_ids() {
        let (store, _) = setup(Duration::ZERO).await;
        assert!(!store
            .update("products", "missing", Document::new())
            .await
            .unwrap());
        assert!(!store.delete("products", "missing").await.unwrap());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn query_filters_by_field_equality() {
        let (store, _) = setup(Duration::ZERO).await;
        store
            .insert("stock", document(json!({ "product_id": "p1", "location_id": "l1" })))
            .await
            .unwrap();
        store
            .insert("stock", document(json!({ "product_id": "p2", "location_id": "l1" })))
            .await
            .unwrap();

        let found = store
            .query("stock", &Query::new().eq("product_id", "p2"))
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].get("product_id"), Some(&json!("p2")));

        let all = store
            .query("stock", &Query::new().eq("location_id", "l1"))
            .await
            .unwrap();
        assert_eq!(all.len(), 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn get_all_serves_cache_until_invalidated() {
        let (store, db) = setup(Duration::from_secs(60)).await;
        store
            .insert("products", document(json!({ "name": "Widget" })))
            .await
            .unwrap();
        assert_eq!(store.get_all("products").await.unwrap().len(), 1);

        // Write behind the store's back
        db.lock()
            .await
            .connection()
            .execute(
                "INSERT INTO documents (table_name, id, data, updated_at) VALUES ('products', 'x', '{\"id\":\"x\"}', 0)",
                (),
            )
            .await
            .unwrap();

        assert_eq!(store.get_all("products").await.unwrap().len(), 1);
        store.invalidate_cache(None);
        assert_eq!(store.get_all("products").await.unwrap().len(), 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn tables_are_isolated() {
        let (store, _) = setup(Duration::ZERO).await;
        store
            .insert("products", document(json!({ "id": "shared-id-123" })))
            .await
            .unwrap();
        store
            .insert("categories", document(json!({ "id": "shared-id-123" })))
            .await
            .unwrap();

        assert!(store.delete("products", "shared-id-123").await.unwrap());
        assert!(store
            .get_by_id("categories", "shared-id-123")
            .await
            .unwrap()
            .is_some());
    }
}
