//! Persistent queue store: one SQLite table per named store, keyed by the
//! operation id and indexed on `queued_at` and `next_attempt_at`.

use std::sync::Arc;

use super::types::{Body, Headers, QueuedOperation, StoreError};
use crate::config::StoreConfig;
use crate::crypto::HeaderCipher;
use crate::db::schema::{queue_table, QueuedOperationRow};
use crate::db::{Database, DbError};

/// A stored row that can no longer be decoded, for example headers sealed
/// under a key that is not configured any more.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorruptRecord {
    pub id: String,
    pub endpoint: String,
    pub method: String,
    pub attempts: u32,
    pub reason: String,
}

/// Result of reading a whole store.
#[derive(Debug, Default)]
pub struct StoreScan {
    pub records: Vec<QueuedOperation>,
    pub corrupt: Vec<CorruptRecord>,
}

pub struct QueueStore {
    db: Option<Arc<Database>>,
    store_name: String,
    table: String,
    cipher: Option<HeaderCipher>,
}

impl QueueStore {
    /// Open the configured database and store. When storage itself is not
    /// usable the store comes back degraded instead of failing, so callers keep
    /// working without offline support. Configuration mistakes still error.
    pub async fn init(config: &StoreConfig) -> Result<Self, DbError> {
        match Database::open(config).await {
            Ok(db) => Ok(Self::available(Arc::new(db), &config.store_name)),
            Err(e @ (DbError::InvalidStoreName(_) | DbError::VersionDowngrade { .. })) => Err(e),
            Err(e) => {
                tracing::warn!(
                    "Persistent storage unavailable for {}/{}, running without offline queue: {}",
                    config.name,
                    config.store_name,
                    e
                );
                Ok(Self::unavailable(&config.store_name))
            }
        }
    }

    /// Use an already-open database, creating the configured stores if needed.
    pub async fn attach(db: Arc<Database>, config: &StoreConfig) -> Result<Self, DbError> {
        db.ensure_stores(config).await?;
        Ok(Self::available(db, &config.store_name))
    }

    fn available(db: Arc<Database>, store_name: &str) -> Self {
        Self {
            db: Some(db),
            store_name: store_name.to_string(),
            table: queue_table(store_name),
            cipher: None,
        }
    }

    pub fn unavailable(store_name: &str) -> Self {
        Self {
            db: None,
            store_name: store_name.to_string(),
            table: queue_table(store_name),
            cipher: None,
        }
    }

    pub fn with_cipher(mut self, cipher: HeaderCipher) -> Self {
        self.cipher = Some(cipher);
        self
    }

    pub fn is_available(&self) -> bool {
        self.db.is_some()
    }

    pub fn database(&self) -> Option<&Arc<Database>> {
        self.db.as_ref()
    }

    pub fn store_name(&self) -> &str {
        &self.store_name
    }

    pub fn db_name(&self) -> &str {
        self.db.as_ref().map(|db| db.name()).unwrap_or("unavailable")
    }

    /// Insert or replace by id. Replacing keeps the record's original position
    /// in the enqueue-order tiebreak.
    pub async fn put(&self, op: &QueuedOperation) -> Result<(), StoreError> {
        let Some(db) = &self.db else {
            tracing::warn!("Store {} unavailable, dropping write for {}", self.store_name, op.id);
            return Ok(());
        };
        let row = self.to_row(op)?;

        let sql = format!(
            r#"
            INSERT INTO {} (id, endpoint, method, headers, body, body_kind, queued_at, attempts, last_error, next_attempt_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                endpoint = excluded.endpoint,
                method = excluded.method,
                headers = excluded.headers,
                body = excluded.body,
                body_kind = excluded.body_kind,
                queued_at = excluded.queued_at,
                attempts = excluded.attempts,
                last_error = excluded.last_error,
                next_attempt_at = excluded.next_attempt_at
            "#,
            self.table
        );

        sqlx::query(&sql)
            .bind(&row.id)
            .bind(&row.endpoint)
            .bind(&row.method)
            .bind(&row.headers)
            .bind(&row.body)
            .bind(&row.body_kind)
            .bind(row.queued_at)
            .bind(row.attempts)
            .bind(&row.last_error)
            .bind(row.next_attempt_at)
            .execute(db.pool())
            .await?;

        Ok(())
    }

    pub async fn get(&self, id: &str) -> Result<Option<QueuedOperation>, StoreError> {
        let Some(db) = &self.db else {
            return Ok(None);
        };
        let sql = format!("SELECT * FROM {} WHERE id = ?", self.table);
        let row: Option<QueuedOperationRow> = sqlx::query_as(&sql)
            .bind(id)
            .fetch_optional(db.pool())
            .await?;

        row.map(|r| self.from_row(r)).transpose()
    }

    /// Every decodable record, earliest deadline first, then enqueue order.
    /// Rows that fail to decode are skipped; see [`QueueStore::scan`].
    pub async fn get_all(&self) -> Result<Vec<QueuedOperation>, StoreError> {
        let scan = self.scan().await?;
        for bad in &scan.corrupt {
            tracing::warn!("Skipping unreadable record {} in {}: {}", bad.id, self.store_name, bad.reason);
        }
        Ok(scan.records)
    }

    /// Read every row in flush order, separating the ones that decode from the
    /// ones that do not.
    pub async fn scan(&self) -> Result<StoreScan, StoreError> {
        let Some(db) = &self.db else {
            return Ok(StoreScan::default());
        };
        let sql = format!(
            "SELECT * FROM {} ORDER BY next_attempt_at ASC, queued_at ASC, rowid ASC",
            self.table
        );
        let rows: Vec<QueuedOperationRow> = sqlx::query_as(&sql).fetch_all(db.pool()).await?;

        let mut scan = StoreScan::default();
        for row in rows {
            let bad = CorruptRecord {
                id: row.id.clone(),
                endpoint: row.endpoint.clone(),
                method: row.method.clone(),
                attempts: row.attempts.max(0) as u32,
                reason: String::new(),
            };
            match self.from_row(row) {
                Ok(op) => scan.records.push(op),
                Err(StoreError::Corrupted { reason, .. }) => scan.corrupt.push(CorruptRecord { reason, ..bad }),
                Err(e) => scan.corrupt.push(CorruptRecord {
                    reason: e.to_string(),
                    ..bad
                }),
            }
        }
        Ok(scan)
    }

    pub async fn delete(&self, id: &str) -> Result<bool, StoreError> {
        let Some(db) = &self.db else {
            return Ok(false);
        };
        let sql = format!("DELETE FROM {} WHERE id = ?", self.table);
        let result = sqlx::query(&sql).bind(id).execute(db.pool()).await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn count(&self) -> Result<usize, StoreError> {
        let Some(db) = &self.db else {
            return Ok(0);
        };
        let sql = format!("SELECT COUNT(*) FROM {}", self.table);
        let (count,): (i64,) = sqlx::query_as(&sql).fetch_one(db.pool()).await?;
        Ok(count as usize)
    }

    fn to_row(&self, op: &QueuedOperation) -> Result<QueuedOperationRow, StoreError> {
        let headers_json = serde_json::to_string(&op.headers)?;
        let headers = match &self.cipher {
            Some(cipher) => cipher.seal(&headers_json)?,
            None => headers_json,
        };

        let (body, body_kind) = match &op.body {
            Some(body) => (Some(body.to_wire()?), body.kind().to_string()),
            None => (None, "none".to_string()),
        };

        Ok(QueuedOperationRow {
            id: op.id.clone(),
            endpoint: op.endpoint.clone(),
            method: op.method.as_str().to_string(),
            headers,
            body,
            body_kind,
            queued_at: op.queued_at,
            attempts: op.attempts as i64,
            last_error: op.last_error.clone(),
            next_attempt_at: op.next_attempt_at,
        })
    }

    fn from_row(&self, row: QueuedOperationRow) -> Result<QueuedOperation, StoreError> {
        let corrupted = |reason: String| StoreError::Corrupted {
            id: row.id.clone(),
            reason,
        };

        let headers_json = if HeaderCipher::is_sealed(&row.headers) {
            match &self.cipher {
                Some(cipher) => cipher.open(&row.headers)?,
                None => return Err(corrupted("headers are sealed but no key is configured".into())),
            }
        } else {
            row.headers.clone()
        };
        let headers: Headers =
            serde_json::from_str(&headers_json).map_err(|e| corrupted(e.to_string()))?;

        let method = row
            .method
            .parse()
            .map_err(|_| corrupted(format!("unknown method {}", row.method)))?;
        let body = Body::from_stored(&row.body_kind, row.body.clone())
            .map_err(|e| corrupted(e.to_string()))?;

        Ok(QueuedOperation {
            id: row.id,
            endpoint: row.endpoint,
            method,
            headers,
            body,
            queued_at: row.queued_at,
            attempts: row.attempts.max(0) as u32,
            last_error: row.last_error,
            next_attempt_at: row.next_attempt_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::types::Method;

    async fn memory_store() -> QueueStore {
        let db = Arc::new(Database::in_memory().await.unwrap());
        QueueStore::attach(db, &StoreConfig::in_memory("operations"))
            .await
            .unwrap()
    }

    fn op(id: &str, queued_at: i64, next_attempt_at: i64) -> QueuedOperation {
        QueuedOperation {
            id: id.to_string(),
            endpoint: "/api/inventory/consume".into(),
            method: Method::Post,
            headers: Headers::normalized(vec![("Authorization", "Bearer secret")]),
            body: Some(Body::Json(serde_json::json!({"quantity": 2}))),
            queued_at,
            attempts: 0,
            last_error: None,
            next_attempt_at,
        }
    }

    #[tokio::test]
    async fn test_put_get_delete_count() {
        let store = memory_store().await;
        assert!(store.is_available());
        assert_eq!(store.count().await.unwrap(), 0);

        store.put(&op("a", 10, 10)).await.unwrap();
        assert_eq!(store.count().await.unwrap(), 1);
        assert_eq!(store.get("a").await.unwrap(), Some(op("a", 10, 10)));
        assert_eq!(store.get("missing").await.unwrap(), None);

        assert!(store.delete("a").await.unwrap());
        assert!(!store.delete("a").await.unwrap());
        assert_eq!(store.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_put_replaces_by_id() {
        let store = memory_store().await;
        let mut record = op("a", 10, 10);
        store.put(&record).await.unwrap();

        record.attempts = 2;
        record.last_error = Some("HTTP 503".into());
        record.next_attempt_at = 9_000;
        store.put(&record).await.unwrap();

        assert_eq!(store.count().await.unwrap(), 1);
        let stored = store.get("a").await.unwrap().unwrap();
        assert_eq!(stored.attempts, 2);
        assert_eq!(stored.last_error.as_deref(), Some("HTTP 503"));
    }

    #[tokio::test]
    async fn test_get_all_orders_by_deadline_then_enqueue_order() {
        let store = memory_store().await;
        store.put(&op("late", 1, 500)).await.unwrap();
        store.put(&op("first", 5, 100)).await.unwrap();
        store.put(&op("second", 5, 100)).await.unwrap();
        store.put(&op("early", 9, 50)).await.unwrap();

        let ids: Vec<String> = store
            .get_all()
            .await
            .unwrap()
            .into_iter()
            .map(|o| o.id)
            .collect();
        assert_eq!(ids, vec!["early", "first", "second", "late"]);
    }

    #[tokio::test]
    async fn test_text_and_empty_bodies_survive() {
        let store = memory_store().await;
        let mut text = op("text", 1, 1);
        text.body = Some(Body::Text("{not json".into()));
        let mut empty = op("empty", 2, 2);
        empty.method = Method::Delete;
        empty.body = None;

        store.put(&text).await.unwrap();
        store.put(&empty).await.unwrap();

        assert_eq!(store.get("text").await.unwrap(), Some(text));
        assert_eq!(store.get("empty").await.unwrap(), Some(empty));
    }

    #[tokio::test]
    async fn test_sealed_headers_at_rest() {
        let db = Arc::new(Database::in_memory().await.unwrap());
        let cipher = HeaderCipher::from_key(&[3u8; 32]).unwrap();
        let store = QueueStore::attach(db.clone(), &StoreConfig::in_memory("operations"))
            .await
            .unwrap()
            .with_cipher(cipher);

        store.put(&op("a", 1, 1)).await.unwrap();

        let (raw,): (String,) =
            sqlx::query_as(r#"SELECT headers FROM "queue_operations" WHERE id = 'a'"#)
                .fetch_one(db.pool())
                .await
                .unwrap();
        assert!(!raw.contains("secret"));
        assert_eq!(
            store.get("a").await.unwrap().unwrap().headers.get("authorization"),
            Some("Bearer secret")
        );

        let keyless = QueueStore::attach(db, &StoreConfig::in_memory("operations"))
            .await
            .unwrap();
        assert!(matches!(
            keyless.get("a").await,
            Err(StoreError::Corrupted { .. })
        ));
    }

    #[tokio::test]
    async fn test_scan_separates_unreadable_rows() {
        let db = Arc::new(Database::in_memory().await.unwrap());
        let sealed = QueueStore::attach(db.clone(), &StoreConfig::in_memory("operations"))
            .await
            .unwrap()
            .with_cipher(HeaderCipher::from_key(&[3u8; 32]).unwrap());
        let mut locked = op("locked", 1, 1);
        locked.attempts = 2;
        sealed.put(&locked).await.unwrap();

        let keyless = QueueStore::attach(db, &StoreConfig::in_memory("operations"))
            .await
            .unwrap();
        keyless.put(&op("healthy", 2, 2)).await.unwrap();

        let scan = keyless.scan().await.unwrap();
        assert_eq!(scan.records.len(), 1);
        assert_eq!(scan.records[0].id, "healthy");
        assert_eq!(
            scan.corrupt,
            vec![CorruptRecord {
                id: "locked".into(),
                endpoint: "/api/inventory/consume".into(),
                method: "POST".into(),
                attempts: 2,
                reason: "headers are sealed but no key is configured".into(),
            }]
        );

        let ids: Vec<String> = keyless.get_all().await.unwrap().into_iter().map(|o| o.id).collect();
        assert_eq!(ids, vec!["healthy"]);
        assert_eq!(keyless.count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_unavailable_store_is_inert() {
        let store = QueueStore::unavailable("operations");
        assert!(!store.is_available());
        store.put(&op("a", 1, 1)).await.unwrap();
        assert_eq!(store.count().await.unwrap(), 0);
        assert!(store.get_all().await.unwrap().is_empty());
        assert_eq!(store.db_name(), "unavailable");
    }

    #[tokio::test]
    async fn test_init_degrades_when_directory_unusable() {
        let file = tempfile::NamedTempFile::new().unwrap();
        // A regular file where the data directory should be.
        let config = StoreConfig {
            data_dir: Some(file.path().join("nested")),
            ..StoreConfig::default()
        };
        let store = QueueStore::init(&config).await.unwrap();
        assert!(!store.is_available());
    }
}
