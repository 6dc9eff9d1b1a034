//! Raw operation store read by the background worker.
//!
//! Deliberately separate from the queue stores: rows here carry only what a
//! worker needs to replay a request, keyed by an autoincrement id.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::background::BackgroundError;
use super::types::{Headers, Method};
use crate::db::schema::RawOperationRow;
use crate::db::Database;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawOperation {
    pub id: i64,
    pub url: String,
    pub method: Method,
    pub headers: Headers,
    pub body: Option<String>,
    /// Milliseconds since the epoch.
    pub timestamp: i64,
    pub retry_count: u32,
}

/// A row that failed to decode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnreadableOperation {
    pub id: i64,
    pub reason: String,
}

#[derive(Clone)]
pub struct RawOperationStore {
    db: Arc<Database>,
}

impl RawOperationStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Append an operation and return its id.
    pub async fn push(
        &self,
        url: &str,
        method: Method,
        headers: &Headers,
        body: Option<&str>,
    ) -> Result<i64, BackgroundError> {
        let headers = serde_json::to_string(headers)?;
        let result = sqlx::query(
            r#"
            INSERT INTO sync_operations (url, method, headers, body, timestamp, retry_count)
            VALUES (?, ?, ?, ?, ?, 0)
            "#,
        )
        .bind(url)
        .bind(method.as_str())
        .bind(headers)
        .bind(body)
        .bind(chrono::Utc::now().timestamp_millis())
        .execute(self.db.pool())
        .await?;

        Ok(result.last_insert_rowid())
    }

    /// Every operation that decodes, oldest first. Unreadable rows are
    /// logged and left out.
    pub async fn get_all(&self) -> Result<Vec<RawOperation>, BackgroundError> {
        let (operations, unreadable) = self.scan().await?;
        for bad in &unreadable {
            tracing::warn!("Skipping unreadable background operation {}: {}", bad.id, bad.reason);
        }
        Ok(operations)
    }

    pub async fn scan(&self) -> Result<(Vec<RawOperation>, Vec<UnreadableOperation>), BackgroundError> {
        let rows: Vec<RawOperationRow> =
            sqlx::query_as("SELECT * FROM sync_operations ORDER BY id ASC")
                .fetch_all(self.db.pool())
                .await?;

        let mut operations = Vec::with_capacity(rows.len());
        let mut unreadable = Vec::new();
        for row in rows {
            let id = row.id;
            match from_row(row) {
                Ok(op) => operations.push(op),
                Err(BackgroundError::Corrupted(reason)) => unreadable.push(UnreadableOperation { id, reason }),
                Err(e) => unreadable.push(UnreadableOperation {
                    id,
                    reason: e.to_string(),
                }),
            }
        }
        Ok((operations, unreadable))
    }

    pub async fn delete(&self, id: i64) -> Result<bool, BackgroundError> {
        let result = sqlx::query("DELETE FROM sync_operations WHERE id = ?")
            .bind(id)
            .execute(self.db.pool())
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Bump the retry counter and return its new value.
    pub async fn record_failure(&self, id: i64) -> Result<u32, BackgroundError> {
        sqlx::query("UPDATE sync_operations SET retry_count = retry_count + 1 WHERE id = ?")
            .bind(id)
            .execute(self.db.pool())
            .await?;

        let (count,): (i64,) = sqlx::query_as("SELECT retry_count FROM sync_operations WHERE id = ?")
            .bind(id)
            .fetch_one(self.db.pool())
            .await?;
        Ok(count.max(0) as u32)
    }

    pub async fn count(&self) -> Result<usize, BackgroundError> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM sync_operations")
            .fetch_one(self.db.pool())
            .await?;
        Ok(count as usize)
    }
}

fn from_row(row: RawOperationRow) -> Result<RawOperation, BackgroundError> {
    let method = row
        .method
        .parse()
        .map_err(|_| BackgroundError::Corrupted(format!("operation {} has method {}", row.id, row.method)))?;

    Ok(RawOperation {
        id: row.id,
        url: row.url,
        method,
        headers: serde_json::from_str(&row.headers)?,
        body: row.body,
        timestamp: row.timestamp,
        retry_count: row.retry_count.max(0) as u32,
    })
}
