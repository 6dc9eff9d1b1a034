use serde::{Deserialize, Serialize};

/// Store names become part of a table identifier, so keep them boring.
pub fn is_valid_store_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 64
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Quoted table identifier for a queue store. Callers must validate `store` first.
pub fn queue_table(store: &str) -> String {
    format!("\"queue_{}\"", store)
}

pub fn create_queue_store_sql(store: &str) -> [String; 3] {
    let table = queue_table(store);
    [
        format!(
            r#"
            CREATE TABLE IF NOT EXISTS {table} (
                id TEXT PRIMARY KEY NOT NULL,
                endpoint TEXT NOT NULL,
                method TEXT NOT NULL,
                headers TEXT NOT NULL,
                body TEXT,
                body_kind TEXT NOT NULL DEFAULT 'none',
                queued_at INTEGER NOT NULL,
                attempts INTEGER NOT NULL DEFAULT 0,
                last_error TEXT,
                next_attempt_at INTEGER NOT NULL
            )
            "#
        ),
        format!(
            "CREATE INDEX IF NOT EXISTS \"idx_{store}_queued_at\" ON {table}(queued_at)"
        ),
        format!(
            "CREATE INDEX IF NOT EXISTS \"idx_{store}_next_attempt_at\" ON {table}(next_attempt_at)"
        ),
    ]
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct QueuedOperationRow {
    pub id: String,
    pub endpoint: String,
    pub method: String,
    pub headers: String,
    pub body: Option<String>,
    pub body_kind: String,
    pub queued_at: i64,
    pub attempts: i64,
    pub last_error: Option<String>,
    pub next_attempt_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct RawOperationRow {
    pub id: i64,
    pub url: String,
    pub method: String,
    pub headers: String,
    pub body: Option<String>,
    pub timestamp: i64,
    pub retry_count: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct AnalyticsRow {
    pub id: i64,
    pub event_type: String,
    pub event_data: Option<String>,
    pub created_at: i64,
}
