//! Queue data types and error definitions

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use super::metadata::SyncContextPatch;
use crate::crypto::CryptoError;
use crate::db::DbError;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Corrupted record {id}: {reason}")]
    Corrupted { id: String, reason: String },
}

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Mutating HTTP verbs. Reads are never queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    Post,
    Put,
    Patch,
    Delete,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Patch => "PATCH",
            Self::Delete => "DELETE",
        }
    }
}

impl FromStr for Method {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "POST" => Ok(Self::Post),
            "PUT" => Ok(Self::Put),
            "PATCH" => Ok(Self::Patch),
            "DELETE" => Ok(Self::Delete),
            other => Err(QueueError::Validation(format!(
                "method {:?} is not a mutating verb",
                other
            ))),
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Header list that keeps insertion order. Lookups ignore case.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Trim names and drop entries whose name ends up empty. A repeated name
    /// keeps its first position and the last value.
    pub fn normalized<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        let mut headers = Self::new();
        for (name, value) in pairs {
            let name = name.as_ref().trim();
            if name.is_empty() {
                continue;
            }
            headers.set(name, value);
        }
        headers
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        match self.0.iter_mut().find(|(k, _)| k.eq_ignore_ascii_case(name)) {
            Some(entry) => entry.1 = value,
            None => self.0.push((name.to_string(), value)),
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Request payload. Only `Json` bodies carry sync metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum Body {
    Json(serde_json::Value),
    Text(String),
}

impl Body {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Json(_) => "json",
            Self::Text(_) => "text",
        }
    }

    pub fn to_wire(&self) -> Result<String, serde_json::Error> {
        match self {
            Self::Json(value) => serde_json::to_string(value),
            Self::Text(text) => Ok(text.clone()),
        }
    }

    pub fn from_stored(kind: &str, raw: Option<String>) -> Result<Option<Self>, serde_json::Error> {
        match (kind, raw) {
            ("json", Some(raw)) => Ok(Some(Self::Json(serde_json::from_str(&raw)?))),
            (_, Some(raw)) => Ok(Some(Self::Text(raw))),
            (_, None) => Ok(None),
        }
    }
}

/// What application code hands to [`SyncQueue::enqueue`](super::SyncQueue::enqueue).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EnqueueRequest {
    pub endpoint: String,
    pub method: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Body>,
    pub sync: Option<SyncContextPatch>,
}

impl EnqueueRequest {
    pub fn new(endpoint: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            method: method.into(),
            ..Self::default()
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn json(mut self, value: serde_json::Value) -> Self {
        self.body = Some(Body::Json(value));
        self
    }

    pub fn text(mut self, text: impl Into<String>) -> Self {
        self.body = Some(Body::Text(text.into()));
        self
    }

    pub fn op_id(mut self, op_id: impl Into<String>) -> Self {
        self.sync.get_or_insert_with(SyncContextPatch::default).op_id = Some(op_id.into());
        self
    }
}

/// One durable record per pending mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedOperation {
    /// Idempotency token, also the primary key.
    pub id: String,
    pub endpoint: String,
    pub method: Method,
    pub headers: Headers,
    pub body: Option<Body>,
    pub queued_at: i64,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub next_attempt_at: i64,
}

impl QueuedOperation {
    pub fn is_due(&self, now: i64) -> bool {
        self.next_attempt_at <= now
    }
}

/// Outcome of one flush pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlushReport {
    pub processed: usize,
    pub pending: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_method_parsing() {
        assert_eq!("post".parse::<Method>().unwrap(), Method::Post);
        assert_eq!(" Patch ".parse::<Method>().unwrap(), Method::Patch);
        assert_eq!("DELETE".parse::<Method>().unwrap(), Method::Delete);
        assert!(matches!(
            "GET".parse::<Method>(),
            Err(QueueError::Validation(_))
        ));
        assert!("".parse::<Method>().is_err());
    }

    #[test]
    fn test_headers_normalization() {
        let headers = Headers::normalized(vec![
            ("  Authorization ", "Bearer abc"),
            ("", "dropped"),
            ("   ", "dropped too"),
            ("X-Trace", "1"),
            ("x-trace", "2"),
        ]);
        assert_eq!(headers.len(), 2);
        assert_eq!(headers.get("authorization"), Some("Bearer abc"));
        assert_eq!(headers.get("X-TRACE"), Some("2"));
        let names: Vec<&str> = headers.iter().map(|(k, _)| k).collect();
        assert_eq!(names, vec!["Authorization", "X-Trace"]);
    }

    #[test]
    fn test_body_stored_roundtrip_by_kind() {
        let json = Body::from_stored("json", Some(r#"{"a":1}"#.into())).unwrap();
        assert_eq!(json, Some(Body::Json(serde_json::json!({"a": 1}))));

        let text = Body::from_stored("text", Some("{not json".into())).unwrap();
        assert_eq!(text, Some(Body::Text("{not json".into())));

        assert_eq!(Body::from_stored("none", None).unwrap(), None);
        assert!(Body::from_stored("json", Some("{broken".into())).is_err());
    }

    #[test]
    fn test_enqueue_request_builder() {
        let request = EnqueueRequest::new("/api/wines/42", "PUT")
            .header("Authorization", "Bearer t")
            .json(serde_json::json!({"rating": 4}))
            .op_id("fixed-id");
        assert_eq!(request.headers.len(), 1);
        assert_eq!(request.sync.unwrap().op_id.as_deref(), Some("fixed-id"));
        assert!(matches!(request.body, Some(Body::Json(_))));
    }

    #[test]
    fn test_queue_error_display() {
        let err = QueueError::Validation("endpoint is required".into());
        assert_eq!(err.to_string(), "Validation error: endpoint is required");
    }
}
