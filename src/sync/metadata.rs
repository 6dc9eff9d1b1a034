//! Idempotency metadata embedded in outgoing JSON bodies.
//!
//! The remote API deduplicates on `sync.op_id`, so the same mutation may be
//! delivered more than once without being applied twice.

use serde::{Deserialize, Serialize};

use super::types::Body;
use crate::config::ClientIdentity;

pub const SYNC_KEY: &str = "sync";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncContext {
    pub op_id: String,
    pub origin: String,
    pub updated_by: String,
    /// Unix seconds.
    pub updated_at: i64,
}

/// Caller-supplied fields; anything missing is filled in.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncContextPatch {
    pub op_id: Option<String>,
    pub origin: Option<String>,
    pub updated_by: Option<String>,
    pub updated_at: Option<i64>,
}

impl From<SyncContext> for SyncContextPatch {
    fn from(ctx: SyncContext) -> Self {
        Self {
            op_id: Some(ctx.op_id),
            origin: Some(ctx.origin),
            updated_by: Some(ctx.updated_by),
            updated_at: Some(ctx.updated_at),
        }
    }
}

impl SyncContext {
    /// Reuse the caller's `op_id` when present, otherwise mint a fresh token.
    pub fn resolve(patch: Option<&SyncContextPatch>, identity: &ClientIdentity) -> Self {
        let patch = patch.cloned().unwrap_or_default();
        let op_id = patch
            .op_id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        Self {
            op_id,
            origin: patch.origin.unwrap_or_else(|| identity.origin.clone()),
            updated_by: patch
                .updated_by
                .unwrap_or_else(|| identity.updated_by.clone()),
            updated_at: patch
                .updated_at
                .unwrap_or_else(|| chrono::Utc::now().timestamp()),
        }
    }

    pub fn to_value(&self) -> serde_json::Value {
        serde_json::json!({
            "op_id": self.op_id,
            "origin": self.origin,
            "updated_by": self.updated_by,
            "updated_at": self.updated_at,
        })
    }
}

/// Write `ctx` under the `sync` key of a JSON object body. Text bodies and
/// non-object JSON are left alone.
pub fn embed(body: &mut Body, ctx: &SyncContext) -> bool {
    match body {
        Body::Json(serde_json::Value::Object(map)) => {
            map.insert(SYNC_KEY.to_string(), ctx.to_value());
            true
        }
        Body::Json(_) => {
            tracing::debug!("JSON body for {} is not an object, sync metadata skipped", ctx.op_id);
            false
        }
        Body::Text(_) => false,
    }
}

/// Re-apply metadata right before sending. The record id always wins as
/// `op_id`; the other fields keep whatever was stamped at enqueue time.
pub fn restamp(body: &mut Body, op_id: &str, identity: &ClientIdentity) -> bool {
    let existing = match body {
        Body::Json(value) => value
            .get(SYNC_KEY)
            .and_then(|sync| serde_json::from_value::<SyncContextPatch>(sync.clone()).ok()),
        Body::Text(_) => return false,
    };

    let mut patch = existing.unwrap_or_default();
    patch.op_id = Some(op_id.to_string());
    let ctx = SyncContext::resolve(Some(&patch), identity);
    embed(body, &ctx)
}
