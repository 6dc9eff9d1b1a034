//! Local delivery analytics. No data is sent externally.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

use crate::db::schema::AnalyticsRow;
use crate::db::Database;
use crate::events::{EventBus, SyncEvent};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyticsEvent {
    pub event_type: String,
    pub event_data: serde_json::Value,
}

impl AnalyticsEvent {
    pub fn new(event_type: impl Into<String>, event_data: serde_json::Value) -> Self {
        Self {
            event_type: event_type.into(),
            event_data,
        }
    }

    /// Lifecycle events worth keeping. Connectivity flips and readiness are not.
    pub fn from_sync_event(event: &SyncEvent) -> Option<Self> {
        match event {
            SyncEvent::Queued { .. }
            | SyncEvent::Processed { .. }
            | SyncEvent::Error { .. }
            | SyncEvent::Discarded { .. }
            | SyncEvent::Synced { .. } => {
                let mut data = serde_json::to_value(event).ok()?;
                if let Some(map) = data.as_object_mut() {
                    map.remove("event");
                }
                Some(Self::new(event.name(), data))
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliverySummary {
    pub queued: i64,
    pub processed: i64,
    pub retried: i64,
    pub discarded: i64,
    pub background_synced: i64,
    pub background_failed: i64,
    pub days: i32,
}

pub struct AnalyticsService {
    db: Arc<Database>,
}

impl AnalyticsService {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    pub async fn track(&self, event: AnalyticsEvent) -> Result<(), sqlx::Error> {
        let now = chrono::Utc::now().timestamp();

        sqlx::query("INSERT INTO analytics (event_type, event_data, created_at) VALUES (?, ?, ?)")
            .bind(&event.event_type)
            .bind(event.event_data.to_string())
            .bind(now)
            .execute(self.db.pool())
            .await?;

        Ok(())
    }

    pub async fn track_sync_event(&self, event: &SyncEvent) -> Result<(), sqlx::Error> {
        match AnalyticsEvent::from_sync_event(event) {
            Some(analytics) => self.track(analytics).await,
            None => Ok(()),
        }
    }

    pub async fn get_summary(&self, days: i32) -> Result<DeliverySummary, sqlx::Error> {
        let since = chrono::Utc::now().timestamp() - (days as i64 * 86400);

        let mut summary = DeliverySummary {
            days,
            ..DeliverySummary::default()
        };
        for (event_type, count) in self.get_event_counts(days).await? {
            match event_type.as_str() {
                "queued" => summary.queued = count,
                "processed" => summary.processed = count,
                "error" => summary.retried = count,
                "discarded" => summary.discarded = count,
                _ => {}
            }
        }

        let background: (Option<i64>, Option<i64>) = sqlx::query_as(
            r#"
            SELECT
                SUM(CAST(json_extract(event_data, '$.successful') AS INTEGER)),
                SUM(CAST(json_extract(event_data, '$.failed') AS INTEGER))
            FROM analytics
            WHERE event_type = 'synced' AND created_at >= ?
            "#,
        )
        .bind(since)
        .fetch_one(self.db.pool())
        .await?;

        summary.background_synced = background.0.unwrap_or(0);
        summary.background_failed = background.1.unwrap_or(0);
        Ok(summary)
    }

    pub async fn get_event_counts(&self, days: i32) -> Result<Vec<(String, i64)>, sqlx::Error> {
        let since = chrono::Utc::now().timestamp() - (days as i64 * 86400);

        let counts: Vec<(String, i64)> = sqlx::query_as(
            "SELECT event_type, COUNT(*) FROM analytics WHERE created_at >= ? GROUP BY event_type",
        )
        .bind(since)
        .fetch_all(self.db.pool())
        .await?;

        Ok(counts)
    }

    /// Most recent discards, newest first.
    pub async fn recent_discards(&self, limit: i64) -> Result<Vec<AnalyticsRow>, sqlx::Error> {
        sqlx::query_as(
            "SELECT * FROM analytics WHERE event_type = 'discarded' ORDER BY created_at DESC, id DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(self.db.pool())
        .await
    }

    /// Record everything published on `events` until the bus goes away.
    pub fn spawn_recorder(self: Arc<Self>, events: &EventBus) -> JoinHandle<()> {
        let mut rx = events.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        if let Err(e) = self.track_sync_event(&event).await {
                            tracing::error!("Failed to record {} event: {}", event.name(), e);
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!("Analytics recorder fell behind, {} events not recorded", skipped);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn discarded() -> SyncEvent {
        SyncEvent::Discarded {
            id: "op-9".into(),
            endpoint: "/api/wines/9".into(),
            method: "DELETE".into(),
            attempts: 5,
            error: "HTTP 500: boom".into(),
        }
    }

    #[test]
    fn test_event_mapping() {
        let event = AnalyticsEvent::from_sync_event(&discarded()).unwrap();
        assert_eq!(event.event_type, "discarded");
        assert_eq!(event.event_data["attempts"], 5);
        assert!(event.event_data.get("event").is_none());

        assert!(AnalyticsEvent::from_sync_event(&SyncEvent::Online).is_none());
    }

    #[test]
    fn test_analytics_event_deserialization() {
        let json = r#"{"event_type":"processed","event_data":{"id":"op-1"}}"#;
        let event: AnalyticsEvent = serde_json::from_str(json).unwrap();
        assert_eq!(event.event_type, "processed");
        assert_eq!(event.event_data["id"], "op-1");
    }

    #[tokio::test]
    async fn test_summary_counts_lifecycle() {
        let service = AnalyticsService::new(Arc::new(Database::in_memory().await.unwrap()));

        service
            .track_sync_event(&SyncEvent::Processed {
                id: "op-1".into(),
                endpoint: "/api/wines".into(),
                method: "POST".into(),
            })
            .await
            .unwrap();
        service.track_sync_event(&discarded()).await.unwrap();
        service
            .track_sync_event(&SyncEvent::Synced {
                successful: 3,
                failed: 1,
            })
            .await
            .unwrap();
        service
            .track_sync_event(&SyncEvent::Synced {
                successful: 2,
                failed: 0,
            })
            .await
            .unwrap();
        service.track_sync_event(&SyncEvent::Empty).await.unwrap();

        let summary = service.get_summary(7).await.unwrap();
        assert_eq!(
            summary,
            DeliverySummary {
                queued: 0,
                processed: 1,
                retried: 0,
                discarded: 1,
                background_synced: 5,
                background_failed: 1,
                days: 7,
            }
        );

        let discards = service.recent_discards(10).await.unwrap();
        assert_eq!(discards.len(), 1);
        assert!(discards[0].event_data.as_deref().unwrap().contains("op-9"));
    }

    #[tokio::test]
    async fn test_recorder_follows_bus() {
        let service = Arc::new(AnalyticsService::new(Arc::new(
            Database::in_memory().await.unwrap(),
        )));
        let events = EventBus::new();
        let recorder = service.clone().spawn_recorder(&events);

        events.emit(discarded());

        let recorded = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if service.get_summary(1).await.unwrap().discarded == 1 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        assert!(recorded.is_ok());
        recorder.abort();
    }

    #[tokio::test]
    async fn test_recorder_drains_and_exits_when_bus_closes() {
        let service = Arc::new(AnalyticsService::new(Arc::new(
            Database::in_memory().await.unwrap(),
        )));
        let events = EventBus::new();
        let recorder = service.clone().spawn_recorder(&events);

        events.emit(discarded());
        drop(events);

        recorder.await.unwrap();
        assert_eq!(service.get_summary(1).await.unwrap().discarded, 1);
    }
}
