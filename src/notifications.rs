//! User-facing notifications for queue lifecycle events.
//!
//! Every queued, processed, retried and discarded mutation produces a
//! notification. Discards are always warnings since the change is gone.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::events::{EventBus, ListenerId, SyncEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationLevel {
    Info,
    Success,
    Warning,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub title: String,
    pub body: String,
    pub level: NotificationLevel,
}

impl Notification {
    fn new(title: impl Into<String>, body: impl Into<String>, level: NotificationLevel) -> Self {
        Self {
            title: title.into(),
            body: body.into(),
            level,
        }
    }
}

/// Where notifications end up (toast layer, OS notifications, a log).
pub trait NotificationSink: Send + Sync {
    fn deliver(&self, notification: &Notification);
}

/// Writes notifications to the log.
pub struct LogSink;

impl NotificationSink for LogSink {
    fn deliver(&self, notification: &Notification) {
        match notification.level {
            NotificationLevel::Warning => {
                tracing::warn!("{}: {}", notification.title, notification.body)
            }
            _ => tracing::info!("{}: {}", notification.title, notification.body),
        }
    }
}

fn plural(count: usize, one: &str, many: &str) -> String {
    format!("{} {}", count, if count == 1 { one } else { many })
}

/// Service for turning queue events into notifications
pub struct NotificationService {
    sink: Arc<dyn NotificationSink>,
}

impl NotificationService {
    pub fn new(sink: Arc<dyn NotificationSink>) -> Self {
        Self { sink }
    }

    pub fn logging() -> Self {
        Self::new(Arc::new(LogSink))
    }

    /// The notification for `event`, if it warrants one.
    pub fn for_event(event: &SyncEvent) -> Option<Notification> {
        match event {
            SyncEvent::Queued {
                endpoint, method, ..
            } => Some(Notification::new(
                "Saved offline",
                format!("{} {} will be sent when the connection is back", method, endpoint),
                NotificationLevel::Info,
            )),
            SyncEvent::Processed {
                endpoint, method, ..
            } => Some(Notification::new(
                "Change synced",
                format!("{} {}", method, endpoint),
                NotificationLevel::Success,
            )),
            SyncEvent::Error {
                endpoint,
                method,
                attempts,
                error,
                ..
            } => Some(Notification::new(
                "Sync delayed",
                format!(
                    "{} {} failed after {}, retrying: {}",
                    method,
                    endpoint,
                    plural(*attempts as usize, "attempt", "attempts"),
                    error
                ),
                NotificationLevel::Info,
            )),
            SyncEvent::Discarded {
                endpoint,
                method,
                attempts,
                error,
                ..
            } => Some(Notification::new(
                "Change could not be synced",
                format!(
                    "{} {} was dropped after {} and will not be retried: {}",
                    method,
                    endpoint,
                    plural(*attempts as usize, "attempt", "attempts"),
                    error
                ),
                NotificationLevel::Warning,
            )),
            SyncEvent::Synced { successful, failed } => {
                if successful + failed == 0 {
                    return None;
                }
                let level = if *failed > 0 {
                    NotificationLevel::Warning
                } else {
                    NotificationLevel::Success
                };
                Some(Notification::new(
                    "Background sync complete",
                    format!(
                        "{} synced, {} failed",
                        plural(*successful, "change", "changes"),
                        failed
                    ),
                    level,
                ))
            }
            _ => None,
        }
    }

    pub fn notify(&self, notification: &Notification) {
        self.sink.deliver(notification);
    }

    /// Forward every relevant event on `events` to the sink.
    pub fn attach(self: &Arc<Self>, events: &EventBus) -> ListenerId {
        let service = self.clone();
        events.on(move |event| {
            if let Some(notification) = Self::for_event(event) {
                service.notify(&notification);
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Collect(Mutex<Vec<Notification>>);

    impl NotificationSink for Collect {
        fn deliver(&self, notification: &Notification) {
            self.0.lock().unwrap().push(notification.clone());
        }
    }

    fn discarded() -> SyncEvent {
        SyncEvent::Discarded {
            id: "op-1".into(),
            endpoint: "/api/inventory/consume".into(),
            method: "POST".into(),
            attempts: 5,
            error: "HTTP 503: down".into(),
        }
    }

    #[test]
    fn test_discard_is_a_warning() {
        let notification = NotificationService::for_event(&discarded()).unwrap();
        assert_eq!(notification.level, NotificationLevel::Warning);
        assert_eq!(
            notification.body,
            "POST /api/inventory/consume was dropped after 5 attempts and will not be retried: HTTP 503: down"
        );
    }

    #[test]
    fn test_background_summary() {
        let ok = NotificationService::for_event(&SyncEvent::Synced {
            successful: 1,
            failed: 0,
        })
        .unwrap();
        assert_eq!(ok.body, "1 change synced, 0 failed");
        assert_eq!(ok.level, NotificationLevel::Success);

        assert!(NotificationService::for_event(&SyncEvent::Synced {
            successful: 0,
            failed: 0
        })
        .is_none());
    }

    #[test]
    fn test_quiet_events() {
        assert!(NotificationService::for_event(&SyncEvent::Empty).is_none());
        assert!(NotificationService::for_event(&SyncEvent::Online).is_none());
    }

    #[test]
    fn test_attach_forwards_lifecycle() {
        let sink = Arc::new(Collect::default());
        let service = Arc::new(NotificationService::new(sink.clone()));
        let events = EventBus::new();
        service.attach(&events);

        events.emit(SyncEvent::Queued {
            id: "op-1".into(),
            endpoint: "/api/wines".into(),
            method: "POST".into(),
        });
        events.emit(SyncEvent::Empty);
        events.emit(discarded());

        let titles: Vec<String> = sink.0.lock().unwrap().iter().map(|n| n.title.clone()).collect();
        assert_eq!(titles, vec!["Saved offline", "Change could not be synced"]);
    }
}
