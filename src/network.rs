//! Connectivity as reported by the host.

use tokio::sync::watch;

use crate::events::{EventBus, SyncEvent};

pub struct NetworkMonitor {
    state: watch::Sender<bool>,
    events: EventBus,
}

impl NetworkMonitor {
    pub fn new(online: bool, events: EventBus) -> Self {
        let (state, _) = watch::channel(online);
        Self { state, events }
    }

    pub fn is_online(&self) -> bool {
        *self.state.borrow()
    }

    /// Record a connectivity change. Events fire only on actual transitions.
    pub fn set_online(&self, online: bool) {
        let changed = self.state.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });

        if changed {
            tracing::info!("Network is now {}", if online { "online" } else { "offline" });
            self.events.emit(if online {
                SyncEvent::Online
            } else {
                SyncEvent::Offline
            });
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.state.subscribe()
    }
}
