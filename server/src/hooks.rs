//! Session lifecycle callbacks
//!
//! The dispatcher calls these from connection tasks, once per successful
//! register and once per matching unregister. Implementations must return
//! quickly; anything slow belongs on a spawned task.

use crate::metrics::ServerMetrics;
use crate::storage::{PostgresStorage, SessionEvent};
use log::{debug, warn};
use std::sync::Arc;
use tokio::runtime::Handle;

pub trait SessionHooks: Send + Sync {
    fn on_session_start(&self, player_id: &str);
    fn on_session_end(&self, player_id: &str);
}

/// Hooks that do nothing
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHooks;

impl SessionHooks for NoopHooks {
    fn on_session_start(&self, _player_id: &str) {}
    fn on_session_end(&self, _player_id: &str) {}
}

/// Persists lifecycle events through [`PostgresStorage`]
///
/// Writes run on the current tokio runtime in the background. While storage is
/// offline the events are skipped
pub struct StorageHooks {
    storage: Arc<PostgresStorage>,
    metrics: Arc<ServerMetrics>,
}

impl StorageHooks {
    pub fn new(storage: Arc<PostgresStorage>, metrics: Arc<ServerMetrics>) -> Self {
        Self { storage, metrics }
    }

    fn record(&self, player_id: &str, event: SessionEvent) {
        if !self.storage.is_connected() {
            debug!("Storage offline, not recording {} for {}", event, player_id);
            return;
        }
        let runtime = match Handle::try_current() {
            Ok(runtime) => runtime,
            Err(e) => {
                warn!("Cannot record {} for {}: {}", event, player_id, e);
                self.metrics.storage_failures_total.inc();
                return;
            }
        };

        let storage = Arc::clone(&self.storage);
        let metrics = Arc::clone(&self.metrics);
        let player_id = player_id.to_string();
        runtime.spawn(async move {
            if !storage.record_session_event(&player_id, event).await {
                metrics.storage_failures_total.inc();
            }
        });
    }
}

impl SessionHooks for StorageHooks {
    fn on_session_start(&self, player_id: &str) {
        self.record(player_id, SessionEvent::Start);
    }

    fn on_session_end(&self, player_id: &str) {
        self.record(player_id, SessionEvent::End);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offline_hooks() -> (StorageHooks, Arc<ServerMetrics>) {
        let metrics = Arc::new(ServerMetrics::new().unwrap());
        let storage = Arc::new(PostgresStorage::new("postgres://127.0.0.1:1/arena"));
        (StorageHooks::new(storage, Arc::clone(&metrics)), metrics)
    }

    #[test]
    fn test_noop_hooks_accept_any_player() {
        let hooks: Box<dyn SessionHooks> = Box::new(NoopHooks);
        hooks.on_session_start("alice");
        hooks.on_session_end("alice");
    }

    #[tokio::test]
    async fn test_offline_storage_hooks_skip_events() {
        let (hooks, metrics) = offline_hooks();
        hooks.on_session_start("alice");
        hooks.on_session_end("alice");
        assert_eq!(metrics.storage_failures_total.get(), 0);
    }

    #[test]
    fn test_offline_storage_hooks_outside_runtime() {
        let (hooks, _) = offline_hooks();
        hooks.on_session_start("bob");
    }
}
