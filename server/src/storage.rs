//! Postgres persistence for session lifecycle events
//!
//! Storage is optional. The server keeps running when the database is
//! unreachable: `connect` reports failure, `record_session_event` becomes a
//! no-op that returns false, and the caller decides how loudly to complain.

use log::{debug, info, warn};
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_POOL_CONNECTIONS: u32 = 4;

const CREATE_SESSION_EVENTS: &str = "CREATE TABLE IF NOT EXISTS session_events (
    id BIGSERIAL PRIMARY KEY,
    player_id TEXT NOT NULL,
    event TEXT NOT NULL,
    recorded_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
)";

const INSERT_SESSION_EVENT: &str =
    "INSERT INTO session_events (player_id, event) VALUES ($1, $2)";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    Start,
    End,
}

impl SessionEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionEvent::Start => "start",
            SessionEvent::End => "end",
        }
    }
}

impl fmt::Display for SessionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage is not connected")]
    NotConnected,
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

pub struct PostgresStorage {
    dsn: String,
    connect_timeout: Duration,
    pool: Mutex<Option<PgPool>>,
}

impl PostgresStorage {
    pub fn new(dsn: impl Into<String>) -> Self {
        Self {
            dsn: dsn.into(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            pool: Mutex::new(None),
        }
    }

    /// Bounds how long `connect` keeps retrying an unreachable database
    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    // The slot only ever holds a cloneable pool handle, so a poisoned lock
    // still guards a usable value.
    fn pool_slot(&self) -> MutexGuard<'_, Option<PgPool>> {
        self.pool.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Opens the pool and makes sure the event table exists
    ///
    /// Returns false, after logging the cause, if either step fails
    pub async fn connect(&self) -> bool {
        match self.try_connect().await {
            Ok(()) => {
                info!("Connected to session storage");
                true
            }
            Err(e) => {
                warn!("Session storage unavailable: {}", e);
                false
            }
        }
    }

    async fn try_connect(&self) -> Result<(), StorageError> {
        let pool = PgPoolOptions::new()
            .max_connections(MAX_POOL_CONNECTIONS)
            .acquire_timeout(self.connect_timeout)
            .connect(&self.dsn)
            .await?;
        sqlx::query(CREATE_SESSION_EVENTS).execute(&pool).await?;

        let previous = self.pool_slot().replace(pool);
        if let Some(previous) = previous {
            previous.close().await;
        }
        Ok(())
    }

    pub async fn disconnect(&self) {
        let pool = self.pool_slot().take();
        if let Some(pool) = pool {
            pool.close().await;
            info!("Disconnected from session storage");
        }
    }

    pub fn is_connected(&self) -> bool {
        self.pool_slot()
            .as_ref()
            .is_some_and(|pool| !pool.is_closed())
    }

    /// Inserts one lifecycle event. Returns false if nothing was written
    pub async fn record_session_event(&self, player_id: &str, event: SessionEvent) -> bool {
        match self.try_record(player_id, event).await {
            Ok(()) => true,
            Err(StorageError::NotConnected) => {
                debug!("Skipping {} event for {}: storage offline", event, player_id);
                false
            }
            Err(e) => {
                warn!("Failed to record {} event for {}: {}", event, player_id, e);
                false
            }
        }
    }

    async fn try_record(&self, player_id: &str, event: SessionEvent) -> Result<(), StorageError> {
        let pool = self.pool_slot().clone().ok_or(StorageError::NotConnected)?;
        sqlx::query(INSERT_SESSION_EVENT)
            .bind(player_id)
            .bind(event.as_str())
            .execute(&pool)
            .await?;
        Ok(())
    }
}
