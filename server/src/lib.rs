//! # Arena Server Library
//!
//! Authoritative movement server for a multiplayer arena. Clients stream their
//! movement input, the server integrates it into the canonical player state,
//! and every connected client receives the whole world on a fixed tick.
//!
//! ## Core Responsibilities
//!
//! ### Authoritative State
//! The [`session::SessionStore`] owns every player's position, facing and last
//! applied input sequence. Clients never write state directly; they only send
//! input, which the store validates and applies with the shared movement model.
//!
//! ### Input Ordering
//! Each input carries a sequence number. Inputs older than the last applied one
//! are dropped, so a reordered network cannot rewind a player.
//!
//! ### State Broadcasting
//! A [`tick::TickScheduler`] fires at a fixed rate on its own thread. On each
//! tick the [`network::StateBroadcaster`] snapshots the store and hands one
//! encoded frame to every connection.
//!
//! ## Architecture
//!
//! ### Threads and Tasks
//! - **Tick thread**: paces the simulation clock with absolute deadlines and
//!   never touches a socket.
//! - **Accept loop**: admits WebSocket clients up to a connection limit.
//! - **Connection tasks**: one per client, parsing input lines, replying with
//!   the client's own state and forwarding broadcasts.
//!
//! The store is the only shared mutable state and is guarded by a single lock
//! that is never held across I/O.
//!
//! ### Session Lifecycle
//! A connection claims the first free player id it names and owns that session
//! until it closes. [`hooks::SessionHooks`] observe the start and end of every
//! session; [`hooks::StorageHooks`] persists them through
//! [`storage::PostgresStorage`] when a database is configured.
//!
//! ## Module Organization
//!
//! - `session`: player state and input application
//! - `tick`: fixed-rate scheduler and the [`tick::TickObserver`] seam
//! - `connection`: per-connection binding and input clock
//! - `network`: dispatcher, accept loop and broadcast fan-out
//! - `hooks`, `storage`: session lifecycle persistence
//! - `metrics`: Prometheus counters and the `/metrics` endpoint
//! - `config`: command-line and environment settings
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::hooks::NoopHooks;
//! use server::metrics::ServerMetrics;
//! use server::network::{Dispatcher, DispatcherConfig};
//! use server::session::SessionStore;
//! use server::tick::TickScheduler;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let sessions = Arc::new(SessionStore::new());
//!     let metrics = Arc::new(ServerMetrics::new()?);
//!     let dispatcher = Dispatcher::bind(
//!         "127.0.0.1:8080",
//!         sessions,
//!         Arc::new(NoopHooks),
//!         metrics,
//!         DispatcherConfig::default(),
//!     )
//!     .await?;
//!
//!     // 60 Hz world broadcasts
//!     let mut scheduler = TickScheduler::new(60.0, Arc::new(dispatcher.broadcaster()))?;
//!     scheduler.start()?;
//!
//!     dispatcher.run().await?;
//!     scheduler.stop();
//!     scheduler.join();
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod connection;
pub mod hooks;
pub mod metrics;
pub mod network;
pub mod session;
pub mod storage;
pub mod tick;
