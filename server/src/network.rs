//! Server network layer: WebSocket connections, input dispatch and state fan-out
//!
//! Each accepted connection runs in its own task. Inbound text is split into
//! lines, every line is parsed as an input frame and applied to the
//! [`SessionStore`], and the resulting player state is echoed back to the
//! sender. Periodic world snapshots come from the tick thread through a
//! [`StateBroadcaster`] and reach every connection over a broadcast channel, so
//! the tick thread never waits on a socket.

use crate::connection::{Binding, Connection, InputTiming};
use crate::hooks::SessionHooks;
use crate::metrics::{
    ServerMetrics, DROP_MALFORMED, DROP_OVERFLOW, DROP_REFUSED, DROP_STALE, DROP_UNKNOWN_PLAYER,
};
use crate::session::{ApplyOutcome, SessionStore};
use crate::tick::{ObserverResult, TickObserver};
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use shared::protocol::{encode_error_frame, encode_state_frame, parse_input_frame};
use shared::TickInfo;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_tungstenite::accept_async_with_config;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;

/// Ticks between periodic debug summaries from the broadcaster
const SUMMARY_INTERVAL_TICKS: u64 = 600;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Largest inbound WebSocket message or frame, in bytes
const MAX_MESSAGE_BYTES: usize = 64 * 1024;

/// Input lines handled per text message; the rest get one error reply
const MAX_LINES_PER_MESSAGE: usize = 64;

fn websocket_config() -> WebSocketConfig {
    let mut config = WebSocketConfig::default();
    config.max_message_size = Some(MAX_MESSAGE_BYTES);
    config.max_frame_size = Some(MAX_MESSAGE_BYTES);
    config
}

/// Tunables for a [`Dispatcher`]
#[derive(Debug, Clone, Copy)]
pub struct DispatcherConfig {
    pub timing: InputTiming,
    /// Connections beyond this are closed right after accept
    pub max_connections: usize,
    /// Broadcast frames buffered per connection before it starts skipping
    pub broadcast_capacity: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            timing: InputTiming::default(),
            max_connections: 256,
            broadcast_capacity: 64,
        }
    }
}

/// Everything a connection task needs, cheap to clone
#[derive(Clone)]
struct ConnectionContext {
    sessions: Arc<SessionStore>,
    hooks: Arc<dyn SessionHooks>,
    metrics: Arc<ServerMetrics>,
    frames: broadcast::Sender<Arc<str>>,
    timing: InputTiming,
}

/// Non-blocking stop request for a running [`Dispatcher`]
#[derive(Debug, Clone)]
pub struct DispatcherHandle {
    shutdown: Arc<watch::Sender<bool>>,
}

impl DispatcherHandle {
    /// Asks the dispatcher to stop accepting and close every connection
    pub fn stop(&self) {
        self.shutdown.send_replace(true);
    }

    pub fn is_stopped(&self) -> bool {
        *self.shutdown.borrow()
    }
}

/// Publishes a snapshot of every session on each tick
///
/// Runs on the scheduler thread. It only copies the store and queues one
/// encoded frame, the connection tasks do the actual writes
#[derive(Clone)]
pub struct StateBroadcaster {
    sessions: Arc<SessionStore>,
    frames: broadcast::Sender<Arc<str>>,
    metrics: Arc<ServerMetrics>,
}

impl TickObserver for StateBroadcaster {
    fn on_tick(&self, info: &TickInfo) -> ObserverResult {
        self.metrics.ticks_total.inc();
        self.metrics.tick_delta_seconds.set(info.delta_seconds);

        let snapshot = self.sessions.snapshot();

        if info.tick % SUMMARY_INTERVAL_TICKS == 0 {
            debug!(
                "Tick {}: {} players, {} listeners, delta {:.4}s",
                info.tick,
                snapshot.len(),
                self.frames.receiver_count(),
                info.delta_seconds
            );
        }

        if self.frames.receiver_count() == 0 {
            return Ok(());
        }
        let frame = encode_state_frame(Some(info.tick), &snapshot)?;
        // Only fails when every receiver went away after the check above
        let _ = self.frames.send(Arc::from(frame));
        Ok(())
    }
}

/// Accepts WebSocket clients and routes their input into the session store
pub struct Dispatcher {
    listener: TcpListener,
    context: ConnectionContext,
    shutdown: Arc<watch::Sender<bool>>,
    max_connections: usize,
}

impl Dispatcher {
    pub async fn bind<A: ToSocketAddrs>(
        addr: A,
        sessions: Arc<SessionStore>,
        hooks: Arc<dyn SessionHooks>,
        metrics: Arc<ServerMetrics>,
        config: DispatcherConfig,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!("Server listening on {}", listener.local_addr()?);

        let (frames, _) = broadcast::channel(config.broadcast_capacity.max(1));
        let (shutdown, _) = watch::channel(false);

        Ok(Self {
            listener,
            context: ConnectionContext {
                sessions,
                hooks,
                metrics,
                frames,
                timing: config.timing,
            },
            shutdown: Arc::new(shutdown),
            max_connections: config.max_connections,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn handle(&self) -> DispatcherHandle {
        DispatcherHandle {
            shutdown: Arc::clone(&self.shutdown),
        }
    }

    /// Tick observer that fans snapshots out to this dispatcher's connections
    pub fn broadcaster(&self) -> StateBroadcaster {
        StateBroadcaster {
            sessions: Arc::clone(&self.context.sessions),
            frames: self.context.frames.clone(),
            metrics: Arc::clone(&self.context.metrics),
        }
    }

    /// Accept loop. Returns once stopped and every connection task has ended
    pub async fn run(self) -> io::Result<()> {
        let Dispatcher {
            listener,
            context,
            shutdown,
            max_connections,
        } = self;

        let mut stop_rx = shutdown.subscribe();
        let mut tasks = JoinSet::new();
        let mut next_connection_id: u64 = 1;

        loop {
            if *stop_rx.borrow_and_update() {
                break;
            }

            tokio::select! {
                _ = stop_rx.changed() => {}
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        if tasks.len() >= max_connections {
                            warn!("Rejecting connection from {}: server full ({} connections)", addr, tasks.len());
                            context.metrics.connections_rejected_total.inc();
                            drop(stream);
                            continue;
                        }
                        let id = next_connection_id;
                        next_connection_id += 1;
                        tasks.spawn(handle_connection(
                            stream,
                            addr,
                            id,
                            context.clone(),
                            shutdown.subscribe(),
                        ));
                    }
                    Err(e) => {
                        error!("Error accepting connection: {}", e);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                },
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined {
                        error!("Connection task failed: {}", e);
                    }
                }
            }
        }

        drop(listener);
        info!("Dispatcher stopping, closing {} connections", tasks.len());
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!("Connection task failed: {}", e);
            }
        }
        info!("Dispatcher stopped");
        Ok(())
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    id: u64,
    context: ConnectionContext,
    mut stop_rx: watch::Receiver<bool>,
) {
    if *stop_rx.borrow_and_update() {
        return;
    }
    if let Err(e) = stream.set_nodelay(true) {
        debug!("Could not disable Nagle for {}: {}", addr, e);
    }

    let handshake = tokio::time::timeout(
        HANDSHAKE_TIMEOUT,
        accept_async_with_config(stream, Some(websocket_config())),
    );
    let ws = tokio::select! {
        _ = stop_rx.changed() => {
            debug!("Abandoning handshake with {}: dispatcher stopping", addr);
            return;
        }
        result = handshake => match result {
            Ok(Ok(ws)) => ws,
            Ok(Err(e)) => {
                warn!("WebSocket handshake with {} failed: {}", addr, e);
                return;
            }
            Err(_) => {
                warn!("WebSocket handshake with {} timed out", addr);
                return;
            }
        },
    };

    context.metrics.connections_active.inc();
    context.metrics.connections_total.inc();
    info!("Connection {} opened from {}", id, addr);

    let mut connection = Connection::new(id, addr, context.timing);
    let mut frames = context.frames.subscribe();
    let (mut sink, mut inbound) = ws.split();

    loop {
        tokio::select! {
            _ = stop_rx.changed() => {
                let _ = sink.send(Message::Close(None)).await;
                break;
            }
            message = inbound.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    let replies = context.handle_text(&mut connection, &text, Instant::now());
                    if send_all(&mut sink, replies).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Binary(_))) => {
                    debug!("Connection {} sent a binary message, ignoring", id);
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!("Connection {} transport error: {}", id, e);
                    break;
                }
            },
            frame = frames.recv() => match frame {
                Ok(frame) => {
                    if sink.send(Message::text(frame.to_string())).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    debug!("Connection {} fell behind, skipped {} state frames", id, skipped);
                    context.metrics.broadcast_frames_lagged_total.inc_by(skipped);
                }
                Err(RecvError::Closed) => break,
            },
        }
    }

    context.close(&mut connection);
    context.metrics.connections_active.dec();
    info!(
        "Connection {} from {} closed after {:.1?}",
        id,
        addr,
        connection.age()
    );
}

async fn send_all<S>(sink: &mut S, replies: Vec<String>) -> Result<(), S::Error>
where
    S: futures_util::Sink<Message> + Unpin,
{
    for reply in replies {
        sink.feed(Message::text(reply)).await?;
    }
    sink.flush().await
}

impl ConnectionContext {
    /// Handles the lines of one text message received at `now`, returning the
    /// replies in order
    fn handle_text(&self, connection: &mut Connection, text: &str, now: Instant) -> Vec<String> {
        let mut lines = text.lines().filter(|line| !line.trim().is_empty());
        let mut replies: Vec<String> = lines
            .by_ref()
            .take(MAX_LINES_PER_MESSAGE)
            .filter_map(|line| self.handle_line(connection, line, now))
            .collect();

        let dropped = lines.count();
        if dropped > 0 {
            warn!(
                "Connection {} sent more than {} frames in one message, dropped {}",
                connection.id, MAX_LINES_PER_MESSAGE, dropped
            );
            self.metrics
                .inputs_dropped_total
                .with_label_values(&[DROP_OVERFLOW])
                .inc_by(dropped as u64);
            replies.push(encode_error_frame(&format!(
                "at most {} frames per message, dropped {}",
                MAX_LINES_PER_MESSAGE, dropped
            )));
        }
        replies
    }

    fn handle_line(
        &self,
        connection: &mut Connection,
        line: &str,
        now: Instant,
    ) -> Option<String> {
        let frame = match parse_input_frame(line) {
            Ok(frame) => frame,
            Err(e) => {
                debug!("Connection {} sent a malformed frame: {}", connection.id, e);
                self.metrics.input_dropped(DROP_MALFORMED);
                return Some(encode_error_frame(&e.to_string()));
            }
        };
        let player_id = frame.player_id.as_str();

        match connection.binding(player_id) {
            Binding::Bound => {}
            Binding::Mismatch { bound } => {
                self.metrics.input_dropped(DROP_REFUSED);
                return Some(encode_error_frame(&format!(
                    "connection controls `{}`, not `{}`",
                    bound, player_id
                )));
            }
            Binding::Unbound => {
                if !self.sessions.register(player_id) {
                    warn!(
                        "Connection {} asked for player {} which is already in use",
                        connection.id, player_id
                    );
                    self.metrics.input_dropped(DROP_REFUSED);
                    return Some(encode_error_frame(&format!(
                        "player `{}` is already in use",
                        player_id
                    )));
                }
                connection.claim(player_id);
                self.metrics.sessions_active.inc();
                self.hooks.on_session_start(player_id);
            }
        }

        let delta_seconds = connection.input_delta(now);
        match self.sessions.apply_input(player_id, &frame.input, delta_seconds) {
            ApplyOutcome::Applied => {
                connection.record_input(now);
                self.metrics.inputs_applied_total.inc();
            }
            ApplyOutcome::Stale => self.metrics.input_dropped(DROP_STALE),
            ApplyOutcome::UnknownPlayer => self.metrics.input_dropped(DROP_UNKNOWN_PLAYER),
        }

        let state = match self.sessions.get(player_id) {
            Ok(state) => state,
            Err(e) => return Some(encode_error_frame(&e.to_string())),
        };
        match encode_state_frame(None, std::slice::from_ref(&state)) {
            Ok(reply) => Some(reply),
            Err(e) => {
                error!("Failed to encode state for {}: {}", player_id, e);
                None
            }
        }
    }

    /// Ends the session this connection owns, if any
    fn close(&self, connection: &mut Connection) {
        if let Some(player_id) = connection.release() {
            if self.sessions.unregister(&player_id) {
                self.metrics.sessions_active.dec();
                self.hooks.on_session_end(&player_id);
            }
        }
    }
}
