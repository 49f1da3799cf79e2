//! Per-connection bookkeeping for the dispatcher
//!
//! A connection starts anonymous and becomes bound to a player the first time
//! one of its input frames names a player id that is free. From then on it may
//! only drive that player, and it owns the player's session: when the
//! connection goes away, so does the session.
//!
//! Each connection also keeps its own input clock, which decides how much
//! simulated time an input frame represents.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// How the elapsed time for each input frame is derived
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InputTiming {
    /// Seconds applied to a connection's first input
    pub first_input_delta: f64,
    /// Upper bound on the seconds a single input may cover
    pub max_input_delta: f64,
}

impl InputTiming {
    /// Timing for a server ticking at `tick_rate` Hz
    ///
    /// The first input of a connection counts as one tick
    pub fn for_tick_rate(tick_rate: f64, max_input_delta: f64) -> Self {
        Self {
            first_input_delta: (1.0 / tick_rate).min(max_input_delta),
            max_input_delta,
        }
    }
}

impl Default for InputTiming {
    fn default() -> Self {
        Self::for_tick_rate(60.0, 0.1)
    }
}

/// How a player id named in a frame relates to a connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Binding {
    /// The connection does not control any player yet
    Unbound,
    /// The connection already controls this player
    Bound,
    /// The connection controls a different player
    Mismatch { bound: String },
}

/// Represents one open client connection
#[derive(Debug)]
pub struct Connection {
    /// Server-assigned connection identifier
    pub id: u64,
    /// Remote address, used for logging
    pub addr: SocketAddr,
    /// When the transport handshake completed
    pub connected_at: Instant,
    player_id: Option<String>,
    last_input: Option<Instant>,
    timing: InputTiming,
}

impl Connection {
    pub fn new(id: u64, addr: SocketAddr, timing: InputTiming) -> Self {
        Self {
            id,
            addr,
            connected_at: Instant::now(),
            player_id: None,
            last_input: None,
            timing,
        }
    }

    /// The player this connection controls, if any
    pub fn player_id(&self) -> Option<&str> {
        self.player_id.as_deref()
    }

    /// Checks `player_id` against the current binding
    ///
    /// For [`Binding::Unbound`] the caller registers the session and, on
    /// success, calls [`Connection::claim`]
    pub fn binding(&self, player_id: &str) -> Binding {
        match &self.player_id {
            Some(bound) if bound == player_id => Binding::Bound,
            Some(bound) => Binding::Mismatch {
                bound: bound.clone(),
            },
            None => Binding::Unbound,
        }
    }

    /// Records that this connection registered and now owns `player_id`
    pub fn claim(&mut self, player_id: &str) {
        self.player_id = Some(player_id.to_string());
    }

    /// Drops the binding and returns the player whose session must be closed
    pub fn release(&mut self) -> Option<String> {
        self.last_input = None;
        self.player_id.take()
    }

    /// Seconds of simulated time covered by an input arriving at `now`
    ///
    /// The first input uses the configured first-input delta; every later one
    /// uses the wall-clock gap since the last applied input, capped so that a
    /// stalled client cannot cover a long distance with one frame. Does not
    /// move the input clock; see [`Connection::record_input`]
    pub fn input_delta(&self, now: Instant) -> f64 {
        let delta = match self.last_input {
            Some(previous) => now.saturating_duration_since(previous).as_secs_f64(),
            None => self.timing.first_input_delta,
        };
        delta.max(0.0).min(self.timing.max_input_delta)
    }

    /// Advances the input clock to `now`
    ///
    /// Only applied inputs move the clock, so time spent on dropped frames is
    /// still credited to the next applied one
    pub fn record_input(&mut self, now: Instant) {
        self.last_input = Some(now);
    }

    /// How long the connection has been open
    pub fn age(&self) -> Duration {
        self.connected_at.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    fn test_addr() -> SocketAddr {
        "127.0.0.1:8080".parse().unwrap()
    }

    fn timing() -> InputTiming {
        InputTiming {
            first_input_delta: 1.0 / 60.0,
            max_input_delta: 0.1,
        }
    }

    #[test]
    fn test_connection_creation() {
        let connection = Connection::new(7, test_addr(), timing());
        assert_eq!(connection.id, 7);
        assert_eq!(connection.addr, test_addr());
        assert_eq!(connection.player_id(), None);
    }

    #[test]
    fn test_unbound_connection_has_no_binding() {
        let connection = Connection::new(1, test_addr(), timing());
        assert_eq!(connection.binding("alice"), Binding::Unbound);
    }

    #[test]
    fn test_claim_and_rebind() {
        let mut connection = Connection::new(1, test_addr(), timing());
        connection.claim("alice");
        assert_eq!(connection.player_id(), Some("alice"));
        assert_eq!(connection.binding("alice"), Binding::Bound);
        assert_eq!(
            connection.binding("bob"),
            Binding::Mismatch {
                bound: "alice".to_string()
            }
        );
    }

    #[test]
    fn test_release_returns_owned_player_once() {
        let mut connection = Connection::new(1, test_addr(), timing());
        connection.claim("alice");
        assert_eq!(connection.release(), Some("alice".to_string()));
        assert_eq!(connection.release(), None);
    }

    /// Computes the delta for an input at `now` and records it as applied
    fn apply_at(connection: &mut Connection, now: Instant) -> f64 {
        let delta = connection.input_delta(now);
        connection.record_input(now);
        delta
    }

    #[test]
    fn test_first_input_uses_configured_delta() {
        let connection = Connection::new(1, test_addr(), timing());
        assert_approx_eq!(connection.input_delta(Instant::now()), 1.0 / 60.0, 1e-12);
    }

    #[test]
    fn test_later_inputs_use_wall_clock_gap() {
        let mut connection = Connection::new(1, test_addr(), timing());
        let start = Instant::now();
        apply_at(&mut connection, start);
        let delta = apply_at(&mut connection, start + Duration::from_millis(40));
        assert_approx_eq!(delta, 0.04, 1e-9);
    }

    #[test]
    fn test_unrecorded_input_leaves_clock_alone() {
        let mut connection = Connection::new(1, test_addr(), timing());
        let start = Instant::now();
        apply_at(&mut connection, start);

        // A dropped frame in between only reads the clock
        assert_approx_eq!(
            connection.input_delta(start + Duration::from_millis(30)),
            0.03,
            1e-9
        );
        let delta = apply_at(&mut connection, start + Duration::from_millis(50));
        assert_approx_eq!(delta, 0.05, 1e-9);
    }

    #[test]
    fn test_input_delta_is_capped() {
        let mut connection = Connection::new(1, test_addr(), timing());
        let start = Instant::now();
        apply_at(&mut connection, start);
        let delta = apply_at(&mut connection, start + Duration::from_secs(5));
        assert_approx_eq!(delta, 0.1, 1e-12);
    }

    #[test]
    fn test_out_of_order_clock_yields_zero() {
        let mut connection = Connection::new(1, test_addr(), timing());
        let start = Instant::now() + Duration::from_millis(10);
        apply_at(&mut connection, start);
        assert_eq!(connection.input_delta(start - Duration::from_millis(5)), 0.0);
    }

    #[test]
    fn test_release_resets_input_clock() {
        let mut connection = Connection::new(1, test_addr(), timing());
        let start = Instant::now();
        connection.claim("alice");
        apply_at(&mut connection, start);
        connection.release();
        assert_approx_eq!(
            connection.input_delta(start + Duration::from_secs(1)),
            1.0 / 60.0,
            1e-12
        );
    }

    #[test]
    fn test_timing_for_tick_rate() {
        let timing = InputTiming::for_tick_rate(30.0, 0.25);
        assert_approx_eq!(timing.first_input_delta, 1.0 / 30.0, 1e-12);
        assert_eq!(timing.max_input_delta, 0.25);

        let capped = InputTiming::for_tick_rate(2.0, 0.1);
        assert_eq!(capped.first_input_delta, 0.1);
    }
}
