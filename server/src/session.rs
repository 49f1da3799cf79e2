//! Authoritative per-player state shared by the dispatcher and the tick loop
//!
//! The store owns the session map outright. Every operation takes the one
//! store-wide lock for its full duration and hands out copies, so callers never
//! alias an entry and a snapshot is always a single point in time.

use log::{info, trace};
use shared::{step_movement, MovementInput, PlayerState, PLAYER_SPEED};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("player `{0}` not found")]
    NotFound(String),
}

/// What `apply_input` did with a sample
///
/// Dropped samples are expected under network reordering and are not errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    UnknownPlayer,
    Stale,
}

#[derive(Debug)]
pub struct SessionStore {
    speed_per_second: f64,
    players: Mutex<HashMap<String, PlayerState>>,
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionStore {
    pub fn new() -> Self {
        Self::with_speed(PLAYER_SPEED)
    }

    pub fn with_speed(speed_per_second: f64) -> Self {
        Self {
            speed_per_second,
            players: Mutex::new(HashMap::new()),
        }
    }

    // A panic while holding the lock can only happen between whole-field
    // writes of plain data, so the map is still consistent.
    fn players(&self) -> MutexGuard<'_, HashMap<String, PlayerState>> {
        self.players.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Inserts a zeroed state for `player_id` unless it is already present
    ///
    /// Returns true only when a new session was created
    pub fn register(&self, player_id: &str) -> bool {
        let mut players = self.players();
        if players.contains_key(player_id) {
            return false;
        }
        players.insert(player_id.to_string(), PlayerState::new(player_id));
        info!("Registered player {}", player_id);
        true
    }

    /// Removes `player_id`. Returns true if a session was removed
    pub fn unregister(&self, player_id: &str) -> bool {
        let removed = self.players().remove(player_id).is_some();
        if removed {
            info!("Removed player {}", player_id);
        }
        removed
    }

    /// Applies one input sample for `player_id`
    ///
    /// Samples for unknown players, and samples whose sequence is lower than the
    /// last applied one, leave the store untouched. An equal sequence is applied
    /// again
    pub fn apply_input(
        &self,
        player_id: &str,
        input: &MovementInput,
        delta_seconds: f64,
    ) -> ApplyOutcome {
        let mut players = self.players();
        let Some(state) = players.get_mut(player_id) else {
            trace!("Dropping input for unknown player {}", player_id);
            return ApplyOutcome::UnknownPlayer;
        };

        if input.sequence < state.last_sequence {
            trace!(
                "Dropping stale input {} for {} (last {})",
                input.sequence,
                player_id,
                state.last_sequence
            );
            return ApplyOutcome::Stale;
        }

        state.last_sequence = input.sequence;
        step_movement(state, input, self.speed_per_second, delta_seconds);
        ApplyOutcome::Applied
    }

    pub fn get(&self, player_id: &str) -> Result<PlayerState, SessionError> {
        self.players()
            .get(player_id)
            .cloned()
            .ok_or_else(|| SessionError::NotFound(player_id.to_string()))
    }

    /// Copies every player's state. Order is unspecified
    pub fn snapshot(&self) -> Vec<PlayerState> {
        self.players().values().cloned().collect()
    }

    pub fn contains(&self, player_id: &str) -> bool {
        self.players().contains_key(player_id)
    }

    pub fn len(&self) -> usize {
        self.players().len()
    }

    pub fn is_empty(&self) -> bool {
        self.players().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::thread;

    fn moving_right(sequence: u64) -> MovementInput {
        MovementInput {
            right: true,
            sequence,
            mouse_x: 1.0,
            ..MovementInput::default()
        }
    }

    #[test]
    fn test_register_creates_zeroed_state() {
        let store = SessionStore::new();
        assert!(store.register("alice"));

        let state = store.get("alice").unwrap();
        assert_eq!(state, PlayerState::new("alice"));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_register_is_idempotent() {
        let store = SessionStore::new();
        assert!(store.register("alice"));
        store.apply_input("alice", &moving_right(4), 1.0);
        let before = store.get("alice").unwrap();

        assert!(!store.register("alice"));
        assert_eq!(store.get("alice").unwrap(), before);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_unregister_is_idempotent() {
        let store = SessionStore::new();
        store.register("alice");
        assert!(store.unregister("alice"));
        assert!(!store.unregister("alice"));
        assert!(!store.unregister("never-registered"));
        assert!(store.is_empty());
    }

    #[test]
    fn test_get_after_unregister_is_not_found() {
        let store = SessionStore::new();
        store.register("alice");
        store.unregister("alice");
        assert_eq!(
            store.get("alice"),
            Err(SessionError::NotFound("alice".to_string()))
        );
    }

    #[test]
    fn test_apply_input_moves_player() {
        let store = SessionStore::with_speed(10.0);
        store.register("alice");

        assert_eq!(
            store.apply_input("alice", &moving_right(1), 0.5),
            ApplyOutcome::Applied
        );
        let state = store.get("alice").unwrap();
        assert_approx_eq!(state.x, 5.0, 1e-12);
        assert_eq!(state.last_sequence, 1);
    }

    #[test]
    fn test_apply_input_unknown_player_creates_nothing() {
        let store = SessionStore::new();
        store.register("alice");

        assert_eq!(
            store.apply_input("mallory", &moving_right(1), 1.0),
            ApplyOutcome::UnknownPlayer
        );
        assert_eq!(store.len(), 1);
        assert!(!store.contains("mallory"));
    }

    #[test]
    fn test_stale_input_leaves_state_untouched() {
        let store = SessionStore::new();
        store.register("alice");
        store.apply_input("alice", &moving_right(10), 0.3);
        let before = store.get("alice").unwrap();

        let mut stale = moving_right(9);
        stale.up = true;
        stale.mouse_y = 3.0;
        assert_eq!(store.apply_input("alice", &stale, 1.0), ApplyOutcome::Stale);

        let after = store.get("alice").unwrap();
        assert_eq!(after.x.to_bits(), before.x.to_bits());
        assert_eq!(after.y.to_bits(), before.y.to_bits());
        assert_eq!(after.facing_radians.to_bits(), before.facing_radians.to_bits());
        assert_eq!(after.last_sequence, before.last_sequence);
    }

    #[test]
    fn test_equal_sequence_is_reapplied() {
        let store = SessionStore::with_speed(1.0);
        store.register("alice");

        store.apply_input("alice", &moving_right(5), 1.0);
        assert_eq!(
            store.apply_input("alice", &moving_right(5), 1.0),
            ApplyOutcome::Applied
        );
        assert_approx_eq!(store.get("alice").unwrap().x, 2.0, 1e-12);
    }

    #[test]
    fn test_first_input_with_sequence_zero_is_applied() {
        let store = SessionStore::with_speed(1.0);
        store.register("alice");
        assert_eq!(
            store.apply_input("alice", &moving_right(0), 1.0),
            ApplyOutcome::Applied
        );
        assert_approx_eq!(store.get("alice").unwrap().x, 1.0, 1e-12);
    }

    #[test]
    fn test_snapshot_contains_every_player() {
        let store = SessionStore::new();
        for id in ["a", "b", "c"] {
            store.register(id);
        }
        store.unregister("b");

        let ids: HashSet<String> = store.snapshot().into_iter().map(|p| p.player_id).collect();
        let expected: HashSet<String> = ["a", "c"].iter().map(|s| s.to_string()).collect();
        assert_eq!(ids, expected);
    }

    #[test]
    fn test_snapshot_is_a_copy() {
        let store = SessionStore::new();
        store.register("alice");
        let mut snapshot = store.snapshot();
        snapshot[0].x = 99.0;
        assert_eq!(store.get("alice").unwrap().x, 0.0);
    }

    #[test]
    fn test_concurrent_inputs_for_different_players() {
        let store = Arc::new(SessionStore::with_speed(1.0));
        let players: Vec<String> = (0..8).map(|i| format!("p{}", i)).collect();
        for id in &players {
            store.register(id);
        }

        let handles: Vec<_> = players
            .iter()
            .cloned()
            .map(|id| {
                let store = Arc::clone(&store);
                thread::spawn(move || {
                    for seq in 1..=500 {
                        store.apply_input(&id, &moving_right(seq), 0.01);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        for id in &players {
            let state = store.get(id).unwrap();
            assert_eq!(state.last_sequence, 500);
            assert_approx_eq!(state.x, 5.0, 1e-9);
        }
    }
}
