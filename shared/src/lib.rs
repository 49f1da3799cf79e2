//! Types and simulation rules shared by the arena server and its clients.
//!
//! The movement model lives here so that any client doing prediction runs the
//! exact same integration the server treats as authoritative.

use serde::{Deserialize, Serialize};

pub mod protocol;

/// Distance a player covers per second of held input, in world units.
pub const PLAYER_SPEED: f64 = 5.0;

/// Authoritative state of one registered player.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct PlayerState {
    pub player_id: String,
    pub x: f64,
    pub y: f64,
    pub facing_radians: f64,
    pub last_sequence: u64,
}

impl PlayerState {
    pub fn new(player_id: impl Into<String>) -> Self {
        Self {
            player_id: player_id.into(),
            x: 0.0,
            y: 0.0,
            facing_radians: 0.0,
            last_sequence: 0,
        }
    }
}

/// One client-reported input sample.
///
/// `mouse_x`/`mouse_y` form a direction vector relative to the player, not
/// screen coordinates.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Default)]
pub struct MovementInput {
    pub up: bool,
    pub down: bool,
    pub left: bool,
    pub right: bool,
    pub sequence: u64,
    pub mouse_x: f64,
    pub mouse_y: f64,
}

impl MovementInput {
    /// Unit-length intent vector built from the four movement flags.
    ///
    /// Opposing flags cancel out; diagonals are normalized so they are not
    /// faster than axis-aligned movement.
    pub fn direction(&self) -> (f64, f64) {
        let mut dx: f64 = 0.0;
        let mut dy: f64 = 0.0;
        if self.up {
            dy -= 1.0;
        }
        if self.down {
            dy += 1.0;
        }
        if self.left {
            dx -= 1.0;
        }
        if self.right {
            dx += 1.0;
        }

        let magnitude = (dx * dx + dy * dy).sqrt();
        if magnitude > 0.0 {
            (dx / magnitude, dy / magnitude)
        } else {
            (0.0, 0.0)
        }
    }

    /// Absolute facing angle derived from the mouse direction vector.
    pub fn facing(&self) -> f64 {
        self.mouse_y.atan2(self.mouse_x)
    }
}

/// Emitted once per scheduler iteration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TickInfo {
    pub tick: u64,
    pub delta_seconds: f64,
}

/// Integrates one input sample into a player's position and facing.
///
/// Pure function: the caller decides whether the input is admissible (sequence
/// ordering lives in the session store). A negative or non-finite elapsed time
/// moves nothing, and a non-finite mouse vector keeps the previous facing, so
/// position and facing stay finite.
pub fn step_movement(
    state: &mut PlayerState,
    input: &MovementInput,
    speed_per_second: f64,
    delta_seconds: f64,
) {
    let delta_seconds = if delta_seconds.is_finite() && delta_seconds > 0.0 {
        delta_seconds
    } else {
        0.0
    };

    let (dx, dy) = input.direction();
    let distance = speed_per_second * delta_seconds;
    let next_x = state.x + dx * distance;
    let next_y = state.y + dy * distance;
    if next_x.is_finite() && next_y.is_finite() {
        state.x = next_x;
        state.y = next_y;
    }

    let facing = input.facing();
    if facing.is_finite() {
        state.facing_radians = facing;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use std::f64::consts::{FRAC_PI_2, PI};

    fn input(up: bool, down: bool, left: bool, right: bool) -> MovementInput {
        MovementInput {
            up,
            down,
            left,
            right,
            sequence: 0,
            mouse_x: 1.0,
            mouse_y: 0.0,
        }
    }

    #[test]
    fn test_player_creation() {
        let player = PlayerState::new("alice");
        assert_eq!(player.player_id, "alice");
        assert_eq!(player.x, 0.0);
        assert_eq!(player.y, 0.0);
        assert_eq!(player.facing_radians, 0.0);
        assert_eq!(player.last_sequence, 0);
    }

    #[test]
    fn test_direction_axis_aligned() {
        assert_eq!(input(true, false, false, false).direction(), (0.0, -1.0));
        assert_eq!(input(false, true, false, false).direction(), (0.0, 1.0));
        assert_eq!(input(false, false, true, false).direction(), (-1.0, 0.0));
        assert_eq!(input(false, false, false, true).direction(), (1.0, 0.0));
    }

    #[test]
    fn test_direction_opposing_flags_cancel() {
        assert_eq!(input(true, true, false, false).direction(), (0.0, 0.0));
        assert_eq!(input(false, false, true, true).direction(), (0.0, 0.0));
        assert_eq!(input(true, true, true, true).direction(), (0.0, 0.0));
    }

    #[test]
    fn test_diagonal_is_normalized() {
        let (dx, dy) = input(true, false, false, true).direction();
        assert_approx_eq!((dx * dx + dy * dy).sqrt(), 1.0, 1e-12);
        assert!(dx > 0.0);
        assert!(dy < 0.0);
    }

    #[test]
    fn test_step_moves_by_speed_times_delta() {
        let mut player = PlayerState::new("p");
        step_movement(&mut player, &input(false, false, false, true), 5.0, 0.5);
        assert_approx_eq!(player.x, 2.5, 1e-12);
        assert_approx_eq!(player.y, 0.0, 1e-12);
    }

    #[test]
    fn test_step_diagonal_displacement_magnitude() {
        let mut player = PlayerState::new("p");
        let dt = 0.2;
        step_movement(&mut player, &input(true, false, false, true), PLAYER_SPEED, dt);
        let magnitude = (player.x * player.x + player.y * player.y).sqrt();
        assert_approx_eq!(magnitude, PLAYER_SPEED * dt, 1e-9);
    }

    #[test]
    fn test_facing_is_absolute() {
        let mut player = PlayerState::new("p");
        player.x = 40.0;
        player.y = -3.0;
        player.facing_radians = 1.0;

        let mut sample = input(false, false, false, false);
        sample.mouse_x = 0.0;
        sample.mouse_y = 1.0;
        step_movement(&mut player, &sample, PLAYER_SPEED, 0.016);
        assert_approx_eq!(player.facing_radians, FRAC_PI_2, 1e-12);

        sample.mouse_x = -1.0;
        sample.mouse_y = 0.0;
        step_movement(&mut player, &sample, PLAYER_SPEED, 0.016);
        assert_approx_eq!(player.facing_radians, PI, 1e-12);
    }

    #[test]
    fn test_zero_mouse_vector_faces_zero() {
        let mut player = PlayerState::new("p");
        player.facing_radians = 2.0;
        let mut sample = input(false, false, false, false);
        sample.mouse_x = 0.0;
        sample.mouse_y = 0.0;
        step_movement(&mut player, &sample, PLAYER_SPEED, 0.016);
        assert_eq!(player.facing_radians, 0.0);
    }

    #[test]
    fn test_invalid_delta_does_not_move() {
        let mut player = PlayerState::new("p");
        let right = input(false, false, false, true);

        step_movement(&mut player, &right, PLAYER_SPEED, -1.0);
        assert_eq!(player.x, 0.0);

        step_movement(&mut player, &right, PLAYER_SPEED, f64::NAN);
        assert_eq!(player.x, 0.0);

        step_movement(&mut player, &right, PLAYER_SPEED, f64::INFINITY);
        assert_eq!(player.x, 0.0);
    }

    #[test]
    fn test_non_finite_mouse_keeps_facing() {
        let mut player = PlayerState::new("p");
        player.facing_radians = 0.75;
        let mut sample = input(false, false, false, false);
        sample.mouse_x = f64::NAN;
        step_movement(&mut player, &sample, PLAYER_SPEED, 0.016);
        assert_eq!(player.facing_radians, 0.75);
    }
}
