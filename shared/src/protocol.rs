//! Line-oriented text protocol spoken between clients and the arena server.
//!
//! Inbound:  `input <player_id> <up> <down> <left> <right> <sequence> <mouse_x> <mouse_y>`
//! Outbound: `state <json>` and `error <reason>`

use crate::{MovementInput, PlayerState};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const INPUT_COMMAND: &str = "input";
pub const STATE_PREFIX: &str = "state";
pub const ERROR_PREFIX: &str = "error";

/// Longest player id accepted on the wire, in bytes.
pub const MAX_PLAYER_ID_LEN: usize = 64;

const INPUT_FIELD_COUNT: usize = 9;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ProtocolError {
    #[error("empty frame")]
    Empty,
    #[error("unknown command `{0}`")]
    UnknownCommand(String),
    #[error("expected {expected} fields, found {found}")]
    WrongArity { expected: usize, found: usize },
    #[error("player id longer than {} bytes", MAX_PLAYER_ID_LEN)]
    PlayerIdTooLong,
    #[error("flag `{field}` must be 0 or 1, got `{value}`")]
    InvalidFlag { field: &'static str, value: String },
    #[error("invalid sequence `{0}`")]
    InvalidSequence(String),
    #[error("field `{field}` is not a number: `{value}`")]
    InvalidNumber { field: &'static str, value: String },
    #[error("field `{0}` must be finite")]
    NonFinite(&'static str),
    #[error("frame does not start with `state`")]
    NotAStateFrame,
    #[error("malformed state payload: {0}")]
    Payload(String),
}

/// A parsed inbound input line.
#[derive(Debug, Clone, PartialEq)]
pub struct InputFrame {
    pub player_id: String,
    pub input: MovementInput,
}

/// Payload of an outbound `state` frame.
///
/// `tick` is present on periodic broadcasts and absent on per-input replies.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct StateFrame {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tick: Option<u64>,
    pub players: Vec<PlayerState>,
}

fn parse_flag(field: &'static str, value: &str) -> Result<bool, ProtocolError> {
    match value {
        "0" => Ok(false),
        "1" => Ok(true),
        other => Err(ProtocolError::InvalidFlag {
            field,
            value: other.to_string(),
        }),
    }
}

fn parse_coordinate(field: &'static str, value: &str) -> Result<f64, ProtocolError> {
    let parsed: f64 = value.parse().map_err(|_| ProtocolError::InvalidNumber {
        field,
        value: value.to_string(),
    })?;
    if !parsed.is_finite() {
        return Err(ProtocolError::NonFinite(field));
    }
    Ok(parsed)
}

/// Parses one inbound line into an [`InputFrame`].
pub fn parse_input_frame(line: &str) -> Result<InputFrame, ProtocolError> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    let command = fields.first().ok_or(ProtocolError::Empty)?;
    if *command != INPUT_COMMAND {
        return Err(ProtocolError::UnknownCommand(command.to_string()));
    }
    if fields.len() != INPUT_FIELD_COUNT {
        return Err(ProtocolError::WrongArity {
            expected: INPUT_FIELD_COUNT,
            found: fields.len(),
        });
    }

    let player_id = fields[1];
    if player_id.len() > MAX_PLAYER_ID_LEN {
        return Err(ProtocolError::PlayerIdTooLong);
    }

    let sequence = fields[6]
        .parse::<u64>()
        .map_err(|_| ProtocolError::InvalidSequence(fields[6].to_string()))?;

    let input = MovementInput {
        up: parse_flag("up", fields[2])?,
        down: parse_flag("down", fields[3])?,
        left: parse_flag("left", fields[4])?,
        right: parse_flag("right", fields[5])?,
        sequence,
        mouse_x: parse_coordinate("mouse_x", fields[7])?,
        mouse_y: parse_coordinate("mouse_y", fields[8])?,
    };

    Ok(InputFrame {
        player_id: player_id.to_string(),
        input,
    })
}

/// Formats an input line; the inverse of [`parse_input_frame`].
pub fn encode_input_frame(player_id: &str, input: &MovementInput) -> String {
    format!(
        "{} {} {} {} {} {} {} {} {}",
        INPUT_COMMAND,
        player_id,
        u8::from(input.up),
        u8::from(input.down),
        u8::from(input.left),
        u8::from(input.right),
        input.sequence,
        input.mouse_x,
        input.mouse_y
    )
}

/// Serializes players into a `state` frame.
pub fn encode_state_frame(
    tick: Option<u64>,
    players: &[PlayerState],
) -> Result<String, serde_json::Error> {
    #[derive(Serialize)]
    struct Borrowed<'a> {
        #[serde(skip_serializing_if = "Option::is_none")]
        tick: Option<u64>,
        players: &'a [PlayerState],
    }

    let payload = serde_json::to_string(&Borrowed { tick, players })?;
    Ok(format!("{} {}", STATE_PREFIX, payload))
}

/// Parses a `state` frame back into its payload.
pub fn decode_state_frame(frame: &str) -> Result<StateFrame, ProtocolError> {
    let payload = frame
        .strip_prefix(STATE_PREFIX)
        .ok_or(ProtocolError::NotAStateFrame)?;
    serde_json::from_str(payload.trim_start()).map_err(|e| ProtocolError::Payload(e.to_string()))
}

/// Formats an `error` frame carrying a human-readable reason.
pub fn encode_error_frame(reason: &str) -> String {
    format!("{} {}", ERROR_PREFIX, reason)
}
