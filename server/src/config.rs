//! Command-line and environment configuration for the server binary

use crate::connection::InputTiming;
use crate::network::DispatcherConfig;
use clap::Parser;
use std::time::Duration;

/// Authoritative arena movement server
#[derive(Parser, Debug, Clone)]
#[clap(author, version, about)]
pub struct ServerConfig {
    /// Address to bind the game and metrics listeners to
    #[clap(short = 'H', long, env = "ARENA_HOST", default_value = "127.0.0.1")]
    pub host: String,

    /// WebSocket port clients connect to
    #[clap(short, long, env = "ARENA_PORT", default_value = "8080")]
    pub port: u16,

    /// Simulation ticks per second
    #[clap(short, long, env = "ARENA_TICK_RATE", default_value = "60", value_parser = parse_tick_rate)]
    pub tick_rate: f64,

    /// Postgres DSN for session events; empty disables persistence
    #[clap(long, env = "ARENA_DATABASE_DSN", default_value = "")]
    pub database_dsn: String,

    /// How long to wait for the database at startup, in milliseconds
    #[clap(long, env = "ARENA_DB_CONNECT_TIMEOUT_MS", default_value = "5000")]
    pub db_connect_timeout_ms: u64,

    /// Port serving Prometheus metrics at /metrics
    #[clap(long, env = "ARENA_METRICS_PORT", default_value = "9090")]
    pub metrics_port: u16,

    /// Maximum concurrent client connections
    #[clap(long, env = "ARENA_MAX_CONNECTIONS", default_value = "256")]
    pub max_connections: usize,

    /// Longest stretch of time one input frame may cover, in seconds
    #[clap(long, env = "ARENA_MAX_INPUT_DELTA", default_value = "0.1", value_parser = parse_positive_seconds)]
    pub max_input_delta: f64,
}

fn parse_positive_finite(value: &str, what: &str) -> Result<f64, String> {
    let parsed: f64 = value
        .parse()
        .map_err(|_| format!("`{}` is not a number", value))?;
    if !parsed.is_finite() || parsed <= 0.0 {
        return Err(format!("{} must be positive and finite, got {}", what, value));
    }
    Ok(parsed)
}

fn parse_tick_rate(value: &str) -> Result<f64, String> {
    parse_positive_finite(value, "tick rate")
}

fn parse_positive_seconds(value: &str) -> Result<f64, String> {
    parse_positive_finite(value, "duration")
}

impl ServerConfig {
    pub fn game_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn metrics_addr(&self) -> String {
        format!("{}:{}", self.host, self.metrics_port)
    }

    pub fn storage_enabled(&self) -> bool {
        !self.database_dsn.trim().is_empty()
    }

    pub fn db_connect_timeout(&self) -> Duration {
        Duration::from_millis(self.db_connect_timeout_ms)
    }

    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            timing: InputTiming::for_tick_rate(self.tick_rate, self.max_input_delta),
            max_connections: self.max_connections,
            ..DispatcherConfig::default()
        }
    }
}
