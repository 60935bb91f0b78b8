//! Environment-driven configuration for the relay process.
//!
//! Every knob has a usable default, so the
//! relay starts with no environment at all. Invalid values are logged
//! and ignored rather than aborting startup.

use std::fmt::Display;
use std::str::FromStr;

use tracing::warn;

/// Default listen port when neither `RELAY_PORT` nor `PORT` is set.
pub const DEFAULT_PORT: u16 = 3001;

/// Default cap on the per-user transaction history log.
pub const DEFAULT_HISTORY_CAP: usize = 1000;

/// Default store backend selector.
pub const DEFAULT_STORE_BACKEND: &str = "memory";

/// Runtime configuration for the relay service.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// TCP port the HTTP/WebSocket listener binds to.
    pub port: u16,
    /// Maximum number of entries retained in each user's transaction log.
    pub history_cap: usize,
    /// Store backend selector (`memory` is the only built-in backend).
    pub store_backend: String,
    /// Whether a store initialization failure is fatal at boot.
    ///
    /// When false (the default) the relay degrades to fan-out-only
    /// operation with persistence disabled.
    pub store_required: bool,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            history_cap: DEFAULT_HISTORY_CAP,
            store_backend: DEFAULT_STORE_BACKEND.to_string(),
            store_required: false,
        }
    }
}

impl RelayConfig {
    /// Build a configuration from the process environment.
    ///
    /// Recognized variables: `RELAY_PORT` (falling back to `PORT`),
    /// `RELAY_HISTORY_CAP`, `RELAY_STORE`, `RELAY_STORE_REQUIRED`.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(port) = parse_env::<u16>("RELAY_PORT").or_else(|| parse_env::<u16>("PORT")) {
            config.port = port;
        }
        if let Some(cap) = parse_env::<usize>("RELAY_HISTORY_CAP") {
            if cap == 0 {
                warn!("RELAY_HISTORY_CAP must be positive, keeping default");
            } else {
                config.history_cap = cap;
            }
        }
        if let Some(backend) = read_env("RELAY_STORE") {
            config.store_backend = backend;
        }
        if let Some(required) = parse_env::<bool>("RELAY_STORE_REQUIRED") {
            config.store_required = required;
        }

        config
    }
}

fn read_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|value| !value.is_empty())
}

fn parse_env<T>(name: &str) -> Option<T>
where
    T: FromStr,
    T::Err: Display,
{
    let raw = read_env(name)?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(error) => {
            warn!(variable = name, value = %raw, %error, "ignoring invalid value");
            None
        }
    }
}
