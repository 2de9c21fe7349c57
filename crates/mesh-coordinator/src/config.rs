//! Mesh coordinator configuration.
//!
//! Configuration is loaded from environment variables. Every value has a
//! default; a value that is present but fails to parse is an error rather
//! than silently falling back.

use common::types::ParticipantId;
use std::collections::HashMap;
use std::env;
use std::time::Duration;
use thiserror::Error;

/// Default time allowed for an offer to be answered (10 seconds).
pub const DEFAULT_NEGOTIATION_TIMEOUT_MS: u64 = 10_000;

/// Default number of re-offers after a negotiation timeout.
pub const DEFAULT_NEGOTIATION_RETRIES: u32 = 1;

/// Default debounce before a relay disconnect becomes a leave (5 seconds).
pub const DEFAULT_DISCONNECT_DEBOUNCE_MS: u64 = 5_000;

/// Default scan interval for negotiation and debounce deadlines.
pub const DEFAULT_TIMER_RESOLUTION_MS: u64 = 250;

/// Default presence capacity per room.
pub const DEFAULT_MAX_ROOM_PARTICIPANTS: usize = 16;

/// Default number of local participants in the loopback demo.
pub const DEFAULT_DEMO_PARTICIPANTS: usize = 3;

/// Default room joined by the loopback demo.
pub const DEFAULT_DEMO_ROOM: &str = "demo-room";

/// Default instance ID prefix.
pub const DEFAULT_INSTANCE_ID_PREFIX: &str = "mesh";

/// Relay identity presence publishes rosters under.
pub const DEFAULT_PRESENCE_ID: &str = "presence";

/// Mesh coordinator configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Unique identifier for this process (log correlation).
    pub instance_id: String,

    /// Relay identity of the presence service. Rosters from anyone else are dropped.
    pub presence_id: ParticipantId,

    /// Time allowed for an offer to be answered.
    pub negotiation_timeout: Duration,

    /// Re-offers after a negotiation timeout before the link is given up.
    pub negotiation_retries: u32,

    /// Debounce between a relay disconnect and the implicit leave.
    pub disconnect_debounce: Duration,

    /// Scan interval for deadlines.
    pub timer_resolution: Duration,

    /// Maximum roster size presence admits per room.
    pub max_room_participants: usize,

    /// Local participants started by the loopback demo.
    pub demo_participants: usize,

    /// Room joined by the loopback demo.
    pub demo_room: String,

    /// Exit the demo right after the mesh is built instead of waiting for Ctrl+C.
    pub demo_exit: bool,

    /// Emit JSON logs.
    pub log_json: bool,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

impl Default for Config {
    fn default() -> Self {
        Self {
            instance_id: format!("{DEFAULT_INSTANCE_ID_PREFIX}-local"),
            presence_id: ParticipantId::new(DEFAULT_PRESENCE_ID),
            negotiation_timeout: Duration::from_millis(DEFAULT_NEGOTIATION_TIMEOUT_MS),
            negotiation_retries: DEFAULT_NEGOTIATION_RETRIES,
            disconnect_debounce: Duration::from_millis(DEFAULT_DISCONNECT_DEBOUNCE_MS),
            timer_resolution: Duration::from_millis(DEFAULT_TIMER_RESOLUTION_MS),
            max_room_participants: DEFAULT_MAX_ROOM_PARTICIPANTS,
            demo_participants: DEFAULT_DEMO_PARTICIPANTS,
            demo_room: DEFAULT_DEMO_ROOM.to_string(),
            demo_exit: false,
            log_json: false,
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` if a variable is present but invalid.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` if a variable is present but invalid.
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let negotiation_timeout_ms = parse_var(
            vars,
            "MESH_NEGOTIATION_TIMEOUT_MS",
            DEFAULT_NEGOTIATION_TIMEOUT_MS,
        )?;
        if negotiation_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue(
                "MESH_NEGOTIATION_TIMEOUT_MS must be greater than 0".to_string(),
            ));
        }

        let negotiation_retries = parse_var(
            vars,
            "MESH_NEGOTIATION_RETRIES",
            DEFAULT_NEGOTIATION_RETRIES,
        )?;

        let disconnect_debounce_ms = parse_var(
            vars,
            "MESH_DISCONNECT_DEBOUNCE_MS",
            DEFAULT_DISCONNECT_DEBOUNCE_MS,
        )?;

        let timer_resolution_ms =
            parse_var(vars, "MESH_TIMER_RESOLUTION_MS", DEFAULT_TIMER_RESOLUTION_MS)?;
        if timer_resolution_ms == 0 {
            return Err(ConfigError::InvalidValue(
                "MESH_TIMER_RESOLUTION_MS must be greater than 0".to_string(),
            ));
        }

        let max_room_participants = parse_var(
            vars,
            "MESH_MAX_ROOM_PARTICIPANTS",
            DEFAULT_MAX_ROOM_PARTICIPANTS,
        )?;
        if max_room_participants == 0 {
            return Err(ConfigError::InvalidValue(
                "MESH_MAX_ROOM_PARTICIPANTS must be greater than 0".to_string(),
            ));
        }

        let demo_participants =
            parse_var(vars, "MESH_DEMO_PARTICIPANTS", DEFAULT_DEMO_PARTICIPANTS)?;

        let demo_room = vars
            .get("MESH_DEMO_ROOM")
            .cloned()
            .unwrap_or_else(|| DEFAULT_DEMO_ROOM.to_string());
        if demo_room.is_empty() {
            return Err(ConfigError::InvalidValue(
                "MESH_DEMO_ROOM must not be empty".to_string(),
            ));
        }

        let presence_id = vars
            .get("MESH_PRESENCE_ID")
            .map_or(DEFAULT_PRESENCE_ID, |id| id.trim());
        if presence_id.is_empty() {
            return Err(ConfigError::InvalidValue(
                "MESH_PRESENCE_ID must not be empty".to_string(),
            ));
        }
        let presence_id = ParticipantId::new(presence_id);

        let demo_exit = parse_var(vars, "MESH_DEMO_EXIT", false)?;
        let log_json = parse_var(vars, "MESH_LOG_JSON", false)?;

        let instance_id = vars.get("MESH_INSTANCE_ID").cloned().unwrap_or_else(|| {
            let uuid_suffix = uuid::Uuid::new_v4().to_string();
            let short_suffix = uuid_suffix.get(..8).unwrap_or("00000000");
            format!("{DEFAULT_INSTANCE_ID_PREFIX}-{short_suffix}")
        });

        Ok(Config {
            instance_id,
            presence_id,
            negotiation_timeout: Duration::from_millis(negotiation_timeout_ms),
            negotiation_retries,
            disconnect_debounce: Duration::from_millis(disconnect_debounce_ms),
            timer_resolution: Duration::from_millis(timer_resolution_ms),
            max_room_participants,
            demo_participants,
            demo_room,
            demo_exit,
            log_json,
        })
    }

    /// Total offers made to a peer before giving up (first try plus retries).
    #[must_use]
    pub fn max_negotiation_attempts(&self) -> u32 {
        self.negotiation_retries.saturating_add(1)
    }
}

fn parse_var<T>(vars: &HashMap<String, String>, name: &str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match vars.get(name) {
        Some(value_str) => value_str.trim().parse().map_err(|e| {
            ConfigError::InvalidValue(format!("{name} must be a valid value, got '{value_str}': {e}"))
        }),
        None => Ok(default),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_from_vars_success_with_defaults() {
        let config = Config::from_vars(&HashMap::new()).expect("Config should load successfully");

        assert_eq!(config.negotiation_timeout, Duration::from_secs(10));
        assert_eq!(config.negotiation_retries, DEFAULT_NEGOTIATION_RETRIES);
        assert_eq!(config.max_negotiation_attempts(), 2);
        assert_eq!(config.disconnect_debounce, Duration::from_secs(5));
        assert_eq!(config.timer_resolution, Duration::from_millis(250));
        assert_eq!(config.max_room_participants, DEFAULT_MAX_ROOM_PARTICIPANTS);
        assert_eq!(config.demo_participants, DEFAULT_DEMO_PARTICIPANTS);
        assert_eq!(config.demo_room, DEFAULT_DEMO_ROOM);
        assert!(!config.demo_exit);
        assert!(!config.log_json);
        assert_eq!(config.presence_id, ParticipantId::new(DEFAULT_PRESENCE_ID));
        // Instance ID should be auto-generated
        assert!(config.instance_id.starts_with("mesh-"));
    }

    #[test]
    fn test_from_vars_success_with_custom_values() {
        let vars = HashMap::from([
            ("MESH_NEGOTIATION_TIMEOUT_MS".to_string(), "2500".to_string()),
            ("MESH_NEGOTIATION_RETRIES".to_string(), "3".to_string()),
            ("MESH_DISCONNECT_DEBOUNCE_MS".to_string(), "0".to_string()),
            ("MESH_TIMER_RESOLUTION_MS".to_string(), "50".to_string()),
            ("MESH_MAX_ROOM_PARTICIPANTS".to_string(), "4".to_string()),
            ("MESH_DEMO_PARTICIPANTS".to_string(), "5".to_string()),
            ("MESH_DEMO_ROOM".to_string(), "standup".to_string()),
            ("MESH_DEMO_EXIT".to_string(), "true".to_string()),
            ("MESH_LOG_JSON".to_string(), "true".to_string()),
            ("MESH_INSTANCE_ID".to_string(), "mesh-custom-001".to_string()),
            ("MESH_PRESENCE_ID".to_string(), "roster-service".to_string()),
        ]);

        let config = Config::from_vars(&vars).expect("Config should load successfully");

        assert_eq!(config.negotiation_timeout, Duration::from_millis(2500));
        assert_eq!(config.negotiation_retries, 3);
        assert_eq!(config.max_negotiation_attempts(), 4);
        assert_eq!(config.disconnect_debounce, Duration::ZERO);
        assert_eq!(config.timer_resolution, Duration::from_millis(50));
        assert_eq!(config.max_room_participants, 4);
        assert_eq!(config.demo_participants, 5);
        assert_eq!(config.demo_room, "standup");
        assert!(config.demo_exit);
        assert!(config.log_json);
        assert_eq!(config.instance_id, "mesh-custom-001");
        assert_eq!(config.presence_id, ParticipantId::new("roster-service"));
    }

    #[test]
    fn test_blank_presence_id_is_rejected() {
        let vars = HashMap::from([("MESH_PRESENCE_ID".to_string(), "  ".to_string())]);
        assert!(matches!(
            Config::from_vars(&vars),
            Err(ConfigError::InvalidValue(msg)) if msg.contains("MESH_PRESENCE_ID")
        ));
    }

    #[test]
    fn test_unparsable_value_is_rejected() {
        let vars = HashMap::from([(
            "MESH_NEGOTIATION_TIMEOUT_MS".to_string(),
            "ten seconds".to_string(),
        )]);

        let result = Config::from_vars(&vars);
        assert!(
            matches!(result, Err(ConfigError::InvalidValue(msg)) if msg.contains("MESH_NEGOTIATION_TIMEOUT_MS"))
        );
    }

    #[test]
    fn test_zero_timeout_is_rejected() {
        let vars = HashMap::from([("MESH_NEGOTIATION_TIMEOUT_MS".to_string(), "0".to_string())]);
        assert!(matches!(
            Config::from_vars(&vars),
            Err(ConfigError::InvalidValue(_))
        ));
    }

    #[test]
    fn test_zero_capacity_is_rejected() {
        let vars = HashMap::from([("MESH_MAX_ROOM_PARTICIPANTS".to_string(), "0".to_string())]);
        assert!(matches!(
            Config::from_vars(&vars),
            Err(ConfigError::InvalidValue(_))
        ));
    }

    #[test]
    fn test_boolean_flags_must_parse() {
        let vars = HashMap::from([("MESH_LOG_JSON".to_string(), "yes".to_string())]);
        assert!(matches!(
            Config::from_vars(&vars),
            Err(ConfigError::InvalidValue(_))
        ));
    }
}
