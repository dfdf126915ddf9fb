//! Configuration types

use crate::{CacheResult, ConfigError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Environment variable selecting the isolated state policy.
pub const ISOLATED_STATE_MACHINE_ENV: &str = "TXCACHE_ISOLATED_STATE_MACHINE";

/// Environment variable toggling transition audit logging.
pub const AUDIT_TRANSITIONS_ENV: &str = "TXCACHE_AUDIT_TRANSITIONS";

// ============================================================================
// STATE POLICY
// ============================================================================

/// Which family of cache states a machine is built with.
///
/// Chosen once when a machine is created and never changed afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum StatePolicy {
    /// Once any transaction dirties the cache every reader waits for a rebuild.
    #[default]
    Default,
    /// Readers whose transaction did not dirty the cache keep the pre-dirty
    /// snapshot until a dirty transaction starts completing.
    Isolated,
}

impl StatePolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            StatePolicy::Default => "default",
            StatePolicy::Isolated => "isolated",
        }
    }

    /// Whether an initialized instance stays servable after going dirty.
    pub fn retains_snapshot(&self) -> bool {
        matches!(self, StatePolicy::Isolated)
    }
}

impl fmt::Display for StatePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for StatePolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "default" => Ok(StatePolicy::Default),
            "isolated" => Ok(StatePolicy::Isolated),
            _ => Err(ConfigError::InvalidValue {
                field: "policy".to_string(),
                value: s.to_string(),
                reason: "expected 'default' or 'isolated'".to_string(),
            }),
        }
    }
}

// ============================================================================
// STATE MACHINE CONFIG
// ============================================================================

/// Configuration read once at state machine construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateMachineConfig {
    /// State family used by the machine.
    pub policy: StatePolicy,
    /// Whether the default audit sink logs every stay/switch (default: true)
    pub audit_transitions: bool,
}

impl Default for StateMachineConfig {
    fn default() -> Self {
        Self {
            policy: StatePolicy::Default,
            audit_transitions: true,
        }
    }
}

impl StateMachineConfig {
    /// Config using the isolated policy, other values default.
    pub fn isolated() -> Self {
        Self {
            policy: StatePolicy::Isolated,
            ..Self::default()
        }
    }

    /// Create StateMachineConfig from environment variables.
    ///
    /// # Environment Variables
    /// - `TXCACHE_ISOLATED_STATE_MACHINE`: Use the isolated state policy (default: false)
    /// - `TXCACHE_AUDIT_TRANSITIONS`: Log every state transition (default: true)
    ///
    /// Unparsable values fall back to the defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let isolated = std::env::var(ISOLATED_STATE_MACHINE_ENV)
            .ok()
            .and_then(|s| parse_bool(&s))
            .unwrap_or(defaults.policy == StatePolicy::Isolated);

        let audit_transitions = std::env::var(AUDIT_TRANSITIONS_ENV)
            .ok()
            .and_then(|s| parse_bool(&s))
            .unwrap_or(defaults.audit_transitions);

        Self {
            policy: if isolated {
                StatePolicy::Isolated
            } else {
                StatePolicy::Default
            },
            audit_transitions,
        }
    }

    /// Like [`StateMachineConfig::from_env`], but rejects unparsable values.
    pub fn from_env_strict() -> CacheResult<Self> {
        let mut config = Self::default();

        if let Ok(raw) = std::env::var(ISOLATED_STATE_MACHINE_ENV) {
            if require_bool(ISOLATED_STATE_MACHINE_ENV, &raw)? {
                config.policy = StatePolicy::Isolated;
            }
        }

        if let Ok(raw) = std::env::var(AUDIT_TRANSITIONS_ENV) {
            config.audit_transitions = require_bool(AUDIT_TRANSITIONS_ENV, &raw)?;
        }

        Ok(config)
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn require_bool(field: &str, raw: &str) -> CacheResult<bool> {
    parse_bool(raw).ok_or_else(|| {
        ConfigError::InvalidValue {
            field: field.to_string(),
            value: raw.to_string(),
            reason: "expected true or false".to_string(),
        }
        .into()
    })
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_policy_round_trip_str() {
        for policy in [StatePolicy::Default, StatePolicy::Isolated] {
            assert_eq!(policy.as_str().parse::<StatePolicy>().unwrap(), policy);
        }
        assert_eq!("ISOLATED".parse::<StatePolicy>().unwrap(), StatePolicy::Isolated);
        assert!("eventual".parse::<StatePolicy>().is_err());
    }

    #[test]
    fn test_only_isolated_retains_snapshot() {
        assert!(StatePolicy::Isolated.retains_snapshot());
        assert!(!StatePolicy::Default.retains_snapshot());
    }

    #[test]
    fn test_parse_bool_variants() {
        assert_eq!(parse_bool("TRUE"), Some(true));
        assert_eq!(parse_bool(" off "), Some(false));
        assert_eq!(parse_bool("maybe"), None);
    }

    #[test]
    fn test_require_bool_reports_field() {
        let err = require_bool("TXCACHE_AUDIT_TRANSITIONS", "sometimes").unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("TXCACHE_AUDIT_TRANSITIONS"));
        assert!(msg.contains("sometimes"));
    }

    #[test]
    fn test_config_serde_round_trip() {
        let config = StateMachineConfig::isolated();
        let json = serde_json::to_string(&config).unwrap();
        let parsed: StateMachineConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, config);
        assert!(parsed.audit_transitions);
    }
}
