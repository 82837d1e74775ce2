//! Actor configuration.
//!
//! Every timing magnitude of the runtime lives here. Durations are (de)serialized as
//! integer milliseconds so configs stay readable as JSON.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::entities::ActorIdentity;
use crate::error::InteractError;
use crate::id::Id;

/// Deadline for a broker outcome on an enqueue
pub const DEFAULT_CONFIRM_TIMEOUT: Duration = Duration::from_secs(5);
/// Default wait for an rpc reply
pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(15);
/// Timeout of the startup self-probe
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(10);
/// How long a starting actor watches for concurrent launches
pub const DEFAULT_LAUNCH_WINDOW: Duration = Duration::from_secs(10);
/// Period of launch notifications during the window
pub const DEFAULT_LAUNCH_PERIOD: Duration = Duration::from_millis(500);
/// Period of liveness announcements
pub const DEFAULT_LIVENESS_PERIOD: Duration = Duration::from_millis(10_000);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ActorConfig {
    /// Logical id of the actor. A random id is used when unset.
    pub id: Option<String>,
    /// Implementation kind reported in liveness replies
    pub kind: String,
    pub display_type: Option<String>,
    pub description: Option<String>,
    #[serde(with = "millis")]
    pub probe_timeout: Duration,
    #[serde(with = "millis")]
    pub launch_window: Duration,
    #[serde(with = "millis")]
    pub launch_period: Duration,
    #[serde(with = "millis")]
    pub liveness_period: Duration,
    #[serde(with = "millis")]
    pub rpc_timeout: Duration,
    #[serde(with = "millis")]
    pub confirm_timeout: Duration,
}

impl Default for ActorConfig {
    fn default() -> Self {
        Self {
            id: None,
            kind: "Actor".to_string(),
            display_type: None,
            description: None,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
            launch_window: DEFAULT_LAUNCH_WINDOW,
            launch_period: DEFAULT_LAUNCH_PERIOD,
            liveness_period: DEFAULT_LIVENESS_PERIOD,
            rpc_timeout: DEFAULT_RPC_TIMEOUT,
            confirm_timeout: DEFAULT_CONFIRM_TIMEOUT,
        }
    }
}

impl ActorConfig {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            ..Default::default()
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn validate(&self) -> Result<(), InteractError> {
        if let Some(id) = &self.id {
            if id.trim().is_empty() {
                return Err(InteractError::Config("actor id cannot be blank".into()));
            }
        }
        if self.kind.trim().is_empty() {
            return Err(InteractError::Config("actor kind cannot be blank".into()));
        }
        let timings = [
            ("probe_timeout", self.probe_timeout),
            ("launch_window", self.launch_window),
            ("launch_period", self.launch_period),
            ("liveness_period", self.liveness_period),
            ("rpc_timeout", self.rpc_timeout),
            ("confirm_timeout", self.confirm_timeout),
        ];
        for (name, value) in timings {
            if value.is_zero() {
                return Err(InteractError::Config(format!("{name} must be positive")));
            }
        }
        if self.launch_period >= self.launch_window {
            return Err(InteractError::Config(
                "launch_period must be shorter than launch_window".into(),
            ));
        }
        Ok(())
    }

    /// Identity under which the actor will run, generating an id when unset.
    pub fn identity(&self) -> ActorIdentity {
        let id = self.id.clone().unwrap_or_else(|| Id::new().to_string());
        ActorIdentity {
            id,
            kind: self.kind.clone(),
            display_type: self.display_type.clone(),
            description: self.description.clone(),
        }
    }
}

pub(crate) mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_defaults() {
        let config = ActorConfig::default();
        assert_eq!(config.launch_window, Duration::from_secs(10));
        assert_eq!(config.launch_period, Duration::from_millis(500));
        assert_eq!(config.liveness_period, Duration::from_secs(10));
        assert_eq!(config.rpc_timeout, Duration::from_secs(15));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json() {
        let config: ActorConfig =
            serde_json::from_str(r#"{"id": "indexer", "kind": "EsIndexer", "rpc_timeout": 2500}"#)
                .unwrap();
        assert_eq!(config.id.as_deref(), Some("indexer"));
        assert_eq!(config.rpc_timeout, Duration::from_millis(2500));
        assert_eq!(config.probe_timeout, DEFAULT_PROBE_TIMEOUT);
        assert_eq!(config.identity().id, "indexer");
    }

    #[test]
    fn test_generated_identity() {
        let config = ActorConfig::new("Worker");
        let identity = config.identity();
        assert!(!identity.id.is_empty());
        assert_eq!(identity.kind, "Worker");
    }

    #[test]
    fn test_invalid() {
        assert_matches!(
            ActorConfig::new("Worker").with_id(" ").validate(),
            Err(InteractError::Config(_))
        );

        let mut config = ActorConfig::new("Worker");
        config.launch_period = config.launch_window;
        assert_matches!(config.validate(), Err(InteractError::Config(_)));

        config = ActorConfig::new("Worker");
        config.rpc_timeout = Duration::ZERO;
        assert_matches!(config.validate(), Err(InteractError::Config(_)));
    }
}
