//! Payloads exchanged by the actor runtime itself.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::envelope::{FieldError, Payload};
use crate::id::Id;
use crate::register_payload;

/// Who an actor is. Two identities denote the same actor when their ids match.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ActorIdentity {
    pub id: String,
    /// Implementation kind of the actor
    #[serde(rename = "Type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl ActorIdentity {
    pub fn new(id: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: kind.into(),
            display_type: None,
            description: None,
        }
    }

    pub fn same_actor(&self, other: &ActorIdentity) -> bool {
        self.id == other.id
    }

    pub fn validate(&self) -> Vec<FieldError> {
        let mut errors = Vec::new();
        FieldError::require(&mut errors, "Id", &self.id);
        FieldError::require(&mut errors, "Type", &self.kind);
        errors
    }
}

impl std::fmt::Display for ActorIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({})", self.kind, self.id)
    }
}

/// Liveness probe request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Ping {
    pub time: DateTime<Utc>,
}

impl Ping {
    pub fn now() -> Self {
        Self { time: Utc::now() }
    }
}

impl Payload for Ping {
    const TAG: &'static str = "Ping";
}

/// Liveness probe reply, also the body of liveness announcements.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Pong {
    pub time: DateTime<Utc>,
    pub actor_info: ActorIdentity,
}

impl Pong {
    pub fn now(actor_info: ActorIdentity) -> Self {
        Self {
            time: Utc::now(),
            actor_info,
        }
    }

    /// A reply proves `target` alive only when it names `target` and was produced after
    /// the probe was sent.
    pub fn answers(&self, target: &str, ping: &Ping) -> bool {
        self.actor_info.id == target && self.time > ping.time
    }
}

impl Payload for Pong {
    const TAG: &'static str = "Pong";

    fn validate(&self) -> Vec<FieldError> {
        self.actor_info
            .validate()
            .into_iter()
            .map(|error| FieldError {
                field: Some(match error.field {
                    Some(field) => format!("ActorInfo.{field}"),
                    None => "ActorInfo".to_string(),
                }),
                message: error.message,
            })
            .collect()
    }
}

/// Broadcast by a starting actor while it watches for a concurrent launch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct LaunchNotification {
    pub launch_id: Id,
    pub started_at: DateTime<Utc>,
}

impl LaunchNotification {
    /// Whether this launch yields to `other`. The later launch yields, ties broken by id.
    pub fn yields_to(&self, other: &LaunchNotification) -> bool {
        (self.started_at, self.launch_id) > (other.started_at, other.launch_id)
    }
}

impl Payload for LaunchNotification {
    const TAG: &'static str = "ActorLaunchNotification";
}

/// Reply sent in place of a response when the remote handler failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct HandlingError {
    pub error_message: String,
}

impl HandlingError {
    pub fn new(error_message: impl Into<String>) -> Self {
        Self {
            error_message: error_message.into(),
        }
    }
}

impl Payload for HandlingError {
    const TAG: &'static str = "RpcHandlingError";

    fn validate(&self) -> Vec<FieldError> {
        let mut errors = Vec::new();
        FieldError::require(&mut errors, "ErrorMessage", &self.error_message);
        errors
    }
}

register_payload!(Ping);
register_payload!(Pong);
register_payload!(LaunchNotification);
register_payload!(HandlingError);

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_pong_answers_ping() {
        let ping = Ping::now();
        let identity = ActorIdentity::new("1", "Test");

        let late = Pong {
            time: ping.time + Duration::milliseconds(1),
            actor_info: identity.clone(),
        };
        assert!(late.answers("1", &ping));
        assert!(!late.answers("2", &ping));

        let stale = Pong {
            time: ping.time,
            actor_info: identity,
        };
        assert!(!stale.answers("1", &ping));
    }

    #[test]
    fn test_pong_validates_identity() {
        let pong = Pong::now(ActorIdentity::new("", "Test"));
        let errors = pong.validate();
        assert_eq!(errors, vec![FieldError::new("ActorInfo.Id", "is required")]);
    }

    #[test]
    fn test_later_launch_yields() {
        let now = Utc::now();
        let first = LaunchNotification {
            launch_id: Id::from_u128(2),
            started_at: now,
        };
        let second = LaunchNotification {
            launch_id: Id::from_u128(1),
            started_at: now + Duration::milliseconds(5),
        };
        assert!(second.yields_to(&first));
        assert!(!first.yields_to(&second));

        let tie = LaunchNotification {
            launch_id: Id::from_u128(3),
            started_at: now,
        };
        assert!(tie.yields_to(&first));
        assert!(!first.yields_to(&tie));
    }
}
