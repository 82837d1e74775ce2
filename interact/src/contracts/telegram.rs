//! Control surface of the Telegram collector.

use serde::{Deserialize, Serialize};

use crate::envelope::{FieldError, Payload};
use crate::register_payload;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TgCollectorStatusCode {
    #[serde(rename = "OK")]
    Ok,
    Error,
}

/// Starts collecting for the account behind `number`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct StartTgCollector {
    pub number: String,
}

impl Payload for StartTgCollector {
    const TAG: &'static str = "StartTgCollectorRequest";

    fn validate(&self) -> Vec<FieldError> {
        let mut errors = Vec::new();
        FieldError::require(&mut errors, "Number", &self.number);
        errors
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StopTgCollector {}

impl Payload for StopTgCollector {
    const TAG: &'static str = "StopTgCollectorRequest";
}

/// Completes a pending login with the code Telegram sent to the phone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SetTgCollectorVerification {
    pub verification_code: String,
}

impl Payload for SetTgCollectorVerification {
    const TAG: &'static str = "SetTgCollectorVerificationRequest";

    fn validate(&self) -> Vec<FieldError> {
        let mut errors = Vec::new();
        FieldError::require(&mut errors, "VerificationCode", &self.verification_code);
        errors
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TgCollectorResponse {
    #[serde(default)]
    pub message: Option<String>,
    pub status: TgCollectorStatusCode,
}

impl Payload for TgCollectorResponse {
    const TAG: &'static str = "TgCollectorResponse";
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TgCollectorStateRequest {}

impl Payload for TgCollectorStateRequest {
    const TAG: &'static str = "TgCollectorCurrentStateRequest";
}

/// Collector-agnostic form of [`TgCollectorStateRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CollectorStateRequest {}

impl Payload for CollectorStateRequest {
    const TAG: &'static str = "CollectorCurrentStateRequest";
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TgCollectorStateResponse {
    pub is_started: bool,
}

impl Payload for TgCollectorStateResponse {
    const TAG: &'static str = "TgCollectorCurrentStateResponse";
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PhoneNumberRequest {}

impl Payload for PhoneNumberRequest {
    const TAG: &'static str = "PhoneNumberRequest";
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PhoneNumberResponse {
    #[serde(default)]
    pub phone_number: String,
}

impl Payload for PhoneNumberResponse {
    const TAG: &'static str = "PhoneNumberResponse";
}

register_payload!(StartTgCollector);
register_payload!(StopTgCollector);
register_payload!(SetTgCollectorVerification);
register_payload!(TgCollectorResponse);
register_payload!(TgCollectorStateRequest);
register_payload!(CollectorStateRequest);
register_payload!(TgCollectorStateResponse);
register_payload!(PhoneNumberRequest);
register_payload!(PhoneNumberResponse);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::Envelope;
    use crate::schema::SchemaRegistry;

    #[test]
    fn test_blank_credentials_are_invalid() {
        let start = StartTgCollector {
            number: "  ".into(),
        };
        let errors = start.validate();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].field.as_deref(), Some("Number"));

        let verification = SetTgCollectorVerification {
            verification_code: String::new(),
        };
        assert_eq!(
            verification.validate()[0].field.as_deref(),
            Some("VerificationCode")
        );

        let valid = StartTgCollector {
            number: "+10000000000".into(),
        };
        assert!(valid.validate().is_empty());
    }

    #[test]
    fn test_response_wire_shape() {
        let bytes = Envelope::new(TgCollectorResponse {
            message: None,
            status: TgCollectorStatusCode::Ok,
        })
        .to_bytes()
        .unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["Type"], "TgCollectorResponse");
        assert_eq!(value["Payload"]["Status"], "OK");
        assert!(value["Payload"]["Message"].is_null());
    }

    #[test]
    fn test_registered_for_inspection() {
        let registry = SchemaRegistry::from_inventory().unwrap();
        let bytes = br#"{"Type":"SetTgCollectorVerificationRequest","Payload":{"VerificationCode":""}}"#;
        let inspection = registry.inspect(bytes).unwrap();
        assert_eq!(inspection.tag, "SetTgCollectorVerificationRequest");
        assert!(!inspection.is_valid());

        let bytes = br#"{"Type":"CollectorCurrentStateRequest","Payload":{}}"#;
        assert!(registry.inspect(bytes).unwrap().is_valid());
    }
}
