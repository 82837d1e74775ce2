//! Control surface of the VK collector.

use serde::{Deserialize, Serialize};

use crate::envelope::Payload;
use crate::register_payload;

/// Hands the collector the OAuth code it exchanges for an access token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AccessTokenRequest {
    #[serde(default)]
    pub code: String,
}

impl Payload for AccessTokenRequest {
    const TAG: &'static str = "AccessTokenRequest";
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct VkCollectorResponse {
    #[serde(default)]
    pub response: Option<String>,
}

impl Payload for VkCollectorResponse {
    const TAG: &'static str = "VkCollectorResponse";
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct VkCollectorStateRequest {}

impl Payload for VkCollectorStateRequest {
    const TAG: &'static str = "VkCollectorCurrentStateRequest";
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct VkCollectorStateResponse {
    pub is_started: bool,
}

impl Payload for VkCollectorStateResponse {
    const TAG: &'static str = "VkCollectorCurrentStateResponse";
}

register_payload!(AccessTokenRequest);
register_payload!(VkCollectorResponse);
register_payload!(VkCollectorStateRequest);
register_payload!(VkCollectorStateResponse);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::Envelope;

    #[test]
    fn test_state_response_wire_shape() {
        let bytes = Envelope::new(VkCollectorStateResponse { is_started: true })
            .to_bytes()
            .unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["Type"], "VkCollectorCurrentStateResponse");
        assert_eq!(value["Payload"]["IsStarted"], true);
    }

    #[test]
    fn test_missing_fields_default() {
        let decoded =
            Envelope::<AccessTokenRequest>::from_bytes(br#"{"Type":"AccessTokenRequest","Payload":{}}"#)
                .unwrap();
        assert_eq!(decoded.payload.code, "");
        assert!(decoded.validate().is_empty());

        let decoded =
            Envelope::<VkCollectorResponse>::from_bytes(br#"{"Type":"VkCollectorResponse","Payload":{"Response":null}}"#)
                .unwrap();
        assert_eq!(decoded.payload.response, None);
    }
}
