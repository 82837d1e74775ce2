//! Control surface of the search index writer.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::millis;
use crate::envelope::Payload;
use crate::register_payload;

/// Starts consuming the given queues. Unset queues keep the indexer's defaults.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct StartEsIndex {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub articles_queue: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delete_queue: Option<String>,
}

impl Payload for StartEsIndex {
    const TAG: &'static str = "StartEsIndexRequest";
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StopEsIndex {}

impl Payload for StopEsIndex {
    const TAG: &'static str = "StopEsIndexRequest";
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct IndexerStateRequest {}

impl Payload for IndexerStateRequest {
    const TAG: &'static str = "IndexerCurrentStateRequest";
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct IndexerStateResponse {
    /// How long the indexer has been in its current state
    #[serde(with = "millis")]
    pub time_span: Duration,
    pub is_started: bool,
}

impl Payload for IndexerStateResponse {
    const TAG: &'static str = "IndexerCurrentStateResponse";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct EsIndexResponse {
    pub date_time: DateTime<Utc>,
}

impl Payload for EsIndexResponse {
    const TAG: &'static str = "EsIndexResponse";
}

register_payload!(StartEsIndex);
register_payload!(StopEsIndex);
register_payload!(IndexerStateRequest);
register_payload!(IndexerStateResponse);
register_payload!(EsIndexResponse);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::Envelope;

    #[test]
    fn test_state_response_wire_shape() {
        let bytes = Envelope::new(IndexerStateResponse {
            time_span: Duration::from_millis(1500),
            is_started: true,
        })
        .to_bytes()
        .unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["Type"], "IndexerCurrentStateResponse");
        assert_eq!(value["Payload"]["TimeSpan"], 1500);
        assert_eq!(value["Payload"]["IsStarted"], true);
    }

    #[test]
    fn test_empty_requests() {
        let bytes = Envelope::new(StopEsIndex::default()).to_bytes().unwrap();
        let decoded = Envelope::<StopEsIndex>::from_bytes(&bytes).unwrap();
        assert!(decoded.validate().is_empty());
    }
}
