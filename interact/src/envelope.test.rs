use super::*;
use crate::test_utils::prelude::*;

use assert_matches::assert_matches;

#[test]
fn test_round_trip() {
    let envelope = Envelope::new(Numbers { first: 2, second: 3 });
    let bytes = envelope.to_bytes().unwrap();
    let decoded = Envelope::<Numbers>::from_bytes(&bytes).unwrap();
    assert_eq!(decoded, envelope);
    assert!(decoded.validate().is_empty());
}

#[test]
fn test_wire_shape() {
    let bytes = Envelope::new(Notify {
        message: "1".into(),
    })
    .to_bytes()
    .unwrap();
    let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(value["Type"], "Notify");
    assert_eq!(value["Payload"]["Message"], "1");
    assert_eq!(peek_tag(&bytes).unwrap(), "Notify");
}

#[test]
fn test_tag_mismatch() {
    // Same shape, different schema
    let bytes = Envelope::new(SkippedNotify {
        message: "1".into(),
    })
    .to_bytes()
    .unwrap();
    let decoded = Envelope::<Notify>::from_bytes(&bytes).unwrap();

    let errors = decoded.validate();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].field.as_deref(), Some("Type"));
    assert_matches!(decoded.ensure_valid(), Err(InteractError::Validation(_)));
}

#[test]
fn test_stamps_tag_on_encode() {
    let mut envelope = Envelope::new(Numbers { first: 1, second: 1 });
    envelope.type_tag = "Other".into();
    let bytes = envelope.to_bytes().unwrap();
    assert_eq!(peek_tag(&bytes).unwrap(), "Numbers");
}

#[test]
fn test_payload_validation() {
    let envelope = Envelope::new(Notify {
        message: " ".into(),
    });
    let errors = envelope.validate();
    assert_eq!(errors, vec![FieldError::new("Message", "is required")]);
    assert_matches!(
        envelope.ensure_valid(),
        Err(InteractError::Validation(error)) if error.field.as_deref() == Some("Message")
    );
}

#[test]
fn test_malformed_bytes() {
    assert_matches!(
        Envelope::<Numbers>::from_bytes(b"{not json"),
        Err(InteractError::Serialization(_))
    );
    assert_matches!(
        Envelope::<Numbers>::from_bytes(br#"{"Type":"Numbers","Payload":{"First":"x"}}"#),
        Err(InteractError::Serialization(_))
    );
}
