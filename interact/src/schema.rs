//! Tag to decoder registry.
//!
//! Payload types announce themselves with [`register_payload!`](crate::register_payload),
//! which submits a [`SchemaRegistration`] to `inventory`. [`SchemaRegistry::from_inventory`]
//! collects them at startup and refuses two different types claiming one tag.

use std::collections::HashMap;

use crate::envelope::{Envelope, FieldError, Payload, peek_tag};
use crate::error::InteractError;

/// Static registration entry for one payload schema.
pub struct SchemaRegistration {
    /// Wire tag of the schema
    pub tag: &'static str,
    /// Rust type name, used to tell duplicate registrations from conflicts
    pub type_name: fn() -> &'static str,
    /// Decodes an envelope of this schema and returns its validation errors
    pub inspect: fn(&[u8]) -> Result<Vec<FieldError>, InteractError>,
}

impl SchemaRegistration {
    pub const fn new(
        tag: &'static str,
        type_name: fn() -> &'static str,
        inspect: fn(&[u8]) -> Result<Vec<FieldError>, InteractError>,
    ) -> Self {
        Self {
            tag,
            type_name,
            inspect,
        }
    }
}

inventory::collect!(SchemaRegistration);

pub fn type_name_of<P: Payload>() -> &'static str {
    std::any::type_name::<P>()
}

pub fn inspect<P: Payload>(bytes: &[u8]) -> Result<Vec<FieldError>, InteractError> {
    Ok(Envelope::<P>::from_bytes(bytes)?.validate())
}

/// Registers a payload type with the schema inventory.
#[macro_export]
macro_rules! register_payload {
    ($payload:ty) => {
        $crate::inventory::submit! {
            $crate::schema::SchemaRegistration::new(
                <$payload as $crate::envelope::Payload>::TAG,
                $crate::schema::type_name_of::<$payload>,
                $crate::schema::inspect::<$payload>,
            )
        }
    };
}

/// Result of inspecting an encoded envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct Inspection {
    pub tag: String,
    pub errors: Vec<FieldError>,
}

impl Inspection {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}

#[derive(Clone, Copy)]
struct SchemaEntry {
    type_name: &'static str,
    inspect: fn(&[u8]) -> Result<Vec<FieldError>, InteractError>,
}

#[derive(Clone, Default)]
pub struct SchemaRegistry {
    entries: HashMap<&'static str, SchemaEntry>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_inventory() -> Result<Self, InteractError> {
        let mut registry = Self::new();
        for registration in inventory::iter::<SchemaRegistration> {
            registry.insert(
                registration.tag,
                SchemaEntry {
                    type_name: (registration.type_name)(),
                    inspect: registration.inspect,
                },
            )?;
        }
        Ok(registry)
    }

    pub fn register<P: Payload>(&mut self) -> Result<(), InteractError> {
        self.insert(
            P::TAG,
            SchemaEntry {
                type_name: type_name_of::<P>(),
                inspect: inspect::<P>,
            },
        )
    }

    fn insert(&mut self, tag: &'static str, entry: SchemaEntry) -> Result<(), InteractError> {
        if let Some(existing) = self.entries.get(tag) {
            if existing.type_name != entry.type_name {
                return Err(InteractError::Config(format!(
                    "payload tag '{}' is claimed by both {} and {}",
                    tag, existing.type_name, entry.type_name
                )));
            }
            return Ok(());
        }
        self.entries.insert(tag, entry);
        Ok(())
    }

    pub fn contains(&self, tag: &str) -> bool {
        self.entries.contains_key(tag)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Decodes any registered envelope and reports its tag and validation errors.
    pub fn inspect(&self, bytes: &[u8]) -> Result<Inspection, InteractError> {
        let tag = peek_tag(bytes)?;
        let entry = self.entries.get(tag.as_str()).ok_or_else(|| {
            InteractError::Validation(FieldError::new(
                "Type",
                format!("unknown payload tag '{tag}'"),
            ))
        })?;
        let errors = (entry.inspect)(bytes)?;
        Ok(Inspection { tag, errors })
    }
}

impl std::fmt::Debug for SchemaRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut tags: Vec<_> = self.entries.keys().collect();
        tags.sort();
        f.debug_struct("SchemaRegistry").field("tags", &tags).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::{HandlingError, Ping};
    use crate::test_utils::prelude::*;
    use assert_matches::assert_matches;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Impostor {
        first: i64,
    }

    impl Payload for Impostor {
        const TAG: &'static str = "Numbers";
    }

    #[test]
    fn test_inventory_contains_builtin_schemas() {
        let registry = SchemaRegistry::from_inventory().unwrap();
        assert!(registry.contains(Ping::TAG));
        assert!(registry.contains(HandlingError::TAG));
        assert!(registry.contains(Numbers::TAG));
    }

    #[test]
    fn test_conflicting_tag_is_rejected() {
        let mut registry = SchemaRegistry::new();
        registry.register::<Numbers>().unwrap();
        registry.register::<Numbers>().unwrap();
        assert_eq!(registry.len(), 1);
        assert_matches!(registry.register::<Impostor>(), Err(InteractError::Config(_)));
    }

    #[test]
    fn test_inspect() {
        let registry = SchemaRegistry::from_inventory().unwrap();

        let bytes = Envelope::new(Notify { message: "".into() }).to_bytes().unwrap();
        let inspection = registry.inspect(&bytes).unwrap();
        assert_eq!(inspection.tag, "Notify");
        assert!(!inspection.is_valid());

        let unknown = br#"{"Type":"Nope","Payload":{}}"#;
        assert_matches!(registry.inspect(unknown), Err(InteractError::Validation(_)));
    }
}
