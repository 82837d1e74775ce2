use serde::{Deserialize, Serialize};
use std::fmt::Display;

use uuid::Uuid;

/// Unique identifier for handlers, launches and correlations.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Id(uuid::Uuid);

impl Default for Id {
    fn default() -> Self {
        Self::new()
    }
}

impl Id {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    pub fn from_u128(id: u128) -> Self {
        Self(Uuid::from_u128(id))
    }

    /// Hyphen-less form used in server generated names.
    pub fn simple(&self) -> String {
        self.0.simple().to_string()
    }
}

impl Display for Id {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for Id {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}
