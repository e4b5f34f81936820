use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! opaque_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            /// Get the inner string value
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<String> for $name {
            fn from(id: String) -> Self {
                Self(id)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.to_string())
            }
        }
    };
}

opaque_id!(
    /// Message identifier, unique and increasing within one queue.
    ///
    /// Callers must treat it as opaque; internally it is the decimal form of
    /// the message's per-queue marker.
    MessageId
);

opaque_id!(
    /// Claim identifier
    ClaimId
);

impl MessageId {
    pub fn from_marker(marker: u64) -> Self {
        Self(marker.to_string())
    }

    /// `None` when the id was not issued by this broker
    pub fn marker(&self) -> Option<u64> {
        self.0.parse().ok()
    }
}

impl ClaimId {
    /// Generate a new unique claim ID
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl Default for ClaimId {
    fn default() -> Self {
        Self::new()
    }
}

/// Document key shared by everything stored for one queue
pub(crate) fn scope(project: &str, queue: &str) -> String {
    format!("{}/{}", project, queue)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_ids_carry_their_marker() {
        let id = MessageId::from_marker(42);
        assert_eq!(id.as_str(), "42");
        assert_eq!(id.marker(), Some(42));
        assert_eq!(MessageId::from("not-a-marker").marker(), None);
    }

    #[test]
    fn claim_ids_are_unique() {
        assert_ne!(ClaimId::new(), ClaimId::new());
    }
}
