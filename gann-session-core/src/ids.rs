//! Opaque identifiers used throughout the signaling and negotiation core.

use crate::error::ValidationError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque, non-empty identifier for a registered agent.
///
/// Equality is byte-identical after trimming surrounding whitespace.
/// Construction through [`AgentId::new`] rejects empty or whitespace-only
/// values, matching the API-boundary invariant in spec §3.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(String);

/// Opaque, non-empty identifier scoping a single negotiation.
///
/// Same construction and equality rules as [`AgentId`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

macro_rules! opaque_id {
    ($ty:ident, $field:literal) => {
        impl $ty {
            /// Construct from a raw string, trimming whitespace.
            ///
            /// # Errors
            ///
            /// Returns [`ValidationError::EmptyId`] if the trimmed value is empty.
            pub fn new(raw: impl Into<String>) -> Result<Self, ValidationError> {
                let raw = raw.into();
                let trimmed = raw.trim();
                if trimmed.is_empty() {
                    return Err(ValidationError::EmptyId { field: $field });
                }
                Ok(Self(trimmed.to_string()))
            }

            /// Borrow the identifier as a string slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl AsRef<str> for $ty {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

opaque_id!(AgentId, "agentId");
opaque_id!(SessionId, "sessionId");

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn trims_surrounding_whitespace() {
        let id = AgentId::new("  peer-a \n").unwrap();
        assert_eq!(id.as_str(), "peer-a");
    }

    #[test]
    fn rejects_empty_and_whitespace_only() {
        assert!(AgentId::new("").is_err());
        assert!(AgentId::new("   ").is_err());
        assert!(SessionId::new("\t\t").is_err());
    }

    #[test]
    fn equality_is_byte_identical_after_trim() {
        assert_eq!(AgentId::new("peer-a").unwrap(), AgentId::new(" peer-a").unwrap());
        assert_ne!(AgentId::new("peer-a").unwrap(), AgentId::new("Peer-A").unwrap());
    }
}
