use std::fmt;
use uuid::Uuid;

/// Token linking one published request to its eventual reply.
///
/// Correlation ids travel *out of band*, as the broker's `correlation_id`
/// message property, never inside the payload. A fresh id is minted for every
/// call and is the key of the correlation registry while that call is pending.
///
/// Ids minted here are UUID v4 in the standard 36-character form. Ids read
/// back from the broker are accepted verbatim, whatever their shape.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CorrelationId(String);

impl CorrelationId {
    /// Mint a new unique correlation id.
    pub fn generate() -> Self {
        // ---
        Self(Uuid::new_v4().to_string())
    }

    /// Borrow the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for CorrelationId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for CorrelationId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
