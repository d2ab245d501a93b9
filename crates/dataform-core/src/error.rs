//! Errors raised while deriving or decoding record keys.

/// Errors that can occur while encoding or decoding a [`RecordKey`](crate::RecordKey).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyError {
    /// A namespace or name contains the key separator.
    #[error("invalid {field} {value:?}: must not contain '/'")]
    InvalidComponent {
        /// Which component was rejected ("namespace" or "name").
        field: &'static str,
        /// The rejected value.
        value: String,
    },

    /// The record has no name.
    #[error("record name must not be empty")]
    EmptyName,

    /// A key string could not be split back into namespace and name.
    #[error("unexpected key format: {0:?}")]
    Malformed(String),
}

impl KeyError {
    /// Creates a new `InvalidComponent` error.
    #[must_use]
    pub fn invalid_component(field: &'static str, value: impl Into<String>) -> Self {
        Self::InvalidComponent {
            field,
            value: value.into(),
        }
    }

    /// Creates a new `Malformed` error.
    #[must_use]
    pub fn malformed(key: impl Into<String>) -> Self {
        Self::Malformed(key.into())
    }
}
