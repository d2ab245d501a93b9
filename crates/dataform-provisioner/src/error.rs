use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum ProvisionError {
    /// The external API rejected or failed the call.
    #[error("Provider API error for {identifier}: {message}")]
    Api { identifier: String, message: String },

    /// The external API asked us to slow down.
    #[error("Provider throttled request for {identifier}")]
    Throttled { identifier: String },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ProvisionError {
    pub fn api(identifier: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Api {
            identifier: identifier.into(),
            message: message.into(),
        }
    }

    pub fn throttled(identifier: impl Into<String>) -> Self {
        Self::Throttled {
            identifier: identifier.into(),
        }
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}
