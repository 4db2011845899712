//! Error types for the binding layer.

use crate::remote::RemoteError;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum BindError {
    #[error("url parameter required")]
    MissingUrl,

    #[error("Invalid type passed to url property: {0}")]
    InvalidUrl(String),

    #[error("No connector configured to resolve url: {0}")]
    MissingConnector(String),

    #[error(
        "InvalidIdException: Models must have an Id. Note: You may be trying to sync a primitive value (int, string, bool). (key: {key})"
    )]
    InvalidId { key: String },

    #[error("Invalid model ID")]
    InvalidModelId,

    #[error("Member id is fixed once stored: {from} cannot become {to:?}")]
    IdChanged { from: String, to: Option<String> },

    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Operation cancelled before the remote answered")]
    Cancelled,
}

impl BindError {
    /// Configuration errors are raised at construction and never at runtime.
    pub fn is_config(&self) -> bool {
        matches!(
            self,
            BindError::MissingUrl | BindError::InvalidUrl(_) | BindError::MissingConnector(_)
        )
    }
}

impl From<serde_json::Error> for BindError {
    fn from(err: serde_json::Error) -> Self {
        BindError::Serialization(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, BindError>;
