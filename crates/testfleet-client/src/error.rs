//! Client error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),

    #[error("queue server returned {status}: {message}")]
    Api { status: u16, message: String },

    #[error("queue server version {actual} does not match expected {expected}")]
    VersionMismatch { expected: String, actual: String },

    #[error("queue server refused to hand out work: {0}")]
    Rejected(String),
}

impl ClientError {
    /// HTTP status of an error response, if the server answered.
    pub fn status(&self) -> Option<u16> {
        match self {
            ClientError::Api { status, .. } => Some(*status),
            _ => None,
        }
    }
}

pub type ClientResult<T> = std::result::Result<T, ClientError>;
