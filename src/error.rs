//! Error types for requests and service setup

use crate::entity::Entity;
use crate::transport::TransportError;
use http::StatusCode;
use std::sync::Arc;
use thiserror::Error;
use tokio::time::Instant;

/// Result type for this crate
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while setting up a [`Service`](crate::Service)
#[derive(Debug, Error)]
pub enum Error {
    /// A base URL or resource URL could not be parsed
    #[error("Invalid URL {url}: {message}")]
    InvalidUrl {
        /// The offending URL string
        url: String,
        /// Why parsing failed
        message: String,
    },

    /// A configuration pattern could not be compiled
    #[error("Invalid configuration pattern {pattern}: {message}")]
    InvalidPattern {
        /// The pattern as given
        pattern: String,
        /// Why compilation failed
        message: String,
    },

    /// No transport was configured and the default one is not compiled in
    #[error("No transport configured; enable the `backend-reqwest` feature or supply one")]
    NoTransport,

    /// The transport could not be constructed
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

/// Structured underlying cause of a [`RequestError`]
#[derive(Debug, Clone, Error)]
pub enum Cause {
    /// The resource URL could not be parsed, so no request was ever sent
    #[error("Invalid URL: {url}")]
    InvalidUrl {
        /// The URL as originally given
        url: String,
    },

    /// A text request body could not be represented in the requested charset
    #[error("Unable to encode text using {encoding}")]
    UnencodableText {
        /// The charset that was requested
        encoding: String,
        /// The text that could not be encoded
        text: String,
    },

    /// A JSON request body could not be serialized
    #[error("Unable to encode request body as JSON: {0}")]
    JsonEncoding(Arc<serde_json::Error>),

    /// The request was cancelled before it completed
    #[error("Request cancelled")]
    RequestCancelled,

    /// The server answered 304 but there was no local data to reuse
    #[error("No data available")]
    NoLocalDataFor304,

    /// A transformer received content of a type it does not accept
    #[error("{transformer} expected {expected} but got {actual}")]
    WrongInputType {
        /// Transformer that rejected the content
        transformer: String,
        /// Kind of content the transformer accepts
        expected: String,
        /// Kind of content it received
        actual: String,
    },

    /// Response bytes could not be decoded as text
    #[error("Unable to decode text using {encoding}")]
    UndecodableText {
        /// The charset used for decoding
        encoding: String,
    },

    /// A transformer produced no output for valid input
    #[error("{transformer} returned nothing")]
    TransformerReturnedNothing {
        /// Transformer that produced nothing
        transformer: String,
    },

    /// A transformer failed with its own error
    #[error("{transformer} failed: {source}")]
    Transformer {
        /// Transformer that failed
        transformer: String,
        /// The transformer's error
        source: Arc<dyn std::error::Error + Send + Sync>,
    },

    /// The transport could not complete the request
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Failure outcome of a request.
///
/// Shared by every callback and observer that sees the failure, so it is
/// cheap to clone. `user_message` is never empty.
#[derive(Debug, Clone, Error)]
#[error("{user_message}")]
pub struct RequestError {
    /// Human-readable description suitable for display
    pub user_message: String,
    /// HTTP status of the response, if one arrived
    pub http_status: Option<StatusCode>,
    /// Response body for error statuses, if the server sent one
    pub entity: Option<Entity>,
    /// Structured underlying cause
    #[source]
    pub cause: Option<Cause>,
    /// When the error occurred
    pub timestamp: Instant,
}

impl RequestError {
    /// Create an error, deriving the user message when none is given.
    ///
    /// The message falls back to the cause's description, then to the HTTP
    /// status text, then to a generic message.
    pub fn new(
        user_message: Option<String>,
        http_status: Option<StatusCode>,
        entity: Option<Entity>,
        cause: Option<Cause>,
    ) -> Self {
        let user_message = user_message
            .filter(|message| !message.is_empty())
            .or_else(|| cause.as_ref().map(|cause| cause.to_string()))
            .filter(|message| !message.is_empty())
            .or_else(|| {
                http_status
                    .and_then(|status| status.canonical_reason())
                    .map(str::to_owned)
            })
            .unwrap_or_else(|| "Request failed".to_string());

        Self {
            user_message,
            http_status,
            entity,
            cause,
            timestamp: Instant::now(),
        }
    }

    /// Create an error from a cause alone
    pub fn from_cause(cause: Cause) -> Self {
        Self::new(None, None, None, Some(cause))
    }

    /// Create an error with an explicit message
    pub fn with_message(user_message: impl Into<String>, cause: Option<Cause>) -> Self {
        Self::new(Some(user_message.into()), None, None, cause)
    }

    /// Create an error for an HTTP error status
    pub fn from_status(status: StatusCode, entity: Option<Entity>) -> Self {
        Self::new(None, Some(status), entity, None)
    }

    /// The error every cancelled request reports
    pub fn cancellation() -> Self {
        Self::from_cause(Cause::RequestCancelled)
    }

    /// Whether this error represents a cancellation
    pub fn is_cancellation(&self) -> bool {
        matches!(self.cause, Some(Cause::RequestCancelled))
    }
}

impl From<TransportError> for RequestError {
    fn from(error: TransportError) -> Self {
        match error {
            TransportError::Cancelled => Self::cancellation(),
            other => Self::from_cause(Cause::Transport(other)),
        }
    }
}
