//! Error types for the execution engine.
//!
//! Conversion errors are returned synchronously from
//! [`CommandExecutor::submit`](super::CommandExecutor::submit) before any
//! native call. Everything that happens after submission is classified into a
//! [`CommandError`] and attached to the [`Command`](super::Command) as data.

use std::time::Duration;

use reqwest::{Method, StatusCode};
use thiserror::Error;

use super::{ErrorRecord, PayloadError};

/// Boxed source error carried by transport faults.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors raised while converting a request into a native request.
#[derive(Debug, Error)]
pub enum ConversionError {
    /// The method is not one of GET, PUT, POST, DELETE or HEAD.
    #[error("unsupported HTTP method {method}")]
    UnsupportedMethod {
        /// The rejected method.
        method: Method,
    },

    /// A non-chunked request carries a payload of unknown length.
    #[error("payload for {endpoint} has no content length and the request is not chunked")]
    MissingContentLength {
        /// The request endpoint.
        endpoint: String,
    },

    /// The payload could not produce a body for this attempt.
    #[error("payload for {endpoint} cannot be sent: {source}")]
    Payload {
        /// The request endpoint.
        endpoint: String,
        /// The underlying payload error.
        #[source]
        source: PayloadError,
    },
}

/// A failure below HTTP: no response was obtained for an attempt.
#[derive(Debug, Error)]
pub enum TransportFault {
    /// The attempt exceeded its time budget.
    #[error("timeout calling {endpoint}")]
    Timeout {
        /// The request endpoint.
        endpoint: String,
        /// The budget that was exceeded, when the executor enforced it.
        after: Option<Duration>,
    },

    /// The connection could not be established or was reset.
    #[error("connection failure calling {endpoint}: {source}")]
    Connect {
        /// The request endpoint.
        endpoint: String,
        /// The underlying error.
        #[source]
        source: BoxError,
    },

    /// TLS negotiation or certificate validation failed.
    #[error("TLS failure calling {endpoint}: {source}")]
    Tls {
        /// The request endpoint.
        endpoint: String,
        /// The underlying error.
        #[source]
        source: BoxError,
    },

    /// Any other I/O failure while sending the request or reading the head.
    #[error("I/O failure calling {endpoint}: {source}")]
    Io {
        /// The request endpoint.
        endpoint: String,
        /// The underlying error.
        #[source]
        source: BoxError,
    },
}

impl TransportFault {
    /// Creates a timeout fault.
    pub fn timeout(endpoint: impl Into<String>, after: Option<Duration>) -> Self {
        Self::Timeout {
            endpoint: endpoint.into(),
            after,
        }
    }

    /// Creates a connection fault.
    pub fn connect(endpoint: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Self::Connect {
            endpoint: endpoint.into(),
            source: source.into(),
        }
    }

    /// Creates a TLS fault.
    pub fn tls(endpoint: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Self::Tls {
            endpoint: endpoint.into(),
            source: source.into(),
        }
    }

    /// Creates a generic I/O fault.
    pub fn io(endpoint: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Self::Io {
            endpoint: endpoint.into(),
            source: source.into(),
        }
    }

    /// Returns the endpoint the fault occurred on.
    #[must_use]
    pub fn endpoint(&self) -> &str {
        match self {
            Self::Timeout { endpoint, .. }
            | Self::Connect { endpoint, .. }
            | Self::Tls { endpoint, .. }
            | Self::Io { endpoint, .. } => endpoint,
        }
    }
}

/// The terminal error attached to a failed command.
#[derive(Debug, Error)]
pub enum CommandError {
    /// No response was obtained.
    #[error(transparent)]
    Transport(#[from] TransportFault),

    /// A status >= 300 with no more specific classification.
    #[error("HTTP {status} calling {endpoint}")]
    HttpStatus {
        /// The request endpoint.
        endpoint: String,
        /// The final status.
        status: StatusCode,
        /// The final status text.
        status_text: String,
    },

    /// The provider signaled that the addressed object does not exist.
    #[error("resource not found at {endpoint}: {message}")]
    ResourceNotFound {
        /// The request endpoint.
        endpoint: String,
        /// The final status.
        status: StatusCode,
        /// The provider's message, verbatim when one was parsed.
        message: String,
    },

    /// Credentials or the request signature were rejected.
    #[error("authorization failed calling {endpoint} (HTTP {status}): {detail}")]
    Authorization {
        /// The request endpoint.
        endpoint: String,
        /// The final status.
        status: StatusCode,
        /// Parsed error records, or the status line.
        detail: String,
    },

    /// A structured error body was parsed but not mapped to a narrower kind.
    #[error("provider error calling {endpoint} (HTTP {status}): {}", summarize(.records))]
    Provider {
        /// The request endpoint.
        endpoint: String,
        /// The final status.
        status: StatusCode,
        /// The parsed error records.
        records: Vec<ErrorRecord>,
    },

    /// The request could not be built for an attempt after it was accepted,
    /// typically because a single-use body was already sent.
    #[error("request could not be built for the next attempt: {0}")]
    Rebuild(#[source] ConversionError),
}

impl CommandError {
    /// Returns the final status, when a response was obtained.
    #[must_use]
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Self::HttpStatus { status, .. }
            | Self::ResourceNotFound { status, .. }
            | Self::Authorization { status, .. }
            | Self::Provider { status, .. } => Some(*status),
            Self::Transport(_) | Self::Rebuild(_) => None,
        }
    }
}

/// Joins error record messages for display.
pub(crate) fn summarize(records: &[ErrorRecord]) -> String {
    records
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Why a submitted command produced no terminal [`Command`](super::Command).
#[derive(Debug, Error)]
pub enum ExecutionError {
    /// The request could not be converted; nothing was sent.
    #[error("command rejected before sending: {0}")]
    Rejected(#[from] ConversionError),

    /// The command was cancelled before it reached a terminal state.
    #[error("command was cancelled")]
    Cancelled,

    /// The task driving the command panicked.
    #[error("command task panicked")]
    Panicked,
}
