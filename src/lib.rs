//! Cloudexec Core Library
//!
//! This library provides the asynchronous HTTP command execution engine shared
//! by every provider binding of a multi-cloud client. A provider-agnostic
//! [`Request`] is wrapped in a [`Command`], converted into a native reqwest
//! request, sent with a bounded retry protocol, and converted back into an
//! abstract [`Response`]. Failures are classified into a typed
//! [`CommandError`] and attached to the command as data.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//! - [`exec`] - Payloads, converters, retry/error handlers and the executor
//! - [`config`] - Validated executor configuration

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod exec;
mod user_agent;

// Re-export commonly used types
pub use config::{ConfigError, ExecutorConfig};
pub use exec::{
    ClassificationRule, ClassifyingErrorHandler, Command, CommandError, CommandExecutor,
    CommandHandle, CommandState, ConversionError, DEFAULT_MAX_ATTEMPTS, ErrorBodyParser,
    ErrorHandler, ErrorKind, ErrorRecord, ExecutionError, ExecutorStats, FailureType, Filter,
    Payload, PayloadError, PayloadMetadata, Request, RequestConverter, Response,
    ResponseConverter, RetryDecision, RetryHandler, RetryPolicy, Transport, TransportFault,
};
