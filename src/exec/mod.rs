//! HTTP command execution engine.
//!
//! This module turns an abstract, provider-agnostic [`Request`] into a native
//! reqwest call, applies outbound [`Filter`]s, drives a bounded retry protocol
//! against transient failures, and converts the native response back into an
//! abstract [`Response`].
//!
//! # Features
//!
//! - Single-owner, single-read [`Payload`]s released exactly once on every path
//! - Fixed-length or chunked request framing with an explicit empty-body contract
//! - Pluggable [`RetryHandler`] with exponential backoff and Retry-After support
//! - Table-driven [`ErrorHandler`] classification into [`CommandError`]
//! - Cancelable [`CommandHandle`]s; errors are delivered as data, never as panics
//!
//! # Example
//!
//! ```no_run
//! use cloudexec_core::exec::{Command, CommandExecutor, Request};
//! use cloudexec_core::ExecutorConfig;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let executor = CommandExecutor::new(&ExecutorConfig::default())?;
//! let request = Request::get("https://api.example.com/servers".parse()?);
//! let command = executor.execute(Command::new(request)).await?;
//! match command.error() {
//!     None => println!("status {}", command.response().map_or(0, |r| r.status().as_u16())),
//!     Some(error) => println!("failed: {error}"),
//! }
//! # Ok(())
//! # }
//! ```

mod command;
pub mod constants;
mod error;
mod error_handler;
mod executor;
pub mod metadata;
mod payload;
mod request;
mod request_converter;
mod response;
mod response_converter;
mod retry;
mod transport;

pub use command::{Command, CommandState};
pub use constants::DEFAULT_MAX_ATTEMPTS;
pub use error::{CommandError, ConversionError, ExecutionError, TransportFault};
pub use error_handler::{
    ClassificationRule, ClassifyingErrorHandler, DefaultErrorParser, ErrorBodyParser,
    ErrorContext, ErrorHandler, ErrorKind, ErrorRecord, JsonErrorParser, ParseError,
    TextErrorParser,
};
pub use executor::{CommandExecutor, CommandExecutorBuilder, CommandHandle, ExecutorStats};
pub use payload::{ByteStream, Payload, PayloadError, PayloadMetadata};
pub use request::{Filter, Request};
pub use request_converter::RequestConverter;
pub use response::Response;
pub use response_converter::ResponseConverter;
pub use retry::{
    FailureType, RetryDecision, RetryHandler, RetryPolicy, classify_fault, classify_status,
    parse_retry_after,
};
pub use transport::{ReqwestTransport, Transport};
