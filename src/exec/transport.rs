//! The native transport seam.
//!
//! The executor only needs one capability from the HTTP stack: send a native
//! request and asynchronously produce a native response or a
//! [`TransportFault`]. [`ReqwestTransport`] is the production implementation;
//! tests inject scripted transports through the same trait.

use std::error::Error as StdError;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, ClientBuilder};
use tracing::{debug, instrument};

use super::TransportFault;
use super::constants::{CONNECT_TIMEOUT_SECS, READ_TIMEOUT_SECS};

/// Sends native requests.
///
/// Implementations must be safe for concurrent use; the executor shares one
/// instance across all commands and adds no locking of its own.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Sends one request. At most one call per request is in flight.
    async fn execute(&self, request: reqwest::Request) -> Result<reqwest::Response, TransportFault>;
}

/// Transport backed by a pooled [`reqwest::Client`].
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    /// Creates a transport with default timeouts.
    ///
    /// # Errors
    ///
    /// Returns the reqwest builder error if the client cannot be built (for
    /// example when no TLS backend is available).
    pub fn new() -> Result<Self, reqwest::Error> {
        Self::with_timeouts(CONNECT_TIMEOUT_SECS, READ_TIMEOUT_SECS)
    }

    /// Creates a transport with explicit timeout values.
    ///
    /// # Errors
    ///
    /// Same as [`new`](Self::new).
    #[instrument(level = "debug")]
    pub fn with_timeouts(
        connect_timeout_secs: u64,
        read_timeout_secs: u64,
    ) -> Result<Self, reqwest::Error> {
        let client = base_client_builder(connect_timeout_secs, read_timeout_secs).build()?;
        Ok(Self { client })
    }

    /// Wraps an already configured client.
    #[must_use]
    pub fn from_client(client: Client) -> Self {
        Self { client }
    }

    /// Returns a reference to the underlying reqwest client.
    #[must_use]
    pub fn inner(&self) -> &Client {
        &self.client
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn execute(&self, request: reqwest::Request) -> Result<reqwest::Response, TransportFault> {
        let endpoint = request.url().to_string();
        self.client
            .execute(request)
            .await
            .map_err(|error| classify_reqwest_error(endpoint, error))
    }
}

fn base_client_builder(connect_timeout_secs: u64, read_timeout_secs: u64) -> ClientBuilder {
    // The converter sends its own User-Agent and Content-Length on every request.
    Client::builder()
        .connect_timeout(Duration::from_secs(connect_timeout_secs))
        .timeout(Duration::from_secs(read_timeout_secs))
        .gzip(true)
}

/// Maps a reqwest send error onto the transport fault taxonomy.
fn classify_reqwest_error(endpoint: String, error: reqwest::Error) -> TransportFault {
    debug!(endpoint = %endpoint, error = %error, "native call failed");
    if error.is_timeout() {
        TransportFault::timeout(endpoint, None)
    } else if source_mentions_tls(&error) {
        TransportFault::tls(endpoint, error)
    } else if error.is_connect() {
        TransportFault::connect(endpoint, error)
    } else {
        TransportFault::io(endpoint, error)
    }
}

/// Checks the causes of `error` for a TLS/certificate failure.
///
/// TLS failures only surface through the text of the source chain. The
/// top-level message is skipped because it embeds the request URL.
fn source_mentions_tls(error: &(dyn StdError + 'static)) -> bool {
    let mut source = error.source();
    while let Some(inner) = source {
        let text = inner.to_string().to_lowercase();
        if ["certificate", "tls", "ssl", "handshake"]
            .iter()
            .any(|marker| text.contains(marker))
        {
            return true;
        }
        source = inner.source();
    }
    false
}
