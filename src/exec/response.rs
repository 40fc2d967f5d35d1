//! Abstract HTTP responses produced by the response converter.

use bytes::Bytes;
use reqwest::StatusCode;
use reqwest::header::HeaderMap;

use super::{Payload, PayloadError};

/// A provider-agnostic HTTP response.
///
/// Once the payload has been consumed or released the response is closed;
/// reading it again fails with [`PayloadError::Consumed`].
#[derive(Debug)]
pub struct Response {
    status: StatusCode,
    status_text: String,
    headers: HeaderMap,
    payload: Option<Payload>,
}

impl Response {
    /// Creates a response.
    #[must_use]
    pub fn new(
        status: StatusCode,
        status_text: impl Into<String>,
        headers: HeaderMap,
        payload: Option<Payload>,
    ) -> Self {
        Self {
            status,
            status_text: status_text.into(),
            headers,
            payload,
        }
    }

    /// Returns the status code.
    #[must_use]
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Returns the status text (reason phrase).
    #[must_use]
    pub fn status_text(&self) -> &str {
        &self.status_text
    }

    /// Returns `"<code> <reason>"`.
    #[must_use]
    pub fn status_line(&self) -> String {
        format!("{} {}", self.status.as_u16(), self.status_text)
    }

    /// Returns the headers, duplicates preserved.
    #[must_use]
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Returns the first value of a header as text, if present and valid.
    #[must_use]
    pub fn first_header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Returns the payload, if any.
    #[must_use]
    pub fn payload(&self) -> Option<&Payload> {
        self.payload.as_ref()
    }

    pub(crate) fn payload_mut(&mut self) -> Option<&mut Payload> {
        self.payload.as_mut()
    }

    /// Takes ownership of the payload, leaving the response without one.
    pub fn take_payload(&mut self) -> Option<Payload> {
        self.payload.take()
    }

    /// Returns `true` when there is no unread payload left.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.payload.as_ref().is_none_or(Payload::is_released)
    }

    /// Reads the whole body and releases the payload.
    ///
    /// A response without a payload reads as empty.
    ///
    /// # Errors
    ///
    /// Returns [`PayloadError::Consumed`] if the body was already read or
    /// released, or the underlying read error.
    pub async fn bytes(&mut self) -> Result<Bytes, PayloadError> {
        match self.payload.as_mut() {
            Some(payload) => payload.bytes().await,
            None => Ok(Bytes::new()),
        }
    }

    /// Reads at most `limit` body bytes and releases the payload.
    ///
    /// # Errors
    ///
    /// Same as [`bytes`](Self::bytes).
    pub async fn bytes_limited(&mut self, limit: usize) -> Result<Bytes, PayloadError> {
        match self.payload.as_mut() {
            Some(payload) => payload.bytes_limited(limit).await,
            None => Ok(Bytes::new()),
        }
    }

    /// Reads the whole body as (lossy) UTF-8 text and releases the payload.
    ///
    /// # Errors
    ///
    /// Same as [`bytes`](Self::bytes).
    pub async fn text(&mut self) -> Result<String, PayloadError> {
        let bytes = self.bytes().await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Releases the payload without reading it.
    ///
    /// Returns `true` if this call performed the release.
    pub fn release(&mut self) -> bool {
        self.payload.as_mut().is_some_and(Payload::release)
    }
}
