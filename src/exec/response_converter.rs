//! Conversion of native reqwest responses into abstract responses.

use hyper::ext::ReasonPhrase;
use tracing::{debug, instrument};

use super::metadata::metadata_from_headers;
use super::{Payload, Response};

/// Builds a [`Response`] from a native response.
///
/// The native response moves into the payload, so closing the payload also
/// closes the underlying connection resource. Headers are copied with
/// duplicates preserved and payload metadata is derived from them through
/// the shared header table.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResponseConverter;

impl ResponseConverter {
    /// Creates a converter.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Converts a native response. Body bytes are not read here.
    ///
    /// The status text is the reason phrase the server sent when it differs
    /// from the canonical one, otherwise the canonical reason.
    #[instrument(level = "debug", skip_all, fields(status = native.status().as_u16()))]
    pub fn convert(&self, native: reqwest::Response) -> Response {
        let status = native.status();
        let status_text = native
            .extensions()
            .get::<ReasonPhrase>()
            .map(|reason| String::from_utf8_lossy(reason.as_bytes()).into_owned())
            .unwrap_or_else(|| status.canonical_reason().unwrap_or_default().to_string());
        let headers = native.headers().clone();
        let metadata = metadata_from_headers(&headers);
        debug!(
            content_length = ?metadata.content_length,
            content_type = ?metadata.content_type,
            "converted response"
        );
        let payload = Payload::from_native(native, metadata);
        Response::new(status, status_text, headers, Some(payload))
    }
}
