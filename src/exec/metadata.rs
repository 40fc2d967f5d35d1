//! Fixed mapping between standard content headers and [`PayloadMetadata`].
//!
//! Shared by the request and response converters so both directions agree on
//! header names and encodings. `Content-MD5` travels base64-encoded (RFC 1864).

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use reqwest::header::{
    CONTENT_ENCODING, CONTENT_LENGTH, CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue,
};
use tracing::debug;

use super::PayloadMetadata;

/// The non-standard `Content-MD5` header.
pub const CONTENT_MD5: HeaderName = HeaderName::from_static("content-md5");

/// Payload field a content header maps onto.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetadataField {
    /// [`PayloadMetadata::content_length`]
    ContentLength,
    /// [`PayloadMetadata::content_type`]
    ContentType,
    /// [`PayloadMetadata::content_encoding`]
    ContentEncoding,
    /// [`PayloadMetadata::content_md5`]
    ContentMd5,
}

/// Header name to payload field table.
pub const PAYLOAD_METADATA_HEADERS: [(HeaderName, MetadataField); 4] = [
    (CONTENT_LENGTH, MetadataField::ContentLength),
    (CONTENT_TYPE, MetadataField::ContentType),
    (CONTENT_ENCODING, MetadataField::ContentEncoding),
    (CONTENT_MD5, MetadataField::ContentMd5),
];

/// Derives payload metadata from response headers.
///
/// Unparseable values are skipped; the first value of each header wins.
#[must_use]
pub fn metadata_from_headers(headers: &HeaderMap) -> PayloadMetadata {
    let mut metadata = PayloadMetadata::default();
    for (name, field) in &PAYLOAD_METADATA_HEADERS {
        let Some(value) = headers.get(name).and_then(|v| v.to_str().ok()) else {
            continue;
        };
        let value = value.trim();
        match field {
            MetadataField::ContentLength => metadata.content_length = value.parse().ok(),
            MetadataField::ContentType => metadata.content_type = Some(value.to_string()),
            MetadataField::ContentEncoding => metadata.content_encoding = Some(value.to_string()),
            MetadataField::ContentMd5 => match STANDARD.decode(value) {
                Ok(digest) => metadata.content_md5 = Some(digest),
                Err(error) => debug!(%error, "ignoring malformed Content-MD5 header"),
            },
        }
    }
    metadata
}

/// Writes the descriptive payload headers (type, encoding, MD5) onto a request.
///
/// `Content-Length` is left to the request converter, which owns the framing
/// decision. Values that are not valid header text are skipped.
pub fn write_metadata_headers(metadata: &PayloadMetadata, headers: &mut HeaderMap) {
    for (name, field) in &PAYLOAD_METADATA_HEADERS {
        let value = match field {
            MetadataField::ContentLength => None,
            MetadataField::ContentType => metadata.content_type.clone(),
            MetadataField::ContentEncoding => metadata.content_encoding.clone(),
            MetadataField::ContentMd5 => metadata.content_md5.as_ref().map(|d| STANDARD.encode(d)),
        };
        let Some(value) = value else {
            continue;
        };
        match HeaderValue::from_str(&value) {
            Ok(value) => {
                headers.insert(name.clone(), value);
            }
            Err(error) => debug!(header = %name, %error, "skipping invalid metadata header"),
        }
    }
}
