//! Conversion of abstract requests into native reqwest requests.

use reqwest::Method;
use reqwest::header::{CONTENT_LENGTH, HeaderValue, USER_AGENT};
use tracing::{debug, instrument};

use super::metadata::write_metadata_headers;
use super::{ConversionError, PayloadError, Request};
use crate::user_agent::default_user_agent;

/// Builds a native request from a [`Request`] for one attempt.
///
/// Conversion runs again on every attempt, so filters that depend on time
/// (signing) recompute their output per attempt.
#[derive(Debug, Clone)]
pub struct RequestConverter {
    user_agent: HeaderValue,
}

impl Default for RequestConverter {
    fn default() -> Self {
        Self::with_user_agent(&default_user_agent())
    }
}

impl RequestConverter {
    /// Creates a converter that sends the default User-Agent.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a converter with a custom User-Agent.
    ///
    /// Falls back to the default User-Agent if `user_agent` is not valid
    /// header text.
    #[must_use]
    pub fn with_user_agent(user_agent: &str) -> Self {
        let user_agent = HeaderValue::from_str(user_agent).unwrap_or_else(|_| {
            debug!(user_agent, "invalid User-Agent, using default");
            HeaderValue::from_static(concat!("cloudexec/", env!("CARGO_PKG_VERSION")))
        });
        Self { user_agent }
    }

    /// Returns the User-Agent sent with every request.
    #[must_use]
    pub fn user_agent(&self) -> &HeaderValue {
        &self.user_agent
    }

    /// Checks everything [`convert`](Self::convert) would reject, without
    /// running filters or taking the payload's body.
    ///
    /// # Errors
    ///
    /// Same as [`convert`](Self::convert).
    pub fn validate(&self, request: &Request) -> Result<(), ConversionError> {
        native_method(request.method())?;
        let Some(payload) = request.payload() else {
            return Ok(());
        };
        if payload.is_released() {
            return Err(ConversionError::Payload {
                endpoint: request.endpoint().to_string(),
                source: PayloadError::Consumed,
            });
        }
        if !request.is_chunked() && payload.metadata().content_length.is_none() {
            return Err(ConversionError::MissingContentLength {
                endpoint: request.endpoint().to_string(),
            });
        }
        Ok(())
    }

    /// Applies the request's filters and builds the native request.
    ///
    /// Header order on the wire: payload metadata headers, `Content-Length`,
    /// `User-Agent`, then every request header verbatim (multi-valued headers
    /// keep their order).
    ///
    /// # Errors
    ///
    /// - [`ConversionError::UnsupportedMethod`] for methods other than
    ///   GET, PUT, POST, DELETE and HEAD
    /// - [`ConversionError::MissingContentLength`] for a non-chunked request
    ///   whose payload length is unknown
    /// - [`ConversionError::Payload`] if the payload cannot produce a body
    #[instrument(level = "debug", skip(self, request), fields(method = %request.method(), endpoint = %request.endpoint()))]
    pub fn convert(&self, request: &mut Request) -> Result<reqwest::Request, ConversionError> {
        request.apply_filters();
        self.validate(request)?;

        let mut native =
            reqwest::Request::new(request.method().clone(), request.endpoint().clone());
        let headers = native.headers_mut();

        match request.payload() {
            Some(payload) => {
                write_metadata_headers(payload.metadata(), headers);
                if !request.is_chunked()
                    && let Some(length) = payload.metadata().content_length
                {
                    headers.insert(CONTENT_LENGTH, HeaderValue::from(length));
                }
            }
            None => {
                headers.insert(CONTENT_LENGTH, HeaderValue::from_static("0"));
            }
        }

        headers.append(USER_AGENT, self.user_agent.clone());
        for (name, value) in request.headers() {
            headers.append(name.clone(), value.clone());
        }

        if let Some(payload) = request.payload() {
            let body = payload
                .body()
                .map_err(|source| ConversionError::Payload {
                    endpoint: request.endpoint().to_string(),
                    source,
                })?;
            *native.body_mut() = Some(body);
        }

        debug!(headers = native.headers().len(), "converted request");
        Ok(native)
    }
}

/// Maps a method onto the supported verb set.
fn native_method(method: &Method) -> Result<Method, ConversionError> {
    match *method {
        Method::GET | Method::PUT | Method::POST | Method::DELETE | Method::HEAD => {
            Ok(method.clone())
        }
        _ => Err(ConversionError::UnsupportedMethod {
            method: method.clone(),
        }),
    }
}
