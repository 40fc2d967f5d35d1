//! Abstract, provider-agnostic HTTP requests and their outbound filters.

use std::fmt;
use std::sync::Arc;
use std::time::SystemTime;

use reqwest::Method;
use reqwest::header::{
    DATE, HeaderMap, HeaderName, HeaderValue, IntoHeaderName, TRANSFER_ENCODING,
};
use url::Url;

use super::Payload;

/// An outbound transform applied to a [`Request`] before every attempt.
///
/// Filters run in registration order, once per attempt, and mutate the
/// request in place. They run again on every retry, so they must be
/// idempotent apart from attempt-dependent fields such as a signature
/// timestamp.
#[derive(Clone)]
pub struct Filter {
    name: &'static str,
    apply: Arc<dyn Fn(&mut Request) + Send + Sync>,
}

impl Filter {
    /// Creates a named filter from a closure.
    pub fn new(name: &'static str, apply: impl Fn(&mut Request) + Send + Sync + 'static) -> Self {
        Self {
            name,
            apply: Arc::new(apply),
        }
    }

    /// A filter that replaces a header with a fixed value.
    #[must_use]
    pub fn set_header(name: HeaderName, value: HeaderValue) -> Self {
        Self::new("set-header", move |request| {
            request.headers_mut().insert(name.clone(), value.clone());
        })
    }

    /// A filter that stamps the `Date` header with the current HTTP-date.
    ///
    /// This is the shape of time-based request signing: the value changes
    /// between attempts while method, endpoint and body stay fixed.
    #[must_use]
    pub fn date_header() -> Self {
        Self::new("date-header", |request| {
            let now = httpdate::fmt_http_date(SystemTime::now());
            if let Ok(value) = HeaderValue::from_str(&now) {
                request.headers_mut().insert(DATE, value);
            }
        })
    }

    /// Returns the filter name used in logs.
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub(crate) fn apply(&self, request: &mut Request) {
        (self.apply)(request);
    }
}

impl fmt::Debug for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Filter").field(&self.name).finish()
    }
}

/// A provider-agnostic HTTP request.
///
/// Headers are a multimap: each name maps to an ordered list of values.
///
/// # Example
///
/// ```
/// use cloudexec_core::exec::{Filter, Payload, Request};
/// use reqwest::header::{HeaderName, HeaderValue};
///
/// let request = Request::put("https://storage.example.com/bucket/key".parse().unwrap())
///     .with_header(HeaderName::from_static("x-meta-owner"), HeaderValue::from_static("ops"))
///     .with_payload(Payload::from_string("hello").with_content_type("text/plain"))
///     .with_filter(Filter::date_header());
/// assert_eq!(request.filters().len(), 1);
/// ```
#[derive(Debug)]
pub struct Request {
    method: Method,
    endpoint: Url,
    headers: HeaderMap,
    payload: Option<Payload>,
    filters: Vec<Filter>,
}

impl Request {
    /// Creates a request with no headers, payload or filters.
    #[must_use]
    pub fn new(method: Method, endpoint: Url) -> Self {
        Self {
            method,
            endpoint,
            headers: HeaderMap::new(),
            payload: None,
            filters: Vec::new(),
        }
    }

    /// Creates a GET request.
    #[must_use]
    pub fn get(endpoint: Url) -> Self {
        Self::new(Method::GET, endpoint)
    }

    /// Creates a PUT request.
    #[must_use]
    pub fn put(endpoint: Url) -> Self {
        Self::new(Method::PUT, endpoint)
    }

    /// Creates a POST request.
    #[must_use]
    pub fn post(endpoint: Url) -> Self {
        Self::new(Method::POST, endpoint)
    }

    /// Creates a DELETE request.
    #[must_use]
    pub fn delete(endpoint: Url) -> Self {
        Self::new(Method::DELETE, endpoint)
    }

    /// Creates a HEAD request.
    #[must_use]
    pub fn head(endpoint: Url) -> Self {
        Self::new(Method::HEAD, endpoint)
    }

    /// Appends a header value, keeping any existing values for the name.
    #[must_use]
    pub fn with_header<K: IntoHeaderName>(mut self, name: K, value: HeaderValue) -> Self {
        self.headers.append(name, value);
        self
    }

    /// Attaches a payload.
    #[must_use]
    pub fn with_payload(mut self, payload: Payload) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Registers a filter after the existing ones.
    #[must_use]
    pub fn with_filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    /// Marks the request for chunked transfer encoding.
    #[must_use]
    pub fn chunked(self) -> Self {
        self.with_header(TRANSFER_ENCODING, HeaderValue::from_static("chunked"))
    }

    /// Returns the HTTP method.
    #[must_use]
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Returns the target endpoint.
    #[must_use]
    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    /// Returns the headers.
    #[must_use]
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Returns the headers for in-place edits (used by filters).
    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
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

    /// Returns the payload for in-place edits, if any.
    pub fn payload_mut(&mut self) -> Option<&mut Payload> {
        self.payload.as_mut()
    }

    /// Returns the registered filters in order.
    #[must_use]
    pub fn filters(&self) -> &[Filter] {
        &self.filters
    }

    /// Returns `true` if the request declares `Transfer-Encoding: chunked`.
    #[must_use]
    pub fn is_chunked(&self) -> bool {
        self.headers
            .get_all(TRANSFER_ENCODING)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .any(|v| v.eq_ignore_ascii_case("chunked"))
    }

    /// Runs every filter over the request in registration order.
    pub(crate) fn apply_filters(&mut self) {
        let filters = self.filters.clone();
        for filter in &filters {
            tracing::trace!(filter = filter.name(), "applying filter");
            filter.apply(self);
        }
    }
}
