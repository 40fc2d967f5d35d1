//! Classification of terminal error responses.
//!
//! When the retry handler denies another attempt, the executor hands the
//! command and its last response to an [`ErrorHandler`]. The default
//! [`ClassifyingErrorHandler`] reads the body once, parses it into
//! [`ErrorRecord`]s through an [`ErrorBodyParser`], and walks an ordered table
//! of [`ClassificationRule`]s; the first rule that matches decides the
//! [`ErrorKind`].
//!
//! The default table:
//!
//! | # | Rule | Kind |
//! |---|------|------|
//! | 1 | 400 whose first message contains `No object found` | ResourceNotFound |
//! | 2 | 404, 410 | ResourceNotFound |
//! | 3 | 401, 403, 407 | Authorization |
//! | 4 | any status with parsed records | Provider |
//! | - | no rule matched | HttpStatus |

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::StatusCode;
use reqwest::header::HeaderMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, instrument};

use super::constants::MAX_ERROR_BODY_BYTES;
use super::error::summarize;
use super::{Command, CommandError, Response};

/// Terminates a failed command with exactly one attached error.
///
/// Implementations must release the response payload before returning and
/// must not fail; internal problems degrade to a less specific error.
#[async_trait]
pub trait ErrorHandler: Send + Sync {
    /// Classifies `response` and attaches the resulting error to `command`.
    async fn handle(&self, command: &mut Command, response: &mut Response);
}

/// One structured error entry from a provider error body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRecord {
    /// Provider error code, when present.
    pub code: Option<String>,
    /// Human-readable message.
    pub message: String,
}

impl ErrorRecord {
    /// Creates a record.
    pub fn new(code: Option<String>, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for ErrorRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.code {
            Some(code) => write!(f, "{code}: {}", self.message),
            None => f.write_str(&self.message),
        }
    }
}

/// Why an error body could not be parsed. Always swallowed by the handler.
#[derive(Debug, Error)]
pub enum ParseError {
    /// The body is empty or whitespace.
    #[error("error body is empty")]
    Empty,

    /// The body is not valid UTF-8.
    #[error("error body is not UTF-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),

    /// The body is not valid JSON.
    #[error("error body is not JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// The body is JSON but has no recognizable error shape.
    #[error("unrecognized error body shape")]
    Unrecognized,
}

/// Turns raw error body bytes into structured records.
pub trait ErrorBodyParser: Send + Sync {
    /// Parses a non-empty body.
    ///
    /// # Errors
    ///
    /// Returns a [`ParseError`] when the body has no structured content.
    fn parse(&self, body: &[u8]) -> Result<Vec<ErrorRecord>, ParseError>;
}

/// Parses the common JSON error envelopes.
///
/// Accepted shapes: `{"list": [...]}`, `{"errors": [...]}`, a bare array, or
/// a single object with `message` and optional `code`/`errorCode`. Array
/// entries may be objects of that form or plain strings.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonErrorParser;

impl ErrorBodyParser for JsonErrorParser {
    fn parse(&self, body: &[u8]) -> Result<Vec<ErrorRecord>, ParseError> {
        let value: Value = serde_json::from_slice(body)?;
        let entries = match &value {
            Value::Array(items) => items.as_slice(),
            Value::Object(map) => match map.get("list").or_else(|| map.get("errors")) {
                Some(Value::Array(items)) => items.as_slice(),
                _ => std::slice::from_ref(&value),
            },
            _ => return Err(ParseError::Unrecognized),
        };

        let records: Vec<ErrorRecord> = entries.iter().filter_map(record_from_json).collect();
        if records.is_empty() && !entries.is_empty() {
            return Err(ParseError::Unrecognized);
        }
        Ok(records)
    }
}

fn record_from_json(value: &Value) -> Option<ErrorRecord> {
    match value {
        Value::String(message) => Some(ErrorRecord::new(None, message.clone())),
        Value::Object(map) => {
            let message = map.get("message")?.as_str()?;
            let code = map
                .get("code")
                .or_else(|| map.get("errorCode"))
                .and_then(|code| match code {
                    Value::String(code) => Some(code.clone()),
                    Value::Number(code) => Some(code.to_string()),
                    _ => None,
                });
            Some(ErrorRecord::new(code, message))
        }
        _ => None,
    }
}

/// Treats the trimmed UTF-8 body as a single message.
#[derive(Debug, Clone, Copy, Default)]
pub struct TextErrorParser;

impl ErrorBodyParser for TextErrorParser {
    fn parse(&self, body: &[u8]) -> Result<Vec<ErrorRecord>, ParseError> {
        let text = std::str::from_utf8(body)?.trim();
        if text.is_empty() {
            return Err(ParseError::Empty);
        }
        Ok(vec![ErrorRecord::new(None, text)])
    }
}

/// JSON first, then plain text.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultErrorParser;

impl ErrorBodyParser for DefaultErrorParser {
    fn parse(&self, body: &[u8]) -> Result<Vec<ErrorRecord>, ParseError> {
        match JsonErrorParser.parse(body) {
            Ok(records) => Ok(records),
            Err(json_error) => {
                debug!(error = %json_error, "error body is not structured JSON, trying text");
                TextErrorParser.parse(body)
            }
        }
    }
}

/// The classification a rule assigns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// See [`CommandError::ResourceNotFound`].
    ResourceNotFound,
    /// See [`CommandError::Authorization`].
    Authorization,
    /// See [`CommandError::Provider`].
    Provider,
    /// See [`CommandError::HttpStatus`].
    HttpStatus,
}

/// What a rule predicate can look at.
#[derive(Debug, Clone, Copy)]
pub struct ErrorContext<'a> {
    /// The final status.
    pub status: StatusCode,
    /// Parsed error records; empty when the body had none.
    pub records: &'a [ErrorRecord],
    /// The response headers.
    pub headers: &'a HeaderMap,
}

type Predicate = Arc<dyn Fn(&ErrorContext<'_>) -> bool + Send + Sync>;

/// A named `(predicate, kind)` pair in a classification table.
#[derive(Clone)]
pub struct ClassificationRule {
    name: String,
    kind: ErrorKind,
    predicate: Predicate,
}

impl ClassificationRule {
    /// Creates a rule from an arbitrary predicate.
    pub fn new(
        name: impl Into<String>,
        kind: ErrorKind,
        predicate: impl Fn(&ErrorContext<'_>) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            kind,
            predicate: Arc::new(predicate),
        }
    }

    /// Matches `status` when the first parsed message contains `needle`.
    pub fn message_contains(status: StatusCode, needle: impl Into<String>, kind: ErrorKind) -> Self {
        let needle = needle.into();
        let name = format!("{} message contains {needle:?}", status.as_u16());
        Self::new(name, kind, move |ctx| {
            ctx.status == status
                && ctx
                    .records
                    .first()
                    .is_some_and(|record| record.message.contains(needle.as_str()))
        })
    }

    /// Matches any of `statuses`.
    #[must_use]
    pub fn statuses(statuses: &[StatusCode], kind: ErrorKind) -> Self {
        let statuses = statuses.to_vec();
        let name = statuses
            .iter()
            .map(|status| status.as_u16().to_string())
            .collect::<Vec<_>>()
            .join("/");
        Self::new(name, kind, move |ctx| statuses.contains(&ctx.status))
    }

    /// Matches any response whose body produced at least one record.
    #[must_use]
    pub fn has_records(kind: ErrorKind) -> Self {
        Self::new("parsed records", kind, |ctx| !ctx.records.is_empty())
    }

    /// The default table, in evaluation order.
    #[must_use]
    pub fn defaults() -> Vec<Self> {
        vec![
            Self::message_contains(
                StatusCode::BAD_REQUEST,
                "No object found",
                ErrorKind::ResourceNotFound,
            ),
            Self::statuses(
                &[StatusCode::NOT_FOUND, StatusCode::GONE],
                ErrorKind::ResourceNotFound,
            ),
            Self::statuses(
                &[
                    StatusCode::UNAUTHORIZED,
                    StatusCode::FORBIDDEN,
                    StatusCode::PROXY_AUTHENTICATION_REQUIRED,
                ],
                ErrorKind::Authorization,
            ),
            Self::has_records(ErrorKind::Provider),
        ]
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Evaluates the predicate.
    #[must_use]
    pub fn matches(&self, ctx: &ErrorContext<'_>) -> bool {
        (self.predicate)(ctx)
    }
}

impl fmt::Debug for ClassificationRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClassificationRule")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

/// Table-driven [`ErrorHandler`].
#[derive(Clone)]
pub struct ClassifyingErrorHandler {
    parser: Arc<dyn ErrorBodyParser>,
    rules: Vec<ClassificationRule>,
}

impl Default for ClassifyingErrorHandler {
    fn default() -> Self {
        Self::new(Arc::new(DefaultErrorParser))
    }
}

impl fmt::Debug for ClassifyingErrorHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClassifyingErrorHandler")
            .field("rules", &self.rules)
            .finish_non_exhaustive()
    }
}

impl ClassifyingErrorHandler {
    /// Creates a handler with the default rule table and the given parser.
    #[must_use]
    pub fn new(parser: Arc<dyn ErrorBodyParser>) -> Self {
        Self {
            parser,
            rules: ClassificationRule::defaults(),
        }
    }

    /// Replaces the whole rule table.
    #[must_use]
    pub fn with_rules(mut self, rules: Vec<ClassificationRule>) -> Self {
        self.rules = rules;
        self
    }

    /// Inserts a rule ahead of every existing rule.
    #[must_use]
    pub fn with_rule_first(mut self, rule: ClassificationRule) -> Self {
        self.rules.insert(0, rule);
        self
    }

    #[must_use]
    pub fn rules(&self) -> &[ClassificationRule] {
        &self.rules
    }

    /// Runs the table against a status and its parsed records.
    #[must_use]
    pub fn classify(&self, ctx: &ErrorContext<'_>) -> ErrorKind {
        let rule = self.rules.iter().find(|rule| rule.matches(ctx));
        debug!(
            status = ctx.status.as_u16(),
            records = ctx.records.len(),
            rule = rule.map_or("fallback", ClassificationRule::name),
            "classified error response"
        );
        rule.map_or(ErrorKind::HttpStatus, ClassificationRule::kind)
    }

    /// Reads and parses the body prefix. Read and parse failures yield no records.
    async fn read_records(&self, response: &mut Response) -> Vec<ErrorRecord> {
        if response.payload().is_none() {
            return Vec::new();
        }
        let body = match response.bytes_limited(MAX_ERROR_BODY_BYTES).await {
            Ok(body) => body,
            Err(error) => {
                debug!(error = %error, "could not read error body");
                return Vec::new();
            }
        };
        if body.is_empty() {
            return Vec::new();
        }
        self.parser.parse(&body).unwrap_or_else(|error| {
            debug!(error = %error, "no structured error in body");
            Vec::new()
        })
    }
}

#[async_trait]
impl ErrorHandler for ClassifyingErrorHandler {
    #[instrument(
        level = "debug",
        skip_all,
        fields(command_id = command.id(), status = response.status().as_u16())
    )]
    async fn handle(&self, command: &mut Command, response: &mut Response) {
        let records = self.read_records(response).await;
        response.release();

        let kind = self.classify(&ErrorContext {
            status: response.status(),
            records: &records,
            headers: response.headers(),
        });
        let endpoint = command.request().endpoint().to_string();
        command.set_error(build_error(kind, endpoint, response, records));
    }
}

fn build_error(
    kind: ErrorKind,
    endpoint: String,
    response: &Response,
    records: Vec<ErrorRecord>,
) -> CommandError {
    let status = response.status();
    match kind {
        ErrorKind::ResourceNotFound => CommandError::ResourceNotFound {
            endpoint,
            status,
            message: records
                .into_iter()
                .next()
                .map_or_else(|| response.status_line(), |record| record.message),
        },
        ErrorKind::Authorization => CommandError::Authorization {
            endpoint,
            status,
            detail: if records.is_empty() {
                response.status_line()
            } else {
                summarize(&records)
            },
        },
        ErrorKind::Provider => CommandError::Provider {
            endpoint,
            status,
            records,
        },
        ErrorKind::HttpStatus => CommandError::HttpStatus {
            endpoint,
            status,
            status_text: response.status_text().to_string(),
        },
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::exec::{Payload, Request};

    fn command() -> Command {
        Command::new(Request::get("https://api.example.com/objects/1".parse().unwrap()))
    }

    fn response(status: u16, body: Option<&str>) -> Response {
        let status = StatusCode::from_u16(status).unwrap();
        Response::new(
            status,
            status.canonical_reason().unwrap_or_default(),
            HeaderMap::new(),
            body.map(|body| Payload::from_string(body.to_string())),
        )
    }

    async fn classify(status: u16, body: Option<&str>) -> (Command, Response) {
        let handler = ClassifyingErrorHandler::default();
        let mut command = command();
        let mut response = response(status, body);
        handler.handle(&mut command, &mut response).await;
        (command, response)
    }

    // ==================== Parser Tests ====================

    #[test]
    fn test_json_list_envelope() {
        let body = br#"{"list":[{"message":"bad image","errorCode":"IllegalArgument"}]}"#;
        let records = DefaultErrorParser.parse(body).unwrap();
        assert_eq!(
            records,
            vec![ErrorRecord::new(Some("IllegalArgument".to_string()), "bad image")]
        );
    }

    #[test]
    fn test_json_errors_envelope_with_numeric_code() {
        let body = br#"{"errors":[{"code":42,"message":"quota"},"plain"]}"#;
        let records = JsonErrorParser.parse(body).unwrap();
        assert_eq!(records[0], ErrorRecord::new(Some("42".to_string()), "quota"));
        assert_eq!(records[1], ErrorRecord::new(None, "plain"));
    }

    #[test]
    fn test_json_single_object() {
        let records = JsonErrorParser
            .parse(br#"{"message":"denied","code":"AccessDenied"}"#)
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].to_string(), "AccessDenied: denied");
    }

    #[test]
    fn test_json_without_message_is_unrecognized() {
        assert!(matches!(
            JsonErrorParser.parse(br#"{"status":"bad"}"#),
            Err(ParseError::Unrecognized)
        ));
        assert!(matches!(
            JsonErrorParser.parse(b"12"),
            Err(ParseError::Unrecognized)
        ));
    }

    #[test]
    fn test_default_parser_falls_back_to_text() {
        let records = DefaultErrorParser.parse(b"No object found: bucket42\n").unwrap();
        assert_eq!(records, vec![ErrorRecord::new(None, "No object found: bucket42")]);
    }

    #[test]
    fn test_text_parser_rejects_empty_and_binary() {
        assert!(matches!(TextErrorParser.parse(b"  \n"), Err(ParseError::Empty)));
        assert!(matches!(
            TextErrorParser.parse(&[0xff, 0xfe]),
            Err(ParseError::Utf8(_))
        ));
    }

    // ==================== Classification Tests ====================

    #[tokio::test]
    async fn test_400_with_no_object_found_is_resource_not_found() {
        let (command, response) = classify(400, Some("No object found: bucket42")).await;
        match command.error() {
            Some(CommandError::ResourceNotFound { message, status, .. }) => {
                assert_eq!(message, "No object found: bucket42");
                assert_eq!(*status, StatusCode::BAD_REQUEST);
            }
            other => panic!("expected ResourceNotFound, got {other:?}"),
        }
        assert!(response.is_closed());
    }

    #[tokio::test]
    async fn test_generic_400_does_not_become_authorization() {
        let (command, _) = classify(400, Some("Bad parameter: size")).await;
        let error = command.error().unwrap();
        assert!(matches!(error, CommandError::Provider { .. }), "{error:?}");

        let (command, _) = classify(400, None).await;
        let error = command.error().unwrap();
        assert!(matches!(error, CommandError::HttpStatus { .. }), "{error:?}");
    }

    #[tokio::test]
    async fn test_403_is_authorization_with_detail() {
        let (command, response) = classify(403, Some("Access denied")).await;
        match command.error().unwrap() {
            CommandError::Authorization { detail, .. } => assert_eq!(detail, "Access denied"),
            other => panic!("expected Authorization, got {other:?}"),
        }
        assert!(response.is_closed());
    }

    #[tokio::test]
    async fn test_401_without_body_uses_status_line() {
        let (command, _) = classify(401, None).await;
        match command.error().unwrap() {
            CommandError::Authorization { detail, .. } => assert_eq!(detail, "401 Unauthorized"),
            other => panic!("expected Authorization, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_404_is_resource_not_found() {
        let (command, _) = classify(404, Some("")).await;
        assert!(matches!(
            command.error(),
            Some(CommandError::ResourceNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_500_without_body_is_http_status() {
        let (command, _) = classify(500, None).await;
        assert!(matches!(
            command.error(),
            Some(CommandError::HttpStatus { status, .. }) if *status == StatusCode::INTERNAL_SERVER_ERROR
        ));
    }

    #[tokio::test]
    async fn test_oversized_body_is_read_up_to_cap() {
        let message = "x".repeat(MAX_ERROR_BODY_BYTES + 512);
        let (command, response) = classify(409, Some(&message)).await;
        match command.error() {
            Some(CommandError::Provider { records, .. }) => {
                assert_eq!(records[0].message.len(), MAX_ERROR_BODY_BYTES);
            }
            other => panic!("expected Provider, got {other:?}"),
        }
        assert!(response.is_closed());
    }

    #[tokio::test]
    async fn test_consumed_body_degrades_to_status_only() {
        let handler = ClassifyingErrorHandler::default();
        let mut command = command();
        let mut response = response(409, Some("conflict"));
        response.release();
        handler.handle(&mut command, &mut response).await;
        assert!(matches!(command.error(), Some(CommandError::HttpStatus { .. })));
    }

    #[test]
    fn test_rule_prepended_wins() {
        let handler = ClassifyingErrorHandler::default().with_rule_first(
            ClassificationRule::message_contains(
                StatusCode::FORBIDDEN,
                "does not exist",
                ErrorKind::ResourceNotFound,
            ),
        );
        let records = vec![ErrorRecord::new(None, "bucket does not exist")];
        let headers = HeaderMap::new();
        let ctx = ErrorContext {
            status: StatusCode::FORBIDDEN,
            records: &records,
            headers: &headers,
        };
        assert_eq!(handler.classify(&ctx), ErrorKind::ResourceNotFound);
        assert_eq!(handler.rules().len(), 5);
    }

    #[test]
    fn test_default_rule_names() {
        let names: Vec<_> = ClassificationRule::defaults()
            .iter()
            .map(|rule| rule.name().to_string())
            .collect();
        assert_eq!(names[1], "404/410");
        assert_eq!(names[2], "401/403/407");
    }
}
