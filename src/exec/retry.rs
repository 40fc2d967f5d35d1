//! Retry decisions with exponential backoff.
//!
//! The executor asks a [`RetryHandler`] after every attempt that ended with a
//! status >= 300 or a [`TransportFault`], as long as the attempt ceiling has
//! not been reached. The default handler is [`RetryPolicy`].
//!
//! # Overview
//!
//! Each outcome is classified into a [`FailureType`]:
//! - [`FailureType::Transient`] - 408, 5xx, and connection/timeout/IO faults
//! - [`FailureType::RateLimited`] - 429, may carry a `Retry-After` header
//! - [`FailureType::NeedsAuth`] - 401, 403, 407; never retried because the
//!   same filters would produce the same signature
//! - [`FailureType::Permanent`] - everything else, including TLS faults
//!
//! # Example
//!
//! ```
//! use cloudexec_core::exec::{FailureType, RetryDecision, RetryPolicy, classify_status};
//! use reqwest::StatusCode;
//!
//! let policy = RetryPolicy::default();
//! match policy.decide(classify_status(StatusCode::SERVICE_UNAVAILABLE), 1) {
//!     RetryDecision::Retry { delay, attempt } => {
//!         println!("retrying in {delay:?} (attempt {attempt})");
//!     }
//!     RetryDecision::DoNotRetry { reason } => println!("not retrying: {reason}"),
//! }
//! ```

use std::time::{Duration, SystemTime};

use rand::Rng;
use reqwest::StatusCode;
use reqwest::header::RETRY_AFTER;
use tracing::{debug, instrument, warn};

use super::constants::{
    DEFAULT_BASE_DELAY, DEFAULT_MAX_ATTEMPTS, DEFAULT_MAX_DELAY, DEFAULT_MAX_JITTER,
    MAX_RETRY_AFTER,
};
use super::{Command, Payload, Response, TransportFault};

/// Default backoff multiplier (doubles each attempt).
const DEFAULT_BACKOFF_MULTIPLIER: f32 = 2.0;

/// Classification of a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureType {
    /// Temporary failure that may succeed on retry.
    Transient,

    /// Failure that won't succeed regardless of retries.
    Permanent,

    /// Credentials or signature rejected.
    NeedsAuth,

    /// Server throttling (HTTP 429).
    RateLimited,
}

/// Decision on whether to run another attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry after the specified delay.
    Retry {
        /// How long to wait before the next attempt.
        delay: Duration,
        /// The number the next attempt will carry (first retry is attempt 2).
        attempt: u32,
    },

    /// Stop and hand the outcome to the error path.
    DoNotRetry {
        /// Human-readable reason.
        reason: String,
    },
}

impl RetryDecision {
    /// Returns `true` for [`RetryDecision::Retry`].
    #[must_use]
    pub fn is_retry(&self) -> bool {
        matches!(self, Self::Retry { .. })
    }
}

/// Decides whether a command gets another attempt.
///
/// Implementations are shared across all commands and must not keep
/// per-command state. They read the command and the response head only; the
/// response payload is released by the executor after a granted retry.
pub trait RetryHandler: Send + Sync {
    /// Decides after an attempt that produced a status >= 300.
    fn should_retry(&self, command: &Command, response: &Response) -> RetryDecision;

    /// Decides after an attempt that produced no response.
    fn should_retry_fault(&self, command: &Command, fault: &TransportFault) -> RetryDecision;

    /// The attempt ceiling. The executor never starts more native calls than
    /// this per command, whatever the handler answers.
    fn max_attempts(&self) -> u32;
}

/// Exponential backoff retry policy.
///
/// # Delay Calculation
///
/// ```text
/// delay = min(base_delay * multiplier^(attempt-1), max_delay) + jitter
/// ```
///
/// A `Retry-After` header on 429 and 503 responses replaces the computed
/// delay, capped at two minutes.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including the initial attempt).
    max_attempts: u32,

    /// Base delay for the first retry.
    base_delay: Duration,

    /// Maximum delay cap.
    max_delay: Duration,

    /// Multiplier applied each attempt.
    backoff_multiplier: f32,

    /// Upper bound for random jitter.
    max_jitter: Duration,

    /// Statuses retried in addition to the default table.
    extra_retryable: Vec<StatusCode>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            backoff_multiplier: DEFAULT_BACKOFF_MULTIPLIER,
            max_jitter: DEFAULT_MAX_JITTER,
            extra_retryable: Vec::new(),
        }
    }
}

impl RetryPolicy {
    /// Creates a new retry policy with custom settings.
    ///
    /// # Arguments
    ///
    /// * `max_attempts` - Maximum attempts including initial (clamped to >= 1)
    /// * `base_delay` - Base delay for first retry
    /// * `max_delay` - Maximum delay cap
    /// * `backoff_multiplier` - Multiplier for exponential increase
    #[must_use]
    pub fn new(
        max_attempts: u32,
        base_delay: Duration,
        max_delay: Duration,
        backoff_multiplier: f32,
    ) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
            backoff_multiplier,
            ..Self::default()
        }
    }

    /// Creates a policy with a custom `max_attempts`, using defaults for other settings.
    #[must_use]
    pub fn with_max_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..Self::default()
        }
    }

    /// Sets the upper bound for random jitter. `Duration::ZERO` disables it.
    #[must_use]
    pub fn with_jitter(mut self, max_jitter: Duration) -> Self {
        self.max_jitter = max_jitter;
        self
    }

    /// Whitelists an additional status as retryable.
    #[must_use]
    pub fn with_retryable_status(mut self, status: StatusCode) -> Self {
        if !self.extra_retryable.contains(&status) {
            self.extra_retryable.push(status);
        }
        self
    }

    /// Returns the base delay.
    #[must_use]
    pub fn base_delay(&self) -> Duration {
        self.base_delay
    }

    /// Returns the maximum computed delay.
    #[must_use]
    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    /// Classifies a status, honoring the policy's whitelist.
    #[must_use]
    pub fn classify(&self, status: StatusCode) -> FailureType {
        if self.extra_retryable.contains(&status) {
            FailureType::Transient
        } else {
            classify_status(status)
        }
    }

    /// Determines whether to retry after a failure.
    ///
    /// `attempt` is the number of the attempt that just failed (1-indexed).
    #[instrument(skip(self), fields(max_attempts = self.max_attempts))]
    pub fn decide(&self, failure_type: FailureType, attempt: u32) -> RetryDecision {
        match failure_type {
            FailureType::Permanent => {
                return RetryDecision::DoNotRetry {
                    reason: "permanent failure - retry would not help".to_string(),
                };
            }
            FailureType::NeedsAuth => {
                return RetryDecision::DoNotRetry {
                    reason: "authorization rejected - retry with same credentials would not help"
                        .to_string(),
                };
            }
            FailureType::Transient | FailureType::RateLimited => {}
        }

        if attempt >= self.max_attempts {
            debug!(attempt, max = self.max_attempts, "max attempts reached");
            return RetryDecision::DoNotRetry {
                reason: format!("max attempts ({}) exhausted", self.max_attempts),
            };
        }

        let delay = self.calculate_delay(attempt);
        debug!(
            attempt,
            next_attempt = attempt + 1,
            delay_ms = delay.as_millis(),
            "will retry"
        );

        RetryDecision::Retry {
            delay,
            attempt: attempt + 1,
        }
    }

    /// Formula: `min(base_delay * multiplier^(attempt-1), max_delay) + jitter`
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss
    )]
    fn calculate_delay(&self, attempt: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as f64;
        let multiplier = f64::from(self.backoff_multiplier);
        let exponent = f64::from(attempt.saturating_sub(1));
        let delay_ms = base_ms * multiplier.powf(exponent);
        let capped_ms = delay_ms.min(self.max_delay.as_millis() as f64);

        Duration::from_millis(capped_ms as u64) + self.calculate_jitter()
    }

    #[allow(clippy::cast_possible_truncation)]
    fn calculate_jitter(&self) -> Duration {
        let max_ms = self.max_jitter.as_millis() as u64;
        if max_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
    }
}

impl RetryHandler for RetryPolicy {
    #[instrument(
        level = "debug",
        skip_all,
        fields(command_id = command.id(), attempt = command.attempts(), status = response.status().as_u16())
    )]
    fn should_retry(&self, command: &Command, response: &Response) -> RetryDecision {
        if let Some(reason) = non_repeatable(command) {
            return RetryDecision::DoNotRetry { reason };
        }

        let failure_type = self.classify(response.status());
        match self.decide(failure_type, command.attempts()) {
            RetryDecision::Retry { delay, attempt } => {
                let delay = retry_after_override(response).unwrap_or(delay);
                RetryDecision::Retry { delay, attempt }
            }
            deny @ RetryDecision::DoNotRetry { .. } => deny,
        }
    }

    #[instrument(
        level = "debug",
        skip_all,
        fields(command_id = command.id(), attempt = command.attempts())
    )]
    fn should_retry_fault(&self, command: &Command, fault: &TransportFault) -> RetryDecision {
        if let Some(reason) = non_repeatable(command) {
            return RetryDecision::DoNotRetry { reason };
        }
        self.decide(classify_fault(fault), command.attempts())
    }

    fn max_attempts(&self) -> u32 {
        self.max_attempts
    }
}

fn non_repeatable(command: &Command) -> Option<String> {
    let repeatable = command
        .request()
        .payload()
        .is_none_or(Payload::is_repeatable);
    (!repeatable).then(|| "request payload cannot be replayed".to_string())
}

/// Reads `Retry-After` on 429 and 503 responses.
fn retry_after_override(response: &Response) -> Option<Duration> {
    if !matches!(
        response.status(),
        StatusCode::TOO_MANY_REQUESTS | StatusCode::SERVICE_UNAVAILABLE
    ) {
        return None;
    }
    let header = response.headers().get(RETRY_AFTER)?.to_str().ok()?;
    let delay = parse_retry_after(header)?;
    debug!(retry_after = %header, delay_ms = delay.as_millis(), "using Retry-After header delay");
    Some(delay)
}

/// Classifies an HTTP status into a failure type.
///
/// | Status | Type |
/// |--------|------|
/// | 401, 403, 407 | NeedsAuth |
/// | 408 | Transient |
/// | 429 | RateLimited |
/// | 5xx | Transient |
/// | other 4xx, 3xx | Permanent |
#[allow(clippy::match_same_arms)]
#[must_use]
pub fn classify_status(status: StatusCode) -> FailureType {
    match status.as_u16() {
        400 => FailureType::Permanent,   // Bad Request
        401 => FailureType::NeedsAuth,   // Unauthorized
        403 => FailureType::NeedsAuth,   // Forbidden
        404 => FailureType::Permanent,   // Not Found
        407 => FailureType::NeedsAuth,   // Proxy Authentication Required
        408 => FailureType::Transient,   // Request Timeout
        410 => FailureType::Permanent,   // Gone
        429 => FailureType::RateLimited, // Too Many Requests

        500 => FailureType::Transient, // Internal Server Error
        502 => FailureType::Transient, // Bad Gateway
        503 => FailureType::Transient, // Service Unavailable
        504 => FailureType::Transient, // Gateway Timeout

        status if (500..600).contains(&status) => FailureType::Transient,

        // Other 4xx, redirects the transport did not follow, and anything unexpected
        _ => FailureType::Permanent,
    }
}

/// Classifies a transport fault. TLS failures are permanent; the rest are transient.
#[must_use]
pub fn classify_fault(fault: &TransportFault) -> FailureType {
    match fault {
        TransportFault::Tls { .. } => FailureType::Permanent,
        TransportFault::Timeout { .. } | TransportFault::Connect { .. } | TransportFault::Io { .. } => {
            FailureType::Transient
        }
    }
}

/// Parses a `Retry-After` header value into a delay.
///
/// Supports delta-seconds (`"120"`) and HTTP-date
/// (`"Wed, 21 Oct 2015 07:28:00 GMT"`). Values above two minutes are capped;
/// past dates yield zero.
///
/// Returns `None` for negative or unparseable values.
#[must_use]
pub fn parse_retry_after(header_value: &str) -> Option<Duration> {
    let header_value = header_value.trim();

    if let Ok(seconds) = header_value.parse::<i64>() {
        if seconds < 0 {
            debug!(seconds, "negative Retry-After value, ignoring");
            return None;
        }
        #[allow(clippy::cast_sign_loss)]
        let duration = Duration::from_secs(seconds as u64);
        return Some(cap_retry_after(duration));
    }

    if let Ok(datetime) = httpdate::parse_http_date(header_value) {
        if let Ok(duration) = datetime.duration_since(SystemTime::now()) {
            Some(cap_retry_after(duration))
        } else {
            debug!(header_value, "Retry-After date is in the past, returning zero");
            Some(Duration::ZERO)
        }
    } else {
        debug!(header_value, "unparseable Retry-After value");
        None
    }
}

fn cap_retry_after(duration: Duration) -> Duration {
    if duration > MAX_RETRY_AFTER {
        warn!(
            delay_secs = duration.as_secs(),
            max_secs = MAX_RETRY_AFTER.as_secs(),
            "Retry-After exceeds maximum, capping"
        );
        MAX_RETRY_AFTER
    } else {
        duration
    }
}
