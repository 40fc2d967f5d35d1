//! Lifecycle tests for the command executor using in-process transports:
//! attempt budgets, cancellation, the concurrency bound and handler seams.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use cloudexec_core::{
    Command, CommandError, CommandExecutor, CommandState, ConversionError, ErrorHandler,
    ExecutionError, Filter, Payload, Request, Response, RetryDecision, RetryHandler, RetryPolicy,
    Transport, TransportFault,
};
use tokio::sync::Notify;

fn native(status: u16, body: &'static str) -> reqwest::Response {
    reqwest::Response::from(http::Response::builder().status(status).body(body).unwrap())
}

fn endpoint() -> url::Url {
    "https://api.example.com/containers/c1".parse().unwrap()
}

fn fast_policy(max_attempts: u32) -> RetryPolicy {
    RetryPolicy::new(max_attempts, Duration::ZERO, Duration::ZERO, 2.0).with_jitter(Duration::ZERO)
}

/// Answers every call with the same status after an optional delay.
#[derive(Clone)]
struct FixedStatus {
    status: u16,
    delay: Duration,
    calls: Arc<AtomicU64>,
    in_flight: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl FixedStatus {
    fn new(status: u16, delay: Duration) -> Self {
        Self {
            status,
            delay,
            calls: Arc::default(),
            in_flight: Arc::default(),
            peak: Arc::default(),
        }
    }
}

#[async_trait]
impl Transport for FixedStatus {
    async fn execute(&self, _request: reqwest::Request) -> Result<reqwest::Response, TransportFault> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(native(self.status, "body"))
    }
}

/// Signals when a call starts, then never answers.
struct Hanging {
    entered: Arc<Notify>,
}

#[async_trait]
impl Transport for Hanging {
    async fn execute(&self, _request: reqwest::Request) -> Result<reqwest::Response, TransportFault> {
        self.entered.notify_one();
        std::future::pending().await
    }
}

/// Answers 500 with a body that never produces a byte.
#[derive(Default)]
struct StalledErrorBody;

#[async_trait]
impl Transport for StalledErrorBody {
    async fn execute(&self, _request: reqwest::Request) -> Result<reqwest::Response, TransportFault> {
        let body = reqwest::Body::wrap_stream(futures_util::stream::pending::<
            Result<bytes::Bytes, std::io::Error>,
        >());
        Ok(reqwest::Response::from(
            http::Response::builder().status(500).body(body).unwrap(),
        ))
    }
}

/// Records when each native call starts, then answers 200 after a delay.
struct Stamped {
    delay: Duration,
    started: Arc<Mutex<Vec<Instant>>>,
}

#[async_trait]
impl Transport for Stamped {
    async fn execute(&self, _request: reqwest::Request) -> Result<reqwest::Response, TransportFault> {
        self.started.lock().unwrap().push(Instant::now());
        tokio::time::sleep(self.delay).await;
        Ok(native(200, ""))
    }
}

/// Fails every call with a TLS fault.
struct BadCertificate {
    calls: Arc<AtomicU64>,
}

#[async_trait]
impl Transport for BadCertificate {
    async fn execute(&self, request: reqwest::Request) -> Result<reqwest::Response, TransportFault> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(TransportFault::tls(request.url().as_str(), "certificate has expired"))
    }
}

/// Delegates to a policy and records the attempt number it was asked about.
struct Recording {
    policy: RetryPolicy,
    seen: Arc<Mutex<Vec<u32>>>,
}

impl RetryHandler for Recording {
    fn should_retry(&self, command: &Command, response: &Response) -> RetryDecision {
        self.seen.lock().unwrap().push(command.attempts());
        self.policy.should_retry(command, response)
    }

    fn should_retry_fault(&self, command: &Command, fault: &TransportFault) -> RetryDecision {
        self.seen.lock().unwrap().push(command.attempts());
        self.policy.should_retry_fault(command, fault)
    }

    fn max_attempts(&self) -> u32 {
        self.policy.max_attempts()
    }
}

/// Retries everything immediately, ignoring payload repeatability.
struct AlwaysRetry;

impl RetryHandler for AlwaysRetry {
    fn should_retry(&self, command: &Command, _response: &Response) -> RetryDecision {
        RetryDecision::Retry {
            delay: Duration::ZERO,
            attempt: command.attempts() + 1,
        }
    }

    fn should_retry_fault(&self, command: &Command, _fault: &TransportFault) -> RetryDecision {
        RetryDecision::Retry {
            delay: Duration::ZERO,
            attempt: command.attempts() + 1,
        }
    }

    fn max_attempts(&self) -> u32 {
        3
    }
}

/// Leaves every failed command untouched.
struct Silent;

#[async_trait]
impl ErrorHandler for Silent {
    async fn handle(&self, _command: &mut Command, _response: &mut Response) {}
}

// ==================== Attempt Budget ====================

#[tokio::test]
async fn test_attempt_timeout_is_retried_then_reported() {
    let transport = FixedStatus::new(200, Duration::from_secs(5));
    let calls = Arc::clone(&transport.calls);
    let executor = CommandExecutor::builder()
        .transport(transport)
        .retry_handler(fast_policy(2))
        .attempt_timeout(Duration::from_millis(20))
        .build()
        .unwrap();

    let command = executor.execute(Command::new(Request::get(endpoint()))).await.unwrap();

    assert_eq!(command.state(), CommandState::Failed);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    match command.error() {
        Some(CommandError::Transport(TransportFault::Timeout { after, .. })) => {
            assert_eq!(*after, Some(Duration::from_millis(20)));
        }
        other => panic!("expected timeout, got {other:?}"),
    }
}

#[tokio::test]
async fn test_tls_fault_is_not_retried() {
    let calls = Arc::new(AtomicU64::new(0));
    let executor = CommandExecutor::builder()
        .transport(BadCertificate {
            calls: Arc::clone(&calls),
        })
        .retry_handler(fast_policy(5))
        .build()
        .unwrap();

    let command = executor.execute(Command::new(Request::get(endpoint()))).await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(matches!(
        command.error(),
        Some(CommandError::Transport(TransportFault::Tls { .. }))
    ));
}

#[tokio::test]
async fn test_retry_handler_sees_increasing_attempts_within_ceiling() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let executor = CommandExecutor::builder()
        .transport(FixedStatus::new(503, Duration::ZERO))
        .retry_handler(Recording {
            policy: fast_policy(4),
            seen: Arc::clone(&seen),
        })
        .build()
        .unwrap();

    let command = executor.execute(Command::new(Request::get(endpoint()))).await.unwrap();

    assert_eq!(command.attempts(), 4);
    // The ceiling is checked before the handler, so attempt 4 is never offered.
    assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3]);
}

#[tokio::test]
async fn test_refused_connection_is_retried_whatever_the_path() {
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let executor = CommandExecutor::builder()
        .retry_handler(fast_policy(3))
        .build()
        .unwrap();
    let url = format!("http://127.0.0.1:{port}/ssl-certs/upload").parse().unwrap();

    let command = executor.execute(Command::new(Request::get(url))).await.unwrap();

    assert_eq!(command.attempts(), 3);
    assert!(matches!(
        command.error(),
        Some(CommandError::Transport(TransportFault::Connect { .. }))
    ));
}

#[tokio::test]
async fn test_stalled_error_body_is_bounded_by_attempt_timeout() {
    let executor = CommandExecutor::builder()
        .transport(StalledErrorBody)
        .retry_handler(fast_policy(1))
        .attempt_timeout(Duration::from_millis(100))
        .build()
        .unwrap();

    let command = tokio::time::timeout(
        Duration::from_secs(2),
        executor.execute(Command::new(Request::get(endpoint()))),
    )
    .await
    .expect("command should finish within the attempt budget")
    .unwrap();

    assert_eq!(command.state(), CommandState::Failed);
    match command.error() {
        Some(CommandError::HttpStatus { status, .. }) => assert_eq!(status.as_u16(), 500),
        other => panic!("expected HttpStatus, got {other:?}"),
    }
    assert!(command.response().unwrap().is_closed());
    assert_eq!(executor.stats().payloads_opened(), 1);
    assert_eq!(executor.stats().payloads_released(), 1);
}

// ==================== Cancellation ====================

#[tokio::test]
async fn test_cancel_during_native_call() {
    let entered = Arc::new(Notify::new());
    let executor = CommandExecutor::builder()
        .transport(Hanging {
            entered: Arc::clone(&entered),
        })
        .build()
        .unwrap();

    let request = Request::put(endpoint()).with_payload(Payload::from_string("abc"));
    let handle = executor.submit(Command::new(request)).unwrap();
    entered.notified().await;
    handle.cancel();

    assert!(matches!(handle.await, Err(ExecutionError::Cancelled)));
    assert_eq!(executor.stats().open_payloads(), 0);
    assert_eq!(executor.stats().succeeded() + executor.stats().failed(), 0);
}

async fn wait_for(mut ready: impl FnMut() -> bool) {
    while !ready() {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test]
async fn test_cancel_while_reading_error_body_releases_response() {
    let executor = CommandExecutor::builder()
        .transport(StalledErrorBody)
        .retry_handler(fast_policy(1))
        .build()
        .unwrap();

    let handle = executor.submit(Command::new(Request::get(endpoint()))).unwrap();
    wait_for(|| executor.stats().payloads_opened() == 1).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    handle.cancel();

    assert!(matches!(handle.await, Err(ExecutionError::Cancelled)));
    assert_eq!(executor.stats().payloads_opened(), 1);
    assert_eq!(executor.stats().payloads_released(), 1);
}

#[tokio::test]
async fn test_cancel_during_backoff_after_discarded_response() {
    let executor = CommandExecutor::builder()
        .transport(FixedStatus::new(503, Duration::ZERO))
        .retry_handler(
            RetryPolicy::new(3, Duration::from_secs(10), Duration::from_secs(10), 2.0)
                .with_jitter(Duration::ZERO),
        )
        .build()
        .unwrap();

    let handle = executor.submit(Command::new(Request::get(endpoint()))).unwrap();
    wait_for(|| executor.stats().retried() == 1).await;
    handle.cancel();

    assert!(matches!(handle.await, Err(ExecutionError::Cancelled)));
    assert_eq!(executor.stats().payloads_opened(), 1);
    assert_eq!(executor.stats().payloads_released(), 1);
}

#[tokio::test]
async fn test_cancel_after_completion_has_no_effect() {
    let executor = CommandExecutor::builder()
        .transport(FixedStatus::new(200, Duration::ZERO))
        .build()
        .unwrap();

    let handle = executor.submit(Command::new(Request::get(endpoint()))).unwrap();
    while !handle.is_finished() {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    handle.cancel();

    let command = handle.await.unwrap();
    assert!(command.is_success());
}

// ==================== Concurrency ====================

#[tokio::test]
async fn test_concurrency_limit_bounds_in_flight_commands() {
    let transport = FixedStatus::new(200, Duration::from_millis(20));
    let peak = Arc::clone(&transport.peak);
    let executor = CommandExecutor::builder()
        .transport(transport)
        .concurrency(2)
        .build()
        .unwrap();

    let handles: Vec<_> = (0..8)
        .map(|_| executor.submit(Command::new(Request::get(endpoint()))).unwrap())
        .collect();
    for handle in handles {
        assert!(handle.await.unwrap().is_success());
    }

    let peak = peak.load(Ordering::SeqCst);
    assert!((1..=2).contains(&peak), "peak in-flight was {peak}");
    assert_eq!(executor.stats().succeeded(), 8);
}

#[tokio::test]
async fn test_filters_run_after_waiting_for_a_permit() {
    let started = Arc::new(Mutex::new(Vec::new()));
    let filtered = Arc::new(Mutex::new(Vec::new()));
    let executor = CommandExecutor::builder()
        .transport(Stamped {
            delay: Duration::from_millis(200),
            started: Arc::clone(&started),
        })
        .concurrency(1)
        .build()
        .unwrap();

    let handles: Vec<_> = (0..2)
        .map(|_| {
            let filtered = Arc::clone(&filtered);
            let request = Request::get(endpoint()).with_filter(Filter::new("stamp", move |_| {
                filtered.lock().unwrap().push(Instant::now());
            }));
            executor.submit(Command::new(request)).unwrap()
        })
        .collect();
    for handle in handles {
        assert!(handle.await.unwrap().is_success());
    }

    let started = started.lock().unwrap();
    let filtered = filtered.lock().unwrap();
    assert_eq!((started.len(), filtered.len()), (2, 2));
    for (filter_ran, call_started) in filtered.iter().zip(started.iter()) {
        let lag = call_started.duration_since(*filter_ran);
        assert!(lag < Duration::from_millis(100), "filter ran {lag:?} before the call");
    }
}

// ==================== Handler Seams ====================

#[tokio::test]
async fn test_silent_error_handler_falls_back_to_http_status() {
    let executor = CommandExecutor::builder()
        .transport(FixedStatus::new(418, Duration::ZERO))
        .retry_handler(fast_policy(5))
        .error_handler(Silent)
        .build()
        .unwrap();

    let command = executor.execute(Command::new(Request::get(endpoint()))).await.unwrap();

    assert_eq!(command.state(), CommandState::Failed);
    match command.error() {
        Some(CommandError::HttpStatus { status, .. }) => assert_eq!(status.as_u16(), 418),
        other => panic!("expected HttpStatus, got {other:?}"),
    }
    assert!(command.response().unwrap().is_closed());
    assert_eq!(executor.stats().open_payloads(), 0);
}

#[tokio::test]
async fn test_retrying_consumed_stream_fails_with_rebuild_error() {
    let transport = FixedStatus::new(503, Duration::ZERO);
    let calls = Arc::clone(&transport.calls);
    let executor = CommandExecutor::builder()
        .transport(transport)
        .retry_handler(AlwaysRetry)
        .build()
        .unwrap();

    let chunks: Vec<Result<bytes::Bytes, std::io::Error>> =
        vec![Ok(bytes::Bytes::from_static(b"once"))];
    let request = Request::put(endpoint())
        .with_payload(Payload::from_stream(Box::pin(futures_util::stream::iter(chunks)), Some(4)));

    let command = executor.execute(Command::new(request)).await.unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(matches!(
        command.error(),
        Some(CommandError::Rebuild(ConversionError::Payload { .. }))
    ));
    assert_eq!(executor.stats().open_payloads(), 0);
}
