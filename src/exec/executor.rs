//! The command executor: attempt loop, retry protocol and completion handles.
//!
//! Each submitted [`Command`] runs its whole attempt loop as one tokio task.
//! A semaphore bounds how many loops run at once; within one command attempts
//! are strictly sequential and the previous response is released before the
//! next native call starts.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use super::constants::{DEFAULT_CONCURRENCY, ERROR_BODY_READ_TIMEOUT};
use super::{
    ClassifyingErrorHandler, Command, CommandError, CommandState, ConversionError, ErrorBodyParser,
    ErrorHandler, ExecutionError, RequestConverter, ReqwestTransport, Response, ResponseConverter,
    RetryDecision, RetryHandler, RetryPolicy, Transport, TransportFault,
};
use crate::config::{ConfigError, ExecutorConfig};

/// Counters across every command an executor has run.
///
/// `payloads_opened` counts response payloads handed out by the response
/// converter and `payloads_released` counts their release hooks; once every
/// command and response has been dropped the two are equal.
#[derive(Debug, Default)]
pub struct ExecutorStats {
    submitted: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
    attempts: AtomicU64,
    payloads_opened: AtomicU64,
    payloads_released: AtomicU64,
}

impl ExecutorStats {
    /// Creates a new stats tracker with zero counts.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Commands accepted by `submit`.
    #[must_use]
    pub fn submitted(&self) -> u64 {
        self.submitted.load(Ordering::SeqCst)
    }

    /// Commands that ended `Succeeded`.
    #[must_use]
    pub fn succeeded(&self) -> u64 {
        self.succeeded.load(Ordering::SeqCst)
    }

    /// Commands that ended `Failed`.
    #[must_use]
    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::SeqCst)
    }

    /// Granted retries.
    #[must_use]
    pub fn retried(&self) -> u64 {
        self.retried.load(Ordering::SeqCst)
    }

    /// Native calls started.
    #[must_use]
    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn payloads_opened(&self) -> u64 {
        self.payloads_opened.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn payloads_released(&self) -> u64 {
        self.payloads_released.load(Ordering::SeqCst)
    }

    /// Response payloads not yet released.
    #[must_use]
    pub fn open_payloads(&self) -> u64 {
        self.payloads_opened()
            .saturating_sub(self.payloads_released())
    }

    fn increment(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::SeqCst);
    }
}

/// Runs commands against a [`Transport`] with a bounded retry protocol.
///
/// Cheap to clone; clones share the transport, handlers, concurrency limit
/// and stats.
#[derive(Clone)]
pub struct CommandExecutor {
    inner: Arc<Inner>,
}

struct Inner {
    transport: Arc<dyn Transport>,
    request_converter: RequestConverter,
    response_converter: ResponseConverter,
    retry_handler: Arc<dyn RetryHandler>,
    error_handler: Arc<dyn ErrorHandler>,
    attempt_timeout: Option<Duration>,
    semaphore: Semaphore,
    concurrency: usize,
    stats: Arc<ExecutorStats>,
}

impl std::fmt::Debug for CommandExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandExecutor")
            .field("concurrency", &self.inner.concurrency)
            .field("max_attempts", &self.inner.retry_handler.max_attempts())
            .field("attempt_timeout", &self.inner.attempt_timeout)
            .finish_non_exhaustive()
    }
}

impl CommandExecutor {
    /// Builds the default stack from a validated configuration: a reqwest
    /// transport, a [`RetryPolicy`] and a [`ClassifyingErrorHandler`] with the
    /// default rule table.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] for an invalid configuration or
    /// [`ConfigError::Client`] if the HTTP client cannot be built.
    pub fn new(config: &ExecutorConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let transport =
            ReqwestTransport::with_timeouts(config.connect_timeout_secs, config.read_timeout_secs)
                .map_err(ConfigError::Client)?;
        let policy = RetryPolicy::new(
            config.max_attempts,
            config.base_delay(),
            config.max_delay(),
            2.0,
        );

        let mut builder = Self::builder()
            .transport(transport)
            .retry_handler(policy)
            .user_agent(&config.user_agent)
            .concurrency(config.concurrency);
        if let Some(timeout) = config.attempt_timeout() {
            builder = builder.attempt_timeout(timeout);
        }
        builder.build().map_err(ConfigError::Client)
    }

    /// Starts a builder for injecting individual collaborators.
    #[must_use]
    pub fn builder() -> CommandExecutorBuilder {
        CommandExecutorBuilder::default()
    }

    /// Returns the shared counters.
    #[must_use]
    pub fn stats(&self) -> &ExecutorStats {
        &self.inner.stats
    }

    /// Returns the concurrency limit.
    #[must_use]
    pub fn concurrency(&self) -> usize {
        self.inner.concurrency
    }

    /// Validates the request and spawns the command's attempt loop.
    ///
    /// Filters run later, once the command holds a concurrency permit, so
    /// time-based output is fresh when the first attempt is sent. Must be
    /// called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Conversion errors are returned here, before any native call, and the
    /// command never enters the loop.
    #[instrument(skip_all, fields(command_id = command.id(), method = %command.request().method(), endpoint = %command.request().endpoint()))]
    pub fn submit(&self, command: Command) -> Result<CommandHandle, ConversionError> {
        self.inner.request_converter.validate(command.request())?;
        ExecutorStats::increment(&self.inner.stats.submitted);

        let id = command.id();
        let inner = Arc::clone(&self.inner);
        let task = tokio::spawn(async move { inner.run(command).await });
        debug!(command_id = id, "command submitted");
        Ok(CommandHandle { id, task })
    }

    /// Submits a command and waits for it to reach a terminal state.
    ///
    /// # Errors
    ///
    /// [`ExecutionError::Rejected`] for conversion errors; HTTP and transport
    /// failures are attached to the returned command instead.
    pub async fn execute(&self, command: Command) -> Result<Command, ExecutionError> {
        self.submit(command)?.await
    }
}

/// What to do after an attempt.
enum Step {
    Finished(Command),
    Retry(Command, Duration),
}

impl Inner {
    #[instrument(name = "command", skip_all, fields(command_id = command.id(), endpoint = %command.request().endpoint()))]
    async fn run(&self, mut command: Command) -> Command {
        // The semaphore is never closed.
        let _permit = self.semaphore.acquire().await.ok();

        loop {
            let native = match self.request_converter.convert(command.request_mut()) {
                Ok(native) => native,
                Err(error) => return self.fail(command, CommandError::Rebuild(error)),
            };
            let attempt = command.begin_attempt();
            ExecutorStats::increment(&self.stats.attempts);
            debug!(attempt, "sending request");

            let step = match self.send(native).await {
                Ok(native_response) => {
                    let response = self.open_response(native_response);
                    self.on_response(command, response).await
                }
                Err(fault) => self.on_fault(command, fault),
            };

            match step {
                Step::Finished(done) => return done,
                Step::Retry(retrying, delay) => {
                    command = retrying;
                    self.back_off(&mut command, delay).await;
                }
            }
        }
    }

    /// Runs one native call, enforcing the per-attempt budget.
    async fn send(&self, native: reqwest::Request) -> Result<reqwest::Response, TransportFault> {
        match self.attempt_timeout {
            Some(limit) => {
                let endpoint = native.url().to_string();
                tokio::time::timeout(limit, self.transport.execute(native))
                    .await
                    .unwrap_or_else(|_| Err(TransportFault::timeout(endpoint, Some(limit))))
            }
            None => self.transport.execute(native).await,
        }
    }

    /// Converts the native response and registers release accounting on it.
    fn open_response(&self, native: reqwest::Response) -> Response {
        let mut response = self.response_converter.convert(native);
        if let Some(payload) = response.payload_mut() {
            ExecutorStats::increment(&self.stats.payloads_opened);
            let stats = Arc::clone(&self.stats);
            payload.on_release(move || ExecutorStats::increment(&stats.payloads_released));
        }
        response
    }

    async fn on_response(&self, mut command: Command, mut response: Response) -> Step {
        let status = response.status();
        if status.as_u16() < 300 {
            debug!(status = status.as_u16(), attempts = command.attempts(), "command succeeded");
            command.set_response(response);
            command.transition(CommandState::Succeeded);
            ExecutorStats::increment(&self.stats.succeeded);
            return Step::Finished(command);
        }

        match self.decide(&command, |handler, command| {
            handler.should_retry(command, &response)
        }) {
            RetryDecision::Retry { delay, .. } => {
                info!(
                    status = status.as_u16(),
                    attempt = command.attempts(),
                    delay_ms = delay.as_millis(),
                    "retrying after error status"
                );
                response.release();
                Step::Retry(command, delay)
            }
            RetryDecision::DoNotRetry { reason } => {
                debug!(status = status.as_u16(), %reason, "not retrying");
                let budget = self.attempt_timeout.unwrap_or(ERROR_BODY_READ_TIMEOUT);
                let handled = tokio::time::timeout(
                    budget,
                    self.error_handler.handle(&mut command, &mut response),
                )
                .await;
                if handled.is_err() {
                    warn!(
                        status = status.as_u16(),
                        budget_ms = budget.as_millis(),
                        "error handler timed out, classifying by status only"
                    );
                }
                response.release();
                if command.error().is_none() {
                    command.set_error(CommandError::HttpStatus {
                        endpoint: command.request().endpoint().to_string(),
                        status,
                        status_text: response.status_text().to_string(),
                    });
                }
                command.set_response(response);
                Step::Finished(self.finish_failed(command))
            }
        }
    }

    fn on_fault(&self, command: Command, fault: TransportFault) -> Step {
        match self.decide(&command, |handler, command| {
            handler.should_retry_fault(command, &fault)
        }) {
            RetryDecision::Retry { delay, .. } => {
                info!(
                    attempt = command.attempts(),
                    delay_ms = delay.as_millis(),
                    error = %fault,
                    "retrying after transport fault"
                );
                Step::Retry(command, delay)
            }
            RetryDecision::DoNotRetry { reason } => {
                debug!(error = %fault, %reason, "not retrying");
                Step::Finished(self.fail(command, CommandError::Transport(fault)))
            }
        }
    }

    /// Applies the attempt ceiling before consulting the retry handler.
    fn decide(
        &self,
        command: &Command,
        ask: impl FnOnce(&dyn RetryHandler, &Command) -> RetryDecision,
    ) -> RetryDecision {
        let ceiling = self.retry_handler.max_attempts().max(1);
        if command.attempts() >= ceiling {
            return RetryDecision::DoNotRetry {
                reason: format!("attempt ceiling ({ceiling}) reached"),
            };
        }
        ask(self.retry_handler.as_ref(), command)
    }

    async fn back_off(&self, command: &mut Command, delay: Duration) {
        ExecutorStats::increment(&self.stats.retried);
        command.transition(CommandState::Retrying);
        tokio::time::sleep(delay).await;
    }

    fn fail(&self, mut command: Command, error: CommandError) -> Command {
        command.set_error(error);
        self.finish_failed(command)
    }

    fn finish_failed(&self, mut command: Command) -> Command {
        if let Some(error) = command.error() {
            warn!(
                command_id = command.id(),
                attempts = command.attempts(),
                error = %error,
                "command failed"
            );
        }
        command.transition(CommandState::Failed);
        ExecutorStats::increment(&self.stats.failed);
        command
    }
}

/// Completion handle for a submitted command.
///
/// Resolves to the terminal [`Command`]. Dropping the handle detaches the
/// task; it still runs to completion.
#[derive(Debug)]
pub struct CommandHandle {
    id: u64,
    task: JoinHandle<Command>,
}

impl CommandHandle {
    /// The id of the command this handle tracks.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Aborts the command's task.
    ///
    /// The in-flight native call is dropped and any response the task holds
    /// is released. Has no effect once the command is terminal.
    pub fn cancel(&self) {
        debug!(command_id = self.id, "cancelling command");
        self.task.abort();
    }

    /// Returns `true` once the task has stopped.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Future for CommandHandle {
    type Output = Result<Command, ExecutionError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.task).poll(cx).map(|joined| {
            joined.map_err(|error| {
                if error.is_cancelled() {
                    ExecutionError::Cancelled
                } else {
                    ExecutionError::Panicked
                }
            })
        })
    }
}

/// Builder for [`CommandExecutor`].
pub struct CommandExecutorBuilder {
    transport: Option<Arc<dyn Transport>>,
    request_converter: RequestConverter,
    retry_handler: Arc<dyn RetryHandler>,
    error_handler: Arc<dyn ErrorHandler>,
    attempt_timeout: Option<Duration>,
    concurrency: usize,
}

impl Default for CommandExecutorBuilder {
    fn default() -> Self {
        Self {
            transport: None,
            request_converter: RequestConverter::default(),
            retry_handler: Arc::new(RetryPolicy::default()),
            error_handler: Arc::new(ClassifyingErrorHandler::default()),
            attempt_timeout: None,
            concurrency: DEFAULT_CONCURRENCY,
        }
    }
}

impl CommandExecutorBuilder {
    /// Uses `transport` instead of a default reqwest transport.
    #[must_use]
    pub fn transport(mut self, transport: impl Transport + 'static) -> Self {
        self.transport = Some(Arc::new(transport));
        self
    }

    /// Replaces the retry handler.
    #[must_use]
    pub fn retry_handler(mut self, handler: impl RetryHandler + 'static) -> Self {
        self.retry_handler = Arc::new(handler);
        self
    }

    /// Replaces the error handler.
    #[must_use]
    pub fn error_handler(mut self, handler: impl ErrorHandler + 'static) -> Self {
        self.error_handler = Arc::new(handler);
        self
    }

    /// Uses the default classification table with a custom body parser.
    #[must_use]
    pub fn error_parser(mut self, parser: impl ErrorBodyParser + 'static) -> Self {
        self.error_handler = Arc::new(ClassifyingErrorHandler::new(Arc::new(parser)));
        self
    }

    /// Sets the User-Agent sent with every request.
    #[must_use]
    pub fn user_agent(mut self, user_agent: &str) -> Self {
        self.request_converter = RequestConverter::with_user_agent(user_agent);
        self
    }

    /// Bounds each native call; exceeding it is a [`TransportFault::Timeout`].
    #[must_use]
    pub fn attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = Some(timeout);
        self
    }

    /// Sets how many commands may run their attempt loop at once (min 1).
    #[must_use]
    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Builds the executor.
    ///
    /// # Errors
    ///
    /// Returns the reqwest builder error when no transport was injected and
    /// the default client cannot be built.
    pub fn build(self) -> Result<CommandExecutor, reqwest::Error> {
        let transport = match self.transport {
            Some(transport) => transport,
            None => Arc::new(ReqwestTransport::new()?),
        };
        Ok(CommandExecutor {
            inner: Arc::new(Inner {
                transport,
                request_converter: self.request_converter,
                response_converter: ResponseConverter::new(),
                retry_handler: self.retry_handler,
                error_handler: self.error_handler,
                attempt_timeout: self.attempt_timeout,
                semaphore: Semaphore::new(self.concurrency),
                concurrency: self.concurrency,
                stats: Arc::new(ExecutorStats::new()),
            }),
        })
    }
}
