//! A single logical request execution across all of its attempts.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::debug;

use super::{CommandError, Request, Response};

static NEXT_COMMAND_ID: AtomicU64 = AtomicU64::new(1);

/// Lifecycle state of a [`Command`].
///
/// `Pending → Executing → {Succeeded, Retrying, Failed}`, with
/// `Retrying → Executing` looping back. `Succeeded` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandState {
    /// Accepted, not yet sent.
    Pending,
    /// Exactly one native call outstanding.
    Executing,
    /// Waiting for the backoff delay before the next attempt.
    Retrying,
    /// Completed with a status below 300.
    Succeeded,
    /// Completed with an attached [`CommandError`].
    Failed,
}

impl CommandState {
    /// Returns `true` for `Succeeded` and `Failed`.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

impl fmt::Display for CommandState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pending => "pending",
            Self::Executing => "executing",
            Self::Retrying => "retrying",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// One request plus the record of its execution.
///
/// A command is owned by exactly one task while it runs; the caller gets it
/// back from the [`CommandHandle`](super::CommandHandle) once it is terminal.
#[derive(Debug)]
pub struct Command {
    id: u64,
    request: Request,
    attempts: u32,
    state: CommandState,
    response: Option<Response>,
    error: Option<CommandError>,
}

impl Command {
    /// Wraps a request in a pending command.
    #[must_use]
    pub fn new(request: Request) -> Self {
        Self {
            id: NEXT_COMMAND_ID.fetch_add(1, Ordering::Relaxed),
            request,
            attempts: 0,
            state: CommandState::Pending,
            response: None,
            error: None,
        }
    }

    /// Process-unique id, used in log fields.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub fn request(&self) -> &Request {
        &self.request
    }

    pub(crate) fn request_mut(&mut self) -> &mut Request {
        &mut self.request
    }

    /// Number of native calls started so far.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    #[must_use]
    pub fn state(&self) -> CommandState {
        self.state
    }

    /// The final response, if one was obtained.
    ///
    /// On failure the response is kept for its status and headers; its payload
    /// has already been released by the error handler.
    #[must_use]
    pub fn response(&self) -> Option<&Response> {
        self.response.as_ref()
    }

    /// Mutable access to the final response, e.g. to read the body.
    pub fn response_mut(&mut self) -> Option<&mut Response> {
        self.response.as_mut()
    }

    /// Takes the final response out of the command.
    pub fn take_response(&mut self) -> Option<Response> {
        self.response.take()
    }

    /// Consumes the command, returning its final response.
    #[must_use]
    pub fn into_response(self) -> Option<Response> {
        self.response
    }

    /// The classified error of a failed command.
    #[must_use]
    pub fn error(&self) -> Option<&CommandError> {
        self.error.as_ref()
    }

    /// Attaches the terminal error, replacing any previous one.
    ///
    /// Called by [`ErrorHandler`](super::ErrorHandler) implementations.
    pub fn set_error(&mut self, error: CommandError) {
        self.error = Some(error);
    }

    /// Returns `true` if the command ended `Succeeded`.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.state == CommandState::Succeeded
    }

    pub(crate) fn begin_attempt(&mut self) -> u32 {
        self.attempts += 1;
        self.transition(CommandState::Executing);
        self.attempts
    }

    pub(crate) fn transition(&mut self, state: CommandState) {
        debug!(
            command_id = self.id,
            attempt = self.attempts,
            from = %self.state,
            to = %state,
            "command state change"
        );
        self.state = state;
    }

    pub(crate) fn set_response(&mut self, response: Response) {
        self.response = Some(response);
    }
}
