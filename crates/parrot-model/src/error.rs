use serde::{Deserialize, Serialize};

/// Stop-reason taxonomy the orchestrator reports for the application under
/// test. This is the vocabulary surfaced to callers; everything below it is
/// logged, not returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AppErrorKind {
    /// The app command itself failed to start or exited non-zero.
    CommandError,
    /// The app exited on its own in a way the runner did not anticipate.
    Unexpected,
    /// A parrot-internal failure (attach, bind, missing handshake mock).
    Internal,
    /// The app stopped because the runner stopped it.
    AppStopped,
    /// The session's context was cancelled.
    CtxCanceled,
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind:?}: {message}")]
pub struct AppError {
    pub kind: AppErrorKind,
    pub message: String,
}

impl AppError {
    pub fn new(kind: AppErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(AppErrorKind::Internal, message)
    }
}
