use std::path::PathBuf;

use thiserror::Error;

/// Failures raised inside the shell before they are folded into a
/// [`CommandResult`](crate::bridge::CommandResult) at the command boundary.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ShellError {
    /// The worker entry point does not exist on disk.
    #[error("worker entry point not found: {}", .0.display())]
    WorkerEntryMissing(PathBuf),

    /// The OS refused to launch the worker.
    #[error("failed to launch worker: {0}")]
    WorkerSpawn(String),

    /// The supervisor task is no longer running.
    #[error("worker supervisor has shut down")]
    SupervisorGone,

    /// A caller-supplied argument failed local validation.
    #[error("{0}")]
    InvalidArgument(String),

    /// The worker could not be reached (refused, timeout, DNS).
    #[error("backend request failed: {0}")]
    Transport(String),

    /// The worker answered with a non-success status.
    #[error("backend request failed: {message}")]
    Backend { status: u16, message: String },

    #[error("settings store error: {0}")]
    Store(String),
}

impl ShellError {
    /// Errors that need user action and are shown as a dialog, not just logged.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ShellError::WorkerEntryMissing(_) | ShellError::WorkerSpawn(_)
        )
    }
}

impl From<reqwest::Error> for ShellError {
    fn from(err: reqwest::Error) -> Self {
        ShellError::Transport(err.to_string())
    }
}
