/// Errors that can occur during PTY operations
#[derive(Debug, thiserror::Error)]
pub enum PtyError {
    /// Failed to create PTY or spawn the process on it
    #[error("Failed to create PTY: {0}")]
    CreateFailed(String),
    /// Failed to write to PTY
    #[error("Failed to write to PTY: {0}")]
    WriteFailed(String),
    /// PTY process has exited or the session was closed
    #[error("PTY process has exited")]
    ProcessExited,
}

impl From<anyhow::Error> for PtyError {
    fn from(err: anyhow::Error) -> Self {
        PtyError::CreateFailed(format!("{err:#}"))
    }
}
