//! Error taxonomy of the judge-facing engine.

/// Everything that can go wrong talking to the judge, split by how callers
/// react: transport and protocol failures are retried with a fresh probe,
/// credential and registration failures are absorbed where they occur, and
/// server errors unwind to the orchestrator.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// Network-level failure (timeout, reset, non-2xx status).
    #[error("transport error: {0}")]
    Transport(String),
    /// The judge returned a structured error we do not understand.
    #[error("judge error: {0}")]
    Server(String),
    /// Login rejected for known credentials.
    #[error("login rejected: {0}")]
    Credential(String),
    /// Registration hit an existing username.
    #[error("account already exists: {0}")]
    AccountExists(String),
    /// The judge rejected the captcha solution.
    #[error("captcha rejected: {0}")]
    Captcha(String),
    /// A response violated the wire contract (missing field, unknown result
    /// code, absent session cookie).
    #[error("protocol violation: {0}")]
    Protocol(String),
}

impl ClientError {
    /// Whether a fresh attempt against another account can succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Protocol(_))
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(err: reqwest::Error) -> Self {
        Self::Transport(err.to_string())
    }
}
