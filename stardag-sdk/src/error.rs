use thiserror::Error;

/// Failures raised by user task code or the engine around it.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("{0}")]
    Execution(String),

    #[error("target i/o: {0}")]
    Target(String),

    #[error("registry: {0}")]
    Registry(#[from] RegistryClientError),

    #[error("failed to acquire lock: {0}")]
    Lock(String),
}

impl TaskError {
    pub fn execution(message: impl Into<String>) -> Self {
        TaskError::Execution(message.into())
    }
}

/// Typed translation of registry HTTP responses.
#[derive(Debug, Error)]
pub enum RegistryClientError {
    /// 401 with the token-expired code; the client retries once after a
    /// transparent refresh before surfacing this.
    #[error("access token expired")]
    TokenExpired,

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("workspace access denied: {0}")]
    WorkspaceAccess(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("api error ({status}): {detail}")]
    Api { status: u16, detail: String },

    #[error("transport: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("{0}")]
    Config(String),
}
