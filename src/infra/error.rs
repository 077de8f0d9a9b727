//! Failures from process plumbing: the HTTP client, the tracing subscriber and plain file I/O.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum InfraError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// The shared `reqwest` client could not be built.
    #[error("failed to build http client")]
    HttpClient(#[source] reqwest::Error),
    /// Another global subscriber is already installed.
    #[error("failed to install tracing subscriber")]
    Subscriber(#[source] tracing_subscriber::util::TryInitError),
}

impl InfraError {
    /// Stable label for log fields.
    pub fn code(&self) -> &'static str {
        match self {
            InfraError::Io(_) => "io",
            InfraError::HttpClient(_) => "http_client",
            InfraError::Subscriber(_) => "subscriber",
        }
    }
}
