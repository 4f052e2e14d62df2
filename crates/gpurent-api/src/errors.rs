use thiserror::Error;

/// API-layer errors for gpurent-api
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("HTTP error: {0}")]
    Http(#[from] HttpError),

    /// The expected confirmation prefix was absent from command output.
    /// Carries every printed diagnostic line; never retried.
    #[error("command failed: {}", lines.join(" | "))]
    CommandFailed { lines: Vec<String> },

    #[error("Core domain error: {0}")]
    Core(#[from] gpurent_core::CoreError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Malformed command output: {0}")]
    MalformedOutput(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

#[derive(Error, Debug)]
pub enum HttpError {
    #[error("Authentication failed: please log in or sign up")]
    AuthenticationFailed,

    #[error("Invalid API key")]
    InvalidApiKey,

    #[error("Rate limited")]
    RateLimited,

    #[error("HTTP error {status}: {message}")]
    Status { status: u16, message: String },

    #[error("command exited with {code}: {stderr}")]
    CommandExit { code: i32, stderr: String },

    #[error("Request error: {0}")]
    Request(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, ApiError>;
