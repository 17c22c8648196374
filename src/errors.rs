use thiserror::Error;

use crate::downloader::AttemptFailure;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Tool error: {0}")]
    Tool(String),

    #[error("Download error: {0}")]
    Download(String),

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Worker error: {0}")]
    Worker(String),

    #[error("All backends failed: {last_error}")]
    AllBackendsExhausted {
        attempts: Vec<AttemptFailure>,
        last_error: String,
    },
}

impl From<url::ParseError> for AppError {
    fn from(error: url::ParseError) -> Self {
        AppError::InvalidUrl(error.to_string())
    }
}

/// Coarse category a caller can map to a user-facing message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureHint {
    LoginRequired,
    Unsupported,
    Generic,
}

impl AppError {
    pub fn hint(&self) -> FailureHint {
        let text = match self {
            AppError::AllBackendsExhausted { last_error, .. } => last_error.as_str(),
            AppError::InvalidUrl(_) => return FailureHint::Unsupported,
            _ => return FailureHint::Generic,
        };

        let lowered = text.to_lowercase();
        if lowered.contains("private") || lowered.contains("login required") {
            FailureHint::LoginRequired
        } else if lowered.contains("unsupported url")
            || lowered.contains("tiktok:sound")
            || lowered.contains("no working app info")
        {
            FailureHint::Unsupported
        } else {
            FailureHint::Generic
        }
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
