use thiserror::Error;

/// Maximum length for response bodies carried in errors.
const MAX_ERROR_BODY_LENGTH: usize = 500;

/// A failed network call.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("Unauthorized - token may be expired")]
    Unauthorized,

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Rate limited, retry after {retry_after:?}s")]
    RateLimited { retry_after: Option<u64> },

    #[error("Service unavailable: {0}")]
    Unavailable(String),

    #[error("Server error {status}: {body}")]
    Server { status: u16, body: String },

    #[error("Request timed out")]
    Timeout,

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

impl FetchError {
    fn truncate_body(body: &str) -> String {
        if body.len() <= MAX_ERROR_BODY_LENGTH {
            return body.to_string();
        }
        let mut end = MAX_ERROR_BODY_LENGTH;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}... (truncated, {} total bytes)", &body[..end], body.len())
    }

    pub fn from_status(status: u16, body: &str, retry_after: Option<u64>) -> Self {
        let truncated = Self::truncate_body(body);
        match status {
            401 => Self::Unauthorized,
            404 => Self::NotFound(truncated),
            429 => Self::RateLimited { retry_after },
            503 => Self::Unavailable(truncated),
            500..=599 => Self::Server {
                status,
                body: truncated,
            },
            _ => Self::InvalidResponse(format!("Status {}: {}", status, truncated)),
        }
    }

    pub fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else {
            Self::Network(err)
        }
    }
}

/// Client cache failures.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Fetch failed and no cached copy exists: {0}")]
    Fetch(#[from] FetchError),

    #[error("Cache IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Corrupt cache record for {key}: {reason}")]
    Corrupt { key: String, reason: String },
}

pub type ClientResult<T> = Result<T, ClientError>;
