use thiserror::Error;

/// Fragments in a browser/navigation error message that point at the egress
/// endpoint rather than the page itself.
const PROXY_FAILURE_MARKERS: &[&str] = &[
    "proxy",
    "tunnel",
    "timeout",
    "timed out",
    "err_connection",
    "err_proxy",
    "err_tunnel",
    "err_timed_out",
    "net::err_",
];

#[derive(Debug, Error)]
pub enum CrawlerError {
    #[error("navigation failed: {0}")]
    Navigation(String),

    #[error("extraction failed: {0}")]
    Extraction(String),

    #[error("browser launch failed: {0}")]
    Launch(String),

    #[error("no live browser session")]
    SessionClosed,

    #[error("invalid proxy \"{input}\": {reason}")]
    InvalidProxy { input: String, reason: String },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("queue error: {0}")]
    Queue(#[from] redis::RedisError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("missing environment variable: {0}")]
    MissingEnvVar(String),

    #[error("invalid value for {var}: {reason}")]
    InvalidEnvVar { var: String, reason: String },

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl CrawlerError {
    /// True when the failure text implicates the proxy / tunnel / a network
    /// timeout, meaning the endpoint used for the attempt should be retired.
    pub fn is_proxy_failure(&self) -> bool {
        message_indicates_proxy_failure(&self.to_string())
    }

    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        CrawlerError::NotFound {
            entity,
            id: id.to_string(),
        }
    }
}

pub fn message_indicates_proxy_failure(message: &str) -> bool {
    let lower = message.to_lowercase();
    PROXY_FAILURE_MARKERS.iter().any(|m| lower.contains(m))
}

pub type Result<T> = std::result::Result<T, CrawlerError>;
