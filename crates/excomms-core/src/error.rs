use axum::http::StatusCode;
use thiserror::Error;

/// Gateway errors
#[derive(Error, Debug)]
pub enum ExcommsError {
    /// Database errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Outbound HTTP errors (telephony provider, media downloads)
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Payload (de)serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Markup rendering errors
    #[error("Markup error: {0}")]
    Markup(String),

    /// Bad input from a caller or a webhook
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Already exists
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Operation intentionally not supported
    #[error("Unimplemented: {0}")]
    Unimplemented(String),

    /// Every proxy number in the pool is reserved or cooling down
    #[error("No free proxy number: {0}")]
    NoFreeNumber(String),

    /// The telephony provider rejected a request with one of its error codes
    #[error("Provider error {code}: {message}")]
    Provider { code: u32, message: String },

    /// The telephony provider does not (yet) have the requested media
    #[error("Media not found: {0}")]
    MediaNotFound(String),

    /// A rows-affected invariant was violated
    #[error("Integrity violation: {0}")]
    Integrity(String),

    /// A collaborator (directory, settings, provider, bus) failed
    #[error("Upstream error: {0}")]
    Upstream(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Timeout
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// The surrounding context was cancelled
    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ExcommsError {
    /// Create a new InvalidArgument error
    pub fn invalid_argument<S: Into<String>>(msg: S) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create a new NotFound error
    pub fn not_found<S: Into<String>>(msg: S) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create a new AlreadyExists error
    pub fn already_exists<S: Into<String>>(msg: S) -> Self {
        Self::AlreadyExists(msg.into())
    }

    /// Create a new Unimplemented error
    pub fn unimplemented<S: Into<String>>(msg: S) -> Self {
        Self::Unimplemented(msg.into())
    }

    /// Create a new Integrity error
    pub fn integrity<S: Into<String>>(msg: S) -> Self {
        Self::Integrity(msg.into())
    }

    /// Create a new Upstream error
    pub fn upstream<S: Into<String>>(msg: S) -> Self {
        Self::Upstream(msg.into())
    }

    /// Provider error code, if the provider rejected the request
    pub fn provider_code(&self) -> Option<u32> {
        match self {
            Self::Provider { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// Create a new Config error
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Self::Config(msg.into())
    }

    /// Create a new Internal error
    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Self::Internal(msg.into())
    }

    /// Check a rows-affected count against the expected value.
    pub fn expect_rows(affected: u64, expected: u64, what: impl std::fmt::Display) -> Result<()> {
        if affected == expected {
            Ok(())
        } else {
            Err(Self::Integrity(format!(
                "expected {} row(s) updated for {} but updated {}",
                expected, what, affected
            )))
        }
    }

    /// Transient failures the caller should retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Database(_)
                | Self::Http(_)
                | Self::Upstream(_)
                | Self::Timeout(_)
                | Self::MediaNotFound(_)
        )
    }

    /// Status code used on the webhook surface. Anything that gates a state
    /// transition maps to 5xx so the telephony provider retries; a missing
    /// call row is included since the previous webhook's write may not be
    /// visible yet.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            Self::Unimplemented(_) => StatusCode::NOT_IMPLEMENTED,
            Self::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::Upstream(_) | Self::Http(_) | Self::Provider { .. } => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Status for internal RPC callers, who see lookups and conflicts as
    /// client errors rather than retry signals.
    pub fn rpc_status_code(&self) -> StatusCode {
        match self {
            Self::NotFound(_) | Self::MediaNotFound(_) => StatusCode::NOT_FOUND,
            Self::AlreadyExists(_) => StatusCode::CONFLICT,
            Self::NoFreeNumber(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => self.status_code(),
        }
    }
}

/// Result type for gateway operations
pub type Result<T> = std::result::Result<T, ExcommsError>;
