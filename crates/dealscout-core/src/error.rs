//! Error types for Dealscout

use thiserror::Error;

/// Result type alias using Dealscout's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Dealscout error types with helpful messages and suggestions
#[derive(Error, Debug)]
pub enum Error {
    // Routing errors (E100-E199)
    #[error("No available model for task type '{task_type}' (attempted: {attempted:?})")]
    NoAvailableModel {
        task_type: String,
        attempted: Vec<String>,
    },

    #[error("Model '{0}' not found. Run `dealscout models list` to see the catalog.")]
    ModelNotFound(String),

    #[error("Invalid task type: {0}")]
    InvalidTaskType(String),

    #[error("Invalid model catalog: {0}")]
    InvalidCatalog(String),

    // Backend errors (E200-E299)
    #[error("Backend '{model}' unavailable after {attempts} attempt(s): {last_error}")]
    BackendUnavailable {
        model: String,
        attempts: u32,
        last_error: String,
    },

    #[error("Network error: {0}. Check that the model backend is reachable.")]
    NetworkError(#[from] reqwest::Error),

    #[error("Rate limited. Waiting {0} seconds before retry.")]
    RateLimited(u64),

    #[error("Backend returned server error ({status}): {body}")]
    BackendStatus { status: u16, body: String },

    #[error("Backend rejected request ({status}): {body}")]
    BackendRejected { status: u16, body: String },

    #[error("Malformed backend response: {0}")]
    MalformedResponse(String),

    #[error("Backend call timed out after {0} ms")]
    Timeout(u64),

    #[error("Operation cancelled")]
    Cancelled,

    // Scoring errors (E300-E399)
    #[error("Malformed score input: {0}")]
    MalformedScoreInput(String),

    #[error("Property '{0}' not found in the record store")]
    PropertyNotFound(String),

    // Learning loop errors (E400-E499)
    #[error("Insufficient feedback: {have} labelled outcome(s), need {need}")]
    InsufficientFeedback { have: usize, need: usize },

    #[error("Invalid weight update: {0}")]
    InvalidWeightUpdate(String),

    #[error("Weight set epoch {0} not found. Run `dealscout weights history` to list epochs.")]
    WeightVersionNotFound(u64),

    // Storage errors (E500-E599)
    #[error("Database error: {0}")]
    DatabaseError(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // Config errors (E600-E699)
    #[error("Configuration error: {0}")]
    ConfigError(String),

    // Generic errors (E9999)
    #[error("{0}")]
    Other(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Get error code for this error type
    pub fn code(&self) -> &'static str {
        match self {
            Self::NoAvailableModel { .. } => "E100",
            Self::ModelNotFound(_) => "E101",
            Self::InvalidTaskType(_) => "E102",
            Self::InvalidCatalog(_) => "E103",
            Self::BackendUnavailable { .. } => "E200",
            Self::NetworkError(_) => "E201",
            Self::RateLimited(_) => "E202",
            Self::BackendStatus { .. } => "E203",
            Self::BackendRejected { .. } => "E204",
            Self::MalformedResponse(_) => "E205",
            Self::Timeout(_) => "E206",
            Self::Cancelled => "E207",
            Self::MalformedScoreInput(_) => "E300",
            Self::PropertyNotFound(_) => "E301",
            Self::InsufficientFeedback { .. } => "E400",
            Self::InvalidWeightUpdate(_) => "E401",
            Self::WeightVersionNotFound(_) => "E402",
            Self::DatabaseError(_) => "E500",
            Self::Serialization(_) => "E501",
            Self::ConfigError(_) => "E600",
            Self::Other(_) | Self::Io(_) => "E9999",
        }
    }

    /// Get suggestion for how to fix this error
    pub fn suggestion(&self) -> Option<String> {
        match self {
            Self::NoAvailableModel { task_type, .. } => Some(format!(
                "dealscout models list --capability {}",
                task_type
            )),
            Self::ModelNotFound(_) => Some("dealscout models list".to_string()),
            Self::NetworkError(_) => Some("Check that the model backend is running".to_string()),
            Self::WeightVersionNotFound(_) => Some("dealscout weights history".to_string()),
            Self::ConfigError(_) => Some("dealscout config list".to_string()),
            _ => None,
        }
    }

    /// Whether the failure is network-shaped and worth retrying against the same backend
    pub fn is_transient(&self) -> bool {
        match self {
            Self::NetworkError(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            Self::RateLimited(_) | Self::BackendStatus { .. } | Self::Timeout(_) => true,
            _ => false,
        }
    }

    /// Whether the failure belongs to one backend, so another model may still serve the request
    ///
    /// Covers every backend failure that is not worth retrying against the
    /// same model: a missing credential, a rejected request, an unusable
    /// response. Cancellation and deadline expiry are not backend faults.
    pub fn is_backend_fault(&self) -> bool {
        matches!(
            self,
            Self::NetworkError(_)
                | Self::RateLimited(_)
                | Self::BackendStatus { .. }
                | Self::BackendRejected { .. }
                | Self::MalformedResponse(_)
                | Self::ConfigError(_)
        )
    }
}
