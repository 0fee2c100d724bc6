//! Error types for the data subject rights engine.

use thiserror::Error;

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for compliance request processing
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed input to intake
    #[error("Validation error: {0}")]
    Validation(String),

    /// Bad or consumed token, unknown request
    #[error("Not found or expired: {0}")]
    NotFoundOrExpired(String),

    /// Request type the dispatcher has no handler for
    #[error("Unsupported request type: {0}")]
    UnsupportedRequestType(String),

    /// Export format other than json/csv
    #[error("Unsupported export format: {0}")]
    UnsupportedFormat(String),

    /// One or more data sources failed during aggregation
    #[error("Aggregation failed for sources: {}", .failed_sources.join(", "))]
    Aggregation {
        failed_sources: Vec<String>,
        details: Vec<String>,
    },

    /// Store unavailable or write rejected
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// Per-subject failure during batch anonymization
    #[error("Anonymization error for subject {subject_id}: {reason}")]
    Anonymization { subject_id: String, reason: String },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// 監査ログに記録する安定した理由コード
    pub fn reason_code(&self) -> &'static str {
        match self {
            Error::Validation(_) => "validation_failed",
            Error::NotFoundOrExpired(_) => "not_found_or_expired",
            Error::UnsupportedRequestType(_) => "unsupported_request_type",
            Error::UnsupportedFormat(_) => "unsupported_format",
            Error::Aggregation { .. } => "aggregation_failed",
            Error::Persistence(_) => "persistence_failed",
            Error::Anonymization { .. } => "anonymization_failed",
            Error::Config(_) => "configuration_error",
            Error::Internal(_) => "internal_error",
            Error::Json(_) => "serialization_failed",
            Error::Io(_) => "io_error",
        }
    }

    /// 再試行で回復しうるエラーかどうか
    ///
    /// 呼び出し側の入力に起因するエラーは再試行しても結果が変わらない。
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Persistence(_) | Error::Aggregation { .. } | Error::Io(_)
        )
    }
}

impl From<sqlx::Error> for Error {
    fn from(e: sqlx::Error) -> Self {
        Error::Persistence(format!("Database operation failed: {}", e))
    }
}

impl From<validator::ValidationErrors> for Error {
    fn from(e: validator::ValidationErrors) -> Self {
        Error::Validation(e.to_string())
    }
}

impl From<config::ConfigError> for Error {
    fn from(e: config::ConfigError) -> Self {
        Error::Config(e.to_string())
    }
}
