use thiserror::Error;

#[derive(Debug, Error)]
pub enum RagError {
    #[error("validation error: {field}: {message}")]
    Validation { field: String, message: String },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("not authorized")]
    NotAuthorized,

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("transient backend error from {backend}: {details}")]
    TransientBackend { backend: String, details: String },

    #[error("integrity error: {0}")]
    Integrity(String),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("url parse error: {0}")]
    Url(#[from] url::ParseError),

    #[error("serialize error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("sql error: {0}")]
    Sql(#[from] sqlx::Error),

    #[error("invalid response from {backend}: {details}")]
    BackendResponse { backend: String, details: String },
}

impl RagError {
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn transient(backend: impl Into<String>, details: impl Into<String>) -> Self {
        Self::TransientBackend {
            backend: backend.into(),
            details: details.into(),
        }
    }

    /// Retry loops consult this to separate rate-limit/network style failures
    /// from permanent configuration or validation failures.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::TransientBackend { .. } => true,
            Self::Http(error) => error.is_timeout() || error.is_connect(),
            Self::Sql(sqlx::Error::PoolTimedOut) | Self::Sql(sqlx::Error::Io(_)) => true,
            _ => false,
        }
    }
}

pub type Result<T, E = RagError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::RagError;

    #[test]
    fn validation_errors_name_the_field() {
        let error = RagError::validation("chunk_size", "must be at least 100");
        assert!(error.to_string().contains("chunk_size"));
        assert!(!error.is_transient());
    }

    #[test]
    fn transient_errors_are_retriable() {
        let error = RagError::transient("opensearch", "429 too many requests");
        assert!(error.is_transient());
        assert!(!RagError::Configuration("unknown backend".into()).is_transient());
    }
}
