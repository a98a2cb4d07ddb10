use std::sync::Arc;
use thiserror::Error;

/// Main error type for Entigraph
#[derive(Error, Debug)]
pub enum EntigraphError {
    /// Invalid schema declaration (unknown target, bad threshold, ...)
    #[error("Schema error: {0}")]
    Schema(String),

    /// Hard lookup of an entity that does not exist
    #[error("Entity not found: {entity_type}/{id}")]
    NotFound { entity_type: String, id: String },

    /// Resolve called on a value that is not a draft
    #[error("Resolve state error: {0}")]
    ResolveState(String),

    /// Storage provider failure, passed through unchanged
    #[error("Provider error: {0}")]
    Provider(String),

    /// Content generator failure
    #[error("Generation error: {0}")]
    Generation(String),

    /// Embedding failure
    #[error("Embedding error: {0}")]
    Embedding(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// File system I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Parse errors (schema files, seeds)
    #[error("Parse error: {0}")]
    Parse(String),

    /// Cascade or draft call exceeded its deadline
    #[error("Timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// One failure delivered to several coalesced loader callers
    #[error(transparent)]
    Shared(Arc<EntigraphError>),
}

impl EntigraphError {
    /// Recover an owned error from one shared between coalesced callers.
    pub fn from_shared(err: Arc<EntigraphError>) -> Self {
        match Arc::try_unwrap(err) {
            Ok(owned) => owned,
            Err(shared) => EntigraphError::Shared(shared),
        }
    }

    /// The underlying error, looking through `Shared`.
    pub fn root(&self) -> &EntigraphError {
        match self {
            EntigraphError::Shared(inner) => inner.root(),
            other => other,
        }
    }

    pub fn is_provider(&self) -> bool {
        matches!(self.root(), EntigraphError::Provider(_))
    }

    pub fn is_generation(&self) -> bool {
        matches!(self.root(), EntigraphError::Generation(_))
    }
}

impl From<serde_json::Error> for EntigraphError {
    fn from(err: serde_json::Error) -> Self {
        EntigraphError::Parse(err.to_string())
    }
}

impl From<serde_yaml_ng::Error> for EntigraphError {
    fn from(err: serde_yaml_ng::Error) -> Self {
        EntigraphError::Parse(err.to_string())
    }
}

/// Convenient Result type using EntigraphError
pub type Result<T> = std::result::Result<T, EntigraphError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = EntigraphError::Schema("unknown target type 'Autor'".to_string());
        assert!(err.to_string().contains("Schema error"));
        assert!(err.to_string().contains("Autor"));
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: EntigraphError = io_err.into();
        assert!(matches!(err, EntigraphError::Io(_)));
    }

    #[test]
    fn test_from_shared_unwraps_sole_owner() {
        let shared = Arc::new(EntigraphError::Provider("boom".to_string()));
        let err = EntigraphError::from_shared(shared);
        assert!(matches!(err, EntigraphError::Provider(_)));
    }

    #[test]
    fn test_shared_is_transparent() {
        let shared = Arc::new(EntigraphError::Provider("boom".to_string()));
        let _other = shared.clone();
        let err = EntigraphError::from_shared(shared);
        assert!(matches!(err, EntigraphError::Shared(_)));
        assert!(err.is_provider());
        assert_eq!(err.to_string(), "Provider error: boom");
    }
}
