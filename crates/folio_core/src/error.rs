use serde::Serialize;
use thiserror::Error;

/// Unified error type for folio operations
#[derive(Debug, Error)]
pub enum FolioError {
    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // Config errors
    #[error("Config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Config serialize error: {0}")]
    ConfigSerialize(#[from] toml::ser::Error),

    #[error("Could not determine config directory")]
    NoConfigDir,

    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    #[error("Transport URL is required in server sync mode")]
    MissingTransportUrl,

    // Validation errors
    #[error("Project owner and slug must both be non-empty")]
    EmptyProjectKey,

    #[error("Invalid project key '{0}'")]
    InvalidProjectKey(String),

    #[error("Invalid document id '{0}'")]
    InvalidDocumentId(String),

    #[error("Element '{0}' not found")]
    ElementNotFound(String),

    #[error("Invalid tree operation: {0}")]
    InvalidTreeOperation(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    // Storage errors
    #[cfg(all(not(target_arch = "wasm32"), feature = "sqlite"))]
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Storage error: {0}")]
    Storage(String),

    // CRDT errors
    #[error("CRDT error: {0}")]
    Crdt(String),

    // Network errors
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Access denied: {0}")]
    AccessDenied(String),

    #[error("Session expired")]
    SessionExpired,

    #[error("Timed out: {0}")]
    Timeout(String),

    // Upstream API errors
    #[error("API error: {0}")]
    Api(String),

    #[error("Cancelled")]
    Cancelled,
}

/// Result type alias for folio operations
pub type Result<T> = std::result::Result<T, FolioError>;

/// A serializable representation of FolioError for IPC
#[derive(Debug, Clone, Serialize)]
pub struct SerializableError {
    /// Error kind/variant name
    pub kind: String,
    /// Human-readable error message
    pub message: String,
}

impl From<&FolioError> for SerializableError {
    fn from(err: &FolioError) -> Self {
        let kind = match err {
            FolioError::Io(_) => "Io",
            FolioError::Json(_) => "Json",
            FolioError::ConfigParse(_) => "ConfigParse",
            FolioError::ConfigSerialize(_) => "ConfigSerialize",
            FolioError::NoConfigDir => "NoConfigDir",
            FolioError::InvalidConfig(_) => "InvalidConfig",
            FolioError::MissingTransportUrl => "MissingTransportUrl",
            FolioError::EmptyProjectKey => "EmptyProjectKey",
            FolioError::InvalidProjectKey(_) => "InvalidProjectKey",
            FolioError::InvalidDocumentId(_) => "InvalidDocumentId",
            FolioError::ElementNotFound(_) => "ElementNotFound",
            FolioError::InvalidTreeOperation(_) => "InvalidTreeOperation",
            FolioError::AlreadyExists(_) => "AlreadyExists",
            #[cfg(all(not(target_arch = "wasm32"), feature = "sqlite"))]
            FolioError::Sqlite(_) => "Sqlite",
            FolioError::Storage(_) => "Storage",
            FolioError::Crdt(_) => "Crdt",
            FolioError::Transport(_) => "Transport",
            FolioError::AccessDenied(_) => "AccessDenied",
            FolioError::SessionExpired => "SessionExpired",
            FolioError::Timeout(_) => "Timeout",
            FolioError::Api(_) => "Api",
            FolioError::Cancelled => "Cancelled",
        }
        .to_string();

        Self {
            kind,
            message: err.to_string(),
        }
    }
}

impl From<FolioError> for SerializableError {
    fn from(err: FolioError) -> Self {
        SerializableError::from(&err)
    }
}

impl FolioError {
    /// Convert to a serializable representation for IPC
    pub fn to_serializable(&self) -> SerializableError {
        SerializableError::from(self)
    }

    /// Whether the error text signals an expired or rejected session.
    ///
    /// Matching is case-sensitive on `401`, `Unauthorized` and `Invalid session`.
    pub fn is_auth_failure(message: &str) -> bool {
        message.contains("401")
            || message.contains("Unauthorized")
            || message.contains("Invalid session")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serializable_kind() {
        let err = FolioError::ElementNotFound("abc".to_string());
        let ser = err.to_serializable();
        assert_eq!(ser.kind, "ElementNotFound");
        assert_eq!(ser.message, "Element 'abc' not found");
    }

    #[test]
    fn test_auth_failure_detection() {
        assert!(FolioError::is_auth_failure("HTTP 401"));
        assert!(FolioError::is_auth_failure("Unauthorized: token"));
        assert!(FolioError::is_auth_failure("Invalid session"));
        assert!(!FolioError::is_auth_failure("unauthorized"));
        assert!(!FolioError::is_auth_failure("connection reset"));
    }
}
