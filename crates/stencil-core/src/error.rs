//! Error types for the stencil cache.

use thiserror::Error;

/// Result type alias using StencilError.
pub type Result<T> = std::result::Result<T, StencilError>;

/// Errors that can occur in the stencil cache.
#[derive(Error, Debug)]
pub enum StencilError {
    /// Stencil not present in the cache.
    #[error("Stencil not found: {path}")]
    StencilNotFound { path: String },

    /// Shape not present in the cache.
    #[error("Shape not found: {id}")]
    ShapeNotFound { id: i64 },

    /// Shape collection not found.
    #[error("Collection not found: {id}")]
    CollectionNotFound { id: i64 },

    /// A saved search with the same name already exists.
    #[error("Saved search already exists: {name}")]
    SavedSearchExists { name: String },

    /// Invalid argument provided.
    #[error("Invalid argument: {message}")]
    InvalidArgument { message: String },

    /// Writing a stencil into the cache failed and was rolled back.
    #[error("Failed to cache stencil {path}: {message}")]
    CacheWrite { path: String, message: String },

    /// Database error.
    #[error("Database error: {message}")]
    Database { message: String },

    /// The store file is damaged.
    #[error("Database corrupted: {message}")]
    Corrupted { message: String },

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error.
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Internal error (unexpected).
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl StencilError {
    /// Create an invalid argument error.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Create a database error.
    pub fn database(message: impl Into<String>) -> Self {
        Self::Database {
            message: message.into(),
        }
    }

    /// Create a corruption error.
    pub fn corrupted(message: impl Into<String>) -> Self {
        Self::Corrupted {
            message: message.into(),
        }
    }

    /// Create a cache write error for a stencil path.
    pub fn cache_write(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self::CacheWrite {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// True for the "referenced row does not exist" family.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::StencilNotFound { .. } | Self::ShapeNotFound { .. } | Self::CollectionNotFound { .. }
        )
    }

    /// True when the request collided with an existing row.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::SavedSearchExists { .. })
    }

    /// Get a stable error code for bridge responses.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::StencilNotFound { .. } => "STENCIL_NOT_FOUND",
            Self::ShapeNotFound { .. } => "SHAPE_NOT_FOUND",
            Self::CollectionNotFound { .. } => "COLLECTION_NOT_FOUND",
            Self::SavedSearchExists { .. } => "SAVED_SEARCH_EXISTS",
            Self::InvalidArgument { .. } => "INVALID_ARGUMENT",
            Self::CacheWrite { .. } => "CACHE_WRITE_FAILED",
            Self::Database { .. } => "DATABASE_ERROR",
            Self::Corrupted { .. } => "DATABASE_CORRUPTED",
            Self::Io(_) => "IO_ERROR",
            Self::Serialization(_) => "SERIALIZATION_ERROR",
            Self::Config { .. } => "CONFIG_ERROR",
            Self::Internal { .. } => "INTERNAL_ERROR",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = StencilError::StencilNotFound {
            path: "/stencils/network.vssx".to_string(),
        };
        assert!(err.to_string().contains("network.vssx"));
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(
            StencilError::ShapeNotFound { id: 7 }.error_code(),
            "SHAPE_NOT_FOUND"
        );
        assert_eq!(StencilError::database("test").error_code(), "DATABASE_ERROR");
    }

    #[test]
    fn test_error_classes() {
        assert!(StencilError::CollectionNotFound { id: 1 }.is_not_found());
        assert!(StencilError::SavedSearchExists {
            name: "routers".to_string()
        }
        .is_conflict());
        assert!(!StencilError::internal("boom").is_not_found());
        assert!(!StencilError::internal("boom").is_conflict());
    }
}
