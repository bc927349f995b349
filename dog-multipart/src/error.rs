use thiserror::Error;

/// Result type for multipart upload operations
pub type MultipartResult<T> = Result<T, MultipartError>;

/// Stable classification of a [`MultipartError`], for callers that branch on cause
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Unknown or already-removed upload, or a missing blob
    NotFound,
    /// Bad index, size or part count, premature finish, size rule violation
    Validation,
    /// Hash mismatch on a part, or the upload is already finalized
    Conflict,
    /// Metadata store or blob store failure
    Internal,
}

/// Errors that can occur during multipart upload operations
#[derive(Error, Debug)]
pub enum MultipartError {
    #[error("Upload not found: {upload_id}")]
    UploadNotFound { upload_id: String },

    #[error("Blob not found: {name}")]
    BlobNotFound { name: String },

    #[error("Invalid request: {message}")]
    Invalid { message: String },

    #[error("Conflict: {message}")]
    Conflict { message: String },

    #[error("{context}: {source}")]
    Backend {
        context: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Cleanup incomplete ({failed} failures): {message}")]
    Cleanup { failed: usize, message: String },

    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    #[error("Serialization error: {source}")]
    Serialization {
        #[from]
        source: serde_json::Error,
    },
}

impl MultipartError {
    /// Create a backend error from any error type
    pub fn backend<C, E>(context: C, error: E) -> Self
    where
        C: Into<String>,
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Backend {
            context: context.into(),
            source: Box::new(error),
        }
    }

    /// Create an invalid request error
    pub fn invalid<S: Into<String>>(message: S) -> Self {
        Self::Invalid {
            message: message.into(),
        }
    }

    /// Create a conflict error
    pub fn conflict<S: Into<String>>(message: S) -> Self {
        Self::Conflict {
            message: message.into(),
        }
    }

    /// Create an upload not found error
    pub fn upload_not_found<S: Into<String>>(upload_id: S) -> Self {
        Self::UploadNotFound {
            upload_id: upload_id.into(),
        }
    }

    /// Create a blob not found error
    pub fn blob_not_found<S: Into<String>>(name: S) -> Self {
        Self::BlobNotFound { name: name.into() }
    }

    /// The stable kind of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::UploadNotFound { .. } | Self::BlobNotFound { .. } => ErrorKind::NotFound,
            Self::Invalid { .. } => ErrorKind::Validation,
            Self::Conflict { .. } => ErrorKind::Conflict,
            Self::Io { source } if source.kind() == std::io::ErrorKind::NotFound => {
                ErrorKind::NotFound
            }
            Self::Backend { .. } | Self::Cleanup { .. } | Self::Io { .. } | Self::Serialization { .. } => {
                ErrorKind::Internal
            }
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }

    /// Add operation context to an internal failure.
    ///
    /// NotFound, Validation and Conflict errors are returned unchanged so that
    /// callers can still match on them.
    pub fn with_context<S: Into<String>>(self, context: S) -> Self {
        match self.kind() {
            ErrorKind::Internal => Self::Backend {
                context: context.into(),
                source: Box::new(self),
            },
            _ => self,
        }
    }
}
