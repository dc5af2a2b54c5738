use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Schema error: {0}")]
    Schema(String),

    #[error("Invalid timestamp: {0}")]
    InvalidTimestamp(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // Remote store / network
    #[error("Network error: {0}")]
    Network(String),

    #[error("Remote store unavailable: {0}")]
    RemoteUnavailable(String),

    #[error("Remote store rejected request: {0}")]
    RemoteRejected(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    // Auth provider
    #[error("Authentication required")]
    AuthRequired,

    #[error("User consent required: {intent}")]
    PermissionRequired { intent: String },

    #[error("Authentication failed: {0}")]
    AuthFatal(String),

    // Media cache
    #[error("Cache error: {0}")]
    Cache(String),

    #[error("Upstream fetch failed: {0}")]
    Upstream(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Returns a stable error code for this error variant.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Io(_) => "IO_ERROR",
            Error::Storage(_) => "STORAGE_ERROR",
            Error::Serialization(_) => "SERIALIZATION_ERROR",
            Error::Schema(_) => "SCHEMA_ERROR",
            Error::InvalidTimestamp(_) => "INVALID_TIMESTAMP",
            Error::NotFound(_) => "NOT_FOUND",
            Error::InvalidArgument(_) => "INVALID_ARGUMENT",
            Error::InvalidConfig(_) => "INVALID_CONFIG",
            Error::Network(_) => "NETWORK_ERROR",
            Error::RemoteUnavailable(_) => "REMOTE_UNAVAILABLE",
            Error::RemoteRejected(_) => "REMOTE_REJECTED",
            Error::Unauthorized(_) => "UNAUTHORIZED",
            Error::AuthRequired => "AUTH_REQUIRED",
            Error::PermissionRequired { .. } => "PERMISSION_REQUIRED",
            Error::AuthFatal(_) => "AUTH_FATAL",
            Error::Cache(_) => "CACHE_ERROR",
            Error::Upstream(_) => "UPSTREAM_ERROR",
            Error::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Returns true if this error is potentially retryable.
    ///
    /// Transient failures (IO, network, an unavailable remote, an expired
    /// token) are retryable. Logical errors and fatal auth failures are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            // Retryable errors (transient)
            Error::Io(_) => true,
            Error::Network(_) => true,
            Error::RemoteUnavailable(_) => true,
            Error::Unauthorized(_) => true,
            Error::AuthRequired => true,
            Error::PermissionRequired { .. } => true,
            Error::Upstream(_) => true,

            // Non-retryable errors (logical/permanent)
            Error::Storage(_) => false,
            Error::Serialization(_) => false,
            Error::Schema(_) => false,
            Error::InvalidTimestamp(_) => false,
            Error::NotFound(_) => false,
            Error::InvalidArgument(_) => false,
            Error::InvalidConfig(_) => false,
            Error::RemoteRejected(_) => false,
            Error::AuthFatal(_) => false,
            Error::Cache(_) => false,
            Error::Internal(_) => false,
        }
    }

    /// Returns true for failures that need credentials to be resolved before
    /// the operation can succeed.
    pub fn is_auth(&self) -> bool {
        matches!(
            self,
            Error::Unauthorized(_)
                | Error::AuthRequired
                | Error::PermissionRequired { .. }
                | Error::AuthFatal(_)
        )
    }

    /// Adds context to an error by wrapping it in an Internal error.
    ///
    /// Auth and network variants are kept as-is so callers can still
    /// classify them after context was attached.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use lectern_core::Error;
    ///
    /// fn load_row() -> Result<(), Error> {
    ///     Err(Error::Storage("disk I/O error".to_string()))
    /// }
    ///
    /// fn open_note() -> Result<(), Error> {
    ///     load_row().map_err(|e| e.with_context("failed to open note"))
    /// }
    /// ```
    pub fn with_context(self, context: &str) -> Error {
        if self.is_auth() || self.is_retryable() {
            return self;
        }
        Error::Internal(format!("{}: {}", context, self))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
