use thiserror::Error;

/// Errors returned by the identity and access-control engine.
///
/// Authentication and authorization failures are deliberately coarse: callers
/// never learn whether a user exists or which grant denied them.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("unauthenticated")]
    Unauthenticated,

    #[error("unauthorized")]
    Unauthorized,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("not found")]
    NotFound,

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("no token provided")]
    NoTokenProvided,

    #[error("store schema version {found} is newer than supported version {supported}")]
    IncompatibleSchema { found: i64, supported: i64 },

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("password hash error: {0}")]
    PasswordHash(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl AuthError {
    pub(crate) fn invalid(what: impl Into<String>) -> Self {
        Self::InvalidArgument(what.into())
    }
}

impl From<pbkdf2::password_hash::Error> for AuthError {
    fn from(err: pbkdf2::password_hash::Error) -> Self {
        Self::PasswordHash(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, AuthError>;
