use thiserror::Error;

/// Crate-wide error type for the Cinch control plane.
///
/// Variants map onto the error-kind table: what each becomes at the HTTP
/// boundary, and whether the caller should retry.
#[derive(Error, Debug)]
pub enum CinchError {
    #[error("bad signature")]
    BadSignature,

    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    #[error("unknown repo")]
    UnknownRepo,

    #[error("storage error: {0}")]
    StorageTransient(String),

    #[error("no dispatch match")]
    DispatchNoMatch,

    #[error("session transport error: {0}")]
    SessionTransport(String),

    #[error("forge status post failed (transient): {0}")]
    ForgeStatusTransient(String),

    #[error("forge status post failed (permanent): {0}")]
    ForgeStatusPermanent(String),

    #[error("encryption key mismatch")]
    KeyMismatch,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("invalid state transition: {0}")]
    InvalidState(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("sql error: {0}")]
    Sql(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CinchError {
    /// Whether the caller should retry this operation rather than surface it.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CinchError::StorageTransient(_)
                | CinchError::DispatchNoMatch
                | CinchError::ForgeStatusTransient(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, CinchError>;
