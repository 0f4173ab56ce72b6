use crate::schema::Format;

/// Error kinds raised by the registry subsystem.
///
/// Each variant carries the numeric `error_code` an embedding HTTP layer
/// would map onto a Confluent-compatible `{error_code, message}` body.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("schema text does not parse as {format:?}: {reason}")]
    InvalidSchema { format: Format, reason: String },

    #[error("incompatible with prior version(s): {reason}")]
    Incompatible { reason: String },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl RegistryError {
    /// Numeric error code in the 40xxx/50xxx space, matching the HTTP
    /// surface this crate is consumed behind.
    pub fn error_code(&self) -> u32 {
        match self {
            Self::InvalidSchema { .. } => 42201,
            Self::Incompatible { .. } => 40901,
            Self::NotFound(_) => 40401,
            Self::BadRequest(_) => 42201,
            Self::StorageUnavailable(_) => 50300,
            Self::Conflict(_) => 40901,
            Self::Internal(_) => 50001,
        }
    }

    pub(crate) fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub(crate) fn incompatible(reason: impl Into<String>) -> Self {
        Self::Incompatible {
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, RegistryError>;
