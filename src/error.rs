use thiserror::Error;

/// The single error type surfaced by every public operation in this crate.
///
/// Each variant's `Display` begins with a stable prefix identifying the
/// failing step, so callers (and tests) can match on message shape the way
/// the rest of the stack does with `DatabaseError`/`AutoscalerError`.
#[derive(Error, Debug)]
pub enum StorageError {
    /// Bad volname, bad volume id, unknown type, schema violation.
    #[error("{0}")]
    InvalidInput(String),

    /// Duplicate storeid, missing base, rollback not latest, unsupported format for op.
    #[error("{0}")]
    Precondition(String),

    /// Digest mismatch or lock timeout; callers may retry.
    #[error("{0}")]
    ConcurrencyConflict(String),

    /// A driver operation is not implemented for this backend type.
    #[error("storage type '{storage_type}' does not support '{op}'")]
    NotSupported {
        op: &'static str,
        storage_type: String,
    },

    /// External tool failed; stderr is attached verbatim.
    #[error("{0}")]
    Backend(String),

    /// Cluster or local lock could not be acquired.
    #[error("{0}")]
    Lock(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl StorageError {
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        StorageError::InvalidInput(msg.into())
    }

    pub fn precondition(msg: impl Into<String>) -> Self {
        StorageError::Precondition(msg.into())
    }

    pub fn concurrency(msg: impl Into<String>) -> Self {
        StorageError::ConcurrencyConflict(msg.into())
    }

    pub fn backend(msg: impl Into<String>) -> Self {
        StorageError::Backend(msg.into())
    }

    pub fn not_supported(op: &'static str, storage_type: impl Into<String>) -> Self {
        StorageError::NotSupported {
            op,
            storage_type: storage_type.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, StorageError>;
