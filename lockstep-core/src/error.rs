//! Error types for lockstep operations

use crate::MultiError;
use thiserror::Error;

/// Cache backend errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CacheError {
    /// Lookup found nothing where an entry was explicitly required.
    #[error("Cache miss")]
    Miss,

    /// An add or CAS precondition on the slot did not hold.
    #[error("Item not stored")]
    NotStored,

    /// The entry changed since its CAS token was captured.
    #[error("Compare-and-swap conflict")]
    CasConflict,

    #[error("Cache backend failure: {reason}")]
    Backend { reason: String },

    #[error("Cache lock poisoned")]
    LockPoisoned,
}

/// Backing store errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// Authoritative negative: the entity does not exist.
    #[error("No such entity")]
    NoSuchEntity,

    #[error("Entity already exists")]
    AlreadyExists,

    #[error("{op} called with {got} items, limit is {limit}")]
    LimitExceeded {
        op: &'static str,
        limit: usize,
        got: usize,
    },

    #[error("Transaction failed: {reason}")]
    TransactionFailed { reason: String },

    #[error("Backing store failure: {reason}")]
    Backend { reason: String },
}

/// Malformed input, reported before any I/O is attempted.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Length mismatch: {keys} keys but {values} values")]
    LengthMismatch { keys: usize, values: usize },

    #[error("Key is incomplete: {key}")]
    IncompleteKey { key: String },

    #[error("Key kind must not be empty")]
    EmptyKind,

    #[error("Mutation at index {index} carries no value")]
    MissingValue { index: usize },
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },
}

/// Master error type for all lockstep errors.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum LockstepError {
    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Codec error: {reason}")]
    Codec { reason: String },

    #[error("Operation canceled")]
    Canceled,

    #[error("Deadline exceeded")]
    DeadlineExceeded,

    /// The backing store committed but the transaction's locks never reached
    /// the cache. The commit is durable; do not retry it.
    #[error("Transaction committed but lock flush failed: {reason}")]
    LockFlush { reason: String },

    #[error("{0}")]
    Multi(#[from] MultiError),
}

/// Result type alias for lockstep operations.
pub type LockstepResult<T> = Result<T, LockstepError>;

impl LockstepError {
    pub fn codec(reason: impl std::fmt::Display) -> Self {
        Self::Codec {
            reason: reason.to_string(),
        }
    }

    pub fn is_no_such_entity(&self) -> bool {
        matches!(self, Self::Store(StoreError::NoSuchEntity))
    }

    pub fn is_not_stored(&self) -> bool {
        matches!(self, Self::Cache(CacheError::NotStored))
    }

    pub fn is_cas_conflict(&self) -> bool {
        matches!(self, Self::Cache(CacheError::CasConflict))
    }

    pub fn is_cache_miss(&self) -> bool {
        matches!(self, Self::Cache(CacheError::Miss))
    }

    pub fn is_canceled(&self) -> bool {
        matches!(self, Self::Canceled)
    }

    pub fn is_deadline_exceeded(&self) -> bool {
        matches!(self, Self::DeadlineExceeded)
    }

    /// Returns the positional errors when this is a [`MultiError`].
    pub fn as_multi(&self) -> Option<&MultiError> {
        match self {
            Self::Multi(me) => Some(me),
            _ => None,
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================
