//! Error types for the points ledger
//!
//! Business rejections (`InsufficientBalance`, `VotingDisabled`, ...) and
//! infrastructure failures (`StoreUnavailable`, `ConcurrentConflict`) share
//! one enum. Callers use [`Error::is_rejection`] and [`Error::is_retryable`]
//! to tell them apart.

use thiserror::Error;

/// Result type for ledger operations
pub type Result<T> = std::result::Result<T, Error>;

/// Ledger errors
#[derive(Error, Debug)]
pub enum Error {
    /// Account, token or record not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Token name already registered (active or not)
    #[error("Duplicate token name: {0}")]
    DuplicateName(String),

    /// Balance too low for the requested debit
    #[error("Insufficient balance: required {required}, available {available}")]
    InsufficientBalance {
        /// Points the operation needs
        required: i64,
        /// Points the account holds
        available: i64,
    },

    /// Voting switched off by an operator
    #[error("Voting is currently disabled")]
    VotingDisabled,

    /// Token not registered
    #[error("Unknown token: {0}")]
    UnknownToken(String),

    /// Token registered but not accepting votes
    #[error("Token inactive: {0}")]
    TokenInactive(String),

    /// Caller supplied a vote cost that differs from the system cost
    #[error("Cost mismatch: requested {requested}, current {current}")]
    CostMismatch {
        /// Cost supplied by the caller
        requested: i64,
        /// Cost in system settings
        current: i64,
    },

    /// Account deactivated by an operator
    #[error("Account inactive: {0}")]
    AccountInactive(String),

    /// Malformed argument (empty name, non-positive amount, ...)
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Store timed out or failed transiently
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// Optimistic-concurrency precondition failed (retries exhausted when surfaced)
    #[error("Concurrent conflict: {0}")]
    ConcurrentConflict(String),

    /// Storage layout error (missing column family, corrupt value)
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Expected business outcome, returned to the user and never retried
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            Error::InsufficientBalance { .. }
                | Error::VotingDisabled
                | Error::UnknownToken(_)
                | Error::TokenInactive(_)
                | Error::CostMismatch { .. }
                | Error::DuplicateName(_)
                | Error::AccountInactive(_)
                | Error::InvalidArgument(_)
        )
    }

    /// Transient infrastructure failure, safe to retry with backoff
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::StoreUnavailable(_) | Error::ConcurrentConflict(_)
        )
    }

    /// Short label used for the rejection metric
    pub fn reason(&self) -> &'static str {
        match self {
            Error::NotFound(_) => "not_found",
            Error::DuplicateName(_) => "duplicate_name",
            Error::InsufficientBalance { .. } => "insufficient_balance",
            Error::VotingDisabled => "voting_disabled",
            Error::UnknownToken(_) => "unknown_token",
            Error::TokenInactive(_) => "token_inactive",
            Error::CostMismatch { .. } => "cost_mismatch",
            Error::AccountInactive(_) => "account_inactive",
            Error::InvalidArgument(_) => "invalid_argument",
            Error::StoreUnavailable(_) => "store_unavailable",
            Error::ConcurrentConflict(_) => "concurrent_conflict",
            Error::Storage(_) => "storage",
            Error::Serialization(_) => "serialization",
            Error::Config(_) => "config",
            Error::Io(_) => "io",
            Error::Other(_) => "other",
        }
    }
}

impl From<rocksdb::Error> for Error {
    fn from(err: rocksdb::Error) -> Self {
        Error::StoreUnavailable(err.to_string())
    }
}

impl From<String> for Error {
    fn from(msg: String) -> Self {
        Error::Other(msg)
    }
}

impl From<&str> for Error {
    fn from(msg: &str) -> Self {
        Error::Other(msg.to_string())
    }
}
