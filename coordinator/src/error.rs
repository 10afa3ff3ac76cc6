//! Error types for the HTLC swap coordinator

use thiserror::Error;

/// Main error type for swap coordination
#[derive(Error, Debug)]
pub enum SwapError {
    #[error("Chain {chain_id} unavailable: {message}")]
    Unavailable { chain_id: u64, message: String },

    #[error("{what} not found")]
    NotFound { what: String },

    #[error("Block {block} unknown on chain {chain_id}")]
    UnknownBlock { chain_id: u64, block: String },

    #[error("Escrow already locked")]
    AlreadyLocked,

    #[error("Escrow has not expired yet (expiry {expiry}, height {height})")]
    NotYetExpired { expiry: u64, height: u64 },

    #[error("Escrow expired (expiry {expiry}, height {height})")]
    Expired { expiry: u64, height: u64 },

    #[error("Secret does not match the committed hash")]
    BadSecret,

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Invalid state transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Invalid expiry: {0}")]
    InvalidExpiry(String),

    #[error("On-chain lock does not match negotiated terms: {0}")]
    TermsMismatch(String),

    #[error("Chain {chain_id} not configured")]
    ChainNotFound { chain_id: u64 },

    #[error("Swap {0} not found")]
    SwapNotFound(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Wallet error: {0}")]
    Wallet(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl SwapError {
    /// Transient errors the coordinator recovers from by re-querying later
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SwapError::Unavailable { .. }
                | SwapError::NotFound { .. }
                | SwapError::UnknownBlock { .. }
                | SwapError::Database(_)
        )
    }

    /// Attempts the escrow rejected; no state was mutated
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            SwapError::AlreadyLocked
                | SwapError::NotYetExpired { .. }
                | SwapError::Expired { .. }
                | SwapError::BadSecret
        )
    }

    pub(crate) fn not_found(what: impl Into<String>) -> Self {
        SwapError::NotFound { what: what.into() }
    }

    pub(crate) fn unavailable(chain_id: u64, message: impl ToString) -> Self {
        SwapError::Unavailable {
            chain_id,
            message: message.to_string(),
        }
    }

    /// Short label used for metrics
    pub fn kind(&self) -> &'static str {
        match self {
            SwapError::Unavailable { .. } => "unavailable",
            SwapError::NotFound { .. } => "not_found",
            SwapError::UnknownBlock { .. } => "unknown_block",
            SwapError::AlreadyLocked => "already_locked",
            SwapError::NotYetExpired { .. } => "not_yet_expired",
            SwapError::Expired { .. } => "expired",
            SwapError::BadSecret => "bad_secret",
            SwapError::Unauthorized(_) => "unauthorized",
            SwapError::InvalidStateTransition { .. } => "invalid_transition",
            SwapError::InvalidExpiry(_) => "invalid_expiry",
            SwapError::TermsMismatch(_) => "terms_mismatch",
            SwapError::ChainNotFound { .. } => "chain_not_found",
            SwapError::SwapNotFound(_) => "swap_not_found",
            SwapError::Config(_) => "config",
            SwapError::Database(_) => "database",
            SwapError::Wallet(_) => "wallet",
            SwapError::Internal(_) => "internal",
        }
    }
}

/// Result type for coordinator operations
pub type SwapResult<T> = Result<T, SwapError>;
