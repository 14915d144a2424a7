//! Error types for ShieldChain

use std::fmt;

/// A consensus rejection: misbehavior score, machine-readable reason code and
/// a human-readable message.
///
/// A score of 100 marks something a correctly functioning peer can never
/// produce. Score 0 rejections are plain "not valid (yet)" answers such as an
/// unknown parent.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{reason} (ban score {score}): {message}")]
pub struct Rejection {
    pub score: u8,
    pub reason: &'static str,
    pub message: String,
}

impl Rejection {
    pub const MAX_SCORE: u8 = 100;

    pub fn dos(score: u8, reason: &'static str, message: impl Into<String>) -> Self {
        Rejection {
            score: score.min(Self::MAX_SCORE),
            reason,
            message: message.into(),
        }
    }

    pub fn invalid(reason: &'static str, message: impl Into<String>) -> Self {
        Self::dos(0, reason, message)
    }

    pub fn is_fatal(&self) -> bool {
        self.score == Self::MAX_SCORE
    }
}

#[derive(Debug, Clone)]
pub enum ChainError {
    Rejected(Rejection),
    DatabaseError(String),
    IoError(String),
    BincodeError(String),
    CryptoError(String),
    ProofError(String),
    ConfigError(String),
    OrphanBlock,
    BlockAlreadyExists,
    BlockNotFound(String),
    ReorgTooDeep { depth: u32, max: u32 },
    InvalidChainState(String),
}

impl fmt::Display for ChainError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ChainError::Rejected(rejection) => write!(f, "Rejected: {}", rejection),
            ChainError::DatabaseError(msg) => write!(f, "Database error: {}", msg),
            ChainError::IoError(msg) => write!(f, "IO error: {}", msg),
            ChainError::BincodeError(msg) => write!(f, "Bincode error: {}", msg),
            ChainError::CryptoError(msg) => write!(f, "Cryptographic error: {}", msg),
            ChainError::ProofError(msg) => write!(f, "Proof error: {}", msg),
            ChainError::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
            ChainError::OrphanBlock => write!(f, "Orphan block"),
            ChainError::BlockAlreadyExists => write!(f, "Block already exists"),
            ChainError::BlockNotFound(msg) => write!(f, "Block not found: {}", msg),
            ChainError::ReorgTooDeep { depth, max } => {
                write!(f, "Reorganization of {} blocks exceeds the maximum of {}", depth, max)
            }
            ChainError::InvalidChainState(msg) => write!(f, "Invalid chain state: {}", msg),
        }
    }
}

impl std::error::Error for ChainError {}

impl ChainError {
    /// The consensus rejection carried by this error, if any.
    pub fn rejection(&self) -> Option<&Rejection> {
        match self {
            ChainError::Rejected(rejection) => Some(rejection),
            _ => None,
        }
    }
}

impl From<Rejection> for ChainError {
    fn from(rejection: Rejection) -> Self {
        ChainError::Rejected(rejection)
    }
}

impl From<std::io::Error> for ChainError {
    fn from(err: std::io::Error) -> Self {
        ChainError::IoError(err.to_string())
    }
}

impl From<Box<bincode::ErrorKind>> for ChainError {
    fn from(err: Box<bincode::ErrorKind>) -> Self {
        ChainError::BincodeError(err.to_string())
    }
}

impl From<rusqlite::Error> for ChainError {
    fn from(err: rusqlite::Error) -> Self {
        ChainError::DatabaseError(err.to_string())
    }
}

/// Convenience alias used across the crate
pub type Result<T> = std::result::Result<T, ChainError>;
