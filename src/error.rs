use thiserror::Error;

use crate::pki::CryptoError;

#[derive(Error, Debug)]
pub enum BrineError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Failed to resolve master {host}:{port}: {reason}")]
    Resolution {
        host: String,
        port: u16,
        reason: String,
    },

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Security violation: {0}")]
    SecurityViolation(String),

    #[error("Not authorized: {0}")]
    AuthorizationDenied(String),

    #[error("Job id {0} already exists with a different target set")]
    DuplicateJobId(String),

    #[error("No minions matched target expression {0:?}")]
    NoTargets(String),

    #[error("Invalid target expression: {0}")]
    InvalidTarget(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

impl BrineError {
    /// Errors the session manager retries under backoff.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BrineError::Transport(_)
                | BrineError::Resolution { .. }
                | BrineError::Authentication(_)
                | BrineError::Io(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, BrineError>;
