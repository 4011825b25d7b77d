//! Key material and trust decisions.
//!
//! - [`Identity`]: this node's ed25519 keypair and fingerprint
//! - [`AcceptedKeySet`]: the master's view of minion keys (pending/accepted/rejected)
//! - [`AutoSign`]: autosign/autoreject file rules
//! - [`session_key`]: the shared publish key and how it is handed to minions

pub mod autosign;
pub mod identity;
pub mod keyset;
pub mod session_key;

use std::path::PathBuf;

use thiserror::Error;

pub use autosign::{AutoSign, AutosignMatch};
pub use identity::{fingerprint, verify_signature, Identity};
pub use keyset::{
    valid_id, AcceptReason, AcceptedKeySet, Admission, FsKeyBackend, KeyBackend, KeyRecord,
    KeyState, MemoryKeyBackend, RejectReason,
};
pub use session_key::{KeyExchange, SessionKey};

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("invalid key length: expected {expected}, found {found}")]
    InvalidKeyLength { expected: usize, found: usize },

    #[error("invalid public key")]
    InvalidPublicKey,

    #[error("signature verification failed")]
    VerifyFailed,

    #[error("decryption failed")]
    DecryptFailed,

    #[error("encryption failed")]
    EncryptFailed,

    #[error("key file not found: {0}")]
    KeyNotFound(PathBuf),

    #[error("hex decode error: {0}")]
    Hex(#[from] hex::FromHexError),

    #[error("failed to read key file: {0}")]
    Io(#[from] std::io::Error),
}
