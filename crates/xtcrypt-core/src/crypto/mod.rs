//! Per-block encryption for file content.

pub mod block;
pub mod keys;

use std::fmt;

use thiserror::Error;

use crate::context::IoContext;

/// Why a sealed block was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntegrityFailure {
    /// The authentication tag does not match the ciphertext.
    TagMismatch,
    /// The sealed block does not have the expected length.
    Truncated { expected: usize, actual: usize },
}

impl fmt::Display for IntegrityFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IntegrityFailure::TagMismatch => write!(f, "authentication tag mismatch"),
            IntegrityFailure::Truncated { expected, actual } => {
                write!(f, "expected {expected} bytes, got {actual}")
            }
        }
    }
}

/// Errors that can occur while sealing or opening a block.
///
/// # Security Classification
///
/// [`CryptoError::Integrity`] indicates **tampering or corruption** of data at
/// rest. It must never be treated as a missing (all-zero) block.
#[derive(Error, Debug)]
pub enum CryptoError {
    /// **[INTEGRITY VIOLATION]** The stored block failed verification.
    #[error("[INTEGRITY VIOLATION] block rejected for {context}: {reason}")]
    Integrity {
        reason: IntegrityFailure,
        context: IoContext,
    },

    /// **[PROGRAMMING ERROR]** The plaintext handed to the codec is not one block.
    #[error("invalid plaintext length: expected {expected}, got {actual}")]
    InvalidPlaintextLength { expected: usize, actual: usize },

    /// **[PROGRAMMING ERROR]** A block size of zero was requested.
    #[error("invalid block size: {0}")]
    InvalidBlockSize(usize),

    /// Key material had the wrong length.
    #[error("invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },
}

impl CryptoError {
    /// Whether this error reports corrupted or tampered data.
    pub fn is_integrity_violation(&self) -> bool {
        matches!(self, CryptoError::Integrity { .. })
    }
}

pub use block::{BlockCodec, TAG_SIZE, decrypt_block, encrypt_block};
pub use keys::{FileKey, KEY_SIZE};
