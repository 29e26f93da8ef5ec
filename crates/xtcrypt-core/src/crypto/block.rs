//! AES-256-CTR + HMAC-SHA256 sealing of individual encryption blocks.
//!
//! Every block is encrypted independently so any block can be decrypted
//! without touching its neighbours.
//!
//! # Sealed Block Format (`block_size + 32` bytes)
//!
//! | Offset       | Size         | Description |
//! |--------------|--------------|-------------|
//! | 0            | `block_size` | AES-CTR ciphertext |
//! | `block_size` | 32           | HMAC-SHA256 over (block_index_be + ciphertext) |
//!
//! The CTR initial counter block is `block_index_be || 0u64`, so the keystream
//! of block *i* depends only on the file key and *i*. Counters of different
//! blocks never overlap because the low 64 bits only advance within a block.

use std::sync::Arc;

use aes::cipher::{KeyIvInit, StreamCipher};
use ring::hmac;
use subtle::ConstantTimeEq;
use tracing::{trace, warn};

use super::{CryptoError, FileKey, IntegrityFailure};
use crate::context::IoContext;

/// HMAC-SHA256 tag size appended to every sealed block.
pub const TAG_SIZE: usize = 32;

/// AES-256-CTR with big-endian 128-bit counter
type Aes256Ctr = ctr::Ctr128BE<aes::Aes256>;

fn block_iv(block_index: u64) -> [u8; 16] {
    let mut iv = [0u8; 16];
    iv[..8].copy_from_slice(&block_index.to_be_bytes());
    iv
}

fn block_tag(key: &FileKey, block_index: u64, ciphertext: &[u8]) -> hmac::Tag {
    key.with_mac_key(|mac_key| {
        let hmac_key = hmac::Key::new(hmac::HMAC_SHA256, mac_key);
        let mut mac_context = hmac::Context::with_key(&hmac_key);
        mac_context.update(&block_index.to_be_bytes());
        mac_context.update(ciphertext);
        mac_context.sign()
    })
}

/// Encrypt one plaintext block and append its tag.
///
/// The output is deterministic for a given (key, block index, plaintext).
pub fn encrypt_block(key: &FileKey, block_index: u64, plaintext: &[u8]) -> Vec<u8> {
    let mut sealed = Vec::with_capacity(plaintext.len() + TAG_SIZE);
    sealed.extend_from_slice(plaintext);

    key.with_enc_key(|enc_key| {
        let mut cipher = Aes256Ctr::new(enc_key.into(), (&block_iv(block_index)).into());
        cipher.apply_keystream(&mut sealed);
    });

    let tag = block_tag(key, block_index, &sealed);
    sealed.extend_from_slice(tag.as_ref());
    sealed
}

/// Verify and decrypt one sealed block of `block_size` plaintext bytes.
///
/// Authenticates before decrypting; a wrong length or a tag mismatch is an
/// integrity violation.
pub fn decrypt_block(
    key: &FileKey,
    block_index: u64,
    block_size: usize,
    sealed: &[u8],
    context: &IoContext,
) -> Result<Vec<u8>, CryptoError> {
    let expected = block_size + TAG_SIZE;
    if sealed.len() != expected {
        warn!(
            block = block_index,
            actual_size = sealed.len(),
            expected_size = expected,
            "Sealed block has wrong size"
        );
        return Err(CryptoError::Integrity {
            reason: IntegrityFailure::Truncated {
                expected,
                actual: sealed.len(),
            },
            context: context.clone(),
        });
    }

    let (ciphertext, expected_tag) = sealed.split_at(block_size);
    let computed_tag = block_tag(key, block_index, ciphertext);

    // Constant-time comparison
    if !bool::from(computed_tag.as_ref().ct_eq(expected_tag)) {
        warn!(block = block_index, "Block tag verification failed");
        return Err(CryptoError::Integrity {
            reason: IntegrityFailure::TagMismatch,
            context: context.clone(),
        });
    }

    let mut plaintext = ciphertext.to_vec();
    key.with_enc_key(|enc_key| {
        let mut cipher = Aes256Ctr::new(enc_key.into(), (&block_iv(block_index)).into());
        cipher.apply_keystream(&mut plaintext);
    });

    trace!(block = block_index, "Block decrypted");
    Ok(plaintext)
}

/// A file key bound to the file's block size.
///
/// Cheap to clone; the key material is shared read-only.
#[derive(Debug, Clone)]
pub struct BlockCodec {
    key: Arc<FileKey>,
    block_size: usize,
}

impl BlockCodec {
    pub fn new(key: Arc<FileKey>, block_size: usize) -> Result<Self, CryptoError> {
        if block_size == 0 {
            return Err(CryptoError::InvalidBlockSize(block_size));
        }
        Ok(Self { key, block_size })
    }

    /// Plaintext bytes per block.
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Stored bytes per block (ciphertext plus tag).
    pub fn sealed_size(&self) -> usize {
        self.block_size + TAG_SIZE
    }

    /// Seal exactly one block of plaintext.
    pub fn encrypt(&self, block_index: u64, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if plaintext.len() != self.block_size {
            return Err(CryptoError::InvalidPlaintextLength {
                expected: self.block_size,
                actual: plaintext.len(),
            });
        }
        Ok(encrypt_block(&self.key, block_index, plaintext))
    }

    /// Open one sealed block.
    pub fn decrypt(
        &self,
        block_index: u64,
        sealed: &[u8],
        context: &IoContext,
    ) -> Result<Vec<u8>, CryptoError> {
        decrypt_block(&self.key, block_index, self.block_size, sealed, context)
    }
}
