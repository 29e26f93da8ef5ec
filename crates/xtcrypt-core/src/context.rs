//! Diagnostic context attached to I/O errors.

use std::fmt;

/// Where an I/O error happened: file, block and replica, as far as known.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IoContext {
    /// The logical file identifier
    pub file_id: Option<String>,
    /// The encryption block index (for block-level errors)
    pub block_index: Option<u64>,
    /// The replica address the operation targeted
    pub replica: Option<String>,
}

impl IoContext {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_file(mut self, file_id: impl Into<String>) -> Self {
        self.file_id = Some(file_id.into());
        self
    }

    #[must_use]
    pub fn with_block(mut self, block_index: u64) -> Self {
        self.block_index = Some(block_index);
        self
    }

    #[must_use]
    pub fn with_replica(mut self, address: impl Into<String>) -> Self {
        self.replica = Some(address.into());
        self
    }
}

impl fmt::Display for IoContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();

        if let Some(ref file_id) = self.file_id {
            parts.push(format!("file '{file_id}'"));
        }
        if let Some(block) = self.block_index {
            parts.push(format!("block {block}"));
        }
        if let Some(ref replica) = self.replica {
            parts.push(format!("on replica {replica}"));
        }

        if parts.is_empty() {
            write!(f, "(no context)")
        } else {
            write!(f, "{}", parts.join(", "))
        }
    }
}
