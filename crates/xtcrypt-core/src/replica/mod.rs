//! Storage replicas and failover routing.

pub mod router;

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::context::IoContext;
use crate::transport::TransportError;

pub use router::{FetchedBlock, ReplicaRouter};

/// Storage medium of a replica node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplicaKind {
    Disk,
    Ssd,
    #[default]
    Unknown,
}

/// One storage node holding a copy of the file's blocks.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReplicaDescriptor {
    /// Network address, e.g. `osd-1.example.org:32640`
    pub address: String,
    /// Stable node identity, independent of the address
    pub identity: String,
    #[serde(default)]
    pub kind: ReplicaKind,
}

impl ReplicaDescriptor {
    pub fn new(address: impl Into<String>, identity: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            identity: identity.into(),
            kind: ReplicaKind::Unknown,
        }
    }

    #[must_use]
    pub fn with_kind(mut self, kind: ReplicaKind) -> Self {
        self.kind = kind;
        self
    }
}

impl fmt::Display for ReplicaDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.identity, self.address)
    }
}

/// Errors from routed storage operations.
#[derive(Error, Debug)]
pub enum RouterError {
    /// Every replica failed with a communication error.
    #[error("all {attempts} replicas unavailable for {context}: {last_error}")]
    ReplicaUnavailable {
        attempts: usize,
        #[source]
        last_error: TransportError,
        context: IoContext,
    },

    /// A replica answered and refused the request.
    #[error("request rejected by replica for {context}: {source}")]
    Rejected {
        #[source]
        source: TransportError,
        context: IoContext,
    },

    /// The replica list was empty.
    #[error("no replicas configured for file '{file_id}'")]
    NoReplicas { file_id: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_deserializes_without_kind() {
        let json = r#"{"address":"osd-1:32640","identity":"osd-uuid-1"}"#;
        let replica: ReplicaDescriptor = serde_json::from_str(json).unwrap();
        assert_eq!(replica.kind, ReplicaKind::Unknown);
        assert_eq!(replica.to_string(), "osd-uuid-1 (osd-1:32640)");
    }

    #[test]
    fn test_kind_serialization() {
        let replica =
            ReplicaDescriptor::new("osd-2:32640", "osd-uuid-2").with_kind(ReplicaKind::Ssd);
        let json = serde_json::to_string(&replica).unwrap();
        assert!(json.contains("\"kind\":\"ssd\""));
    }
}
