//! Identity and result types shared across the harness core.

use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU64, Ordering};

/// Process-wide monotonically increasing server identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServerId(pub u64);

impl std::fmt::Display for ServerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Allocates [`ServerId`]s for the lifetime of a test session. Shared process-wide,
/// mirroring the single `itertools.count` counter of the original harness.
#[derive(Debug, Default)]
pub struct ServerIdGenerator(AtomicU64);

impl ServerIdGenerator {
    pub fn new() -> Self {
        Self(AtomicU64::new(1))
    }

    pub fn next(&self) -> ServerId {
        ServerId(self.0.fetch_add(1, Ordering::Relaxed))
    }
}

/// Opaque identifier assigned by the server itself, discovered via its admin API.
/// Not known until the process has initialized enough to answer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HostId(pub String);

impl std::fmt::Display for HostId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A leased loopback address, unique within the test session.
pub type IpAddress = Ipv4Addr;

/// Describes a replacement of a departed node by a fresh one.
#[derive(Debug, Clone, Serialize, Deserialize, typed_builder::TypedBuilder)]
pub struct ReplaceConfig {
    /// The server being replaced.
    pub replaced_id: ServerId,
    /// Reuse the departing node's IP for the replacement.
    #[builder(default)]
    pub reuse_ip_addr: bool,
    /// Replace by host id rather than by address.
    #[builder(default)]
    pub use_host_id: bool,
    /// Addresses the replacement should treat as dead rather than wait on.
    #[builder(default)]
    pub ignore_dead_nodes: Vec<IpAddress>,
}

/// The universal return shape of Cluster mutators.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionResult {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl ActionResult {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            data: None,
        }
    }

    pub fn ok_with(message: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            success: true,
            message: message.into(),
            data: Some(data),
        }
    }

    pub fn fail(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            data: None,
        }
    }
}
