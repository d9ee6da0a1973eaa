//! Keyspace-count inspection used by the after-test postcondition check.
//!
//! Like [`crate::query_probe::QueryProbe`], the real inspection rides over the
//! external query-protocol client; this trait is the seam the core depends on.

use crate::ids::IpAddress;
use async_trait::async_trait;
use std::time::Duration;

#[async_trait]
pub trait SchemaProbe: Send + Sync {
    /// Counts user keyspaces visible from `ip`'s control connection.
    async fn keyspace_count(&self, ip: IpAddress, timeout: Duration) -> crate::error::Result<u64>;
}

/// Stand-in used when no real schema inspection is wired up: always reports
/// zero, so the postcondition check never fires unless a test double says
/// otherwise. Real deployments supply an implementation backed by the actual
/// query-protocol client.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSchemaProbe;

#[async_trait]
impl SchemaProbe for NullSchemaProbe {
    async fn keyspace_count(&self, _ip: IpAddress, _timeout: Duration) -> crate::error::Result<u64> {
        Ok(0)
    }
}
