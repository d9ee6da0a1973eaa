//! Test doubles for the harness's external collaborators.
//!
//! Gated behind the `test-support` feature, mirroring how the rest of the
//! crate keeps optional test tooling out of default builds.
//!
//! ```ignore
//! use dtest_harness::testing::{FakeQueryProbe, FakeSchemaProbe, WiremockAdmin};
//!
//! #[tokio::test]
//! async fn test_my_app() {
//!     let admin = WiremockAdmin::start().await;
//!     admin.mock_host_id("host-1").await;
//!     // build a ClusterDeps using admin's port, FakeQueryProbe, FakeSchemaProbe
//! }
//! ```

use crate::admin_client::{AdminApi, HostIdProbe};
use crate::error::AdminApiError;
use crate::ids::{HostId, IpAddress};
use crate::query_probe::{CqlUpState, QueryProbe};
use crate::schema_probe::SchemaProbe;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// A [`QueryProbe`] whose outcome is fixed at construction, for tests that
/// don't care about the readiness loop's retry behavior.
#[derive(Debug, Clone, Copy)]
pub struct FakeQueryProbe(pub CqlUpState);

impl FakeQueryProbe {
    pub fn always_queried() -> Self {
        Self(CqlUpState::Queried)
    }
}

#[async_trait]
impl QueryProbe for FakeQueryProbe {
    async fn probe(&self, _ip: IpAddress, _port: u16, _timeout: Duration) -> CqlUpState {
        self.0
    }
}

/// A [`SchemaProbe`] returning a fixed keyspace count.
#[derive(Debug, Default)]
pub struct FakeSchemaProbe {
    count: Mutex<u64>,
}

impl FakeSchemaProbe {
    pub fn new(count: u64) -> Self {
        Self { count: Mutex::new(count) }
    }

    pub fn set(&self, count: u64) {
        *self.count.lock().unwrap() = count;
    }
}

#[async_trait]
impl SchemaProbe for FakeSchemaProbe {
    async fn keyspace_count(&self, _ip: IpAddress, _timeout: Duration) -> crate::error::Result<u64> {
        Ok(*self.count.lock().unwrap())
    }
}

/// An in-memory [`AdminApi`] for tests that don't need real HTTP, keyed by ip.
#[derive(Debug, Default)]
pub struct FakeAdmin {
    host_ids: Mutex<HashMap<IpAddress, HostId>>,
}

impl FakeAdmin {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_host_id(&self, ip: IpAddress, host_id: impl Into<String>) {
        self.host_ids.lock().unwrap().insert(ip, HostId(host_id.into()));
    }
}

#[async_trait]
impl AdminApi for FakeAdmin {
    async fn get_host_id(&self, ip: IpAddress) -> Result<HostIdProbe, AdminApiError> {
        match self.host_ids.lock().unwrap().get(&ip) {
            Some(id) => Ok(HostIdProbe::Ready(id.clone())),
            None => Ok(HostIdProbe::Pending),
        }
    }

    async fn remove_node(
        &self,
        _initiator: IpAddress,
        _target: &HostId,
        _ignore_dead: &[IpAddress],
        _timeout: Duration,
    ) -> Result<(), AdminApiError> {
        Ok(())
    }

    async fn decommission_node(&self, _ip: IpAddress, _timeout: Duration) -> Result<(), AdminApiError> {
        Ok(())
    }
}

/// A `wiremock`-backed admin server for tests that want to exercise the real
/// [`crate::admin_client::ReqwestAdminClient`] HTTP path rather than a fake.
pub struct WiremockAdmin {
    server: MockServer,
}

impl WiremockAdmin {
    pub async fn start() -> Self {
        Self { server: MockServer::start().await }
    }

    pub fn port(&self) -> u16 {
        self.server.address().port()
    }

    pub async fn mock_host_id(&self, host_id: &str) {
        Mock::given(method("GET"))
            .and(path("/storage_service/hostid/local"))
            .respond_with(ResponseTemplate::new(200).set_body_json(host_id))
            .mount(&self.server)
            .await;
    }

    pub async fn mock_host_id_error(&self, status: u16) {
        Mock::given(method("GET"))
            .and(path("/storage_service/hostid/local"))
            .respond_with(ResponseTemplate::new(status))
            .mount(&self.server)
            .await;
    }

    pub fn inner(&self) -> &MockServer {
        &self.server
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fake_admin_reports_pending_until_host_id_is_set() {
        let admin = FakeAdmin::new();
        let ip = std::net::Ipv4Addr::new(127, 0, 5, 2);
        assert_eq!(admin.get_host_id(ip).await.unwrap(), HostIdProbe::Pending);
        admin.set_host_id(ip, "abc-123");
        assert_eq!(
            admin.get_host_id(ip).await.unwrap(),
            HostIdProbe::Ready(HostId("abc-123".to_string()))
        );
    }

    #[tokio::test]
    async fn wiremock_admin_serves_configured_host_id() {
        let admin = WiremockAdmin::start().await;
        admin.mock_host_id("wiremock-host").await;
        let client = crate::admin_client::ReqwestAdminClient::new(admin.port());
        let ip = std::net::Ipv4Addr::new(127, 0, 0, 1);
        let probe = client.get_host_id(ip).await.unwrap();
        assert_eq!(probe, HostIdProbe::Ready(HostId("wiremock-host".to_string())));
    }
}
