//! Client for a server's admin REST API.
//!
//! This is an external collaborator: the harness core only needs three calls
//! out of whatever surface the server binary exposes (host-id discovery,
//! remove-node, decommission). [`AdminApi`] is the seam the core depends on;
//! [`ReqwestAdminClient`] is the default implementation, and the `testing`
//! module provides a wiremock-backed one for tests.

use crate::error::AdminApiError;
use crate::ids::{HostId, IpAddress};
use async_trait::async_trait;
use std::time::Duration;

/// Outcome of a host-id probe. `Pending` covers both "connection refused" and
/// any 4xx — the server hasn't initialized far enough to answer yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostIdProbe {
    Pending,
    Ready(HostId),
}

/// The subset of a server's admin REST API the core depends on.
#[async_trait]
pub trait AdminApi: Send + Sync {
    /// Polls for this server's host id. A 5xx response is fatal; anything
    /// else that isn't a clean answer is reported as [`HostIdProbe::Pending`].
    async fn get_host_id(&self, ip: IpAddress) -> Result<HostIdProbe, AdminApiError>;

    /// Asks `initiator` to remove `target`, ignoring the given addresses as
    /// already-dead rather than waiting on them.
    async fn remove_node(
        &self,
        initiator: IpAddress,
        target: &HostId,
        ignore_dead: &[IpAddress],
        timeout: Duration,
    ) -> Result<(), AdminApiError>;

    /// Starts a cooperative decommission of `ip`.
    async fn decommission_node(&self, ip: IpAddress, timeout: Duration) -> Result<(), AdminApiError>;
}

/// Default [`AdminApi`] implementation backed by `reqwest`.
#[derive(Debug, Clone)]
pub struct ReqwestAdminClient {
    client: reqwest::Client,
    port: u16,
}

impl ReqwestAdminClient {
    pub fn new(port: u16) -> Self {
        Self {
            client: reqwest::Client::new(),
            port,
        }
    }

    fn base_url(&self, ip: IpAddress) -> String {
        format!("http://{}:{}", ip, self.port)
    }
}

#[async_trait]
impl AdminApi for ReqwestAdminClient {
    async fn get_host_id(&self, ip: IpAddress) -> Result<HostIdProbe, AdminApiError> {
        let url = format!("{}/storage_service/hostid/local", self.base_url(ip));
        let response = match self.client.get(&url).send().await {
            Ok(resp) => resp,
            Err(_) => return Ok(HostIdProbe::Pending),
        };
        let status = response.status();
        if status.as_u16() >= 500 {
            let text = response.text().await.unwrap_or_default();
            return Err(AdminApiError::Status {
                code: status.as_u16(),
                message: text,
            });
        }
        if !status.is_success() {
            return Ok(HostIdProbe::Pending);
        }
        let bytes = response.bytes().await.map_err(|e| AdminApiError::Parse(e.to_string()))?;
        let deserializer = &mut serde_json::Deserializer::from_slice(&bytes);
        let id: String =
            serde_path_to_error::deserialize(deserializer).map_err(|e| AdminApiError::Parse(e.to_string()))?;
        Ok(HostIdProbe::Ready(HostId(id)))
    }

    async fn remove_node(
        &self,
        initiator: IpAddress,
        target: &HostId,
        ignore_dead: &[IpAddress],
        timeout: Duration,
    ) -> Result<(), AdminApiError> {
        let url = format!(
            "{}/storage_service/remove_node",
            self.base_url(initiator)
        );
        let ignore_dead: Vec<String> = ignore_dead.iter().map(|ip| ip.to_string()).collect();
        let body = serde_json::json!({
            "host_id": target.0,
            "ignore_nodes": ignore_dead.join(","),
        });
        let response = self
            .client
            .post(&url)
            .timeout(timeout)
            .json(&body)
            .send()
            .await?;
        if response.status().is_success() {
            Ok(())
        } else {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            Err(AdminApiError::Status {
                code: status.as_u16(),
                message: text,
            })
        }
    }

    async fn decommission_node(&self, ip: IpAddress, timeout: Duration) -> Result<(), AdminApiError> {
        let url = format!("{}/storage_service/decommission", self.base_url(ip));
        let response = self.client.post(&url).timeout(timeout).send().await?;
        if response.status().is_success() {
            Ok(())
        } else {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            Err(AdminApiError::Status {
                code: status.as_u16(),
                message: text,
            })
        }
    }
}
