//! Keeps a bounded number of warm Clusters; hands one out per test;
//! replaces dirty ones without contaminating later tests.

use crate::cluster::{Cluster, ClusterDeps};
use crate::error::Result;
use std::collections::VecDeque;
use tokio::sync::Mutex;
use tracing::info;

/// A bounded pool of warm [`Cluster`]s, shared across the test session.
pub struct ClusterPool {
    warm: Mutex<VecDeque<Cluster>>,
    deps: ClusterDeps,
    replicas: usize,
    capacity: usize,
}

impl ClusterPool {
    pub fn new(capacity: usize, replicas: usize, deps: ClusterDeps) -> Self {
        Self {
            warm: Mutex::new(VecDeque::new()),
            deps,
            replicas,
            capacity,
        }
    }

    /// Provisions up to `capacity` clusters up front so the first tests don't
    /// pay the install-and-start cost inline.
    pub async fn warm_up(&self) -> Result<()> {
        let mut warm = self.warm.lock().await;
        while warm.len() < self.capacity {
            let mut cluster = Cluster::new(self.replicas, self.deps.clone());
            cluster.install_and_start().await?;
            warm.push_back(cluster);
        }
        Ok(())
    }

    /// Hands out a warm cluster, provisioning one on demand if the pool is empty.
    pub async fn get(&self) -> Result<Cluster> {
        let mut warm = self.warm.lock().await;
        if let Some(cluster) = warm.pop_front() {
            return Ok(cluster);
        }
        drop(warm);
        let mut cluster = Cluster::new(self.replicas, self.deps.clone());
        cluster.install_and_start().await?;
        Ok(cluster)
    }

    /// Returns a cluster to the pool. Dirty clusters never re-enter rotation;
    /// they're uninstalled instead.
    pub async fn put(&self, cluster: Cluster, is_dirty: bool) -> Result<()> {
        if is_dirty || cluster.is_dirty() {
            self.retire(cluster).await
        } else {
            let mut warm = self.warm.lock().await;
            if warm.len() < self.capacity {
                warm.push_back(cluster);
            } else {
                drop(warm);
                self.retire(cluster).await?;
            }
            Ok(())
        }
    }

    /// Uninstalls `old` and provisions a fresh replacement, returning it.
    pub async fn replace_dirty(&self, old: Cluster) -> Result<Cluster> {
        self.retire(old).await?;
        let mut cluster = Cluster::new(self.replicas, self.deps.clone());
        cluster.install_and_start().await?;
        Ok(cluster)
    }

    async fn retire(&self, mut cluster: Cluster) -> Result<()> {
        info!(cluster = %cluster, "retiring dirty cluster");
        cluster.uninstall().await
    }

    pub async fn warm_count(&self) -> usize {
        self.warm.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admin_client::{AdminApi, HostIdProbe};
    use crate::host_registry::HostRegistry;
    use crate::ids::{HostId, IpAddress, ServerIdGenerator};
    use crate::query_probe::{CqlUpState, QueryProbe};
    use crate::schema_probe::NullSchemaProbe;
    use async_trait::async_trait;
    use std::path::PathBuf;
    use std::sync::Arc;
    use std::time::Duration;

    struct ImmediateAdmin;
    #[async_trait]
    impl AdminApi for ImmediateAdmin {
        async fn get_host_id(&self, ip: IpAddress) -> std::result::Result<HostIdProbe, crate::error::AdminApiError> {
            Ok(HostIdProbe::Ready(HostId(format!("host-{ip}"))))
        }
        async fn remove_node(&self, _: IpAddress, _: &HostId, _: &[IpAddress], _: Duration) -> std::result::Result<(), crate::error::AdminApiError> {
            Ok(())
        }
        async fn decommission_node(&self, _: IpAddress, _: Duration) -> std::result::Result<(), crate::error::AdminApiError> {
            Ok(())
        }
    }

    struct ImmediateQuery;
    #[async_trait]
    impl QueryProbe for ImmediateQuery {
        async fn probe(&self, _: IpAddress, _: u16, _: Duration) -> CqlUpState {
            CqlUpState::Queried
        }
    }

    fn deps(vardir: &std::path::Path) -> ClusterDeps {
        ClusterDeps {
            host_registry: Arc::new(HostRegistry::with_range(20, 250)),
            id_generator: Arc::new(ServerIdGenerator::new()),
            admin: Arc::new(ImmediateAdmin),
            query_probe: Arc::new(ImmediateQuery),
            schema_probe: Arc::new(NullSchemaProbe),
            executable: PathBuf::from("/bin/true"),
            vardir: vardir.to_path_buf(),
        }
    }

    #[tokio::test]
    async fn get_without_warm_up_provisions_on_demand() {
        let dir = tempfile::tempdir().unwrap();
        let pool = ClusterPool::new(2, 1, deps(dir.path()));
        let cluster = pool.get().await.unwrap();
        assert!(cluster.is_up());
    }

    #[tokio::test]
    async fn dirty_clusters_never_reenter_rotation() {
        let dir = tempfile::tempdir().unwrap();
        let pool = ClusterPool::new(2, 1, deps(dir.path()));
        let cluster = pool.get().await.unwrap();
        pool.put(cluster, true).await.unwrap();
        assert_eq!(pool.warm_count().await, 0);
    }

    #[tokio::test]
    async fn clean_clusters_return_to_the_pool() {
        let dir = tempfile::tempdir().unwrap();
        let pool = ClusterPool::new(2, 1, deps(dir.path()));
        let cluster = pool.get().await.unwrap();
        pool.put(cluster, false).await.unwrap();
        assert_eq!(pool.warm_count().await, 1);
    }
}
