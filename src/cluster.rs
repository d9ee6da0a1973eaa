//! Aggregates Servers; maintains running/stopped/removed sets, seed list,
//! leased IPs, dirtiness flag, and per-test invariants.

use crate::admin_client::AdminApi;
use crate::config::ConfigMap;
use crate::error::{HarnessError, Result};
use crate::host_registry::HostRegistry;
use crate::ids::{ActionResult, HostId, IpAddress, ReplaceConfig, ServerId, ServerIdGenerator};
use crate::query_probe::QueryProbe;
use crate::schema_probe::SchemaProbe;
use crate::server::{STOP_TIMEOUT, Server};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::warn;

/// Options for [`Cluster::add_server`].
#[derive(Debug, Default)]
pub struct AddServerOptions {
    pub replace_cfg: Option<ReplaceConfig>,
    pub cmdline: Vec<String>,
    pub config: ConfigMap,
    pub start: bool,
}

impl AddServerOptions {
    pub fn new() -> Self {
        Self {
            start: true,
            ..Default::default()
        }
    }
}

/// Shared collaborators a Cluster needs to provision and supervise Servers.
/// Grouped so `ClusterPool` can hand out identical wiring to every Cluster
/// it warms.
#[derive(Clone)]
pub struct ClusterDeps {
    pub host_registry: Arc<HostRegistry>,
    pub id_generator: Arc<ServerIdGenerator>,
    pub admin: Arc<dyn AdminApi>,
    pub query_probe: Arc<dyn QueryProbe>,
    pub schema_probe: Arc<dyn SchemaProbe>,
    pub executable: PathBuf,
    pub vardir: PathBuf,
}

/// A set of Servers sharing a cluster name and a seed list.
pub struct Cluster {
    pub name: String,
    pub replicas: usize,
    running: HashMap<ServerId, Server>,
    stopped: HashMap<ServerId, Server>,
    removed: HashSet<ServerId>,
    leased_ips: HashSet<IpAddress>,
    is_running: bool,
    is_dirty: bool,
    start_exception: Option<String>,
    keyspace_baseline: Option<u64>,
    deps: ClusterDeps,
}

impl Cluster {
    pub fn new(replicas: usize, deps: ClusterDeps) -> Self {
        Self {
            name: uuid::Uuid::new_v4().to_string(),
            replicas,
            running: HashMap::new(),
            stopped: HashMap::new(),
            removed: HashSet::new(),
            leased_ips: HashSet::new(),
            is_running: false,
            is_dirty: false,
            start_exception: None,
            keyspace_baseline: None,
            deps,
        }
    }

    pub fn is_dirty(&self) -> bool {
        self.is_dirty
    }

    pub fn is_up(&self) -> bool {
        !self.running.is_empty()
    }

    fn mark_dirty(&mut self) {
        self.is_dirty = true;
    }

    pub fn mark_dirty_forced(&mut self) {
        self.mark_dirty();
    }

    fn seeds(&self) -> Vec<IpAddress> {
        self.running.values().map(|s| s.ip).collect()
    }

    /// `running ∩ stopped = ∅`, enforced structurally since a ServerId lives
    /// in exactly one of the two maps at a time — see `add_server`,
    /// `server_start`, `server_stop`.
    pub fn running_servers(&self) -> Vec<(ServerId, IpAddress)> {
        self.running
            .iter()
            .filter(|(id, _)| !self.removed.contains(id))
            .map(|(id, s)| (*id, s.ip))
            .collect()
    }

    fn find(&self, id: ServerId) -> Option<&Server> {
        self.running.get(&id).or_else(|| self.stopped.get(&id))
    }

    fn find_mut(&mut self, id: ServerId) -> Option<&mut Server> {
        if self.running.contains_key(&id) {
            self.running.get_mut(&id)
        } else {
            self.stopped.get_mut(&id)
        }
    }

    pub fn host_ip(&self, id: ServerId) -> Option<IpAddress> {
        self.find(id).map(|s| s.ip)
    }

    pub fn host_id(&self, id: ServerId) -> Option<HostId> {
        self.find(id).and_then(|s| s.host_id.clone())
    }

    /// Provisions `replicas` servers, capturing any failure as
    /// `start_exception` rather than propagating it — surfaced on the next
    /// `before_test` so it attributes to a specific test.
    pub async fn install_and_start(&mut self) -> Result<()> {
        for _ in 0..self.replicas {
            if let Err(e) = self.add_server(AddServerOptions::new()).await {
                self.start_exception = Some(e.to_string());
                break;
            }
        }
        if self.replicas > 0 && self.start_exception.is_none() {
            if let Some((_, ip)) = self.running_servers().into_iter().next() {
                self.keyspace_baseline = self
                    .deps
                    .schema_probe
                    .keyspace_count(ip, STOP_TIMEOUT)
                    .await
                    .ok();
            }
        }
        self.is_running = true;
        self.is_dirty = false;
        Ok(())
    }

    /// Marks dirty, stops every running server, and uninstalls every stopped
    /// one, then releases all leased IPs.
    pub async fn uninstall(&mut self) -> Result<()> {
        self.mark_dirty();
        self.stop().await?;
        for (_, mut server) in self.stopped.drain() {
            let _ = server.uninstall();
        }
        for ip in self.leased_ips.drain() {
            self.deps.host_registry.release_host(ip);
        }
        Ok(())
    }

    /// Stops every running server and moves it to `stopped`.
    pub async fn stop(&mut self) -> Result<()> {
        let ids: Vec<ServerId> = self.running.keys().copied().collect();
        for id in ids {
            if let Some(mut server) = self.running.remove(&id) {
                let _ = server.stop().await;
                self.stopped.insert(id, server);
            }
        }
        self.is_running = false;
        if !self.running.is_empty() {
            self.mark_dirty();
        }
        Ok(())
    }

    /// Marks dirty; sets the target for `replace_cfg`-based provisioning.
    /// Leases (or reuses) an IP, recomputes seeds, builds the Server, and
    /// installs/starts it. On failure, a freshly leased IP is released (a
    /// reused one is retained); on success the server lands in `running` or
    /// `stopped` per `opts.start`.
    pub async fn add_server(&mut self, opts: AddServerOptions) -> Result<(ServerId, IpAddress)> {
        self.mark_dirty();

        let mut config = opts.config;
        let mut reused_ip: Option<IpAddress> = None;

        if let Some(replace_cfg) = &opts.replace_cfg {
            let replaced = self
                .stopped
                .get(&replace_cfg.replaced_id)
                .ok_or_else(|| {
                    HarnessError::Mutation(format!(
                        "replace target {} is not stopped",
                        replace_cfg.replaced_id
                    ))
                })?;
            if self.removed.contains(&replace_cfg.replaced_id) {
                return Err(HarnessError::Mutation(format!(
                    "replace target {} has already been removed",
                    replace_cfg.replaced_id
                )));
            }
            if replace_cfg.use_host_id {
                let host_id = replaced.host_id.clone().ok_or_else(|| {
                    HarnessError::Mutation("replace target has no known host id".to_string())
                })?;
                config.insert(
                    "replace_node_first_boot".into(),
                    serde_yaml::Value::String(host_id.0),
                );
            } else {
                config.insert(
                    "replace_address_first_boot".into(),
                    serde_yaml::Value::String(replaced.ip.to_string()),
                );
            }
            if !replace_cfg.ignore_dead_nodes.is_empty() {
                let ignore: Vec<String> = replace_cfg
                    .ignore_dead_nodes
                    .iter()
                    .map(|ip| ip.to_string())
                    .collect();
                config.insert(
                    "ignore_dead_nodes_for_replace".into(),
                    serde_yaml::Value::String(ignore.join(",")),
                );
            }
            if replace_cfg.reuse_ip_addr {
                reused_ip = Some(replaced.ip);
            }
        }

        let ip = match reused_ip {
            Some(ip) => ip,
            None => {
                let ip = self.deps.host_registry.lease_host()?;
                self.leased_ips.insert(ip);
                ip
            }
        };

        let seeds = {
            let s = self.seeds();
            if s.is_empty() { vec![ip] } else { s }
        };

        let id = self.deps.id_generator.next();
        let mut server = Server::new(
            id,
            self.deps.executable.clone(),
            &self.deps.vardir,
            ip,
            seeds,
            self.name.clone(),
            config,
            opts.cmdline,
        );

        let provision = async {
            server.install()?;
            if opts.start {
                server
                    .start(self.deps.admin.as_ref(), self.deps.query_probe.as_ref(), None)
                    .await?;
            }
            Ok::<(), HarnessError>(())
        }
        .await;

        if let Err(e) = provision {
            if reused_ip.is_none() {
                self.leased_ips.remove(&ip);
                self.deps.host_registry.release_host(ip);
            }
            return Err(e);
        }

        if opts.start {
            self.running.insert(id, server);
        } else {
            self.stopped.insert(id, server);
        }
        Ok((id, ip))
    }

    /// No-op if already stopped; fails if unknown. Moves `running` -> `stopped`
    /// only after the underlying stop succeeds.
    pub async fn server_stop(&mut self, id: ServerId, gracefully: bool) -> ActionResult {
        if self.stopped.contains_key(&id) {
            return ActionResult::ok(format!("server {id} already stopped"));
        }
        let Some(mut server) = self.running.remove(&id) else {
            return ActionResult::fail(format!("unknown server {id}"));
        };
        self.mark_dirty();
        let result = if gracefully { server.stop_gracefully().await } else { server.stop().await };
        self.stopped.insert(id, server);
        match result {
            Ok(()) => ActionResult::ok(format!("server {id} stopped")),
            Err(e) => ActionResult::fail(e.to_string()),
        }
    }

    /// Adds to `removed` without stopping: the departure may be initiated
    /// from another node while this one is still alive.
    pub fn server_mark_removed(&mut self, id: ServerId) -> ActionResult {
        if self.find(id).is_none() {
            return ActionResult::fail(format!("unknown server {id}"));
        }
        self.removed.insert(id);
        ActionResult::ok(format!("server {id} marked removed"))
    }

    /// No-op if already running; fails if unknown. Moves to `running` before
    /// calling start, so a failed start doesn't leak the server out of both
    /// maps; with `expected_error` set, success means the expected failure
    /// happened, so the server returns to `stopped`.
    pub async fn server_start(&mut self, id: ServerId, expected_error: Option<&str>) -> ActionResult {
        if self.running.contains_key(&id) {
            return ActionResult::ok(format!("server {id} already running"));
        }
        let Some(mut server) = self.stopped.remove(&id) else {
            return ActionResult::fail(format!("unknown server {id}"));
        };
        let seeds = {
            let s = self.seeds();
            if s.is_empty() { vec![server.ip] } else { s }
        };
        server.seeds = seeds;
        self.running.insert(id, server);

        let server = self.running.get_mut(&id).expect("just inserted");
        let result = server
            .start(self.deps.admin.as_ref(), self.deps.query_probe.as_ref(), expected_error)
            .await;

        match result {
            Ok(()) => {
                if expected_error.is_some() {
                    let server = self.running.remove(&id).expect("just inserted");
                    self.stopped.insert(id, server);
                }
                ActionResult::ok(format!("server {id} started"))
            }
            Err(e) => {
                let server = self.running.remove(&id).expect("just inserted");
                self.stopped.insert(id, server);
                ActionResult::fail(e.to_string())
            }
        }
    }

    /// Stop-gracefully then start.
    pub async fn server_restart(&mut self, id: ServerId) -> ActionResult {
        let stop = self.server_stop(id, true).await;
        if !stop.success {
            return stop;
        }
        self.server_start(id, None).await
    }

    pub fn server_pause(&mut self, id: ServerId) -> ActionResult {
        self.mark_dirty();
        match self.running.get(&id) {
            Some(server) => match server.pause() {
                Ok(()) => ActionResult::ok(format!("server {id} paused")),
                Err(e) => ActionResult::fail(e.to_string()),
            },
            None => ActionResult::fail(format!("server {id} is not running")),
        }
    }

    pub fn server_unpause(&mut self, id: ServerId) -> ActionResult {
        match self.running.get(&id) {
            Some(server) => match server.unpause() {
                Ok(()) => ActionResult::ok(format!("server {id} unpaused")),
                Err(e) => ActionResult::fail(e.to_string()),
            },
            None => ActionResult::fail(format!("server {id} is not running")),
        }
    }

    pub fn get_config(&self, id: ServerId) -> ActionResult {
        match self.find(id) {
            Some(server) => {
                let data = serde_json::to_value(server.get_config()).unwrap_or_default();
                ActionResult::ok_with(format!("config for server {id}"), data)
            }
            None => ActionResult::fail(format!("unknown server {id}")),
        }
    }

    pub fn update_config(&mut self, id: ServerId, key: &str, value: serde_json::Value) -> ActionResult {
        self.mark_dirty();
        let yaml_value: serde_yaml::Value = serde_yaml::to_value(&value).unwrap_or(serde_yaml::Value::Null);
        match self.find_mut(id) {
            Some(server) => match server.update_config(key, yaml_value) {
                Ok(()) => ActionResult::ok(format!("updated {key} on server {id}")),
                Err(e) => ActionResult::fail(e.to_string()),
            },
            None => ActionResult::fail(format!("unknown server {id}")),
        }
    }

    /// The server must be stopped. Leases a new IP and does *not* release the
    /// old one until cluster uninstall — immediate reuse within the same
    /// cluster could confuse gossip.
    pub fn change_ip(&mut self, id: ServerId) -> ActionResult {
        if self.running.contains_key(&id) {
            return ActionResult::fail(format!("server {id} is still running"));
        }
        if !self.stopped.contains_key(&id) {
            return ActionResult::fail(format!("unknown server {id}"));
        }
        self.mark_dirty();
        let server = self.stopped.get_mut(&id).unwrap();
        let new_ip = match self.deps.host_registry.lease_host() {
            Ok(ip) => ip,
            Err(e) => return ActionResult::fail(e.to_string()),
        };
        if let Err(e) = server.change_ip(new_ip) {
            self.deps.host_registry.release_host(new_ip);
            return ActionResult::fail(e.to_string());
        }
        self.leased_ips.insert(new_ip);
        ActionResult::ok_with(
            format!("server {id} ip changed"),
            serde_json::json!({"ip_addr": new_ip.to_string()}),
        )
    }

    /// Invokes admin-REST decommission on the target, then stops it gracefully.
    pub async fn decommission_node(&mut self, id: ServerId) -> ActionResult {
        let Some(ip) = self.running.get(&id).map(|s| s.ip) else {
            return ActionResult::fail(format!("server {id} is not running"));
        };
        self.mark_dirty();
        if self.running_servers().len() == 1 {
            warn!(server_id = id.0, "decommissioning the last running node");
        }
        if let Err(e) = self.deps.admin.decommission_node(ip, STOP_TIMEOUT).await {
            return ActionResult::fail(e.to_string());
        }
        self.server_stop(id, true).await
    }

    /// Invokes admin-REST remove on `initiator`, passing `target`'s host id
    /// and the ignore-dead list. Fails loudly if `initiator` is not running.
    pub async fn remove_node(
        &mut self,
        initiator: ServerId,
        target: ServerId,
        ignore_dead: Vec<IpAddress>,
    ) -> ActionResult {
        let Some(initiator_ip) = self.running.get(&initiator).map(|s| s.ip) else {
            return ActionResult::fail(format!("initiator {initiator} is not running"));
        };
        let Some(target_host_id) = self.find(target).and_then(|s| s.host_id.clone()) else {
            return ActionResult::fail(format!("target {target} has no known host id"));
        };
        self.mark_dirty();
        match self
            .deps
            .admin
            .remove_node(initiator_ip, &target_host_id, &ignore_dead, STOP_TIMEOUT)
            .await
        {
            Ok(()) => self.server_mark_removed(target),
            Err(e) => ActionResult::fail(e.to_string()),
        }
    }

    /// Surfaces any saved startup exception (dirtying the cluster) and writes
    /// a log marker to every running server.
    pub async fn before_test(&mut self, name: &str) -> Result<String> {
        if let Some(err) = self.start_exception.take() {
            self.mark_dirty();
            return Err(HarnessError::Mutation(err));
        }
        for server in self.running.values() {
            let _ = server.write_log_marker(&format!("before test {name}")).await;
        }
        Ok(self.describe())
    }

    /// Marks dirty on failure; if still clean, compares the current keyspace
    /// count against the baseline captured at cluster birth.
    pub async fn after_test(&mut self, name: &str, success: bool) -> Result<()> {
        if let Some(err) = &self.start_exception {
            return Err(HarnessError::Mutation(err.clone()));
        }
        if !success {
            self.mark_dirty();
        }
        let mut violation = None;
        if !self.is_dirty {
            if let (Some(baseline), Some((_, ip))) =
                (self.keyspace_baseline, self.running_servers().into_iter().next())
            {
                if let Ok(current) = self.deps.schema_probe.keyspace_count(ip, STOP_TIMEOUT).await {
                    if current != baseline {
                        violation = Some(format!(
                            "keyspace count changed from {baseline} to {current} after test {name}"
                        ));
                    }
                }
            }
        }
        for server in self.running.values().chain(self.stopped.values()) {
            let _ = server.write_log_marker(&format!("after test {name}")).await;
        }
        if let Some(message) = violation {
            self.mark_dirty();
            return Err(HarnessError::Postcondition {
                test_name: name.to_string(),
                message,
            });
        }
        Ok(())
    }

    pub fn take_log_savepoint(&mut self) {
        for server in self.running.values_mut() {
            let _ = server.take_log_savepoint();
        }
    }

    /// Explicit per-server log read, replacing the "guess the first running
    /// server" heuristic the original harness used for diagnostics.
    pub async fn read_server_log(&self, id: ServerId) -> Result<String> {
        let server = self.find(id).ok_or(HarnessError::UnknownServer(id.0))?;
        Ok(server.read_log().await)
    }

    fn describe(&self) -> String {
        format!(
            "Cluster(name={}, running={}, stopped={}, dirty={})",
            self.name,
            self.running.len(),
            self.stopped.len(),
            self.is_dirty
        )
    }

    /// `running ∩ stopped = ∅`; every `leased_ips` entry accounted for;
    /// `removed ⊆ running ∪ stopped`. Exercised directly in tests and useful
    /// for assertions in callers that want to sanity-check state.
    pub fn check_invariants(&self) -> std::result::Result<(), String> {
        for id in self.running.keys() {
            if self.stopped.contains_key(id) {
                return Err(format!("server {id} is in both running and stopped"));
            }
        }
        for id in &self.removed {
            if !self.running.contains_key(id) && !self.stopped.contains_key(id) {
                return Err(format!("removed server {id} is in neither running nor stopped"));
            }
        }
        let live_ips: HashSet<IpAddress> = self
            .running
            .values()
            .chain(self.stopped.values())
            .map(|s| s.ip)
            .collect();
        if !live_ips.is_subset(&self.leased_ips) {
            return Err("a server's ip is not accounted for in leased_ips".to_string());
        }
        Ok(())
    }
}

impl std::fmt::Display for Cluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.describe())
    }
}
