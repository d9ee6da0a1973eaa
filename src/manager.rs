//! Per-test façade: owns one Cluster for the duration of a test, serving a
//! local Unix-socket HTTP control plane.

use crate::cluster::{AddServerOptions, Cluster};
use crate::error::Result;
use crate::ids::{ActionResult, IpAddress, ReplaceConfig, ServerId};
use crate::pool::ClusterPool;
use axum::Router;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, put};
use serde::Deserialize;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::sync::Mutex;
use tracing::{error, info};

struct ManagerState {
    cluster: Mutex<Cluster>,
}

/// One Manager per test: leases a Cluster on `start`, serves the control
/// plane on a per-test socket, and returns the cluster to the pool on `stop`.
pub struct Manager {
    pool: Arc<ClusterPool>,
    state: Arc<ManagerState>,
    manager_dir: TempDir,
    socket_path: std::path::PathBuf,
    shutdown: Option<tokio::sync::oneshot::Sender<()>>,
    server_task: Option<tokio::task::JoinHandle<()>>,
}

impl Manager {
    /// Leases a Cluster from `pool` and binds the control-plane socket.
    /// `manager_dir` is created short and under a global temp directory
    /// rather than the test's own vardir, to avoid Unix socket path-length
    /// limits.
    pub async fn start(pool: Arc<ClusterPool>) -> Result<Self> {
        let cluster = pool.get().await?;
        let manager_dir = TempDir::with_prefix("manager-")?;
        let socket_path = manager_dir.path().join("api");

        let state = Arc::new(ManagerState {
            cluster: Mutex::new(cluster),
        });

        let listener = tokio::net::UnixListener::bind(&socket_path)?;
        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
        let router = build_router(state.clone());

        let server_task = tokio::spawn(async move {
            let result = axum::serve(listener, router)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await;
            if let Err(e) = result {
                error!("manager control-plane server exited with error: {e}");
            }
        });

        info!(socket = %socket_path.display(), "manager started");

        Ok(Self {
            pool,
            state,
            manager_dir,
            socket_path,
            shutdown: Some(shutdown_tx),
            server_task: Some(server_task),
        })
    }

    pub fn socket_path(&self) -> &std::path::Path {
        &self.socket_path
    }

    /// Tears down the socket, returns the cluster to the pool tagged by its
    /// current dirtiness, and removes the manager's temp directory.
    pub async fn stop(mut self) -> Result<()> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.server_task.take() {
            let _ = task.await;
        }
        let cluster = Arc::try_unwrap(self.state)
            .map_err(|_| crate::error::HarnessError::Mutation("manager state still shared".into()))?
            .cluster
            .into_inner();
        let is_dirty = cluster.is_dirty();
        self.pool.put(cluster, is_dirty).await?;
        // `manager_dir` is removed on drop; the explicit drop here just makes
        // the cleanup point visible at the call site rather than implicit.
        drop(self.manager_dir);
        Ok(())
    }
}

fn build_router(state: Arc<ManagerState>) -> Router {
    Router::new()
        .route("/up", get(|| async { "OK" }))
        .route("/cluster/up", get(cluster_up))
        .route("/cluster/is-dirty", get(cluster_is_dirty))
        .route("/cluster/replicas", get(cluster_replicas))
        .route("/cluster/running-servers", get(cluster_running_servers))
        .route("/cluster/host-ip/{id}", get(cluster_host_ip))
        .route("/cluster/host-id/{id}", get(cluster_host_id))
        .route("/cluster/before-test/{name}", get(cluster_before_test))
        .route("/cluster/after-test/{success}", get(cluster_after_test))
        .route("/cluster/mark-dirty", get(cluster_mark_dirty))
        .route("/cluster/server/{id}/stop", get(server_stop))
        .route("/cluster/server/{id}/stop_gracefully", get(server_stop_gracefully))
        .route("/cluster/server/{id}/start", get(server_start))
        .route("/cluster/server/{id}/restart", get(server_restart))
        .route("/cluster/server/{id}/pause", get(server_pause))
        .route("/cluster/server/{id}/unpause", get(server_unpause))
        .route("/cluster/addserver", put(cluster_add_server))
        .route("/cluster/remove-node/{initiator}", put(cluster_remove_node))
        .route("/cluster/decommission-node/{id}", get(cluster_decommission_node))
        .route("/cluster/server/{id}/get_config", get(server_get_config))
        .route("/cluster/server/{id}/update_config", put(server_update_config))
        .route("/cluster/server/{id}/change_ip", put(server_change_ip))
        .with_state(state)
}

/// Every handler here wraps its body and converts panics-worth errors into a
/// 500 with the error message; axum's `Result<_, Response>` return type gives
/// us that for free since every fallible step below is explicit.
fn mutation_response(result: ActionResult) -> Response {
    if result.success {
        match result.data {
            Some(data) => axum::Json(data).into_response(),
            None => result.message.into_response(),
        }
    } else {
        (StatusCode::INTERNAL_SERVER_ERROR, result.message).into_response()
    }
}

/// Config-surface routes answer an unknown server id with 404 rather than
/// 500. `Cluster`'s config methods phrase that failure consistently as
/// "unknown server {id}", which is what we key off here.
fn config_response(result: ActionResult) -> Response {
    if result.success {
        match result.data {
            Some(data) => axum::Json(data).into_response(),
            None => result.message.into_response(),
        }
    } else if result.message.starts_with("unknown server") {
        (StatusCode::NOT_FOUND, result.message).into_response()
    } else {
        (StatusCode::INTERNAL_SERVER_ERROR, result.message).into_response()
    }
}

fn parse_id(id: &str) -> std::result::Result<ServerId, Response> {
    id.parse::<u64>()
        .map(ServerId)
        .map_err(|_| (StatusCode::INTERNAL_SERVER_ERROR, format!("invalid server id {id}")).into_response())
}

async fn cluster_up(State(state): State<Arc<ManagerState>>) -> &'static str {
    if state.cluster.lock().await.is_up() { "True" } else { "False" }
}

async fn cluster_is_dirty(State(state): State<Arc<ManagerState>>) -> &'static str {
    if state.cluster.lock().await.is_dirty() { "True" } else { "False" }
}

async fn cluster_replicas(State(state): State<Arc<ManagerState>>) -> String {
    state.cluster.lock().await.replicas.to_string()
}

async fn cluster_running_servers(State(state): State<Arc<ManagerState>>) -> axum::Json<Vec<(ServerId, IpAddress)>> {
    axum::Json(state.cluster.lock().await.running_servers())
}

async fn cluster_host_ip(State(state): State<Arc<ManagerState>>, Path(id): Path<String>) -> Response {
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match state.cluster.lock().await.host_ip(id) {
        Some(ip) => ip.to_string().into_response(),
        None => (StatusCode::INTERNAL_SERVER_ERROR, format!("unknown server {id}")).into_response(),
    }
}

async fn cluster_host_id(State(state): State<Arc<ManagerState>>, Path(id): Path<String>) -> Response {
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match state.cluster.lock().await.host_id(id) {
        Some(host_id) => host_id.to_string().into_response(),
        None => (StatusCode::INTERNAL_SERVER_ERROR, format!("unknown server {id}")).into_response(),
    }
}

async fn cluster_before_test(State(state): State<Arc<ManagerState>>, Path(name): Path<String>) -> Response {
    let mut cluster = state.cluster.lock().await;
    cluster.take_log_savepoint();
    match cluster.before_test(&name).await {
        Ok(description) => description.into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

async fn cluster_after_test(State(state): State<Arc<ManagerState>>, Path(success): Path<String>) -> Response {
    let success = match success.as_str() {
        "True" => true,
        "False" => false,
        other => {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("after-test success must be literally True or False, got {other}"),
            )
                .into_response();
        }
    };
    match state.cluster.lock().await.after_test("test", success).await {
        Ok(()) => "OK".into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

async fn cluster_mark_dirty(State(state): State<Arc<ManagerState>>) -> &'static str {
    state.cluster.lock().await.mark_dirty_forced();
    "OK"
}

async fn server_stop(State(state): State<Arc<ManagerState>>, Path(id): Path<String>) -> Response {
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    mutation_response(state.cluster.lock().await.server_stop(id, false).await)
}

async fn server_stop_gracefully(State(state): State<Arc<ManagerState>>, Path(id): Path<String>) -> Response {
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    mutation_response(state.cluster.lock().await.server_stop(id, true).await)
}

#[derive(Deserialize, Default)]
struct StartQuery {
    expected_error: Option<String>,
}

async fn server_start(
    State(state): State<Arc<ManagerState>>,
    Path(id): Path<String>,
    axum::extract::Query(query): axum::extract::Query<StartQuery>,
) -> Response {
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    mutation_response(
        state
            .cluster
            .lock()
            .await
            .server_start(id, query.expected_error.as_deref())
            .await,
    )
}

async fn server_restart(State(state): State<Arc<ManagerState>>, Path(id): Path<String>) -> Response {
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    mutation_response(state.cluster.lock().await.server_restart(id).await)
}

async fn server_pause(State(state): State<Arc<ManagerState>>, Path(id): Path<String>) -> Response {
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    mutation_response(state.cluster.lock().await.server_pause(id))
}

async fn server_unpause(State(state): State<Arc<ManagerState>>, Path(id): Path<String>) -> Response {
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    mutation_response(state.cluster.lock().await.server_unpause(id))
}

#[derive(Deserialize, Default)]
struct AddServerRequest {
    replace_cfg: Option<ReplaceConfig>,
    #[serde(default)]
    cmdline: Vec<String>,
    #[serde(default)]
    config: std::collections::BTreeMap<String, serde_yaml::Value>,
    #[serde(default = "default_true")]
    start: bool,
}

fn default_true() -> bool {
    true
}

async fn cluster_add_server(
    State(state): State<Arc<ManagerState>>,
    axum::extract::Json(body): axum::extract::Json<AddServerRequest>,
) -> Response {
    let opts = AddServerOptions {
        replace_cfg: body.replace_cfg,
        cmdline: body.cmdline,
        config: body.config,
        start: body.start,
    };
    match state.cluster.lock().await.add_server(opts).await {
        Ok((id, ip)) => axum::Json(serde_json::json!({"server_id": id, "ip_addr": ip.to_string()})).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

#[derive(Deserialize)]
struct RemoveNodeRequest {
    server_id: ServerId,
    #[serde(default)]
    ignore_dead: Vec<Ipv4Addr>,
}

async fn cluster_remove_node(
    State(state): State<Arc<ManagerState>>,
    Path(initiator): Path<String>,
    axum::extract::Json(body): axum::extract::Json<RemoveNodeRequest>,
) -> Response {
    let initiator = match parse_id(&initiator) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    mutation_response(
        state
            .cluster
            .lock()
            .await
            .remove_node(initiator, body.server_id, body.ignore_dead)
            .await,
    )
}

async fn cluster_decommission_node(State(state): State<Arc<ManagerState>>, Path(id): Path<String>) -> Response {
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    mutation_response(state.cluster.lock().await.decommission_node(id).await)
}

async fn server_get_config(State(state): State<Arc<ManagerState>>, Path(id): Path<String>) -> Response {
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    config_response(state.cluster.lock().await.get_config(id))
}

#[derive(Deserialize)]
struct UpdateConfigRequest {
    key: String,
    value: serde_json::Value,
}

async fn server_update_config(
    State(state): State<Arc<ManagerState>>,
    Path(id): Path<String>,
    axum::extract::Json(body): axum::extract::Json<UpdateConfigRequest>,
) -> Response {
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    config_response(state.cluster.lock().await.update_config(id, &body.key, body.value))
}

async fn server_change_ip(State(state): State<Arc<ManagerState>>, Path(id): Path<String>) -> Response {
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    config_response(state.cluster.lock().await.change_ip(id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admin_client::{AdminApi, HostIdProbe};
    use crate::cluster::ClusterDeps;
    use crate::host_registry::HostRegistry;
    use crate::ids::{HostId, ServerIdGenerator};
    use crate::query_probe::{CqlUpState, QueryProbe};
    use crate::schema_probe::NullSchemaProbe;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{Method, Request};
    use std::path::PathBuf;
    use tower::ServiceExt;

    struct ImmediateAdmin;

    #[async_trait]
    impl AdminApi for ImmediateAdmin {
        async fn get_host_id(&self, ip: IpAddress) -> std::result::Result<HostIdProbe, crate::error::AdminApiError> {
            Ok(HostIdProbe::Ready(HostId(format!("host-{ip}"))))
        }
        async fn remove_node(
            &self,
            _initiator: IpAddress,
            _target: &HostId,
            _ignore_dead: &[IpAddress],
            _timeout: std::time::Duration,
        ) -> std::result::Result<(), crate::error::AdminApiError> {
            Ok(())
        }
        async fn decommission_node(
            &self,
            _ip: IpAddress,
            _timeout: std::time::Duration,
        ) -> std::result::Result<(), crate::error::AdminApiError> {
            Ok(())
        }
    }

    struct ImmediateQuery;

    #[async_trait]
    impl QueryProbe for ImmediateQuery {
        async fn probe(&self, _ip: IpAddress, _port: u16, _timeout: std::time::Duration) -> CqlUpState {
            CqlUpState::Queried
        }
    }

    fn deps(vardir: &std::path::Path) -> ClusterDeps {
        ClusterDeps {
            host_registry: Arc::new(HostRegistry::with_range(40, 250)),
            id_generator: Arc::new(ServerIdGenerator::new()),
            admin: Arc::new(ImmediateAdmin),
            query_probe: Arc::new(ImmediateQuery),
            schema_probe: Arc::new(NullSchemaProbe),
            executable: PathBuf::from("/bin/true"),
            vardir: vardir.to_path_buf(),
        }
    }

    async fn router_with_cluster(replicas: usize, dir: &std::path::Path) -> Router {
        let mut cluster = Cluster::new(replicas, deps(dir));
        cluster.install_and_start().await.unwrap();
        let state = Arc::new(ManagerState {
            cluster: Mutex::new(cluster),
        });
        build_router(state)
    }

    fn request(method: Method, uri: &str, body: Body) -> Request<Body> {
        Request::builder().method(method).uri(uri).body(body).unwrap()
    }

    fn json_request(method: Method, uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_string(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn cluster_up_reports_true_once_replicas_are_running() {
        let dir = tempfile::tempdir().unwrap();
        let router = router_with_cluster(2, dir.path()).await;
        let response = router
            .oneshot(request(Method::GET, "/cluster/up", Body::empty()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_string(response).await, "True");
    }

    #[tokio::test]
    async fn running_servers_lists_every_provisioned_replica() {
        let dir = tempfile::tempdir().unwrap();
        let router = router_with_cluster(3, dir.path()).await;
        let response = router
            .oneshot(request(Method::GET, "/cluster/running-servers", Body::empty()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_string(response).await;
        let servers: Vec<(ServerId, IpAddress)> = serde_json::from_str(&body).unwrap();
        assert_eq!(servers.len(), 3);
    }

    #[tokio::test]
    async fn addserver_with_start_false_does_not_appear_in_running_servers() {
        let dir = tempfile::tempdir().unwrap();
        let router = router_with_cluster(1, dir.path()).await;
        let response = router
            .clone()
            .oneshot(json_request(
                Method::PUT,
                "/cluster/addserver",
                serde_json::json!({"start": false}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = router
            .oneshot(request(Method::GET, "/cluster/running-servers", Body::empty()))
            .await
            .unwrap();
        let servers: Vec<(ServerId, IpAddress)> =
            serde_json::from_str(&body_string(response).await).unwrap();
        assert_eq!(servers.len(), 1, "the stopped addserver result must not show up as running");
    }

    #[tokio::test]
    async fn get_config_for_unknown_server_is_404() {
        let dir = tempfile::tempdir().unwrap();
        let router = router_with_cluster(1, dir.path()).await;
        let response = router
            .oneshot(request(Method::GET, "/cluster/server/999/get_config", Body::empty()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn server_stop_for_unknown_server_is_500_not_404() {
        let dir = tempfile::tempdir().unwrap();
        let router = router_with_cluster(1, dir.path()).await;
        let response = router
            .oneshot(request(Method::GET, "/cluster/server/999/stop", Body::empty()))
            .await
            .unwrap();
        assert_eq!(
            response.status(),
            StatusCode::INTERNAL_SERVER_ERROR,
            "control routes report unknown ids as 500, not 404"
        );
    }

    #[tokio::test]
    async fn update_config_then_get_config_round_trips_over_http() {
        let dir = tempfile::tempdir().unwrap();
        let router = router_with_cluster(1, dir.path()).await;
        let response = router
            .clone()
            .oneshot(request(Method::GET, "/cluster/running-servers", Body::empty()))
            .await
            .unwrap();
        let servers: Vec<(ServerId, IpAddress)> =
            serde_json::from_str(&body_string(response).await).unwrap();
        let id = servers[0].0;

        let response = router
            .clone()
            .oneshot(json_request(
                Method::PUT,
                &format!("/cluster/server/{id}/update_config"),
                serde_json::json!({"key": "num_tokens", "value": 32}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = router
            .clone()
            .oneshot(request(
                Method::GET,
                &format!("/cluster/server/{id}/get_config"),
                Body::empty(),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let config: serde_json::Value = serde_json::from_str(&body_string(response).await).unwrap();
        assert_eq!(config["num_tokens"], serde_json::json!(32));

        let response = router
            .oneshot(request(Method::GET, "/cluster/is-dirty", Body::empty()))
            .await
            .unwrap();
        assert_eq!(body_string(response).await, "True", "a config update dirties the cluster");
    }

    #[tokio::test]
    async fn after_test_with_literal_true_runs_the_hook() {
        let dir = tempfile::tempdir().unwrap();
        let router = router_with_cluster(1, dir.path()).await;
        let response = router
            .oneshot(request(Method::GET, "/cluster/after-test/True", Body::empty()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn after_test_with_anything_other_than_true_or_false_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let router = router_with_cluster(1, dir.path()).await;
        let response = router
            .oneshot(request(Method::GET, "/cluster/after-test/maybe", Body::empty()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
