//! Owns a single server subprocess: install, start, readiness probe, stop,
//! pause, uninstall, config reload, IP change, log capture.

use crate::admin_client::{AdminApi, HostIdProbe};
use crate::cmdline::{BASELINE_CMDLINE, merge_cmdline_options};
use crate::config::{self, ConfigMap};
use crate::error::{HarnessError, Result};
use crate::ids::{HostId, IpAddress, ServerId};
use crate::query_probe::{CqlUpState, QueryProbe};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::{Child, Command};
use tracing::warn;

/// Topology-wide deadline for the readiness loop.
pub const TOPOLOGY_TIMEOUT: Duration = Duration::from_secs(1000);
/// Escalation deadline for a graceful stop before falling back to kill.
pub const STOP_TIMEOUT: Duration = Duration::from_secs(60);
const POLL_INTERVAL: Duration = Duration::from_millis(100);
const QUERY_PORT: u16 = 9042;

/// Where a [`Server`] sits in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerLifecycle {
    Uninstalled,
    Installed,
    Running,
    Ready,
    Stopped,
}

/// Owns one server subprocess and everything needed to supervise it.
pub struct Server {
    pub id: ServerId,
    pub executable: PathBuf,
    pub workdir: PathBuf,
    pub log_path: PathBuf,
    pub seeds: Vec<IpAddress>,
    pub ip: IpAddress,
    pub cluster_name: String,
    pub config: ConfigMap,
    pub cmdline: Vec<String>,
    pub host_id: Option<HostId>,
    lifecycle: ServerLifecycle,
    child: Option<Child>,
    log_savepoint: u64,
    control_connected: bool,
}

impl Server {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: ServerId,
        executable: PathBuf,
        vardir: &std::path::Path,
        ip: IpAddress,
        seeds: Vec<IpAddress>,
        cluster_name: String,
        config_overlay: ConfigMap,
        cmdline_overlay: Vec<String>,
    ) -> Self {
        let workdir = vardir.join(format!("scylla-{id}"));
        let log_path = vardir.join(format!("scylla-{id}.log"));
        let mut config = config::baseline_config(&workdir, ip, &seeds, &cluster_name);
        config::apply_overlay(&mut config, config_overlay);
        let baseline: Vec<String> = BASELINE_CMDLINE.iter().map(|s| s.to_string()).collect();
        let cmdline = merge_cmdline_options(&baseline, &cmdline_overlay);

        Self {
            id,
            executable,
            workdir,
            log_path,
            seeds,
            ip,
            cluster_name,
            config,
            cmdline,
            host_id: None,
            lifecycle: ServerLifecycle::Uninstalled,
            child: None,
            log_savepoint: 0,
            control_connected: false,
        }
    }

    pub fn is_running(&self) -> bool {
        self.child.is_some()
    }

    pub fn lifecycle(&self) -> ServerLifecycle {
        self.lifecycle
    }

    /// Invariant: a server with no subprocess has no control connection.
    pub fn has_control_connection(&self) -> bool {
        self.is_running() && self.control_connected
    }

    fn config_file_path(&self) -> PathBuf {
        self.workdir.join("conf").join("scylla.yaml")
    }

    /// Creates the work directory (purging stale contents), writes the
    /// config, and opens the log file for append. Rolls back on failure.
    pub fn install(&mut self) -> Result<()> {
        let result = self.install_inner();
        if result.is_err() {
            let _ = std::fs::remove_dir_all(&self.workdir);
            let _ = std::fs::remove_file(&self.log_path);
        }
        result
    }

    fn install_inner(&mut self) -> Result<()> {
        if self.workdir.exists() {
            std::fs::remove_dir_all(&self.workdir)?;
        }
        std::fs::create_dir_all(self.workdir.join("conf"))?;
        self.write_config_file()?;
        // Open (and thereby create) the log file for append; the handle itself
        // isn't retained, the subprocess inherits a fresh fd at start time.
        std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)?;
        self.lifecycle = ServerLifecycle::Installed;
        Ok(())
    }

    fn write_config_file(&self) -> Result<()> {
        let contents = config::to_file_contents(&self.config)?;
        std::fs::write(self.config_file_path(), contents)?;
        Ok(())
    }

    pub fn get_config(&self) -> &ConfigMap {
        &self.config
    }

    /// Mutates the in-memory config, rewrites the file, and signals a reload
    /// if the process is running. Never restarts.
    pub fn update_config(&mut self, key: &str, value: serde_yaml::Value) -> Result<()> {
        self.config.insert(key.to_string(), value);
        self.write_config_file()?;
        if let Some(child) = &self.child {
            if let Some(pid) = child.id() {
                let _ = signal::kill(Pid::from_raw(pid as i32), Signal::SIGHUP);
            }
        }
        Ok(())
    }

    /// Legal only while stopped. Rewrites the address-bearing config keys.
    pub fn change_ip(&mut self, new_ip: IpAddress) -> Result<()> {
        if self.is_running() {
            return Err(HarnessError::Mutation(format!(
                "cannot change ip of running server {}",
                self.id
            )));
        }
        self.ip = new_ip;
        config::set_addresses(&mut self.config, new_ip);
        self.write_config_file()
    }

    /// Spawns the subprocess in its own session with an empty environment,
    /// redirecting stdout/stderr to the log file, then drives the readiness
    /// loop until the topology timeout elapses.
    pub async fn start(
        &mut self,
        admin: &dyn AdminApi,
        probe: &dyn QueryProbe,
        expected_error: Option<&str>,
    ) -> Result<()> {
        self.spawn()?;
        self.lifecycle = ServerLifecycle::Running;

        let deadline = Instant::now() + TOPOLOGY_TIMEOUT;
        loop {
            if Instant::now() >= deadline {
                return Err(self.report_error("failed to start the node, timeout reached", None));
            }

            if let Some(status) = self.child.as_mut().and_then(|c| c.try_wait().ok()).flatten() {
                self.child = None;
                self.lifecycle = ServerLifecycle::Stopped;
                if let Some(expected) = expected_error {
                    if self.log_contains(expected)? {
                        return Ok(());
                    }
                    return Err(self.report_error(
                        &format!("exited with {status}, log did not contain expected error"),
                        expected_error,
                    ));
                }
                return Err(self.report_error(&format!("exited unexpectedly with {status}"), None));
            }

            if self.host_id.is_none() {
                match admin.get_host_id(self.ip).await {
                    Ok(HostIdProbe::Ready(id)) => self.host_id = Some(id),
                    Ok(HostIdProbe::Pending) => {}
                    Err(e) if e.is_fatal() => return Err(HarnessError::AdminApi(e)),
                    Err(_) => {}
                }
            }

            if self.host_id.is_some() {
                let state = probe.probe(self.ip, QUERY_PORT, TOPOLOGY_TIMEOUT).await;
                self.control_connected = matches!(state, CqlUpState::Connected | CqlUpState::Queried);
                if state == CqlUpState::Queried {
                    if expected_error.is_some() {
                        return Err(self.report_error(
                            "server started successfully but an error was expected",
                            expected_error,
                        ));
                    }
                    self.lifecycle = ServerLifecycle::Ready;
                    return Ok(());
                }
            }

            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    fn spawn(&mut self) -> Result<()> {
        let log = std::fs::OpenOptions::new().create(true).append(true).open(&self.log_path)?;
        let log_err = log.try_clone()?;

        let mut cmd = Command::new(&self.executable);
        cmd.current_dir(&self.workdir)
            .args(&self.cmdline)
            .arg("--options-file")
            .arg(self.config_file_path())
            .env_clear()
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err));

        // New session so signals sent to the harness's own group don't reach the child.
        unsafe {
            cmd.pre_exec(|| {
                nix::unistd::setsid().map_err(std::io::Error::from)?;
                Ok(())
            });
        }

        self.child = Some(cmd.spawn()?);
        Ok(())
    }

    fn report_error(&self, reason: &str, expected_error: Option<&str>) -> HarnessError {
        let last_line = self.last_log_line().unwrap_or_else(|_| "<unreadable>".to_string());
        let host_id = self
            .host_id
            .as_ref()
            .map(|h| h.to_string())
            .unwrap_or_else(|| "<missing>".to_string());
        let mut diagnostic = format!(
            "server {} ip={} workdir={} host_id={} reason: {reason}",
            self.id,
            self.ip,
            self.workdir.display(),
            host_id,
        );
        if let Some(expected) = expected_error {
            diagnostic.push_str(&format!(" (expected error: {expected})"));
        }
        diagnostic.push_str(&format!(" last log line: {last_line}"));
        warn!(server_id = self.id.0, "{diagnostic}");
        HarnessError::Startup {
            server_id: self.id.0,
            diagnostic,
        }
    }

    fn last_log_line(&self) -> Result<String> {
        let contents = std::fs::read_to_string(&self.log_path)?;
        Ok(contents.lines().last().unwrap_or_default().to_string())
    }

    fn log_contains(&self, needle: &str) -> Result<bool> {
        let contents = std::fs::read_to_string(&self.log_path)?;
        Ok(contents.contains(needle))
    }

    /// No-op if not running. Kills the subprocess and waits for exit.
    pub async fn stop(&mut self) -> Result<()> {
        self.control_connected = false;
        let Some(mut child) = self.child.take() else {
            return Ok(());
        };
        if let Some(pid) = child.id() {
            let _ = signal::kill(Pid::from_raw(pid as i32), Signal::SIGKILL);
        }
        let _ = child.wait().await;
        self.lifecycle = ServerLifecycle::Stopped;
        Ok(())
    }

    /// Sends a termination signal, waits up to [`STOP_TIMEOUT`], and escalates
    /// to kill if the deadline is exceeded.
    pub async fn stop_gracefully(&mut self) -> Result<()> {
        self.control_connected = false;
        let Some(mut child) = self.child.take() else {
            return Ok(());
        };
        let Some(pid) = child.id() else {
            let _ = child.wait().await;
            self.lifecycle = ServerLifecycle::Stopped;
            return Ok(());
        };
        let _ = signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM);

        let result = tokio::time::timeout(STOP_TIMEOUT, child.wait()).await;
        self.lifecycle = ServerLifecycle::Stopped;
        match result {
            Ok(_) => Ok(()),
            Err(_) => {
                let _ = signal::kill(Pid::from_raw(pid as i32), Signal::SIGKILL);
                let _ = child.wait().await;
                Err(HarnessError::Mutation(format!(
                    "server {} did not stop gracefully within {:?}, escalated to kill",
                    self.id, STOP_TIMEOUT
                )))
            }
        }
    }

    /// Sends SIGSTOP to simulate a frozen node.
    pub fn pause(&self) -> Result<()> {
        self.signal_running(Signal::SIGSTOP)
    }

    /// Sends SIGCONT to resume a paused node.
    pub fn unpause(&self) -> Result<()> {
        self.signal_running(Signal::SIGCONT)
    }

    fn signal_running(&self, sig: Signal) -> Result<()> {
        let pid = self
            .child
            .as_ref()
            .and_then(|c| c.id())
            .ok_or_else(|| HarnessError::Mutation(format!("server {} is not running", self.id)))?;
        signal::kill(Pid::from_raw(pid as i32), sig)
            .map_err(|e| HarnessError::Mutation(e.to_string()))
    }

    /// Records the current log file offset.
    pub fn take_log_savepoint(&mut self) -> Result<()> {
        let meta = std::fs::metadata(&self.log_path)?;
        self.log_savepoint = meta.len();
        Ok(())
    }

    /// Returns the first three lines (boot banner) plus everything from the
    /// savepoint onward. Any read error becomes a diagnostic string rather
    /// than a propagated failure: log reads must never mask a primary failure.
    pub async fn read_log(&self) -> String {
        match self.read_log_inner().await {
            Ok(text) => text,
            Err(e) => format!("<failed to read log for server {}: {e}>", self.id),
        }
    }

    async fn read_log_inner(&self) -> Result<String> {
        let contents = tokio::fs::read_to_string(&self.log_path).await?;
        let banner: String = contents.lines().take(3).collect::<Vec<_>>().join("\n");
        let offset = self.log_savepoint as usize;
        let tail = if offset < contents.len() {
            &contents[offset..]
        } else {
            ""
        };
        Ok(format!("{banner}\n{tail}"))
    }

    /// Appends a marker line to the log, used to delimit before/after-test context.
    pub async fn write_log_marker(&self, msg: &str) -> Result<()> {
        let mut file = tokio::fs::OpenOptions::new()
            .append(true)
            .open(&self.log_path)
            .await?;
        use tokio::io::AsyncWriteExt;
        file.write_all(format!("-- {msg} --\n").as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    /// Removes the work directory and log file. Idempotent.
    pub fn uninstall(&mut self) -> Result<()> {
        match std::fs::remove_dir_all(&self.workdir) {
            Ok(()) => {}
            Err(_) if !self.workdir.exists() => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        match std::fs::remove_file(&self.log_path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.lifecycle = ServerLifecycle::Uninstalled;
        Ok(())
    }
}

impl std::fmt::Display for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Server(id={}, ip={}, workdir={})",
            self.id,
            self.ip,
            self.workdir.display()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admin_client::AdminApi;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct FakeAdmin {
        ready: AtomicBool,
    }

    #[async_trait]
    impl AdminApi for FakeAdmin {
        async fn get_host_id(&self, _ip: IpAddress) -> std::result::Result<HostIdProbe, crate::error::AdminApiError> {
            if self.ready.load(Ordering::SeqCst) {
                Ok(HostIdProbe::Ready(HostId("abc".into())))
            } else {
                Ok(HostIdProbe::Pending)
            }
        }

        async fn remove_node(
            &self,
            _initiator: IpAddress,
            _target: &HostId,
            _ignore_dead: &[IpAddress],
            _timeout: Duration,
        ) -> std::result::Result<(), crate::error::AdminApiError> {
            Ok(())
        }

        async fn decommission_node(&self, _ip: IpAddress, _timeout: Duration) -> std::result::Result<(), crate::error::AdminApiError> {
            Ok(())
        }
    }

    fn test_server(dir: &std::path::Path) -> Server {
        Server::new(
            ServerId(1),
            PathBuf::from("/bin/true"),
            dir,
            std::net::Ipv4Addr::new(127, 0, 0, 2),
            vec![],
            "test-cluster".to_string(),
            ConfigMap::new(),
            vec![],
        )
    }

    #[test]
    fn install_creates_workdir_config_and_log() {
        let dir = tempfile::tempdir().unwrap();
        let mut server = test_server(dir.path());
        server.install().unwrap();
        assert!(server.workdir.join("conf").join("scylla.yaml").exists());
        assert!(server.log_path.exists());
        assert_eq!(server.lifecycle(), ServerLifecycle::Installed);
    }

    #[test]
    fn install_purges_stale_workdir() {
        let dir = tempfile::tempdir().unwrap();
        let mut server = test_server(dir.path());
        std::fs::create_dir_all(&server.workdir).unwrap();
        std::fs::write(server.workdir.join("stale.txt"), "leftover").unwrap();
        server.install().unwrap();
        assert!(!server.workdir.join("stale.txt").exists());
    }

    #[test]
    fn uninstall_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let mut server = test_server(dir.path());
        server.install().unwrap();
        server.uninstall().unwrap();
        assert!(server.uninstall().is_ok());
    }

    #[tokio::test]
    async fn change_ip_fails_while_running() {
        let dir = tempfile::tempdir().unwrap();
        let mut server = test_server(dir.path());
        server.install().unwrap();
        server.child = Some(Command::new("sleep").arg("5").spawn().unwrap());
        assert!(server.change_ip(std::net::Ipv4Addr::new(127, 0, 0, 9)).is_err());
    }

    #[tokio::test]
    async fn start_fails_fast_when_executable_is_missing() {
        let dir = tempfile::tempdir().unwrap();
        let mut server = Server::new(
            ServerId(2),
            PathBuf::from("/nonexistent/executable"),
            dir.path(),
            std::net::Ipv4Addr::new(127, 0, 0, 3),
            vec![],
            "c".to_string(),
            ConfigMap::new(),
            vec![],
        );
        server.install().unwrap();
        let admin = FakeAdmin { ready: AtomicBool::new(false) };
        let probe = crate::query_probe::TcpQueryProbe;
        let result = server.start(&admin, &probe, None).await;
        assert!(result.is_err());
    }
}
