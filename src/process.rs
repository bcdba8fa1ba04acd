//! Lifecycle of the framework server subprocess.
//!
//! [`ServerHandle`] is an explicit value owned by the out-of-process backend.
//! Start, restart and stop are serialized by a `tokio::sync::Mutex` around
//! the child process slot, so concurrent callers never race to spawn.
//!
//! ```text
//! stopped ──start──▶ starting ──/health 200──▶ healthy ──requests──▶ serving
//!    ▲                   │ deadline elapsed
//!    └───────kill────────┴──────────────▶ ServerUnhealthy
//! ```
//!
//! Without a configured `command` the handle attaches to an externally
//! managed server: it only polls health and never spawns or kills.
//!
//! The pid of a spawned server is recorded in `{work_dir}/framework.pid`,
//! so a later `spx` process can terminate a server an earlier one started.
//! A managed start fails if any other server keeps answering on the port.

use serde::Serialize;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::config::FrameworkConfig;
use crate::error::{RagError, RagResult};

/// Server output is appended here, under the work dir.
pub const STARTUP_LOG: &str = "server_startup.log";

/// Pid of the last server this crate spawned, under the work dir.
pub const PID_FILE: &str = "framework.pid";

#[derive(Debug, Clone, Serialize)]
pub struct ServerStatus {
    pub url: String,
    pub healthy: bool,
    /// Whether this handle spawns the server (a `command` is configured).
    pub managed: bool,
    /// Process id of the child this handle spawned, if still tracked.
    pub pid: Option<u32>,
    pub log_path: String,
}

pub struct ServerHandle {
    config: FrameworkConfig,
    work_dir: PathBuf,
    client: reqwest::Client,
    child: Mutex<Option<Child>>,
}

impl ServerHandle {
    pub fn new(config: &FrameworkConfig, work_dir: PathBuf) -> Self {
        Self {
            config: config.clone(),
            work_dir,
            client: reqwest::Client::new(),
            child: Mutex::new(None),
        }
    }

    pub fn url(&self) -> &str {
        self.config.url.trim_end_matches('/')
    }

    pub fn log_path(&self) -> PathBuf {
        self.work_dir.join(STARTUP_LOG)
    }

    pub fn pid_path(&self) -> PathBuf {
        self.work_dir.join(PID_FILE)
    }

    fn recorded_pid(&self) -> Option<u32> {
        std::fs::read_to_string(self.pid_path())
            .ok()
            .and_then(|s| s.trim().parse().ok())
    }

    fn forget_pid(&self) {
        if let Err(e) = std::fs::remove_file(self.pid_path()) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(error = %e, "could not remove pid file");
            }
        }
    }

    pub fn is_managed(&self) -> bool {
        self.config.command.as_ref().is_some_and(|c| !c.is_empty())
    }

    /// `GET /health` answered 200 within the per-call timeout.
    pub async fn is_healthy(&self) -> bool {
        let resp = self
            .client
            .get(format!("{}/health", self.url()))
            .timeout(Duration::from_millis(self.config.health_timeout_ms))
            .send()
            .await;
        matches!(resp, Ok(r) if r.status().is_success())
    }

    /// Kill whatever is serving and start a fresh server with `env`.
    pub async fn start(&self, env: &[(String, String)]) -> RagResult<()> {
        let mut slot = self.child.lock().await;
        self.start_locked(&mut slot, env).await
    }

    /// Start the server only if it is not healthy. Returns whether a start
    /// happened.
    pub async fn ensure_running(&self, env: &[(String, String)]) -> RagResult<bool> {
        let mut slot = self.child.lock().await;
        if self.is_healthy().await {
            return Ok(false);
        }
        tracing::info!(url = self.url(), "framework server not healthy; starting");
        self.start_locked(&mut slot, env).await?;
        Ok(true)
    }

    /// Force-stop the server. Returns whether anything was stopped.
    pub async fn stop(&self) -> RagResult<bool> {
        let mut slot = self.child.lock().await;
        self.kill_locked("stop", &mut slot).await
    }

    pub async fn status(&self) -> ServerStatus {
        let pid = {
            let mut slot = self.child.lock().await;
            // Forget a child that already exited
            if let Some(child) = slot.as_mut() {
                if matches!(child.try_wait(), Ok(Some(_))) {
                    *slot = None;
                }
            }
            slot.as_ref().and_then(|c| c.id())
        };
        ServerStatus {
            url: self.url().to_string(),
            healthy: self.is_healthy().await,
            managed: self.is_managed(),
            pid,
            log_path: self.log_path().display().to_string(),
        }
    }

    async fn start_locked(&self, slot: &mut Option<Child>, env: &[(String, String)]) -> RagResult<()> {
        let argv = match self.config.command.as_ref().filter(|c| !c.is_empty()) {
            Some(argv) => argv,
            None => {
                tracing::info!(url = self.url(), "no framework command configured; waiting for external server");
                return self.wait_healthy("start", slot).await;
            }
        };

        self.kill_locked("start", slot).await?;

        std::fs::create_dir_all(&self.work_dir)?;
        let log = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.log_path())?;
        let log_err = log.try_clone()?;

        let mut cmd = Command::new(&argv[0]);
        cmd.args(&argv[1..])
            .env(&self.config.app_module_env, &self.config.app_module)
            .current_dir(&self.work_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err));
        for (key, value) in env {
            cmd.env(key, value);
        }

        let child = cmd
            .spawn()
            .map_err(|e| RagError::resource("start", format!("failed to spawn '{}': {}", argv[0], e)))?;
        tracing::info!(
            pid = child.id(),
            command = %argv.join(" "),
            log = %self.log_path().display(),
            "spawned framework server"
        );
        if let Some(pid) = child.id() {
            std::fs::write(self.pid_path(), pid.to_string())?;
        }
        *slot = Some(child);

        self.wait_healthy("start", slot).await
    }

    /// Poll `/health` every `poll_interval_ms` until the startup deadline.
    async fn wait_healthy(&self, operation: &str, slot: &mut Option<Child>) -> RagResult<()> {
        let timeout = Duration::from_secs(self.config.startup_timeout_secs);
        let interval = Duration::from_millis(self.config.poll_interval_ms);
        let deadline = Instant::now() + timeout;

        loop {
            // An exited child fails the start even if something answers
            if let Some(child) = slot.as_mut() {
                if let Ok(Some(exit)) = child.try_wait() {
                    *slot = None;
                    self.forget_pid();
                    return Err(RagError::resource(
                        operation,
                        format!(
                            "framework server exited during startup ({}); see {}",
                            exit,
                            self.log_path().display()
                        ),
                    ));
                }
            }

            if self.is_healthy().await {
                tracing::info!(url = self.url(), "framework server healthy");
                return Ok(());
            }

            if Instant::now() + interval > deadline {
                break;
            }
            tokio::time::sleep(interval).await;
        }

        tracing::error!(
            url = self.url(),
            timeout_secs = self.config.startup_timeout_secs,
            "framework server did not become healthy"
        );
        Err(RagError::ServerUnhealthy {
            operation: operation.to_string(),
            timeout_secs: self.config.startup_timeout_secs,
        })
    }

    /// Kill our own child, or the server an earlier process recorded in the
    /// pid file; otherwise fall back to the kill pattern. In managed mode a
    /// server that still answers afterwards is an error.
    async fn kill_locked(&self, operation: &str, slot: &mut Option<Child>) -> RagResult<bool> {
        let mut killed = false;
        if let Some(mut child) = slot.take() {
            let pid = child.id();
            match child.kill().await {
                Ok(()) => tracing::info!(?pid, "killed framework server"),
                Err(e) => tracing::warn!(?pid, error = %e, "failed to kill framework server"),
            }
            self.forget_pid();
            killed = true;
        } else if let Some(pid) = self.recorded_pid() {
            let status = Command::new("kill")
                .args(["-9", &pid.to_string()])
                .output()
                .await
                .map_err(|e| RagError::resource(operation, format!("failed to run kill: {}", e)))?
                .status;
            tracing::info!(pid, %status, "killed recorded framework server");
            self.forget_pid();
            killed = status.success();
        }

        if !self.is_healthy().await {
            return Ok(killed);
        }
        if killed {
            self.wait_down().await;
            if !self.is_healthy().await {
                return Ok(true);
            }
        }

        if !self.is_managed() {
            tracing::warn!(url = self.url(), "a server is answering but is not managed by this handle; left running");
            return Ok(killed);
        }

        if let Some(pattern) = &self.config.kill_pattern {
            let output = Command::new("pkill")
                .args(["-9", "-f", pattern])
                .output()
                .await
                .map_err(|e| RagError::resource(operation, format!("failed to run pkill: {}", e)))?;
            tracing::info!(pattern = %pattern, status = %output.status, "killed foreign framework server");
            self.wait_down().await;
            if !self.is_healthy().await {
                return Ok(true);
            }
        }

        tracing::error!(url = self.url(), "a server this handle did not start keeps answering");
        Err(RagError::resource(
            operation,
            format!(
                "a server not started by spx is answering at {}; stop it or set framework.kill_pattern",
                self.url()
            ),
        ))
    }

    /// Wait (bounded by the startup timeout) for the port to stop answering.
    async fn wait_down(&self) {
        let deadline = Instant::now() + Duration::from_secs(self.config.startup_timeout_secs);
        let interval = Duration::from_millis(self.config.poll_interval_ms);
        while Instant::now() < deadline && self.is_healthy().await {
            tokio::time::sleep(interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn config(url: &str, command: Option<Vec<String>>) -> FrameworkConfig {
        FrameworkConfig {
            url: url.to_string(),
            command,
            startup_timeout_secs: 1,
            poll_interval_ms: 100,
            health_timeout_ms: 100,
            ..FrameworkConfig::default()
        }
    }

    #[tokio::test]
    async fn test_attach_mode_times_out_when_nothing_listens() {
        let tmp = TempDir::new().unwrap();
        // Port 9 (discard) is not an HTTP server on test machines
        let handle = ServerHandle::new(&config("http://127.0.0.1:9", None), tmp.path().to_path_buf());
        assert!(!handle.is_managed());
        let err = handle.start(&[]).await.unwrap_err();
        assert_eq!(err.code(), "server_unhealthy");
        assert!(err.to_string().contains("1s"));
    }

    #[tokio::test]
    async fn test_spawned_process_that_exits_is_reported() {
        let tmp = TempDir::new().unwrap();
        let handle = ServerHandle::new(
            &config("http://127.0.0.1:9", Some(vec!["true".to_string()])),
            tmp.path().to_path_buf(),
        );
        let err = handle.start(&[]).await.unwrap_err();
        assert!(matches!(
            err.code(),
            "resource" | "server_unhealthy"
        ));
        assert!(tmp.path().join(STARTUP_LOG).exists());
    }

    async fn serve_health() -> (String, tokio::task::JoinHandle<()>) {
        let app = axum::Router::new().route("/health", axum::routing::get(|| async { "ok" }));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let task = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{}", addr), task)
    }

    #[tokio::test]
    async fn test_managed_start_refuses_server_it_cannot_stop() {
        let (url, task) = serve_health().await;
        let tmp = TempDir::new().unwrap();
        let handle = ServerHandle::new(
            &config(&url, Some(vec!["false".to_string()])),
            tmp.path().to_path_buf(),
        );
        assert!(handle.is_healthy().await);

        let err = handle.start(&[]).await.unwrap_err();
        assert_eq!(err.code(), "resource");
        assert_eq!(err.to_json()["error"]["operation"], "start");
        assert!(err.to_string().contains("kill_pattern"));
        task.abort();
    }

    #[tokio::test]
    async fn test_attach_mode_accepts_running_server() {
        let (url, task) = serve_health().await;
        let tmp = TempDir::new().unwrap();
        let handle = ServerHandle::new(&config(&url, None), tmp.path().to_path_buf());
        handle.start(&[]).await.unwrap();
        assert!(!handle.stop().await.unwrap());
        task.abort();
    }

    #[tokio::test]
    async fn test_stop_kills_server_recorded_by_earlier_process() {
        let tmp = TempDir::new().unwrap();
        let mut old = std::process::Command::new("sleep").arg("30").spawn().unwrap();
        std::fs::write(tmp.path().join(PID_FILE), old.id().to_string()).unwrap();

        let handle = ServerHandle::new(
            &config("http://127.0.0.1:9", Some(vec!["sleep".to_string(), "30".to_string()])),
            tmp.path().to_path_buf(),
        );
        assert!(handle.stop().await.unwrap());

        let status = old.wait().unwrap();
        assert!(!status.success());
        assert!(!tmp.path().join(PID_FILE).exists());
    }

    #[tokio::test]
    async fn test_stop_without_server_is_noop() {
        let tmp = TempDir::new().unwrap();
        let handle = ServerHandle::new(&config("http://127.0.0.1:9", None), tmp.path().to_path_buf());
        assert!(!handle.stop().await.unwrap());
        let status = handle.status().await;
        assert!(!status.healthy);
        assert!(status.pid.is_none());
    }
}
