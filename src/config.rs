use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::proxy::route::{AllowedHostSet, RouteRule};

/// Fixed local port the worker's HTTP service listens on.
pub const WORKER_PORT: u16 = 5001;

/// Line fragment the worker prints once its HTTP service accepts connections.
pub const READY_MARKER: &str = "Running on";

/// How long a command waits for a fresh worker before calling it anyway.
pub const READINESS_TIMEOUT_MS: u64 = 5000;

/// Inactivity after which the worker is stopped (5 minutes).
pub const IDLE_TIMEOUT_MS: u64 = 5 * 60 * 1000;

/// Grace period between the termination request and a forced kill.
pub const STOP_GRACE_MS: u64 = 3000;

/// Default transport timeout for worker and upstream calls.
pub const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Largest inbound body the proxy buffers for forwarding (16 MB).
pub const MAX_PROXY_BODY_BYTES: usize = 16 * 1024 * 1024;

/// Client identifier injected into every forwarded proxy request.
pub const CLIENT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/121.0.0.0 Safari/537.36";

/// Top-level configuration for the desktop shell.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ShellConfig {
    /// Directory bundled resources (the worker entry point) are resolved against.
    pub resource_dir: PathBuf,
    /// Directory holding `settings.json`.
    pub data_dir: PathBuf,
    pub worker: WorkerConfig,
    pub proxy: ProxyConfig,
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            resource_dir: PathBuf::from("."),
            data_dir: dirs::config_dir()
                .map(|dir| dir.join("tomato_desk"))
                .unwrap_or_else(|| PathBuf::from(".tomato_desk")),
            worker: WorkerConfig::default(),
            proxy: ProxyConfig::default(),
        }
    }
}

impl ShellConfig {
    /// Load from a JSON file. A missing file yields the defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config '{}'", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("failed to parse config '{}'", path.display()))
    }
}

/// How the worker process is launched and reached.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Interpreter or executable used to launch the entry point.
    pub program: String,
    /// Worker entry point; relative paths resolve against `resource_dir`.
    pub entry: PathBuf,
    pub args: Vec<String>,
    pub host: String,
    pub port: u16,
    pub ready_marker: String,
    pub readiness_timeout_ms: u64,
    pub idle_timeout_ms: u64,
    pub stop_grace_ms: u64,
    pub request_timeout_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            program: "python".to_string(),
            entry: PathBuf::from("python/main.py"),
            args: Vec::new(),
            host: "127.0.0.1".to_string(),
            port: WORKER_PORT,
            ready_marker: READY_MARKER.to_string(),
            readiness_timeout_ms: READINESS_TIMEOUT_MS,
            idle_timeout_ms: IDLE_TIMEOUT_MS,
            stop_grace_ms: STOP_GRACE_MS,
            request_timeout_secs: REQUEST_TIMEOUT_SECS,
        }
    }
}

impl WorkerConfig {
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    pub fn readiness_timeout(&self) -> Duration {
        Duration::from_millis(self.readiness_timeout_ms)
    }

    pub fn idle_window(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Reverse proxy routing and forwarding settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    pub listen: SocketAddr,
    pub allowed_hosts: AllowedHostSet,
    /// Evaluated in order, first match wins.
    pub routes: Vec<RouteRule>,
    /// Scheme used when the first path segment names the upstream host.
    pub literal_host_scheme: String,
    pub upstream_timeout_secs: u64,
    pub client_user_agent: String,
    pub max_body_bytes: usize,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 8787)),
            allowed_hosts: AllowedHostSet::default(),
            routes: RouteRule::defaults(),
            literal_host_scheme: "https".to_string(),
            upstream_timeout_secs: REQUEST_TIMEOUT_SECS,
            client_user_agent: CLIENT_USER_AGENT.to_string(),
            max_body_bytes: MAX_PROXY_BODY_BYTES,
        }
    }
}

impl ProxyConfig {
    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream_timeout_secs)
    }
}
