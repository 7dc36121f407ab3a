use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct WardenConfig {
    pub server: ServerConfig,
    pub control_plane: ControlPlaneConfig,
    pub worker: WorkerConfig,
    pub stream: StreamConfig,
    pub ports: PortsConfig,
    pub graph: GraphConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub log_level: String,
    /// Upper bound on queued presentation calls while no window is attached.
    pub presentation_queue: usize,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ControlPlaneConfig {
    pub port: u16,
    pub max_body_bytes: usize,
    pub request_timeout_ms: u64,
    pub max_requests_per_second: usize,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct WorkerConfig {
    pub command: String,
    pub args: Vec<String>,
    pub working_dir: Option<String>,
    /// Extra environment for the worker process.
    pub env: BTreeMap<String, String>,
    /// Variable through which the worker is told the port leased for it.
    /// Empty disables the handoff.
    pub port_env: String,
    /// Stdout line prefix the worker prints followed by its bound port.
    pub ready_prefix: String,
    pub startup_timeout_ms: u64,
    pub grace_timeout_ms: u64,
    pub restart_base_delay_ms: u64,
    pub restart_max_delay_ms: u64,
    /// Largest power of two applied to the restart base delay.
    pub restart_exponent_cap: u32,
    pub max_restarts: u32,
    pub healthy_after_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StreamConfig {
    pub host: String,
    pub path: String,
    pub connect_timeout_ms: u64,
    pub reconnect_base_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct PortsConfig {
    pub registry_path: String,
    pub range_start: u16,
    pub range_end: u16,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct GraphConfig {
    /// Capacity of the delta fan-out channel; a consumer further behind resyncs.
    pub broadcast_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            log_level: "info".into(),
            presentation_queue: 256,
        }
    }
}

impl Default for ControlPlaneConfig {
    fn default() -> Self {
        Self {
            port: 3002,
            max_body_bytes: 1024 * 1024,
            request_timeout_ms: 60_000,
            max_requests_per_second: 50,
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            command: "warden-worker".into(),
            args: Vec::new(),
            working_dir: None,
            env: BTreeMap::new(),
            port_env: "WARDEN_PORT".into(),
            ready_prefix: "WARDEN_WORKER_PORT=".into(),
            startup_timeout_ms: 30_000,
            grace_timeout_ms: 5_000,
            restart_base_delay_ms: 1_000,
            restart_max_delay_ms: 30_000,
            restart_exponent_cap: 5,
            max_restarts: 3,
            healthy_after_ms: 10_000,
        }
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            path: "/stream/progress".into(),
            connect_timeout_ms: 5_000,
            reconnect_base_delay_ms: 1_000,
            reconnect_max_delay_ms: 30_000,
        }
    }
}

impl Default for PortsConfig {
    fn default() -> Self {
        let registry_path = default_warden_dir()
            .join("ports.json")
            .to_string_lossy()
            .into_owned();
        Self {
            registry_path,
            range_start: 3100,
            range_end: 3199,
        }
    }
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            broadcast_capacity: 1024,
        }
    }
}

impl WorkerConfig {
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }

    pub fn grace_timeout(&self) -> Duration {
        Duration::from_millis(self.grace_timeout_ms)
    }

    pub fn healthy_after(&self) -> Duration {
        Duration::from_millis(self.healthy_after_ms)
    }
}

/// Returns `~/.warden/`, falling back to the working directory when no home exists.
pub fn default_warden_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".warden")
}

/// Returns the default config file path: `~/.warden/config.toml`
pub fn default_config_path() -> PathBuf {
    default_warden_dir().join("config.toml")
}

impl WardenConfig {
    /// Load config from TOML file (if it exists) then apply env var overrides.
    pub fn load() -> Result<Self> {
        Self::load_from(default_config_path())
    }

    /// Load from a specific path, then apply env var overrides.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut config = if path.exists() {
            let contents =
                std::fs::read_to_string(path).context("failed to read config file")?;
            toml::from_str(&contents).context("failed to parse config TOML")?
        } else {
            info!("no config file at {}, using defaults", path.display());
            WardenConfig::default()
        };

        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Apply environment variable overrides (WARDEN_CONTROL_PORT, WARDEN_LOG_LEVEL,
    /// WARDEN_PORTS_FILE, WARDEN_WORKER_COMMAND).
    fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(val) = std::env::var("WARDEN_CONTROL_PORT") {
            self.control_plane.port = val
                .trim()
                .parse()
                .with_context(|| format!("WARDEN_CONTROL_PORT is not a port: {val}"))?;
        }
        if let Ok(val) = std::env::var("WARDEN_LOG_LEVEL") {
            self.server.log_level = val;
        }
        if let Ok(val) = std::env::var("WARDEN_PORTS_FILE") {
            self.ports.registry_path = val;
        }
        if let Ok(val) = std::env::var("WARDEN_WORKER_COMMAND") {
            self.worker.command = val;
        }
        Ok(())
    }

    /// Resolve the port registry path, expanding `~` if needed.
    pub fn resolved_registry_path(&self) -> PathBuf {
        expand_tilde(&self.ports.registry_path)
    }
}

pub fn expand_tilde(path: &str) -> PathBuf {
    match (path.strip_prefix("~/"), dirs::home_dir()) {
        (Some(rest), Some(home)) => home.join(rest),
        _ => PathBuf::from(path),
    }
}
