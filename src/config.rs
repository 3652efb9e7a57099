//! TOML configuration for the operator.
//!
//! Layered the same way everywhere: compiled-in defaults, then a config file
//! (path from `CERTSUITE_OPERATOR_CONFIG`, or the system location), then a
//! few environment overrides.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::controller::status::RetryPolicy;

/// Environment variable naming a config file to load.
pub const CONFIG_ENV_VAR: &str = "CERTSUITE_OPERATOR_CONFIG";
/// Environment variable carrying the harvester image reference.
pub const SIDECAR_IMAGE_ENV_VAR: &str = "SIDECAR_APP_IMG";

const SYSTEM_CONFIG_PATH: &str = "/etc/certsuite-operator/operator.toml";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OperatorConfig {
    #[serde(default)]
    pub controller: ControllerConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub cluster: ClusterConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl OperatorConfig {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        info!(path = %path.display(), "loaded operator configuration");
        Ok(config)
    }

    /// Try, in order: the file named by `CERTSUITE_OPERATOR_CONFIG`, the
    /// system location, compiled-in defaults. Environment overrides are
    /// applied on top.
    pub fn load_or_default() -> Self {
        let mut config = Self::load_file_or_default();
        config.apply_env();
        config
    }

    fn load_file_or_default() -> Self {
        if let Ok(env_path) = std::env::var(CONFIG_ENV_VAR) {
            let path = Path::new(&env_path);
            match Self::load(path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "CERTSUITE_OPERATOR_CONFIG set but file could not be loaded, trying fallback"
                    );
                }
            }
        }

        let system_path = Path::new(SYSTEM_CONFIG_PATH);
        if system_path.exists() {
            match Self::load(system_path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %system_path.display(),
                        error = %e,
                        "system config file exists but could not be loaded, using defaults"
                    );
                }
            }
        }

        debug!("no config file found, using compiled-in defaults");
        Self::default()
    }

    /// Apply environment overrides.
    pub fn apply_env(&mut self) {
        if let Ok(image) = std::env::var(SIDECAR_IMAGE_ENV_VAR) {
            if !image.is_empty() {
                self.controller.sidecar_image = image;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Namespace watched for runs; execution units are created here too.
    pub namespace: String,
    /// Harvester image. Required to serve; usually set via `SIDECAR_APP_IMG`.
    pub sidecar_image: String,
    /// Image of the certification suite itself.
    pub runner_image: String,
    /// Pod status poll interval while a run is in flight.
    pub check_interval_sec: u64,
    /// Timeout used when a run's own timeout is missing or unparsable.
    pub default_timeout_sec: u64,
    /// How often the run list is re-read for new and deleted runs.
    pub resync_interval_sec: u64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            namespace: "cnf-certsuite-operator".to_string(),
            sidecar_image: String::new(),
            runner_image: "quay.io/testnetworkfunction/cnf-certification-test:unstable".to_string(),
            check_interval_sec: 5,
            default_timeout_sec: 3600,
            resync_interval_sec: 5,
        }
    }
}

impl ControllerConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_sec)
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_sec)
    }

    pub fn resync_interval(&self) -> Duration {
        Duration::from_secs(self.resync_interval_sec.max(1))
    }
}

// ---------------------------------------------------------------------------
// Retry
// ---------------------------------------------------------------------------

/// Backoff used when a status write hits a conflict.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts, including the first.
    pub steps: u32,
    pub initial_delay_ms: u64,
    pub factor: f64,
    pub max_delay_ms: u64,
    /// Random extra delay, as a fraction of the computed delay.
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            steps: 5,
            initial_delay_ms: 10,
            factor: 2.0,
            max_delay_ms: 1000,
            jitter: 0.1,
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            steps: self.steps.max(1),
            initial_delay: Duration::from_millis(self.initial_delay_ms),
            factor: self.factor,
            max_delay: Duration::from_millis(self.max_delay_ms),
            jitter: self.jitter,
        }
    }
}

// ---------------------------------------------------------------------------
// Cluster
// ---------------------------------------------------------------------------

/// How to reach the API server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// API server base URL; the in-cluster service address when unset.
    pub api_server: Option<String>,
    pub token_path: PathBuf,
    pub ca_cert_path: PathBuf,
    pub request_timeout_sec: u64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            api_server: None,
            token_path: PathBuf::from("/var/run/secrets/kubernetes.io/serviceaccount/token"),
            ca_cert_path: PathBuf::from("/var/run/secrets/kubernetes.io/serviceaccount/ca.crt"),
            request_timeout_sec: 10,
        }
    }
}

// ---------------------------------------------------------------------------
// HTTP
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    /// Address for the probe and status endpoints.
    pub listen_address: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            listen_address: "0.0.0.0:8081".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Minimum tracing level (`trace`, `debug`, `info`, `warn`, `error`).
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
