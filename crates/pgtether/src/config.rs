//! Connector configuration
//!
//! All target parameters are resolved by the caller before the connector is
//! constructed; the connector core itself never reads environment variables.
//! [`TargetConfig::from_env`] is the one edge helper that applies the CI
//! conventions (in-cluster detection, bearer token) for callers that want
//! them.

use std::env;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Internal node address used when running inside the cluster, where the
/// database is reachable directly through a node port.
pub const IN_CLUSTER_NODE_IP: &str = "10.129.71.49";

/// Node port exposing the database inside the cluster
pub const IN_CLUSTER_NODE_PORT: u16 = 31021;

/// Default cluster API server
pub const DEFAULT_SERVER_URL: &str = "https://api.okd-3dc1.diia.digital:6443";

/// How the database endpoint is reached
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccessMode {
    /// Port-forward a pod's database port to a local port via the cluster CLI
    Tunneled {
        /// Database pod name
        pod: String,
        /// Cluster namespace
        namespace: String,
        /// Database port inside the pod
        remote_port: u16,
    },
    /// Connect straight to a reachable host/port (in-cluster or local database)
    Direct {
        /// Database host
        host: String,
        /// Database port
        port: u16,
    },
}

/// Settings for the cluster CLI and the port-forward tunnel
#[derive(Clone)]
pub struct TunnelSettings {
    /// Path to the cluster CLI executable
    pub cli_path: PathBuf,
    /// Cluster API server URL passed to `login`
    pub server_url: String,
    /// Bearer token passed to `login`
    pub token: String,
    /// Path to the kubeconfig the CLI reads and regenerates
    pub kubeconfig_path: PathBuf,
    /// How long to let the forwarding process settle before checking liveness
    pub settle: Duration,
    /// Local port candidate range (inclusive start, exclusive end)
    pub port_range: (u16, u16),
    /// How many candidate ports to probe before giving up
    pub probe_budget: u32,
}

impl fmt::Debug for TunnelSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TunnelSettings")
            .field("cli_path", &self.cli_path)
            .field("server_url", &self.server_url)
            .field("token", &"***")
            .field("kubeconfig_path", &self.kubeconfig_path)
            .field("settle", &self.settle)
            .field("port_range", &self.port_range)
            .field("probe_budget", &self.probe_budget)
            .finish()
    }
}

impl Default for TunnelSettings {
    fn default() -> Self {
        Self {
            cli_path: default_cli_path(),
            server_url: DEFAULT_SERVER_URL.to_string(),
            token: String::new(),
            kubeconfig_path: default_kubeconfig_path(),
            settle: Duration::from_secs(3),
            port_range: (30000, 40000),
            probe_budget: 100,
        }
    }
}

fn default_cli_path() -> PathBuf {
    if cfg!(target_os = "macos") {
        PathBuf::from("/opt/homebrew/bin/oc")
    } else {
        PathBuf::from("/usr/local/bin/oc")
    }
}

fn default_kubeconfig_path() -> PathBuf {
    match env::var_os("HOME") {
        Some(home) => Path::new(&home).join(".kube").join("config"),
        None => PathBuf::from(".kube/config"),
    }
}

/// Full target description for one connector instance
#[derive(Clone)]
pub struct TargetConfig {
    /// How the endpoint is reached
    pub mode: AccessMode,
    /// Database name
    pub dbname: String,
    /// Database user
    pub user: String,
    /// Database password
    pub password: String,
    /// Retry budget for lifecycle steps (login, forward, connect)
    pub max_retries: u32,
    /// Delay between lifecycle retry attempts
    pub retry_delay: Duration,
    /// Minimum pooled sessions
    pub pool_min: usize,
    /// Maximum pooled sessions
    pub pool_max: usize,
    /// How long a pooled acquisition may wait before failing
    pub pool_acquire_timeout: Duration,
    /// Cluster CLI and tunnel settings (unused in direct mode)
    pub tunnel: TunnelSettings,
}

impl fmt::Debug for TargetConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TargetConfig")
            .field("mode", &self.mode)
            .field("dbname", &self.dbname)
            .field("user", &self.user)
            .field("password", &"***")
            .field("max_retries", &self.max_retries)
            .field("retry_delay", &self.retry_delay)
            .field("pool_min", &self.pool_min)
            .field("pool_max", &self.pool_max)
            .field("pool_acquire_timeout", &self.pool_acquire_timeout)
            .field("tunnel", &self.tunnel)
            .finish()
    }
}

impl TargetConfig {
    /// Create a configuration with the given access mode and credentials
    pub fn new(
        mode: AccessMode,
        dbname: impl Into<String>,
        user: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            mode,
            dbname: dbname.into(),
            user: user.into(),
            password: password.into(),
            max_retries: 5,
            retry_delay: Duration::from_secs(2),
            pool_min: 1,
            pool_max: 10,
            pool_acquire_timeout: Duration::from_secs(30),
            tunnel: TunnelSettings::default(),
        }
    }

    /// Resolve the access mode from the process environment the way CI jobs
    /// expect it: inside the pipeline (`GITLAB_CI=true`) an operational pod is
    /// reachable directly through the node port, otherwise a tunnel is needed.
    /// The bearer token is taken from `OC_SECRET`.
    pub fn from_env(
        pod: impl Into<String>,
        namespace: impl Into<String>,
        remote_port: u16,
        dbname: impl Into<String>,
        user: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        let pod = pod.into();
        let in_ci = env::var("GITLAB_CI").map(|v| v == "true").unwrap_or(false);

        let mode = if in_ci && pod.starts_with("operational") {
            AccessMode::Direct {
                host: IN_CLUSTER_NODE_IP.to_string(),
                port: IN_CLUSTER_NODE_PORT,
            }
        } else {
            AccessMode::Tunneled {
                pod,
                namespace: namespace.into(),
                remote_port,
            }
        };

        let mut config = Self::new(mode, dbname, user, password);
        config.tunnel.token = env::var("OC_SECRET").unwrap_or_default();
        config
    }

    /// Set the lifecycle retry budget
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set the delay between lifecycle retry attempts
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Set pool bounds
    pub fn with_pool_size(mut self, min: usize, max: usize) -> Self {
        self.pool_min = min;
        self.pool_max = max.max(min.max(1));
        self
    }

    /// Set the pooled acquisition timeout
    pub fn with_pool_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.pool_acquire_timeout = timeout;
        self
    }

    /// Replace the tunnel settings
    pub fn with_tunnel(mut self, tunnel: TunnelSettings) -> Self {
        self.tunnel = tunnel;
        self
    }
}
