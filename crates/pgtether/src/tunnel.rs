//! Cluster CLI tunnel management
//!
//! Brings up a port-forward from a database pod to a free local port using
//! the cluster CLI, in three steps:
//!
//! 1. Validate the kubeconfig; a structurally broken file is moved aside to
//!    `<path>.bak` so the CLI regenerates it on login.
//! 2. `login` against the API server with a bearer token, retried on a fixed
//!    delay.
//! 3. `port-forward` the pod to a freshly probed local port, give the process
//!    a settle period, and check it is still alive. Each retry picks a new
//!    port; a process that died during the settle period has its stderr
//!    logged and the port recorded for the final error.
//!
//! The forwarding child is spawned with `kill_on_drop`, so an aborted
//! activation cannot leak a forwarder.

use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use rand::Rng;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::config::TunnelSettings;
use crate::error::{Error, Result};
use crate::retry::RetryPolicy;

/// A live port-forward subprocess bound to a local port
#[derive(Debug)]
pub struct Tunnel {
    child: Child,
    local_port: u16,
}

impl Tunnel {
    /// Local port the forward is bound to
    #[inline]
    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    /// Whether the forwarding process is still running
    pub fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    /// Terminate the forwarding process and wait for it to exit
    pub async fn terminate(&mut self) -> Result<()> {
        if self.is_alive() {
            self.child.kill().await?;
        }
        self.child.wait().await?;
        Ok(())
    }
}

/// Probe random ports in the configured range until one accepts a local
/// bind. Ports in `exclude` are skipped, so forwarding retries never reuse a
/// port that already failed.
pub fn pick_free_port(settings: &TunnelSettings, exclude: &[u16]) -> Result<u16> {
    let (lo, hi) = settings.port_range;
    let mut rng = rand::thread_rng();
    for _ in 0..settings.probe_budget {
        let port = rng.gen_range(lo..hi);
        if exclude.contains(&port) {
            continue;
        }
        if TcpListener::bind(("127.0.0.1", port)).is_ok() {
            return Ok(port);
        }
    }
    Err(Error::NoFreePort {
        probes: settings.probe_budget,
    })
}

/// Structural validation of the kubeconfig: the file must exist and parse as
/// a YAML mapping. Anything else is treated as corrupt.
pub fn kubeconfig_is_valid(path: &Path) -> bool {
    let Ok(raw) = std::fs::read_to_string(path) else {
        return false;
    };
    matches!(
        serde_yaml::from_str::<serde_yaml::Value>(&raw),
        Ok(serde_yaml::Value::Mapping(_))
    )
}

/// Move a corrupt kubeconfig aside (`<path>.bak`) so the CLI regenerates it
/// on login. The suffix is appended, keeping any existing extension.
fn backup_kubeconfig(path: &Path) -> Result<()> {
    if path.exists() {
        let mut backup = path.as_os_str().to_os_string();
        backup.push(".bak");
        let backup = PathBuf::from(backup);
        std::fs::rename(path, &backup)?;
        info!("backed up corrupt kubeconfig to {}", backup.display());
    }
    Ok(())
}

/// Log in to the cluster, regenerating the kubeconfig if it is corrupt.
/// Retries on a fixed delay; exhaustion maps to [`Error::TunnelAuth`] with
/// the last stderr output.
pub async fn ensure_login(settings: &TunnelSettings, policy: &RetryPolicy) -> Result<()> {
    if !kubeconfig_is_valid(&settings.kubeconfig_path) {
        warn!(
            "kubeconfig {} is missing or corrupt, regenerating via login",
            settings.kubeconfig_path.display()
        );
        backup_kubeconfig(&settings.kubeconfig_path)?;
    }

    let mut last_stderr = String::new();
    for attempt in 1..=policy.max_attempts {
        info!(
            "login attempt {}/{} against {}",
            attempt, policy.max_attempts, settings.server_url
        );
        let output = Command::new(&settings.cli_path)
            .arg("login")
            .arg(format!("--server={}", settings.server_url))
            .arg(format!("--token={}", settings.token))
            .arg("--insecure-skip-tls-verify")
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await?;

        if output.status.success() && kubeconfig_is_valid(&settings.kubeconfig_path) {
            info!("cluster login succeeded");
            return Ok(());
        }

        last_stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        warn!("login attempt {} failed: {}", attempt, last_stderr);
        if attempt < policy.max_attempts {
            tokio::time::sleep(policy.delay_for(attempt)).await;
        }
    }

    Err(Error::TunnelAuth {
        attempts: policy.max_attempts,
        message: last_stderr,
    })
}

/// Start a port-forward from `pod`'s `remote_port` to a fresh local port.
/// Each attempt probes a new port, spawns the forwarder, waits the settle
/// period and checks the process survived it. Exhaustion maps to
/// [`Error::TunnelSetup`] carrying every port that was tried.
pub async fn establish(
    settings: &TunnelSettings,
    pod: &str,
    namespace: &str,
    remote_port: u16,
    policy: &RetryPolicy,
) -> Result<Tunnel> {
    let mut tried_ports = Vec::with_capacity(policy.max_attempts as usize);

    for attempt in 1..=policy.max_attempts {
        let local_port = pick_free_port(settings, &tried_ports)?;
        tried_ports.push(local_port);
        info!(
            "attempt {}/{}: forwarding pod {}:{} to localhost:{}",
            attempt, policy.max_attempts, pod, remote_port, local_port
        );

        let mut child = Command::new(&settings.cli_path)
            .arg("port-forward")
            .arg(format!("pod/{pod}"))
            .arg(format!("{local_port}:{remote_port}"))
            .arg("-n")
            .arg(namespace)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        tokio::time::sleep(settings.settle).await;

        match child.try_wait()? {
            None => {
                debug!("port-forward settled on localhost:{local_port}");
                return Ok(Tunnel { child, local_port });
            }
            Some(status) => {
                let stderr = read_stderr(&mut child).await;
                warn!(
                    "port-forward exited ({}) during settle: {}",
                    status,
                    stderr.trim()
                );
                if attempt < policy.max_attempts {
                    tokio::time::sleep(policy.delay_for(attempt)).await;
                }
            }
        }
    }

    Err(Error::TunnelSetup {
        attempts: policy.max_attempts,
        ports: tried_ports,
    })
}

async fn read_stderr(child: &mut Child) -> String {
    let mut buf = String::new();
    if let Some(mut stderr) = child.stderr.take() {
        let _ = stderr.read_to_string(&mut buf).await;
    }
    buf
}
