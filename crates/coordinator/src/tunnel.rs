//! Port-forward tunnels from the local environment into worker pods.
//!
//! Each tunnel is one `kubectl port-forward` child process, owned by the
//! job that opened it and killed on every exit path (shutdown is
//! idempotent, and the child is also killed on drop). Local ports are
//! derived from the job id so concurrent coordinators sharing one local
//! network namespace do not collide.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use sha1::{Digest, Sha1};
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tracing::{debug, warn};

/// First port of the coordinator's local allocation window.
const PORT_BASE: u16 = 20_000;
/// Size of the allocation window.
const PORT_SPAN: u32 = 10_000;

/// Deterministic local port for a job id.
///
/// Stable across runs and hosts, so a job's tunnel endpoint can be
/// predicted from its token alone.
#[must_use]
pub fn derive_local_port(job_id: &str) -> u16 {
    let digest = Sha1::digest(job_id.as_bytes());
    let n = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
    debug!(job_id = %job_id, digest = %hex::encode(&digest[..4]), "derived local port");
    #[allow(clippy::cast_possible_truncation)]
    let offset = (n % PORT_SPAN) as u16;
    PORT_BASE + offset
}

/// Errors establishing or tearing down a tunnel.
#[derive(Error, Debug)]
pub enum TunnelError {
    /// The forwarding process could not be spawned or inspected.
    #[error("port-forward process error: {0}")]
    Process(#[from] std::io::Error),

    /// The forwarding process exited within the startup grace window.
    #[error("port-forward for {target} exited during startup: {stderr}")]
    StartupFailed { target: String, stderr: String },
}

/// A live local-to-remote forward.
#[async_trait]
pub trait PortForward: Send {
    /// The local port the forward listens on.
    fn local_port(&self) -> u16;

    /// Local HTTP endpoint for the forward.
    fn endpoint(&self) -> String {
        format!("http://localhost:{}", self.local_port())
    }

    /// Terminate the forwarding process. Safe to call repeatedly and on
    /// an already-dead process.
    async fn shutdown(&mut self);
}

/// Opens tunnels to cluster targets.
#[async_trait]
pub trait TunnelFactory: Send + Sync {
    /// Start forwarding `localhost:<local_port>` to `<target>:<remote_port>`,
    /// where `target` is a pod name or a `svc/...` reference.
    async fn open(
        &self,
        target: &str,
        remote_port: u16,
        local_port: u16,
    ) -> Result<Box<dyn PortForward>, TunnelError>;
}

/// [`TunnelFactory`] shelling out to `kubectl port-forward`.
pub struct KubectlTunnelFactory {
    namespace: String,
    grace: Duration,
}

impl KubectlTunnelFactory {
    /// Tunnels into `namespace`, waiting `grace` before concluding that a
    /// forward survived startup.
    #[must_use]
    pub fn new(namespace: impl Into<String>, grace: Duration) -> Self {
        Self {
            namespace: namespace.into(),
            grace,
        }
    }
}

#[async_trait]
impl TunnelFactory for KubectlTunnelFactory {
    async fn open(
        &self,
        target: &str,
        remote_port: u16,
        local_port: u16,
    ) -> Result<Box<dyn PortForward>, TunnelError> {
        let mut child = Command::new("kubectl")
            .args([
                "port-forward",
                "-n",
                &self.namespace,
                target,
                &format!("{local_port}:{remote_port}"),
            ])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        // kubectl exits immediately on a bad target or an occupied local
        // port; give it the grace window before trusting the forward.
        tokio::time::sleep(self.grace).await;

        if let Some(status) = child.try_wait()? {
            let mut stderr = String::new();
            if let Some(mut pipe) = child.stderr.take() {
                let _ = pipe.read_to_string(&mut stderr).await;
            }
            let stderr = if stderr.trim().is_empty() {
                format!("exited with {status}")
            } else {
                stderr.trim().to_string()
            };
            return Err(TunnelError::StartupFailed {
                target: target.to_string(),
                stderr,
            });
        }

        debug!(target = %target, local_port, remote_port, "port-forward established");
        Ok(Box::new(KubectlPortForward {
            child: Some(child),
            local_port,
            target: target.to_string(),
        }))
    }
}

/// Handle on a running `kubectl port-forward` child.
pub struct KubectlPortForward {
    child: Option<Child>,
    local_port: u16,
    target: String,
}

#[async_trait]
impl PortForward for KubectlPortForward {
    fn local_port(&self) -> u16 {
        self.local_port
    }

    async fn shutdown(&mut self) {
        if let Some(mut child) = self.child.take() {
            if let Err(err) = child.kill().await {
                // Already dead; nothing left to release.
                warn!(target = %self.target, error = %err, "port-forward kill failed");
            }
            debug!(target = %self.target, "port-forward terminated");
        }
    }
}
