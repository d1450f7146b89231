//! Farm configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Settings shared by the coordinator and the operator CLI.
///
/// Defaults mirror the deployed farm: everything lives in the `keda`
/// namespace, the autoscaler watches `test_queue`, and worker pods
/// register themselves in the `active_jobs` hash.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FarmConfig {
    /// Redis connection URL for the shared queue and registry.
    pub store_url: String,
    /// Kubernetes namespace the farm runs in.
    pub namespace: String,
    /// Queue list key observed by the autoscaler.
    pub queue_key: String,
    /// Registry hash key the worker side writes bindings into.
    pub registry_key: String,
    /// Label selector matching emulator worker pods.
    pub pod_selector: String,
    /// Appium port inside each worker pod.
    pub appium_port: u16,
    /// VNC port inside each worker pod (viewer only).
    pub vnc_port: u16,
    /// Binding poll attempts before giving up on a worker.
    pub bind_attempts: u32,
    /// Sleep between binding polls.
    pub bind_interval: Duration,
    /// Readiness probe attempts against the tunneled endpoint.
    pub probe_attempts: u32,
    /// Sleep between readiness probes.
    pub probe_interval: Duration,
    /// Grace period before checking that a port-forward survived startup.
    pub tunnel_grace: Duration,
    /// Delete the worker pod during release. On for test runs; the viewer
    /// and status paths never delete pods.
    pub delete_pod_on_release: bool,
}

impl Default for FarmConfig {
    fn default() -> Self {
        Self {
            store_url: "redis://localhost:6379".to_string(),
            namespace: "keda".to_string(),
            queue_key: "test_queue".to_string(),
            registry_key: "active_jobs".to_string(),
            pod_selector: "app=android-emulator".to_string(),
            appium_port: 4723,
            vnc_port: 6080,
            bind_attempts: 136,
            bind_interval: Duration::from_secs(1),
            probe_attempts: 15,
            probe_interval: Duration::from_secs(2),
            tunnel_grace: Duration::from_secs(3),
            delete_pod_on_release: true,
        }
    }
}
