//! Farm provisioning: cluster, autoscaler, shared store, worker template.
//!
//! Wraps the external cluster tools (`k3d`, `docker`, `kubectl`) as opaque
//! commands, reporting each step and failing fast when one breaks. The
//! farm manifest itself is generated here and streamed to `kubectl apply`
//! through a temp file.

use std::process::Stdio;

use anyhow::{bail, Context, Result};
use coordinator::{FarmConfig, KubectlTunnelFactory, PortForward, TunnelFactory};
use tokio::process::Command;

use crate::ui;

const CLUSTER_NAME: &str = "android-cluster";
const IMAGE_NAME: &str = "android-farm:latest";

/// Brings the farm up and tears it down again on Ctrl-C.
pub struct FarmProvisioner {
    cfg: FarmConfig,
    keda_manifest: String,
    skip_build: bool,
}

impl FarmProvisioner {
    #[must_use]
    pub fn new(cfg: FarmConfig, keda_manifest: String, skip_build: bool) -> Self {
        Self {
            cfg,
            keda_manifest,
            skip_build,
        }
    }

    /// Provision everything, hold the store tunnel open until Ctrl-C,
    /// then tear the cluster down.
    pub async fn up(&self) -> Result<()> {
        self.preflight_cleanup().await;

        if self.skip_build {
            ui::print_info("Skipping image build/import");
        } else {
            run_step("1: Build image", "docker", &["build", "-t", IMAGE_NAME, "."]).await?;
        }
        run_step(
            "2: Create cluster",
            "k3d",
            &["cluster", "create", CLUSTER_NAME],
        )
        .await?;
        if !self.skip_build {
            run_step(
                "3: Import image",
                "k3d",
                &["image", "import", IMAGE_NAME, "-c", CLUSTER_NAME],
            )
            .await?;
        }
        run_step(
            "4: Install autoscaler",
            "kubectl",
            &["apply", "-f", &self.keda_manifest],
        )
        .await?;
        self.apply_farm_manifest().await?;
        run_step(
            "6: Wait for store pod",
            "kubectl",
            &[
                "wait",
                "--for=condition=ready",
                "pod",
                "-l",
                "app=redis",
                "-n",
                &self.cfg.namespace,
                "--timeout=120s",
            ],
        )
        .await?;

        ui::print_step("7: Forward the shared store to localhost");
        let tunnels = KubectlTunnelFactory::new(&self.cfg.namespace, self.cfg.tunnel_grace);
        let mut store_tunnel = tunnels
            .open("svc/redis-service", 6379, 6379)
            .await
            .context("store port-forward failed to start")?;
        ui::print_success("Store reachable at localhost:6379");

        self.print_next_steps();

        tokio::signal::ctrl_c()
            .await
            .context("failed to wait for Ctrl-C")?;
        println!();
        ui::print_info("Shutdown signal received, cleaning up...");

        store_tunnel.shutdown().await;
        run_step(
            "Cleanup: Delete cluster",
            "k3d",
            &["cluster", "delete", CLUSTER_NAME],
        )
        .await?;
        ui::print_success("Cleanup complete");
        Ok(())
    }

    /// Remove a leftover cluster from a previous run, quietly.
    async fn preflight_cleanup(&self) {
        let removed = Command::new("k3d")
            .args(["cluster", "delete", CLUSTER_NAME])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .is_ok_and(|status| status.success());
        if removed {
            ui::print_info("Old cluster found and removed");
        } else {
            ui::print_info("No old cluster found, starting fresh");
        }
    }

    /// Generate the farm manifest and hand it to `kubectl apply`.
    async fn apply_farm_manifest(&self) -> Result<()> {
        let manifest = self.generate_farm_manifest();

        let temp_file = tempfile::NamedTempFile::new().context("failed to create temp file")?;
        std::fs::write(temp_file.path(), manifest).context("failed to write farm manifest")?;

        let path = temp_file
            .path()
            .to_str()
            .context("temp file path is not valid UTF-8")?;
        run_step("5: Apply farm manifest", "kubectl", &["apply", "-f", path]).await
    }

    /// The shared store plus the autoscaled worker template. Worker pods
    /// receive the store location and registry key through their
    /// environment; registering their address against the consumed job
    /// token is the image entrypoint's responsibility.
    fn generate_farm_manifest(&self) -> String {
        format!(
            r"apiVersion: apps/v1
kind: Deployment
metadata:
  name: redis
  namespace: {ns}
  labels:
    app: redis
spec:
  replicas: 1
  selector:
    matchLabels:
      app: redis
  template:
    metadata:
      labels:
        app: redis
    spec:
      containers:
      - name: redis
        image: redis:7-alpine
        ports:
        - containerPort: 6379
---
apiVersion: v1
kind: Service
metadata:
  name: redis-service
  namespace: {ns}
spec:
  selector:
    app: redis
  ports:
  - port: 6379
    targetPort: 6379
---
apiVersion: keda.sh/v1alpha1
kind: ScaledJob
metadata:
  name: android-emulator
  namespace: {ns}
spec:
  jobTargetRef:
    template:
      metadata:
        labels:
          app: android-emulator
      spec:
        restartPolicy: Never
        containers:
        - name: emulator
          image: {image}
          imagePullPolicy: Never
          ports:
          - containerPort: {appium_port}
          - containerPort: {vnc_port}
          env:
          - name: REDIS_HOST
            value: redis-service.{ns}.svc.cluster.local
          - name: JOB_QUEUE
            value: {queue}
          - name: ACTIVE_JOBS_HASH
            value: {registry}
  pollingInterval: 5
  maxReplicaCount: 10
  triggers:
  - type: redis
    metadata:
      address: redis-service.{ns}.svc.cluster.local:6379
      listName: {queue}
      listLength: '1'
",
            ns = self.cfg.namespace,
            image = IMAGE_NAME,
            appium_port = self.cfg.appium_port,
            vnc_port = self.cfg.vnc_port,
            queue = self.cfg.queue_key,
            registry = self.cfg.registry_key,
        )
    }

    fn print_next_steps(&self) {
        println!();
        ui::print_success("Setup complete");
        println!();
        println!("Open other terminals to run:");
        println!(
            "  1. kubectl get pods -n {} -w   (to monitor the farm)",
            self.cfg.namespace
        );
        println!("  2. farm test                     (to create jobs)");
        println!("  3. farm view                     (to watch an emulator)");
        println!();
        println!("Press Ctrl-C in this window to shut the farm down.");
    }
}

/// Run one provisioning command, streaming its output, failing the run if
/// it fails.
async fn run_step(step: &str, program: &str, args: &[&str]) -> Result<()> {
    ui::print_step(&format!("{step}..."));

    let status = Command::new(program).args(args).status().await;

    match status {
        Ok(status) if status.success() => {
            ui::print_success(&format!("{step}: Success"));
            Ok(())
        }
        Ok(status) => bail!("step '{step}' failed: {program} exited with {status}"),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            bail!("command not found: '{program}'. Is it installed and in your PATH?")
        }
        Err(err) => Err(err).context(format!("failed to run '{program}' for step '{step}'")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provisioner() -> FarmProvisioner {
        FarmProvisioner::new(FarmConfig::default(), "keda-2.10.1.yaml".to_string(), false)
    }

    #[test]
    fn manifest_contains_store_and_worker_template() {
        let manifest = provisioner().generate_farm_manifest();
        assert!(manifest.contains("kind: ScaledJob"));
        assert!(manifest.contains("name: redis-service"));
        assert!(manifest.contains("app: android-emulator"));
        assert!(manifest.contains("listName: test_queue"));
        assert!(manifest.contains("ACTIVE_JOBS_HASH"));
    }

    #[test]
    fn manifest_targets_the_configured_namespace() {
        let cfg = FarmConfig {
            namespace: "farm-ns".to_string(),
            ..FarmConfig::default()
        };
        let manifest =
            FarmProvisioner::new(cfg, String::new(), true).generate_farm_manifest();
        assert!(manifest.contains("namespace: farm-ns"));
        assert!(manifest.contains("redis-service.farm-ns.svc.cluster.local"));
    }
}
