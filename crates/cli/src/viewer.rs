//! Emulator viewer: list worker pods and tunnel to one pod's VNC port.
//!
//! Read-only listing plus a single tunnel, no coordination semantics:
//! the viewer never touches the queue or registry.

use anyhow::{Context, Result};
use coordinator::{
    FarmConfig, KubePodLocator, KubectlTunnelFactory, PodLocator, PortForward, TunnelFactory,
};
use dialoguer::Select;

use crate::ui;

/// First local port of the viewer's window; each listed pod gets the
/// next one, so several viewers can run side by side.
const VIEW_PORT_BASE: u16 = 6081;

/// Prompt for a running emulator pod and hold a VNC tunnel open to it
/// until Ctrl-C.
pub async fn watch(cfg: &FarmConfig) -> Result<()> {
    ui::print_step("Finding running emulator pods...");

    let client = kube::Client::try_default()
        .await
        .context("failed to create Kubernetes client. Is kubectl configured?")?;
    let locator = KubePodLocator::new(client, &cfg.namespace, cfg.pod_selector.clone());

    let pods = locator
        .list_workers()
        .await
        .context("could not list pods. Is the cluster reachable?")?;
    if pods.is_empty() {
        ui::print_warning("No emulator pods found");
        return Ok(());
    }
    ui::print_success(&format!("Found {} pod(s)", pods.len()));

    let names: Vec<&str> = pods.iter().map(|pod| pod.name.as_str()).collect();
    let choice = Select::new()
        .with_prompt("Select a pod to watch")
        .items(&names)
        .default(0)
        .interact()
        .context("pod selection cancelled")?;

    #[allow(clippy::cast_possible_truncation)]
    let local_port = VIEW_PORT_BASE + choice as u16;
    let selected = names[choice];

    ui::print_step(&format!("Starting VNC viewer for '{selected}'..."));
    let tunnels = KubectlTunnelFactory::new(&cfg.namespace, cfg.tunnel_grace);
    let mut tunnel = tunnels
        .open(selected, cfg.vnc_port, local_port)
        .await
        .context("VNC port-forward failed to start")?;

    ui::print_success(&format!("Open http://localhost:{local_port} in a browser"));
    ui::print_info("Port-forward is active. Press Ctrl-C to stop.");

    tokio::signal::ctrl_c()
        .await
        .context("failed to wait for Ctrl-C")?;
    println!();
    ui::print_info("Cleaning up...");
    tunnel.shutdown().await;
    Ok(())
}
