//! Read-only farm snapshot: queue depth, live bindings, worker pods.

use std::collections::HashSet;

use anyhow::{Context, Result};
use colored::Colorize;
use coordinator::{FarmConfig, KubePodLocator, PodLocator, RedisJobStore, JobStore};

/// Print the current state of the shared stores and the worker pool.
///
/// Bindings whose address matches no running pod are flagged: they are
/// the leftovers of a crashed coordinator and are never cleaned up
/// automatically.
pub async fn show(cfg: &FarmConfig) -> Result<()> {
    let store = RedisJobStore::connect(&cfg.store_url, &cfg.queue_key, &cfg.registry_key)
        .await
        .context("could not connect to the shared store")?;

    let client = kube::Client::try_default()
        .await
        .context("failed to create Kubernetes client")?;
    let locator = KubePodLocator::new(client, &cfg.namespace, cfg.pod_selector.clone());

    let pending = store.pending().await?;
    let bindings = store.bindings().await?;
    let workers = locator
        .list_workers()
        .await
        .context("could not list worker pods")?;

    println!("{}", "Queue".cyan().bold());
    println!("  {} job(s) waiting in '{}'", pending, cfg.queue_key);
    println!();

    println!("{}", "Bindings".cyan().bold());
    if bindings.is_empty() {
        println!("  none");
    } else {
        let live_addresses: HashSet<&str> = workers
            .iter()
            .filter_map(|pod| pod.address.as_deref())
            .collect();
        for (job_id, address) in &bindings {
            if live_addresses.contains(address.as_str()) {
                println!("  {job_id} → {address}");
            } else {
                println!(
                    "  {job_id} → {address} {}",
                    "(stale: no pod has this address)".yellow()
                );
            }
        }
    }
    println!();

    println!("{}", "Worker pods".cyan().bold());
    if workers.is_empty() {
        println!("  none");
    } else {
        for pod in &workers {
            println!(
                "  {} {}",
                pod.name,
                pod.address.as_deref().unwrap_or("(no address yet)")
            );
        }
    }
    Ok(())
}
