//! Emulator farm operator CLI.
//!
//! Three entry points around the coordination library: `up` provisions
//! the cluster and holds it open, `test` submits a job and drives the
//! browser script against whichever worker binds to it, `view` tunnels
//! into a running emulator's VNC port. `status` is a read-only snapshot
//! of the shared stores and the worker pool.

#![warn(clippy::pedantic)]

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use coordinator::automation::AppiumChromeDriver;
use coordinator::probe::HttpStatusProbe;
use coordinator::{
    FarmConfig, JobCoordinator, KubePodLocator, KubectlTunnelFactory, RedisJobStore, Seams,
};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod provision;
mod status;
mod ui;
mod viewer;

/// Elastic Android emulator farm: provision, test, watch.
#[derive(Parser)]
#[command(name = "farm")]
#[command(about = "Dispatch browser tests to autoscaled Android emulator pods")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Kubernetes namespace the farm runs in
    #[arg(long, default_value = "keda", global = true)]
    namespace: String,

    /// Redis URL for the shared queue and registry
    #[arg(
        long,
        env = "FARM_STORE_URL",
        default_value = "redis://localhost:6379",
        global = true
    )]
    store_url: String,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Provision the cluster, autoscaler, and farm, then hold it open
    Up {
        /// KEDA install manifest to apply
        #[arg(long, default_value = "keda-2.10.1.yaml")]
        keda_manifest: String,

        /// Skip the image build/import steps
        #[arg(long)]
        skip_build: bool,
    },
    /// Submit a job and run the browser test against the bound worker
    Test {
        /// URL the automation script should exercise
        #[arg(long, default_value = "https://www.google.com")]
        url: String,

        /// Seconds to wait for a worker to bind
        #[arg(long, default_value = "136")]
        bind_budget: u32,

        /// Keep the worker pod around after the run (for debugging)
        #[arg(long)]
        keep_pod: bool,
    },
    /// Watch a running emulator over VNC
    View,
    /// Show queue depth, bindings, and worker pods
    Status,
}

impl Cli {
    /// Farm settings from the global flags.
    fn farm_config(&self) -> FarmConfig {
        FarmConfig {
            store_url: self.store_url.clone(),
            namespace: self.namespace.clone(),
            ..FarmConfig::default()
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("coordinator=debug,farm_cli=debug,info")
    } else {
        EnvFilter::new("warn")
    };
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(filter)
        .init();

    match &cli.command {
        Commands::Up {
            keda_manifest,
            skip_build,
        } => {
            let provisioner = provision::FarmProvisioner::new(
                cli.farm_config(),
                keda_manifest.clone(),
                *skip_build,
            );
            provisioner.up().await
        }
        Commands::Test {
            url,
            bind_budget,
            keep_pod,
        } => run_test(&cli, url, *bind_budget, *keep_pod).await,
        Commands::View => viewer::watch(&cli.farm_config()).await,
        Commands::Status => status::show(&cli.farm_config()).await,
    }
}

/// Submit one job and drive it to a terminal state, releasing everything
/// on the way out, including on Ctrl-C.
async fn run_test(cli: &Cli, url: &str, bind_budget: u32, keep_pod: bool) -> Result<()> {
    let cfg = FarmConfig {
        bind_attempts: bind_budget,
        bind_interval: Duration::from_secs(1),
        delete_pod_on_release: !keep_pod,
        ..cli.farm_config()
    };

    let store = RedisJobStore::connect(&cfg.store_url, &cfg.queue_key, &cfg.registry_key)
        .await
        .with_context(|| format!("could not connect to the shared store at {}", cfg.store_url))?;
    ui::print_success(&format!("Connected to store at {}", cfg.store_url));

    let client = kube::Client::try_default()
        .await
        .context("failed to create Kubernetes client. Is kubectl configured?")?;
    let locator = KubePodLocator::new(client, &cfg.namespace, cfg.pod_selector.clone());
    let tunnels = KubectlTunnelFactory::new(&cfg.namespace, cfg.tunnel_grace);

    let seams = Seams {
        store: Arc::new(store),
        locator: Arc::new(locator),
        tunnels: Arc::new(tunnels),
        probe: Arc::new(HttpStatusProbe::new()),
        driver: Arc::new(AppiumChromeDriver::new()),
    };
    let coordinator = JobCoordinator::new(seams, cfg);

    ui::print_step(&format!("Submitting a job against {url}"));
    let report = coordinator
        .run_until(url, async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await;

    for failure in &report.cleanup_failures {
        ui::print_warning(&failure.to_string());
    }

    if report.succeeded() {
        println!();
        println!(
            "{} job {} (page title: {})",
            "TEST SUCCEEDED".green().bold(),
            report.job_id,
            report.page_title.as_deref().unwrap_or("(none)")
        );
        Ok(())
    } else {
        ui::print_error(&format!(
            "job {} {} at step '{}': {}",
            report.job_id,
            report.state,
            report.failed_step.unwrap_or("unknown"),
            report.cause.as_deref().unwrap_or("unknown cause")
        ));
        bail!("test run did not complete")
    }
}
