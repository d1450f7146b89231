//! The job coordinator state machine.
//!
//! Drives one job through `Init → Submitted → Bound → Tunneling → Running
//! → {Completed|Failed|TimedOut}` and then always through release. The
//! producer has no direct channel to the worker-provisioning system, so
//! the binding handshake is a bounded poll against the shared registry: a
//! silent hang becomes an observable, classified timeout.
//!
//! Every external dependency enters through a seam trait, which is what
//! keeps the whole machine testable without a cluster.

use std::future::Future;
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::automation::{UiDriver, UiSession};
use crate::config::FarmConfig;
use crate::error::{CleanupFailure, FarmError};
use crate::job::{Job, JobReport, JobState};
use crate::probe::LivenessProbe;
use crate::resolver::{PodLocator, PodRef, ResolveError};
use crate::store::JobStore;
use crate::tunnel::{derive_local_port, PortForward, TunnelFactory};

/// The external collaborators a coordinator drives.
#[derive(Clone)]
pub struct Seams {
    pub store: Arc<dyn JobStore>,
    pub locator: Arc<dyn PodLocator>,
    pub tunnels: Arc<dyn TunnelFactory>,
    pub probe: Arc<dyn LivenessProbe>,
    pub driver: Arc<dyn UiDriver>,
}

/// Resources a job has acquired so far. Tracked as they are acquired so
/// release can tear down exactly what exists, in order, whatever point
/// the run reached.
#[derive(Default)]
struct Acquired {
    enqueued: bool,
    pod: Option<PodRef>,
    tunnel: Option<Box<dyn PortForward>>,
    session: Option<Box<dyn UiSession>>,
}

/// Coordinates single jobs end to end. One instance may run many jobs;
/// concurrent jobs are independent and share only the backing stores.
pub struct JobCoordinator {
    seams: Seams,
    cfg: FarmConfig,
}

impl JobCoordinator {
    #[must_use]
    pub fn new(seams: Seams, cfg: FarmConfig) -> Self {
        Self { seams, cfg }
    }

    /// Run one job to a terminal state, then release.
    pub async fn run(&self, target_url: &str) -> JobReport {
        self.run_until(target_url, std::future::pending()).await
    }

    /// Run one job, racing it against an external shutdown signal.
    ///
    /// The shutdown future resolving classifies the job as interrupted;
    /// release runs either way. This is the only cancellation path; the
    /// state machine itself never hangs, because every wait is bounded.
    pub async fn run_until<F>(&self, target_url: &str, shutdown: F) -> JobReport
    where
        F: Future<Output = ()> + Send,
    {
        let mut job = Job::new();
        let mut acquired = Acquired::default();

        let outcome = {
            let execute = self.execute(&mut job, &mut acquired, target_url);
            tokio::pin!(execute);
            tokio::select! {
                result = &mut execute => result,
                () = shutdown => Err(FarmError::Interrupted),
            }
        };

        let (state, failed_step, cause, page_title) = match outcome {
            Ok(title) => {
                info!(job_id = %job.id, title = %title, "job completed");
                (JobState::Completed, None, None, Some(title))
            }
            Err(err) => {
                let state = match &err {
                    FarmError::BindingTimeout { .. } | FarmError::ServiceNotReady { .. } => {
                        JobState::TimedOut
                    }
                    _ => JobState::Failed,
                };
                error!(
                    job_id = %job.id,
                    step = err.step(),
                    cause = %err,
                    "job did not complete"
                );
                (state, Some(err.step()), Some(err.to_string()), None)
            }
        };
        job.state = state;

        let cleanup_failures = self.release(&job.id, &mut acquired).await;

        JobReport {
            job_id: job.id,
            state,
            failed_step,
            cause,
            page_title,
            cleanup_failures,
        }
    }

    /// The forward path of the state machine.
    async fn execute(
        &self,
        job: &mut Job,
        acquired: &mut Acquired,
        target_url: &str,
    ) -> Result<String, FarmError> {
        // Submit. The queue is a prerequisite; failure here is fatal.
        self.seams
            .store
            .enqueue(&job.id)
            .await
            .map_err(FarmError::QueueUnavailable)?;
        acquired.enqueued = true;
        job.state = JobState::Submitted;
        info!(job_id = %job.id, queue = %self.cfg.queue_key, "job submitted");

        let address = self.await_binding(&job.id).await?;
        job.state = JobState::Bound;
        info!(job_id = %job.id, address = %address, "worker bound");

        // Resolve the transient address to a pod identity. Not cached:
        // the cluster reuses addresses across pod churn.
        let pod = match self.seams.locator.pod_by_address(&address).await {
            Ok(pod) => pod,
            Err(err) => {
                if let ResolveError::Kube(ref source) = err {
                    warn!(address = %address, error = %source, "cluster query failed during resolve");
                }
                return Err(FarmError::PodNotFound { address });
            }
        };
        info!(job_id = %job.id, pod = %pod.name, "resolved worker pod");

        job.state = JobState::Tunneling;
        // Record the pod before tunneling: release must still delete it
        // when the tunnel never comes up.
        let pod_name = pod.name.clone();
        acquired.pod = Some(pod);
        let local_port = derive_local_port(&job.id);
        let tunnel = self
            .seams
            .tunnels
            .open(&pod_name, self.cfg.appium_port, local_port)
            .await
            .map_err(|err| FarmError::TunnelUnavailable {
                reason: err.to_string(),
            })?;
        let endpoint = tunnel.endpoint();
        acquired.tunnel = Some(tunnel);

        self.await_ready(&endpoint).await?;

        job.state = JobState::Running;
        let session = self
            .seams
            .driver
            .open(&endpoint)
            .await
            .map_err(FarmError::AutomationFailure)?;
        let session = acquired.session.insert(session);
        session
            .exercise(target_url)
            .await
            .map_err(FarmError::AutomationFailure)
    }

    /// Poll the registry until a worker binds or the budget runs out.
    /// Polling stops on the first hit; each poll is a fresh point-read.
    async fn await_binding(&self, job_id: &str) -> Result<String, FarmError> {
        for attempt in 1..=self.cfg.bind_attempts {
            let binding = self
                .seams
                .store
                .binding(job_id)
                .await
                .map_err(FarmError::RegistryUnavailable)?;

            if let Some(address) = binding {
                debug!(job_id = %job_id, attempt, "binding appeared");
                return Ok(address);
            }
            if attempt < self.cfg.bind_attempts {
                tokio::time::sleep(self.cfg.bind_interval).await;
            }
        }
        Err(FarmError::BindingTimeout {
            job_id: job_id.to_string(),
            attempts: self.cfg.bind_attempts,
        })
    }

    /// Probe the tunneled endpoint until it answers or the budget runs
    /// out.
    async fn await_ready(&self, endpoint: &str) -> Result<(), FarmError> {
        for attempt in 1..=self.cfg.probe_attempts {
            if self.seams.probe.check(endpoint).await {
                debug!(endpoint = %endpoint, attempt, "service ready");
                return Ok(());
            }
            if attempt < self.cfg.probe_attempts {
                tokio::time::sleep(self.cfg.probe_interval).await;
            }
        }
        Err(FarmError::ServiceNotReady {
            attempts: self.cfg.probe_attempts,
        })
    }

    /// Tear down everything the job acquired. Every step is best-effort
    /// and isolated: one step failing never stops the rest, and failures
    /// here never overwrite the job's primary outcome.
    async fn release(&self, job_id: &str, acquired: &mut Acquired) -> Vec<CleanupFailure> {
        let mut failures = Vec::new();

        if let Some(session) = acquired.session.as_mut() {
            if let Err(err) = session.quit().await {
                failures.push(CleanupFailure {
                    step: "session",
                    cause: err.to_string(),
                });
            }
        }

        if let Some(tunnel) = acquired.tunnel.as_mut() {
            tunnel.shutdown().await;
        }

        match self.seams.store.clear_binding(job_id).await {
            Ok(existed) => debug!(job_id = %job_id, existed, "registry binding cleared"),
            Err(err) => failures.push(CleanupFailure {
                step: "registry",
                cause: err.to_string(),
            }),
        }

        if acquired.enqueued {
            // Still queued when no worker ever consumed the token.
            match self.seams.store.remove(job_id).await {
                Ok(was_present) => debug!(job_id = %job_id, was_present, "queue token removed"),
                Err(err) => failures.push(CleanupFailure {
                    step: "queue",
                    cause: err.to_string(),
                }),
            }
        }

        if self.cfg.delete_pod_on_release {
            if let Some(pod) = acquired.pod.as_ref() {
                if let Err(err) = self.seams.locator.delete_pod(&pod.name).await {
                    failures.push(CleanupFailure {
                        step: "pod",
                        cause: err.to_string(),
                    });
                }
            }
        }

        for failure in &failures {
            warn!(job_id = %job_id, step = failure.step, cause = %failure.cause, "cleanup step failed");
        }
        failures
    }
}
