//! Error types for the coordination protocol.
//!
//! Connectivity failures to the backing stores are kept distinct from
//! "nothing there yet": the binding and readiness loops retry on absence
//! only, never on a store that is down.

use thiserror::Error;

use crate::store::StoreError;

/// Terminal failure kinds for a single job attempt.
#[derive(Error, Debug)]
pub enum FarmError {
    /// The queue could not be reached when submitting. Fatal for the run;
    /// the queue is a prerequisite, not a transient dependency.
    #[error("job queue unavailable: {0}")]
    QueueUnavailable(#[source] StoreError),

    /// The registry could not be reached while polling for a binding.
    #[error("job registry unavailable: {0}")]
    RegistryUnavailable(#[source] StoreError),

    /// No worker published an address for the job within the attempt
    /// budget. The observable symptom of autoscaler misconfiguration,
    /// image pull failures, or queue starvation.
    #[error("no worker bound to job {job_id} after {attempts} polls")]
    BindingTimeout { job_id: String, attempts: u32 },

    /// The bound address did not match any pod in the namespace.
    #[error("no pod found for address {address}")]
    PodNotFound { address: String },

    /// The port-forward process failed to start or died immediately.
    #[error("tunnel unavailable: {reason}")]
    TunnelUnavailable { reason: String },

    /// The tunneled endpoint never answered its liveness probe.
    #[error("service did not become ready after {attempts} probes")]
    ServiceNotReady { attempts: u32 },

    /// The automation driver raised mid-run. The underlying cause is
    /// preserved for reporting.
    #[error("automation failure: {0}")]
    AutomationFailure(#[source] crate::automation::DriverError),

    /// An external cancellation signal stopped the job before a natural
    /// terminal state. Release still runs.
    #[error("interrupted by operator")]
    Interrupted,
}

impl FarmError {
    /// Name of the step the error belongs to, for terminal reporting.
    #[must_use]
    pub fn step(&self) -> &'static str {
        match self {
            Self::QueueUnavailable(_) => "submit",
            Self::RegistryUnavailable(_) | Self::BindingTimeout { .. } => "await-binding",
            Self::PodNotFound { .. } => "resolve",
            Self::TunnelUnavailable { .. } => "tunnel",
            Self::ServiceNotReady { .. } => "readiness",
            Self::AutomationFailure(_) => "run",
            Self::Interrupted => "interrupt",
        }
    }
}

/// A release step that failed. Collected, logged, and reported, but never
/// allowed to overwrite the job's primary outcome.
#[derive(Debug, Clone)]
pub struct CleanupFailure {
    /// Which release step failed (`session`, `tunnel`, `registry`,
    /// `queue`, `pod`).
    pub step: &'static str,
    /// Cause string from the underlying error.
    pub cause: String,
}

impl std::fmt::Display for CleanupFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "cleanup step '{}' failed: {}", self.step, self.cause)
    }
}
