//! Job identity and lifecycle reporting.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::CleanupFailure;

/// Length of the short job token. A uuid-v4 prefix of this length keeps
/// the collision probability negligible for the farm's concurrent-job
/// counts while staying readable in queue dumps and pod logs.
const TOKEN_LEN: usize = 8;

/// One unit of automated-browser work submitted for execution on a
/// worker pod.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    /// Opaque token, globally unique per submission.
    pub id: String,
    /// Coordinator-side lifecycle state. The shared stores only ever see
    /// queue membership and the bound address.
    pub state: JobState,
}

impl Job {
    /// Create a job with a fresh token in `Init` state.
    #[must_use]
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4().simple().to_string()[..TOKEN_LEN].to_string(),
            state: JobState::Init,
        }
    }
}

impl Default for Job {
    fn default() -> Self {
        Self::new()
    }
}

/// Lifecycle states of a job as seen by its coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
    Init,
    /// Token pushed onto the shared queue.
    Submitted,
    /// A worker published an address against the token.
    Bound,
    /// Port-forward to the worker is being established.
    Tunneling,
    /// The automation driver holds a session against the tunnel.
    Running,
    Completed,
    Failed,
    TimedOut,
}

impl JobState {
    /// Whether this state ends the lifecycle.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::TimedOut)
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Init => "init",
            Self::Submitted => "submitted",
            Self::Bound => "bound",
            Self::Tunneling => "tunneling",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::TimedOut => "timed-out",
        };
        f.write_str(s)
    }
}

/// Terminal report for one job, produced after release has run.
#[derive(Debug)]
pub struct JobReport {
    pub job_id: String,
    pub state: JobState,
    /// Failing step name, when the job did not complete.
    pub failed_step: Option<&'static str>,
    /// Underlying cause string, when the job did not complete.
    pub cause: Option<String>,
    /// Page title captured by the automation script on success.
    pub page_title: Option<String>,
    /// Best-effort release steps that failed. Never affects `state`.
    pub cleanup_failures: Vec<CleanupFailure>,
}

impl JobReport {
    /// Whether the job reached `Completed`.
    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.state == JobState::Completed
    }
}
