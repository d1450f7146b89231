//! Emulator farm coordination library.
//!
//! This crate implements the producer side of the farm's job-to-pod
//! binding protocol:
//! - Queue/registry client for the shared Redis store
//! - Pod resolution from a registered address to a pod identity
//! - Port-forward tunnel management with deterministic local ports
//! - WebDriver session client for the Appium endpoint on each pod
//! - The job coordinator state machine tying it all together, with
//!   guaranteed cleanup on every exit path
//!
//! The autoscaler that turns queue depth into pods, and the pods'
//! self-registration, are external collaborators; this crate only speaks
//! to the stores and the cluster API they share.

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)] // Seam methods fail for one documented reason each

pub mod automation;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod job;
pub mod probe;
pub mod resolver;
pub mod store;
pub mod tunnel;

pub use config::FarmConfig;
pub use coordinator::{JobCoordinator, Seams};
pub use error::{CleanupFailure, FarmError};
pub use job::{Job, JobReport, JobState};
pub use resolver::{KubePodLocator, PodLocator, PodRef};
pub use store::{JobStore, RedisJobStore};
pub use tunnel::{derive_local_port, KubectlTunnelFactory, PortForward, TunnelFactory};
