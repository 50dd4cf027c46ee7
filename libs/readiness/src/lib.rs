//! Phased readiness orchestration for freshly booted virtual machines.
//!
//! A session acquires an environment, then walks an ordered list of phases
//! (port open, shell usable, first boot finished, service healthy, ...),
//! each bounded by its own timeout, and releases the environment whatever
//! happens.
//!
//! - [`Prober`]: polls a [`Check`] with tri-state failure classification
//! - [`RemoteExecutor`] / [`SshExecutor`]: one remote command, bounded
//! - [`Sequencer`]: drives a [`Session`] through its phases
//! - [`LifecycleManager`]: exactly-once release of a [`Provisioner`]'s
//!   environments
//! - [`Orchestrator`]: one [`TargetSpec`] end to end, producing a
//!   [`SessionReport`]

pub mod checks;
pub mod config;
pub mod coordinates;
pub mod diagnostics;
pub mod error;
pub mod executor;
pub mod harness;
pub mod lifecycle;
pub mod outcome;
pub mod phase;
pub mod probe;
pub mod report;
pub mod sequencer;
pub mod session;
pub mod target;

pub use checks::{Check, CheckFactory, Checks};
pub use config::{ConfigError, HarnessConfig};
pub use coordinates::{Coordinates, CredentialRef, PortForward, SSH_GUEST_PORT};
pub use diagnostics::Diagnostics;
pub use error::{CheckError, ExecError, FailureClass, ProvisionError, TeardownError};
pub use executor::{CommandOutput, RemoteExecutor, SshConfig, SshExecutor};
pub use harness::{Credentials, Orchestrator};
pub use lifecycle::{
    CredentialSeed, Environment, Lease, LifecycleManager, ProvisionRequest, Provisioner,
    TeardownStatus,
};
pub use outcome::{FailureReason, Outcome, TimeoutCause};
pub use phase::{Phase, PhaseAction, Severity};
pub use probe::{ProbeOutcome, ProbeVerdict, Prober};
pub use report::{aggregate_exit_code, RunSummary, SessionReport};
pub use sequencer::{Sequencer, SequencerConfig, SessionRun};
pub use session::{PhaseRecord, PhaseStatus, Session};
pub use target::{PhaseSpec, TargetSpec, TargetSpecError};
