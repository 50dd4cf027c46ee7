//! Test doubles for the readiness core.
//!
//! - [`ScriptedExecutor`]: canned replies to remote commands, optionally
//!   changing over time
//! - [`ScriptedChecks`]: per-phase readiness timelines
//! - [`FakeProvisioner`]: counts provisions and releases, injects failures
//!
//! Timelines are measured from the double's creation on the tokio clock, so
//! tests under `#[tokio::test(start_paused = true)]` are exact.

mod checks;
mod executor;
mod provisioner;

pub use checks::{Script, ScriptedChecks};
pub use executor::{Reply, ScriptedExecutor};
pub use provisioner::FakeProvisioner;
