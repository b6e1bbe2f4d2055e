//! Orchestration of bundler network experiments.
//!
//! A config file describes a four-node testbed (sender, inbox, outbox,
//! receiver) and a sweep of experiment parameters. For every combination the
//! orchestrator starts the measurement boxes, the congestion control agent
//! and the traffic generators in a fixed order, runs the clients inside an
//! emulated bottleneck, and collects every log.

#[cfg(not(windows))]
#[cfg(test)]
#[global_allocator]
static ALLOC: mimalloc::MiMalloc = mimalloc::MiMalloc;

pub mod boxes;
pub mod ccp;
pub mod config;
pub mod error;
pub mod iteration;
pub mod orchestrator;
pub mod remote;
pub mod setup;
pub mod sweep;
pub mod traffic;

// Test helpers module - available when test-internals feature is enabled
#[cfg(any(test, feature = "test-internals"))]
pub mod test_helpers;

#[cfg(test)]
pub mod tests;

pub use config::{Config, Role};
pub use error::{ExpError, Severity, severity_of};
pub use iteration::{Coordinator, IterationOutcome, OnExisting};
pub use orchestrator::{Options, Summary};
pub use remote::{Machines, RemoteNode};
pub use sweep::{Algorithm, Experiment};
pub use traffic::{Traffic, TrafficSpec};
