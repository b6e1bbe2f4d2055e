//! Emulated-link shells for bundler experiments.
//!
//! Wraps traffic in nested `mm-delay`/`mm-link` shells so that every traffic
//! path crosses its own emulated bottleneck. Nothing here executes anything:
//! the crate renders command lines and bash scripts which the orchestrator
//! uploads and runs on a node.
//!
//! # Modules
//!
//! - [`shell`]: Typed command builder, `&&` chains and generated bash scripts
//! - [`link`]: Link rate/RTT and bandwidth-delay-product buffer sizing
//! - [`queue`]: Queue discipline selection and `mm-link` queue flags
//! - [`topology`]: Per-path inner scripts and the outer script that runs them

pub mod link;
pub mod queue;
pub mod shell;
pub mod topology;

pub use link::{BufferDepth, LinkParams, MTU_BYTES};
pub use queue::{EcmpConfig, FifoQueue, QueueDiscipline};
pub use shell::{Chain, Script, ShellCommand, quote};
pub use topology::{EmulatedTopology, EmulationPath, EmulationPlan, ScriptFile};
