//! Failure taxonomy for experiment runs.
//!
//! Most functions return `anyhow::Result` and attach the intended effect as
//! context. The failures the orchestrator has to tell apart are raised as
//! [`ExpError`] and recovered from the chain with [`severity_of`].

use std::path::PathBuf;

use thiserror::Error;

/// How far a failure is allowed to propagate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    /// A best-effort step failed; the iteration carries on.
    SoftWarning,
    /// An environment precondition is unmet; the run stops.
    FatalWarning,
    /// The configuration (or the orchestrator itself) is wrong; nothing may run.
    FatalError,
}

impl Severity {
    pub fn exit_code(self) -> u8 {
        match self {
            Severity::SoftWarning => 0,
            Severity::FatalWarning => 1,
            Severity::FatalError => 2,
        }
    }
}

#[derive(Debug, Error)]
pub enum ExpError {
    #[error("invalid config: {0}")]
    Config(String),

    #[error("bundle traffic ({traffic}) is outside of bundle capture region ({start}-{end})")]
    BundleOutsideRegion {
        traffic: String,
        start: u16,
        end: u16,
    },

    #[error("cross traffic ({traffic}) is in bundle capture region ({start}-{end})")]
    CrossInsideRegion {
        traffic: String,
        start: u16,
        end: u16,
    },

    #[error(
        "found existing results at {0}; pass --skip-existing or --overwrite-existing to choose \
         how to proceed"
    )]
    ExistingResults(PathBuf),

    #[error("iteration directory not reset: {0} was already prepared in this run (this is a bug)")]
    IterationDirReused(PathBuf),

    #[error("{process} is not running on {node} (log: {log})\n{log_tail}")]
    ProcessNotRunning {
        node: String,
        process: String,
        log: PathBuf,
        log_tail: String,
    },

    #[error("timed out waiting for \"{marker}\" in {log} on {node}")]
    ReadinessTimeout {
        node: String,
        marker: String,
        log: PathBuf,
    },

    #[error(
        "{node}: requested {expected} {process} processes, but {running} are running (log: \
         {log})\n{log_tail}"
    )]
    ProcessCount {
        node: String,
        process: String,
        expected: usize,
        running: usize,
        log: PathBuf,
        log_tail: String,
    },

    #[error("{node}: {what} not found at {path}")]
    MissingTool {
        node: String,
        what: String,
        path: String,
    },

    #[error("failed to kill all experiment processes on {node} ({count} remain)")]
    LeftoverProcesses { node: String, count: usize },
}

impl ExpError {
    pub fn config(msg: impl Into<String>) -> Self {
        ExpError::Config(msg.into())
    }

    pub fn severity(&self) -> Severity {
        match self {
            ExpError::Config(_)
            | ExpError::BundleOutsideRegion { .. }
            | ExpError::CrossInsideRegion { .. }
            | ExpError::ExistingResults(_)
            | ExpError::IterationDirReused(_) => Severity::FatalError,
            ExpError::ProcessNotRunning { .. }
            | ExpError::ReadinessTimeout { .. }
            | ExpError::ProcessCount { .. }
            | ExpError::MissingTool { .. }
            | ExpError::LeftoverProcesses { .. } => Severity::FatalWarning,
        }
    }
}

/// Severity of an error chain.
///
/// Errors that carry no [`ExpError`] are transport or I/O failures on a
/// node, which count as unmet environment preconditions.
pub fn severity_of(err: &anyhow::Error) -> Severity {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<ExpError>())
        .map_or(Severity::FatalWarning, ExpError::severity)
}

/// Shorthand used by call sites that need to pull the classified error back
/// out of a chain.
pub fn find_exp_error(err: &anyhow::Error) -> Option<&ExpError> {
    err.chain().find_map(|cause| cause.downcast_ref::<ExpError>())
}
