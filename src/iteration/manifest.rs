use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::config::Role;
use crate::remote::Machines;

/// A file some node produced during an iteration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub role: Role,
    pub path: PathBuf,
}

/// Outcome of fetching every artifact.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CollectReport {
    pub fetched: usize,
    pub failed: Vec<PathBuf>,
}

/// Files to bring back to the controller once an iteration ends.
#[derive(Debug, Clone, Default)]
pub struct Manifest {
    artifacts: Vec<Artifact>,
}

impl Manifest {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `path` on `role`'s node. Duplicates are ignored.
    pub fn push(&mut self, role: Role, path: PathBuf) {
        let artifact = Artifact { role, path };
        if !self.artifacts.contains(&artifact) {
            self.artifacts.push(artifact);
        }
    }

    pub fn artifacts(&self) -> &[Artifact] {
        &self.artifacts
    }

    pub fn contains(&self, role: Role, path: &Path) -> bool {
        self.artifacts
            .iter()
            .any(|a| a.role == role && a.path == path)
    }

    /// Copy every artifact into `local_dir`. Failures are logged and counted,
    /// never returned: losing one log does not invalidate the iteration.
    /// Files on the controller's own machine are already in place.
    pub fn collect(&self, machines: &Machines, local_dir: &Path) -> CollectReport {
        let mut report = CollectReport::default();
        for artifact in &self.artifacts {
            let node = machines.role(artifact.role);
            if node.is_local() {
                continue;
            }
            let Some(name) = artifact.path.file_name() else {
                continue;
            };
            match node.get(&artifact.path, &local_dir.join(name)) {
                Ok(()) => {
                    debug!(node = node.addr(), path = %artifact.path.display(), "fetched");
                    report.fetched += 1;
                }
                Err(e) => {
                    warn!(
                        node = node.addr(),
                        path = %artifact.path.display(),
                        "could not fetch file: {e:#}"
                    );
                    report.failed.push(artifact.path.clone());
                }
            }
        }
        report
    }
}
