use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::error::ExpError;

/// Iteration directories prepared during one orchestrator run.
///
/// Two iterations must never share a directory; a second claim on the same
/// path means the sweep produced a duplicate name.
#[derive(Debug, Default)]
pub struct Session {
    prepared: HashSet<PathBuf>,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn claim(&mut self, dir: &Path) -> Result<(), ExpError> {
        if self.prepared.insert(dir.to_path_buf()) {
            Ok(())
        } else {
            Err(ExpError::IterationDirReused(dir.to_path_buf()))
        }
    }

    pub fn len(&self) -> usize {
        self.prepared.len()
    }

    pub fn is_empty(&self) -> bool {
        self.prepared.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Severity;

    #[test]
    fn second_claim_is_a_fatal_error() {
        let mut session = Session::new();
        session.claim(Path::new("/exp/a")).unwrap();
        session.claim(Path::new("/exp/b")).unwrap();

        let err = session.claim(Path::new("/exp/a")).unwrap_err();
        assert!(matches!(err, ExpError::IterationDirReused(ref p) if p == Path::new("/exp/a")));
        assert_eq!(err.severity(), Severity::FatalError);
        assert_eq!(session.len(), 2);
    }
}
