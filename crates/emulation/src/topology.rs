use std::path::{Path, PathBuf};

use tracing::debug;

use crate::link::{BufferDepth, LinkParams};
use crate::queue::QueueDiscipline;
use crate::shell::{Script, ShellCommand};

/// Seconds the outbox is given to open its capture before clients start.
pub const OUTBOX_SETTLE_SECS: u32 = 1;

/// What runs inside one emulated link.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EmulationPath {
    /// Capture process started first and left running; `None` when the run
    /// does not use the bundler.
    pub outbox: Option<String>,
    /// Client fragments, each spawned in its own subshell and waited on.
    pub clients: Vec<String>,
}

/// A script body together with where it must be written on the node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptFile {
    pub path: PathBuf,
    pub contents: String,
}

/// Everything needed to start the emulated topology on a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmulationPlan {
    /// One script per path, run inside `mm-delay`/`mm-link`.
    pub inner: Vec<ScriptFile>,
    /// Launches every inner script in its own shell and waits for all of them.
    pub outer: ScriptFile,
    /// Per-path downlink logs written by `mm-link`.
    pub downlink_logs: Vec<PathBuf>,
}

/// Builds nested emulation shells, one per traffic path.
///
/// Each path gets an independent bottleneck with the same rate, delay and
/// queueing. All files live in `work_dir`, which is also the directory the
/// outer script must be started from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmulatedTopology {
    pub link: LinkParams,
    pub depth: BufferDepth,
    pub queue: QueueDiscipline,
    pub work_dir: PathBuf,
}

impl EmulatedTopology {
    pub fn new(
        link: LinkParams,
        depth: BufferDepth,
        queue: QueueDiscipline,
        work_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            link,
            depth,
            queue,
            work_dir: work_dir.into(),
        }
    }

    pub fn buffer_packets(&self) -> Option<u64> {
        self.depth.packets(&self.link)
    }

    pub fn inner_script_path(&self, idx: usize) -> PathBuf {
        self.work_dir.join(format!("mm_inner{idx}.sh"))
    }

    pub fn outer_script_path(&self) -> PathBuf {
        self.work_dir.join("mm_outer.sh")
    }

    pub fn downlink_log_name(idx: usize) -> String {
        format!("downlink{idx}.log")
    }

    /// `mm-delay <d> mm-link --cbr <r>M <r>M [queue flags] --downlink-log=.. <inner>`
    pub fn shell_command(&self, inner: &Path, idx: usize) -> ShellCommand {
        let rate = format!("{}M", self.link.rate_mbps);
        ShellCommand::new("mm-delay")
            .arg(self.link.one_way_delay_ms())
            .arg("mm-link")
            .arg("--cbr")
            .arg(&rate)
            .arg(&rate)
            .args(self.queue.link_args(self.buffer_packets()))
            .opt("downlink-log", Self::downlink_log_name(idx))
            .arg(inner.to_string_lossy())
    }

    pub fn inner_script(path: &EmulationPath) -> Script {
        let mut script = Script::new();
        if let Some(outbox) = &path.outbox {
            script.detach(outbox);
            script.line(format!("sleep {OUTBOX_SETTLE_SECS}"));
        }
        for client in &path.clients {
            script.spawn(client);
        }
        script.wait_all();
        script
    }

    pub fn build(&self, paths: &[EmulationPath]) -> EmulationPlan {
        let mut inner = Vec::with_capacity(paths.len());
        let mut outer = Script::new();
        let mut downlink_logs = Vec::with_capacity(paths.len());

        for (idx, path) in paths.iter().enumerate() {
            let inner_path = self.inner_script_path(idx);
            outer.spawn(self.shell_command(&inner_path, idx).render());
            inner.push(ScriptFile {
                path: inner_path,
                contents: Self::inner_script(path).into_string(),
            });
            downlink_logs.push(self.work_dir.join(Self::downlink_log_name(idx)));
        }
        outer.wait_all();

        debug!(
            paths = paths.len(),
            link = %self.link,
            buffer = ?self.buffer_packets(),
            "built emulation plan"
        );

        EmulationPlan {
            inner,
            outer: ScriptFile {
                path: self.outer_script_path(),
                contents: outer.into_string(),
            },
            downlink_logs,
        }
    }
}
