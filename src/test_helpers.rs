#![cfg(any(test, feature = "test-internals"))]
#![allow(dead_code)] // Allow unused helpers - they're used by library tests but not binary tests

use std::cell::RefCell;
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::rc::Rc;

use anyhow::{Result, bail};
use emulation::quote;

use crate::config::{Config, Role, Timing};
use crate::remote::{Machines, RemoteNode, RunOpts, RunOutput, quote_path};

/// An in-memory node that records every command and answers probes from
/// scripted state.
///
/// By default every command succeeds, every process is running, every log
/// marker is present and `pgrep -c` reports zero. Files exist unless they sit
/// in a directory the node created with `mkdir -p` and were never uploaded.
pub struct FakeNode {
    addr: String,
    local: bool,
    dry_run: bool,
    state: RefCell<FakeState>,
}

#[derive(Default)]
struct FakeState {
    commands: Vec<String>,
    puts: Vec<(PathBuf, String)>,
    gets: Vec<(PathBuf, PathBuf)>,
    missing_files: HashSet<PathBuf>,
    created_dirs: Vec<String>,
    missing_programs: HashSet<String>,
    missing_markers: HashSet<String>,
    dead_processes: HashSet<String>,
    pgrep_counts: HashMap<String, VecDeque<usize>>,
    failing: Vec<String>,
    failing_get: bool,
}

impl FakeNode {
    pub fn new(addr: &str) -> Self {
        Self {
            addr: addr.to_string(),
            local: false,
            dry_run: false,
            state: RefCell::new(FakeState::default()),
        }
    }

    pub fn local(mut self) -> Self {
        self.local = true;
        self
    }

    pub fn dry_run(mut self) -> Self {
        self.dry_run = true;
        self
    }

    pub fn with_missing_file(self, path: impl Into<PathBuf>) -> Self {
        self.state.borrow_mut().missing_files.insert(path.into());
        self
    }

    pub fn without_program(self, program: &str) -> Self {
        self.state
            .borrow_mut()
            .missing_programs
            .insert(program.to_string());
        self
    }

    /// `grep` for `marker` never succeeds.
    pub fn without_marker(self, marker: &str) -> Self {
        self.state
            .borrow_mut()
            .missing_markers
            .insert(marker.to_string());
        self
    }

    /// `pgrep -x name` never succeeds.
    pub fn with_dead_process(self, name: &str) -> Self {
        self.state
            .borrow_mut()
            .dead_processes
            .insert(name.to_string());
        self
    }

    /// Answers for successive `pgrep -c` calls for exactly `pattern`.
    /// The last answer repeats.
    pub fn with_pgrep_counts(self, pattern: &str, counts: &[usize]) -> Self {
        self.state
            .borrow_mut()
            .pgrep_counts
            .insert(pattern.to_string(), counts.iter().copied().collect());
        self
    }

    /// Commands containing `needle` exit with status 1.
    pub fn failing_command(self, needle: &str) -> Self {
        self.state.borrow_mut().failing.push(needle.to_string());
        self
    }

    pub fn failing_get(self) -> Self {
        self.state.borrow_mut().failing_get = true;
        self
    }

    /// Every line handed to the shell, in order.
    pub fn commands(&self) -> Vec<String> {
        self.state.borrow().commands.clone()
    }

    pub fn ran(&self, needle: &str) -> bool {
        self.position(needle).is_some()
    }

    /// Index of the first command containing `needle`.
    pub fn position(&self, needle: &str) -> Option<usize> {
        self.state
            .borrow()
            .commands
            .iter()
            .position(|c| c.contains(needle))
    }

    pub fn count(&self, needle: &str) -> usize {
        self.state
            .borrow()
            .commands
            .iter()
            .filter(|c| c.contains(needle))
            .count()
    }

    pub fn puts(&self) -> Vec<(PathBuf, String)> {
        self.state.borrow().puts.clone()
    }

    pub fn put_contents(&self, path: &Path) -> Option<String> {
        self.state
            .borrow()
            .puts
            .iter()
            .rev()
            .find(|(p, _)| p == path)
            .map(|(_, c)| c.clone())
    }

    pub fn gets(&self) -> Vec<(PathBuf, PathBuf)> {
        self.state.borrow().gets.clone()
    }

    fn answer(&self, cmd: &str) -> RunOutput {
        let mut state = self.state.borrow_mut();
        if state.failing.iter().any(|n| cmd.contains(n.as_str())) {
            return RunOutput::failed(1);
        }
        if let Some(dir) = cmd.strip_prefix("mkdir -p ") {
            state.created_dirs.push(dir.to_string());
            return RunOutput::ok("");
        }
        if let Some(path) = cmd.strip_prefix("test -e ") {
            let uploaded = state.puts.iter().any(|(p, _)| quote_path(p) == path);
            let fresh = state
                .created_dirs
                .iter()
                .any(|d| path.starts_with(&format!("{d}/")));
            let missing = state
                .missing_files
                .iter()
                .any(|p| quote_path(p) == path)
                || (fresh && !uploaded);
            return if missing {
                RunOutput::failed(1)
            } else {
                RunOutput::ok("")
            };
        }
        if cmd.starts_with("command -v ") {
            let missing = state
                .missing_programs
                .iter()
                .any(|p| cmd.contains(p.as_str()));
            return if missing {
                RunOutput::failed(1)
            } else {
                RunOutput::ok("")
            };
        }
        if cmd.starts_with("grep -q -F ") {
            let missing = state
                .missing_markers
                .iter()
                .any(|m| cmd.contains(m.as_str()));
            return if missing {
                RunOutput::failed(1)
            } else {
                RunOutput::ok("")
            };
        }
        if let Some(name) = cmd.strip_prefix("pgrep -x ") {
            return if state.dead_processes.contains(name) {
                RunOutput::failed(1)
            } else {
                RunOutput::ok(format!("{}\n", 4242))
            };
        }
        if let Some(pattern) = cmd.strip_prefix("pgrep -c ") {
            let count = state
                .pgrep_counts
                .iter_mut()
                .find(|(key, _)| quote(key) == pattern)
                .map(|(_, counts)| {
                    if counts.len() > 1 {
                        counts.pop_front().unwrap_or(0)
                    } else {
                        counts.front().copied().unwrap_or(0)
                    }
                })
                .unwrap_or(0);
            // pgrep exits 1 when nothing matches
            let status = if count == 0 { 1 } else { 0 };
            return RunOutput {
                status,
                stdout: format!("{count}\n"),
                stderr: String::new(),
            };
        }
        if cmd.starts_with("tail -n ") {
            return RunOutput::ok("last lines of the log\n");
        }
        if let Some(path) = cmd.strip_prefix("cat ") {
            let contents = state
                .puts
                .iter()
                .rev()
                .find(|(p, _)| quote_path(p) == path)
                .map(|(_, c)| c.clone());
            return match contents {
                Some(c) => RunOutput::ok(c),
                None => RunOutput::failed(1),
            };
        }
        RunOutput::ok("")
    }
}

impl RemoteNode for FakeNode {
    fn addr(&self) -> &str {
        &self.addr
    }

    fn is_local(&self) -> bool {
        self.local
    }

    fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    fn run(&self, cmd: &str, opts: &RunOpts) -> Result<RunOutput> {
        self.state.borrow_mut().commands.push(opts.render(cmd));
        if self.dry_run {
            return Ok(RunOutput::ok(""));
        }
        Ok(self.answer(cmd))
    }

    fn put(&self, contents: &[u8], path: &Path) -> Result<()> {
        self.state.borrow_mut().puts.push((
            path.to_path_buf(),
            String::from_utf8_lossy(contents).into_owned(),
        ));
        Ok(())
    }

    fn get(&self, remote: &Path, local: &Path) -> Result<()> {
        if self.state.borrow().failing_get {
            bail!("scp {} failed", remote.display());
        }
        self.state
            .borrow_mut()
            .gets
            .push((remote.to_path_buf(), local.to_path_buf()));
        Ok(())
    }

    fn home(&self) -> Result<PathBuf> {
        Ok(PathBuf::from("/home/fake"))
    }
}

/// Four fake nodes wired into [`Machines`].
pub struct FakeTestbed {
    pub sender: Rc<FakeNode>,
    pub inbox: Rc<FakeNode>,
    pub outbox: Rc<FakeNode>,
    pub receiver: Rc<FakeNode>,
    pub machines: Machines,
}

impl FakeTestbed {
    pub fn new() -> Self {
        Self::from_nodes(
            FakeNode::new("sender"),
            FakeNode::new("inbox"),
            FakeNode::new("outbox"),
            FakeNode::new("receiver"),
        )
    }

    pub fn from_nodes(
        sender: FakeNode,
        inbox: FakeNode,
        outbox: FakeNode,
        receiver: FakeNode,
    ) -> Self {
        let sender = Rc::new(sender);
        let inbox = Rc::new(inbox);
        let outbox = Rc::new(outbox);
        let receiver = Rc::new(receiver);
        let machines = Machines::from_nodes([
            (Role::Sender, sender.clone() as Rc<dyn RemoteNode>),
            (Role::Inbox, inbox.clone() as Rc<dyn RemoteNode>),
            (Role::Outbox, outbox.clone() as Rc<dyn RemoteNode>),
            (Role::Receiver, receiver.clone() as Rc<dyn RemoteNode>),
        ]);
        Self {
            sender,
            inbox,
            outbox,
            receiver,
            machines,
        }
    }

    pub fn all(&self) -> [&FakeNode; 4] {
        [&self.sender, &self.inbox, &self.outbox, &self.receiver]
    }
}

impl Default for FakeTestbed {
    fn default() -> Self {
        Self::new()
    }
}

/// A valid config rooted at `root` with a single-iteration sweep.
///
/// `experiment` replaces the default `[experiment]` table when given.
pub fn test_config_toml(root: &Path, experiment: Option<&str>) -> String {
    let experiment = experiment.unwrap_or(
        r#"
sch = ["fifo"]
alg = ["copa"]
rate = [96]
rtt = [50]
bdp = [2]
seed = [1]
bundle_traffic = [[{ source = "iperf", port = 5050, flows = 4, length = 10, alg = "cubic" }]]
cross_traffic = [[]]
"#,
    );
    format!(
        r#"
[topology.sender]
name = "sender"
ifaces = [{{ dev = "eth1", addr = "10.1.1.1" }}]

[topology.inbox]
name = "inbox"
listen_port = 28316
ifaces = [{{ dev = "eth1", addr = "10.1.1.2" }}, {{ dev = "eth2", addr = "10.1.2.2" }}]

[topology.outbox]
name = "outbox"
ifaces = [{{ dev = "eth1", addr = "10.1.2.3" }}]

[topology.receiver]
name = "receiver"
self = true
ifaces = [{{ dev = "eth1", addr = "10.1.2.4" }}]

[parameters]
initial_sample_rate = 128
bg_port_start = 5000
qdisc_buf_size = 15000

[structure]
bundler_root = "{root}"

[ccp.copa]
binary = "ccp_copa/target/release/copa"

[ccp.const]
binary = "ccp_const/target/release/ccp_const"

[distributions]
CAIDA_CDF = "{root}/CAIDA_CDF"

[experiment]
{experiment}
"#,
        root = root.display(),
    )
}

/// Parsed [`test_config_toml`] with every settle delay removed.
pub fn test_config(root: &Path, experiment: Option<&str>) -> Config {
    let mut config = Config::from_toml_str(&test_config_toml(root, experiment), "exp")
        .expect("test config parses");
    config.timing = Timing::zero();
    config
}
