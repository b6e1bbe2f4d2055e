//! Command execution on experiment nodes.
//!
//! Everything the orchestrator does to a machine goes through
//! [`RemoteNode`], so iterations can be driven against real hosts over ssh,
//! the local shell, or a scripted fake in tests.

mod node;
pub mod readiness;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use anyhow::{Context, Result, bail};
use emulation::quote;

pub use self::node::{Node, NodeOptions, Transport, local_home};
use self::readiness::{RetryPolicy, poll_until};
use crate::config::{Role, Topology};
use crate::error::ExpError;

/// Number of log lines attached to process failures.
pub const LOG_TAIL_LINES: usize = 40;

/// How a command is wrapped before it reaches the node's shell.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunOpts {
    pub sudo: bool,
    pub background: bool,
    pub stdout: Option<PathBuf>,
    pub stderr: Option<PathBuf>,
    pub workdir: Option<PathBuf>,
}

impl RunOpts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sudo(mut self) -> Self {
        self.sudo = true;
        self
    }

    /// Detach the command from the session; `run` returns immediately.
    pub fn background(mut self) -> Self {
        self.background = true;
        self
    }

    /// Send both stdout and stderr to `path`.
    pub fn log_to(mut self, path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        self.stdout = Some(path.clone());
        self.stderr = Some(path);
        self
    }

    pub fn stdout(mut self, path: impl Into<PathBuf>) -> Self {
        self.stdout = Some(path.into());
        self
    }

    pub fn workdir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.workdir = Some(dir.into());
        self
    }

    /// The exact line handed to the node's shell.
    pub fn render(&self, cmd: &str) -> String {
        let mut line = if self.sudo {
            format!("sudo bash -c {}", quote(cmd))
        } else {
            cmd.to_string()
        };
        if self.background {
            line = format!("nohup bash -c {}", quote(&line));
        }

        match (&self.stdout, &self.stderr) {
            (Some(out), Some(err)) if out == err => {
                line.push_str(&format!(" > {} 2>&1", quote_path(out)));
            }
            (out, err) => {
                if let Some(out) = out {
                    line.push_str(&format!(" > {}", quote_path(out)));
                } else if self.background {
                    line.push_str(" > /dev/null");
                }
                if let Some(err) = err {
                    line.push_str(&format!(" 2> {}", quote_path(err)));
                } else if self.background {
                    line.push_str(" 2> /dev/null");
                }
            }
        }
        if self.background {
            line.push_str(" < /dev/null &");
        }

        match &self.workdir {
            Some(dir) => format!("cd {} && {line}", quote_path(dir)),
            None => line,
        }
    }
}

/// Exit status and captured output of a finished command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunOutput {
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl RunOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            status: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failed(status: i32) -> Self {
        Self {
            status,
            ..Self::default()
        }
    }

    pub fn success(&self) -> bool {
        self.status == 0
    }
}

pub fn quote_path(path: &Path) -> String {
    quote(&path.to_string_lossy())
}

/// Replace a leading `~` with `home`.
pub fn expand_home(path: &Path, home: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => home.join(rest),
        Err(_) => path.to_path_buf(),
    }
}

/// A machine that takes part in an experiment.
pub trait RemoteNode {
    /// Address used to reach the node, for messages.
    fn addr(&self) -> &str;

    fn is_local(&self) -> bool;

    /// Commands are printed instead of executed.
    fn is_dry_run(&self) -> bool;

    /// Run `cmd` through the node's shell.
    ///
    /// A non-zero exit is not an error here; failing to reach the node is.
    fn run(&self, cmd: &str, opts: &RunOpts) -> Result<RunOutput>;

    /// Write `contents` to `path` on the node.
    fn put(&self, contents: &[u8], path: &Path) -> Result<()>;

    /// Copy `remote` on the node to `local` on this machine.
    fn get(&self, remote: &Path, local: &Path) -> Result<()>;

    /// The home directory of the account commands run as.
    fn home(&self) -> Result<PathBuf>;

    /// Run `cmd` and fail unless it exits zero.
    fn expect(&self, cmd: &str, opts: &RunOpts, what: &str) -> Result<RunOutput> {
        let out = self
            .run(cmd, opts)
            .with_context(|| format!("{what} on {}", self.addr()))?;
        if !out.success() {
            bail!(
                "{what} on {}: `{cmd}` exited with {}\n{}",
                self.addr(),
                out.status,
                out.stderr.trim()
            );
        }
        Ok(out)
    }

    fn file_exists(&self, path: &Path) -> Result<bool> {
        let out = self.run(&format!("test -e {}", quote_path(path)), &RunOpts::new())?;
        Ok(out.success())
    }

    fn prog_exists(&self, program: &str) -> Result<bool> {
        let out = self.run(
            &format!("command -v {} > /dev/null", quote(program)),
            &RunOpts::new(),
        )?;
        Ok(out.success())
    }

    fn read_file(&self, path: &Path) -> Result<String> {
        let out = self.expect(
            &format!("cat {}", quote_path(path)),
            &RunOpts::new(),
            "read file",
        )?;
        Ok(out.stdout)
    }

    /// Last lines of a log, for error messages. Never fails.
    fn log_tail(&self, path: &Path) -> String {
        let cmd = format!("tail -n {LOG_TAIL_LINES} {}", quote_path(path));
        match self.run(&cmd, &RunOpts::new()) {
            Ok(out) if out.success() => out.stdout,
            Ok(out) => format!("<could not read {}: exit {}>", path.display(), out.status),
            Err(e) => format!("<could not read {}: {e:#}>", path.display()),
        }
    }

    /// Number of processes whose name matches the extended regex `pattern`.
    fn count_procs(&self, pattern: &str) -> Result<usize> {
        let out = self.run(&format!("pgrep -c {}", quote(pattern)), &RunOpts::new())?;
        let count = out.stdout.trim();
        count.parse().with_context(|| {
            format!(
                "unexpected pgrep output on {} (exit {}): {count:?}",
                self.addr(),
                out.status
            )
        })
    }

    /// Wait for a process named exactly `name` to appear.
    fn check_proc(&self, name: &str, log: &Path, policy: &RetryPolicy) -> Result<()> {
        let probe = format!("pgrep -x {}", quote(name));
        let running = poll_until(policy, || Ok(self.run(&probe, &RunOpts::new())?.success()))?;
        if running {
            return Ok(());
        }
        Err(ExpError::ProcessNotRunning {
            node: self.addr().to_string(),
            process: name.to_string(),
            log: log.to_path_buf(),
            log_tail: self.log_tail(log),
        }
        .into())
    }

    /// Wait for `marker` to appear in `log`.
    fn check_file(&self, marker: &str, log: &Path, policy: &RetryPolicy) -> Result<()> {
        let probe = format!("grep -q -F -- {} {}", quote(marker), quote_path(log));
        let found = poll_until(policy, || Ok(self.run(&probe, &RunOpts::new())?.success()))?;
        if found {
            return Ok(());
        }
        Err(ExpError::ReadinessTimeout {
            node: self.addr().to_string(),
            marker: marker.to_string(),
            log: log.to_path_buf(),
        }
        .into())
    }
}

/// A node together with the role it plays, so that artifacts can be traced
/// back to the machine that produced them.
#[derive(Clone, Copy)]
pub struct Endpoint<'a> {
    pub role: Role,
    pub node: &'a dyn RemoteNode,
}

/// Connections to the four roles.
///
/// Roles that share a hostname share one connection; [`Machines::conns`]
/// lists each distinct connection once.
pub struct Machines {
    roles: BTreeMap<Role, usize>,
    conns: Vec<Rc<dyn RemoteNode>>,
}

impl Machines {
    /// Open (lazily) one connection per distinct hostname in the topology.
    ///
    /// The node marked `self` is driven through the local shell, as is any
    /// other role that names the same host.
    pub fn connect(topology: &Topology, opts: NodeOptions) -> Self {
        let mut by_host: BTreeMap<String, usize> = BTreeMap::new();
        let mut roles = BTreeMap::new();
        let mut conns: Vec<Rc<dyn RemoteNode>> = Vec::new();

        // Register the local node first so that hostname aliases resolve to it.
        let mut order: Vec<Role> = Role::ALL.to_vec();
        order.sort_by_key(|role| !topology.node(*role).is_self);

        for role in order {
            let details = topology.node(role);
            let idx = *by_host.entry(details.name.clone()).or_insert_with(|| {
                let node = if details.is_self {
                    Node::local(&details.name, opts)
                } else {
                    Node::ssh(&details.name, details.user.clone(), details.port, opts)
                };
                conns.push(Rc::new(node));
                conns.len() - 1
            });
            roles.insert(role, idx);
        }

        Self { roles, conns }
    }

    /// Build from existing nodes; nodes reporting the same address are merged.
    pub fn from_nodes(nodes: [(Role, Rc<dyn RemoteNode>); 4]) -> Self {
        let mut roles = BTreeMap::new();
        let mut conns: Vec<Rc<dyn RemoteNode>> = Vec::new();
        for (role, node) in nodes {
            let idx = match conns.iter().position(|c| c.addr() == node.addr()) {
                Some(idx) => idx,
                None => {
                    conns.push(node);
                    conns.len() - 1
                }
            };
            roles.insert(role, idx);
        }
        Self { roles, conns }
    }

    pub fn role(&self, role: Role) -> &dyn RemoteNode {
        // Every constructor fills all four roles.
        self.conns[self.roles[&role]].as_ref()
    }

    pub fn endpoint(&self, role: Role) -> Endpoint<'_> {
        Endpoint {
            role,
            node: self.role(role),
        }
    }

    pub fn sender(&self) -> &dyn RemoteNode {
        self.role(Role::Sender)
    }

    pub fn inbox(&self) -> &dyn RemoteNode {
        self.role(Role::Inbox)
    }

    pub fn outbox(&self) -> &dyn RemoteNode {
        self.role(Role::Outbox)
    }

    pub fn receiver(&self) -> &dyn RemoteNode {
        self.role(Role::Receiver)
    }

    pub fn conns(&self) -> impl Iterator<Item = &dyn RemoteNode> {
        self.conns.iter().map(|c| c.as_ref())
    }
}
