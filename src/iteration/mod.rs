//! One run of the sweep, from a clean testbed to collected results.
//!
//! Stages run strictly in order:
//!
//! 1. kill leftover processes on every node
//! 2. claim and prepare the iteration directory
//! 3. start the inbox, then the agent, and wait for the inbox to be ready
//! 4. optionally start tcpprobe on the sender
//! 5. start bundle servers on the sender and cross servers on the receiver
//! 6. build client fragments without running them
//! 7. run the emulation shell, which starts the outbox and every client
//! 8. kill leftovers again and fetch every artifact

mod manifest;
mod session;

use std::fmt;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use emulation::{EmulatedTopology, EmulationPath, LinkParams, QueueDiscipline, quote};
use tracing::{debug, info, warn};

pub use self::manifest::{Artifact, CollectReport, Manifest};
pub use self::session::Session;
use crate::boxes::{self, InboxCommand, OutboxCommand};
use crate::ccp;
use crate::config::{Config, Role};
use crate::error::ExpError;
use crate::remote::readiness::Readiness;
use crate::remote::{Machines, RemoteNode, RunOpts, expand_home, quote_path};
use crate::sweep::Experiment;
use crate::traffic::{self, ClientStart, Launch, Region, Traffic};

pub const TCPPROBE: &str = "/proc/net/tcpprobe";

/// What to do when an iteration's results already exist.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OnExisting {
    /// Refuse to continue; the operator has to choose.
    #[default]
    Abort,
    /// Leave the old results alone and move on.
    Skip,
    /// Remove the old results and run again.
    Overwrite,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct IterationOptions {
    pub on_existing: OnExisting,
    pub tcpprobe: bool,
    /// Leftover processes after a kill abort the run.
    pub strict: bool,
    pub dry_run: bool,
    pub readiness: Readiness,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    KillLeftovers,
    PrepareDir,
    StartInbox,
    StartAgent,
    AwaitInbox,
    StartTcpprobe,
    StartServers,
    BuildClients,
    RunEmulation,
    Collect,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Stage::KillLeftovers => "kill-leftovers",
            Stage::PrepareDir => "prepare-dir",
            Stage::StartInbox => "start-inbox",
            Stage::StartAgent => "start-ccp-agent",
            Stage::AwaitInbox => "await-inbox-ready",
            Stage::StartTcpprobe => "start-tcpprobe",
            Stage::StartServers => "start-servers",
            Stage::BuildClients => "build-clients",
            Stage::RunEmulation => "run-emulation",
            Stage::Collect => "collect-outputs",
        })
    }
}

/// State shared by the stages of one iteration.
pub struct IterationEnv<'a> {
    pub config: &'a Config,
    /// Iteration directory, as seen by the nodes.
    pub dir: PathBuf,
    pub manifest: Manifest,
    pub readiness: Readiness,
    pub dry_run: bool,
}

impl<'a> IterationEnv<'a> {
    pub fn new(config: &'a Config, dir: PathBuf, readiness: Readiness, dry_run: bool) -> Self {
        Self {
            config,
            dir,
            manifest: Manifest::new(),
            readiness,
            dry_run,
        }
    }

    pub fn path(&self, name: impl AsRef<Path>) -> PathBuf {
        self.dir.join(name)
    }

    pub fn record(&mut self, role: Role, path: PathBuf) {
        self.manifest.push(role, path);
    }

    /// Give a freshly started process time to come up. No-op in dry runs.
    pub fn settle(&self, delay: Duration) {
        if !self.dry_run && !delay.is_zero() {
            thread::sleep(delay);
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IterationOutcome {
    Completed {
        dir: PathBuf,
        elapsed: Duration,
        collected: CollectReport,
    },
    /// Results already exist and `--skip-existing` was given.
    SkippedExisting(PathBuf),
    /// The combination is not meaningful (e.g. no bundler with a custom
    /// scheduler).
    SkippedCombination,
}

/// Drives iterations over a fixed set of machines.
pub struct Coordinator<'a> {
    config: &'a Config,
    machines: &'a Machines,
    opts: IterationOptions,
    session: Session,
    local_home: PathBuf,
}

impl<'a> Coordinator<'a> {
    pub fn new(
        config: &'a Config,
        machines: &'a Machines,
        opts: IterationOptions,
        local_home: PathBuf,
    ) -> Self {
        Self {
            config,
            machines,
            opts,
            session: Session::new(),
            local_home,
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    fn bind_traffic(&self, exp: &Experiment) -> Result<(Vec<Traffic>, Vec<Traffic>), ExpError> {
        let window = self.config.parameters.bundle_window();
        Ok((
            Traffic::all(&exp.bundle_traffic, Region::Bundle, exp, window)?,
            Traffic::all(&exp.cross_traffic, Region::Cross, exp, window)?,
        ))
    }

    pub fn run(&mut self, exp: &Experiment) -> Result<IterationOutcome> {
        if exp.skipped() {
            info!(%exp, "skipping: no bundler with scheduler {}", exp.sch);
            return Ok(IterationOutcome::SkippedCombination);
        }
        let (bundle, cross) = self.bind_traffic(exp)?;
        let name = exp.iteration_name(&traffic::describe(&bundle), &traffic::describe(&cross));
        let dir = self.config.experiment_dir().join(name);

        enter(Stage::KillLeftovers);
        self.kill_leftovers()?;

        enter(Stage::PrepareDir);
        if !self.prepare_dir(&dir)? {
            return Ok(IterationOutcome::SkippedExisting(dir));
        }

        let mut env = IterationEnv::new(
            self.config,
            dir.clone(),
            self.opts.readiness,
            self.opts.dry_run,
        );
        let started = Instant::now();

        if exp.uses_bundler() {
            self.start_inbox(&mut env, exp)?;
        }
        if self.opts.tcpprobe {
            enter(Stage::StartTcpprobe);
            self.start_tcpprobe(&mut env)
                .with_context(|| format!("{} failed", Stage::StartTcpprobe))?;
        }

        enter(Stage::StartServers);
        let sender = self.machines.endpoint(Role::Sender);
        let receiver = self.machines.endpoint(Role::Receiver);
        for t in &bundle {
            t.start_server(&mut env, sender)?;
        }
        for t in &cross {
            t.start_server(&mut env, receiver)?;
        }

        enter(Stage::BuildClients);
        let mut bundle_clients = Vec::with_capacity(bundle.len());
        for t in &bundle {
            let start = t.start_client(&mut env, receiver, Region::Bundle, Launch::Deferred)?;
            bundle_clients.push(fragment(start)?);
        }
        let mut cross_clients = Vec::with_capacity(cross.len());
        for t in &cross {
            let start = t.start_client(&mut env, receiver, Region::Cross, Launch::Deferred)?;
            cross_clients.push(fragment(start)?);
        }

        enter(Stage::RunEmulation);
        self.run_emulation(&mut env, exp, bundle_clients, cross_clients)
            .with_context(|| format!("{} failed", Stage::RunEmulation))?;
        let elapsed = started.elapsed();
        info!(elapsed = ?elapsed, "ran for {:.1} seconds", elapsed.as_secs_f64());

        enter(Stage::KillLeftovers);
        self.kill_leftovers()?;

        enter(Stage::Collect);
        let local_dir = expand_home(&dir, &self.local_home);
        let collected = env.manifest.collect(self.machines, &local_dir);
        if !collected.failed.is_empty() {
            warn!(failed = collected.failed.len(), "some results could not be fetched");
        }
        Ok(IterationOutcome::Completed {
            dir,
            elapsed,
            collected,
        })
    }

    /// Kill every experiment process on every node and make sure none
    /// survived.
    pub fn kill_leftovers(&self) -> Result<()> {
        let pattern = self.config.kill_pattern();
        for node in self.machines.conns() {
            node.run(&format!("pkill -9 {}", quote(&pattern)), &RunOpts::new().sudo())
                .with_context(|| {
                    format!("Failed to kill experiment processes on {}", node.addr())
                })?;
            if node.is_dry_run() {
                continue;
            }
            let count = node.count_procs(&pattern)?;
            if count == 0 {
                continue;
            }
            let err = ExpError::LeftoverProcesses {
                node: node.addr().to_string(),
                count,
            };
            if self.opts.strict {
                return Err(err.into());
            }
            warn!(node = node.addr(), count, "{err}");
        }
        Ok(())
    }

    /// Returns false if the iteration must be skipped.
    fn prepare_dir(&mut self, dir: &Path) -> Result<bool> {
        self.session.claim(dir)?;

        let local = expand_home(dir, &self.local_home);
        let exists = local.exists();
        let quoted = quote_path(dir);
        match (exists, self.opts.on_existing) {
            (false, _) => info!(dir = %dir.display(), "fresh"),
            (true, OnExisting::Skip) => {
                info!(dir = %dir.display(), "results exist, skipping");
                return Ok(false);
            }
            (true, OnExisting::Abort) => return Err(ExpError::ExistingResults(local).into()),
            (true, OnExisting::Overwrite) => {
                info!(dir = %dir.display(), "overwriting");
                for node in self.machines.conns() {
                    node.expect(
                        &format!("rm -rf {quoted}"),
                        &RunOpts::new(),
                        &format!("Failed to remove iteration directory {}", dir.display()),
                    )?;
                }
            }
        }

        for node in self.machines.conns() {
            node.expect(
                &format!("mkdir -p {quoted}"),
                &RunOpts::new(),
                &format!("Failed to create iteration directory {}", dir.display()),
            )?;
        }
        Ok(true)
    }

    fn start_inbox(&self, env: &mut IterationEnv<'_>, exp: &Experiment) -> Result<()> {
        let inbox = self.machines.endpoint(Role::Inbox);
        let log = boxes::inbox_log(&env.dir);

        enter(Stage::StartInbox);
        inbox.node.expect(
            &InboxCommand::new(self.config, &exp.sch).command().render(),
            &RunOpts::new().sudo().background().log_to(&log),
            "Failed to start inbox",
        )?;
        env.record(Role::Inbox, log.clone());
        env.settle(self.config.timing.inbox_startup());
        inbox
            .node
            .check_proc(boxes::INBOX_PROCESS, &log, &env.readiness.inbox)?;
        inbox
            .node
            .check_file(boxes::INBOX_AWAITING_DATAPATH, &log, &env.readiness.inbox)?;

        enter(Stage::StartAgent);
        let agent_log = ccp::start_agent(
            self.config,
            inbox,
            &exp.alg,
            &env.dir,
            &env.readiness.server,
        )?;
        env.record(Role::Inbox, agent_log);

        enter(Stage::AwaitInbox);
        inbox
            .node
            .check_file(boxes::INBOX_READY, &log, &env.readiness.inbox)?;
        Ok(())
    }

    fn start_tcpprobe(&self, env: &mut IterationEnv<'_>) -> Result<()> {
        let sender = self.machines.sender();
        if !sender.file_exists(Path::new(TCPPROBE))? {
            return Err(ExpError::MissingTool {
                node: sender.addr().to_string(),
                what: "tcpprobe (is the kernel module loaded?)".to_string(),
                path: TCPPROBE.to_string(),
            }
            .into());
        }
        let bg = RunOpts::new().sudo().background();
        sender.expect(
            &format!("dd if=/dev/null of={TCPPROBE} bs=256"),
            &bg,
            "Sender failed to clear tcpprobe buffer",
        )?;
        let log = env.path("tcpprobe.log");
        sender.expect(
            &format!("dd if={TCPPROBE} of={} bs=256", quote_path(&log)),
            &bg,
            "Sender failed to start tcpprobe",
        )?;
        env.record(Role::Sender, log);
        Ok(())
    }

    fn queue_discipline(&self, exp: &Experiment) -> QueueDiscipline {
        let params = &self.config.parameters;
        if !exp.uses_bundler() && exp.sch == "sfq" {
            QueueDiscipline::Sfq
        } else if let Some(ecmp) = &params.ecmp {
            QueueDiscipline::Ecmp(*ecmp)
        } else {
            QueueDiscipline::Fifo {
                downlink: params.fifo_downlink.clone(),
                uplink: params.fifo_uplink.clone(),
            }
        }
    }

    fn run_emulation(
        &self,
        env: &mut IterationEnv<'_>,
        exp: &Experiment,
        bundle_clients: Vec<String>,
        cross_clients: Vec<String>,
    ) -> Result<()> {
        let host = self.machines.receiver();
        let mut paths = emulation_paths(bundle_clients, cross_clients);

        if exp.uses_bundler() {
            let outbox = OutboxCommand::new(self.config, true).command().render();
            for (idx, path) in paths.iter_mut().enumerate() {
                let log = boxes::outbox_log(&env.dir, idx);
                path.outbox = Some(format!("{outbox} > {} 2>&1", quote_path(&log)));
                env.record(Role::Receiver, log);
            }
        }

        let topology = EmulatedTopology::new(
            LinkParams::new(exp.rate, exp.rtt),
            exp.bdp,
            self.queue_discipline(exp),
            env.dir.clone(),
        );
        let plan = topology.build(&paths);

        for script in plan.inner.iter().chain([&plan.outer]) {
            if host.is_dry_run() {
                println!("cat {}\n{}", script.path.display(), script.contents);
            }
            host.put(script.contents.as_bytes(), &script.path)
                .with_context(|| format!("Failed to upload {}", script.path.display()))?;
            host.expect(
                &format!("chmod +x {}", quote_path(&script.path)),
                &RunOpts::new(),
                "Failed to make emulation script executable",
            )?;
        }
        for log in &plan.downlink_logs {
            env.record(Role::Receiver, log.clone());
        }

        info!(link = %topology.link, paths = paths.len(), "starting emulation shell");
        host.expect(
            &quote_path(&plan.outer.path),
            &RunOpts::new().workdir(&env.dir),
            "Failed to start emulation shell on receiver",
        )?;
        Ok(())
    }
}

fn enter(stage: Stage) {
    debug!(%stage, "entering stage");
}

fn fragment(start: ClientStart) -> Result<String> {
    match start {
        ClientStart::Fragment(cmd) => Ok(cmd),
        ClientStart::Running(log) => anyhow::bail!(
            "client was started directly (log {}) instead of inside the emulation shell",
            log.display()
        ),
    }
}

/// One path per bundle client; cross clients share the first path. With no
/// bundle clients there is a single path.
pub fn emulation_paths(bundle: Vec<String>, cross: Vec<String>) -> Vec<EmulationPath> {
    let mut paths: Vec<EmulationPath> = bundle
        .into_iter()
        .map(|client| EmulationPath {
            outbox: None,
            clients: vec![client],
        })
        .collect();
    if paths.is_empty() {
        paths.push(EmulationPath::default());
    }
    paths[0].clients.extend(cross);
    paths
}
