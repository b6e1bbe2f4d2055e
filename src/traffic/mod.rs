//! Traffic generators driven by an iteration.
//!
//! A [`TrafficSpec`] is what the config file says; a [`Traffic`] is that spec
//! bound to one experiment (Poisson load resolved against the link rate,
//! seed filled in) and checked against the port window it must respect.

mod cbr;
mod iperf;
mod load;
mod poisson;

use std::fmt;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use emulation::{Chain, ShellCommand};
use serde::{Deserialize, Deserializer};
use tracing::info;

pub use self::cbr::CbrSpec;
pub use self::iperf::IperfSpec;
pub use self::load::{LoadError, LoadExpr};
pub use self::poisson::{ETG_SERVER_PROCESS, PoissonSpec, PoissonTraffic};
use crate::config::PortWindow;
use crate::error::ExpError;
use crate::iteration::IterationEnv;
use crate::remote::{Endpoint, RunOpts};
use crate::sweep::Experiment;

/// Agent that holds CBR flows at a fixed rate.
pub const CBR_AGENT: &str = "const";

/// Printed by iperf once it accepts connections.
pub const SERVER_LISTENING: &str = "Server listening on TCP port";

/// Seconds between iperf interim reports.
pub const REPORT_INTERVAL_SECS: u32 = 1;

/// Which side of the port window a traffic instance belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Region {
    /// Inside the window: measured by the inbox/outbox pair.
    Bundle,
    /// Outside the window: competing load that is not measured.
    Cross,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "source", rename_all = "lowercase")]
pub enum TrafficSpec {
    Iperf(IperfSpec),
    Cbr(CbrSpec),
    Poisson(PoissonSpec),
}

impl TrafficSpec {
    /// First and last port used.
    pub fn ports(&self) -> (u16, u16) {
        match self {
            TrafficSpec::Iperf(s) => (s.port, s.port),
            TrafficSpec::Cbr(s) => (s.port, s.port),
            TrafficSpec::Poisson(s) => (s.start_port, s.last_port()),
        }
    }

    pub fn check_region(&self, region: Region, window: PortWindow) -> Result<(), ExpError> {
        if let TrafficSpec::Poisson(p) = self {
            if p.conns == 0 {
                return Err(ExpError::config("poisson traffic needs at least one connection"));
            }
            if u32::from(p.start_port) + u32::from(p.conns) - 1 > u32::from(u16::MAX) {
                return Err(ExpError::config(format!(
                    "poisson traffic with {} connections from port {} runs past port {}",
                    p.conns,
                    p.start_port,
                    u16::MAX
                )));
            }
        }

        let (first, last) = self.ports();
        let traffic = if first == last {
            first.to_string()
        } else {
            format!("{first}-{last}")
        };
        match region {
            Region::Bundle if !window.contains_all(first, last) => {
                Err(ExpError::BundleOutsideRegion {
                    traffic,
                    start: window.start,
                    end: window.end,
                })
            }
            Region::Cross if window.overlaps(first, last) => Err(ExpError::CrossInsideRegion {
                traffic,
                start: window.start,
                end: window.end,
            }),
            _ => Ok(()),
        }
    }
}

/// Whether a client runs now or is handed back for the emulation shell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Launch {
    Deferred,
    Now,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientStart {
    /// Shell fragment to be run inside an emulated path.
    Fragment(String),
    /// Already running in the background; output goes to this log.
    Running(PathBuf),
}

/// A traffic spec bound to one experiment.
#[derive(Debug, Clone, PartialEq)]
pub enum Traffic {
    Iperf(IperfSpec),
    Cbr(CbrSpec),
    Poisson(PoissonTraffic),
}

impl Traffic {
    pub fn new(
        spec: &TrafficSpec,
        region: Region,
        exp: &Experiment,
        window: PortWindow,
    ) -> Result<Self, ExpError> {
        spec.check_region(region, window)?;
        Ok(match spec {
            TrafficSpec::Iperf(s) => Traffic::Iperf(s.clone()),
            TrafficSpec::Cbr(s) => Traffic::Cbr(s.clone()),
            TrafficSpec::Poisson(s) => Traffic::Poisson(PoissonTraffic::bind(s, exp)?),
        })
    }

    /// Bind every spec of one sweep axis.
    pub fn all(
        specs: &[TrafficSpec],
        region: Region,
        exp: &Experiment,
        window: PortWindow,
    ) -> Result<Vec<Self>, ExpError> {
        specs
            .iter()
            .map(|spec| Traffic::new(spec, region, exp, window))
            .collect()
    }

    pub fn spec(&self) -> TrafficSpec {
        match self {
            Traffic::Iperf(s) => TrafficSpec::Iperf(s.clone()),
            Traffic::Cbr(s) => TrafficSpec::Cbr(s.clone()),
            Traffic::Poisson(p) => TrafficSpec::Poisson(p.spec.clone()),
        }
    }

    /// Launch the server side and wait until it is ready. Returns its log.
    pub fn start_server(&self, env: &mut IterationEnv<'_>, at: Endpoint<'_>) -> Result<PathBuf> {
        info!(node = at.node.addr(), traffic = %self, "starting server");
        match self {
            Traffic::Iperf(s) => s.start_server(env, at),
            Traffic::Cbr(s) => s.start_server(env, at),
            Traffic::Poisson(p) => p.start_server(env, at),
        }
    }

    /// Build the client side and either run it or hand it back.
    pub fn start_client(
        &self,
        env: &mut IterationEnv<'_>,
        at: Endpoint<'_>,
        region: Region,
        launch: Launch,
    ) -> Result<ClientStart> {
        self.spec()
            .check_region(region, env.config.parameters.bundle_window())?;
        info!(node = at.node.addr(), traffic = %self, ?launch, "preparing client");
        match self {
            Traffic::Iperf(s) => s.start_client(env, at, region, launch),
            Traffic::Cbr(s) => s.start_client(env, at, region, launch),
            Traffic::Poisson(p) => p.start_client(env, at, region, launch),
        }
    }
}

impl fmt::Display for Traffic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Traffic::Iperf(s) => write!(f, "iperf.{}.{}", s.alg, s.flows),
            Traffic::Cbr(s) => write!(f, "cbr.{}", s.rate),
            Traffic::Poisson(p) => write!(f, "{p}"),
        }
    }
}

/// Join traffic descriptors the way iteration names expect.
pub fn describe(traffic: &[Traffic]) -> String {
    traffic
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

/// Where a client finds its server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Destination {
    Host(IpAddr),
    /// The host running the emulation shell, as seen from inside it.
    EmulationBase,
}

impl Destination {
    /// Bundle servers run on the sender; cross servers run on the host of
    /// the emulation shell.
    fn for_region(env: &IterationEnv<'_>, region: Region) -> Result<Self> {
        match region {
            Region::Bundle => {
                let addr = env
                    .config
                    .topology
                    .sender
                    .primary_addr()
                    .context("sender has no usable address")?;
                Ok(Destination::Host(addr))
            }
            Region::Cross => Ok(Destination::EmulationBase),
        }
    }

    fn push(self, cmd: ShellCommand) -> ShellCommand {
        match self {
            Destination::Host(addr) => cmd.arg(addr),
            Destination::EmulationBase => cmd.expand("$MAHIMAHI_BASE"),
        }
    }
}

/// Run `chain` in the background on `at`, or hand it back with its output
/// sent to `log`.
fn launch_client(
    at: Endpoint<'_>,
    chain: Chain,
    log: &Path,
    launch: Launch,
    what: &str,
) -> Result<ClientStart> {
    match launch {
        Launch::Deferred => Ok(ClientStart::Fragment(chain.log_to(log).render())),
        Launch::Now => {
            at.node.expect(
                &chain.render(),
                &RunOpts::new().background().log_to(log),
                &format!("Failed to start {what}"),
            )?;
            Ok(ClientStart::Running(log.to_path_buf()))
        }
    }
}

/// Start an iperf server and wait for it to listen.
fn start_iperf_server(
    env: &mut IterationEnv<'_>,
    at: Endpoint<'_>,
    cmd: ShellCommand,
    log: PathBuf,
    settle: Duration,
) -> Result<PathBuf> {
    at.node.expect(
        &cmd.render(),
        &RunOpts::new().background().log_to(&log),
        "Failed to start iperf server",
    )?;
    env.record(at.role, log.clone());
    env.settle(settle);
    at.node
        .check_file(SERVER_LISTENING, &log, &env.readiness.server)?;
    Ok(log)
}

/// Lowest `i >= 1` for which `name(i)` does not exist in the iteration
/// directory on `at`. Always 1 in dry runs.
fn next_free_index(
    env: &IterationEnv<'_>,
    at: Endpoint<'_>,
    name: impl Fn(usize) -> String,
) -> Result<usize> {
    const LIMIT: usize = 1000;
    if env.dry_run {
        return Ok(1);
    }
    for i in 1..=LIMIT {
        if !at.node.file_exists(&env.path(name(i)))? {
            return Ok(i);
        }
    }
    anyhow::bail!(
        "{} already holds {LIMIT} files named like {}",
        env.dir.display(),
        name(1)
    )
}

/// Accept a TOML string or number and keep its text.
fn text_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Int(i64),
        Float(f64),
    }

    Ok(match Raw::deserialize(deserializer)? {
        Raw::Text(s) => s,
        Raw::Int(i) => i.to_string(),
        Raw::Float(f) => f.to_string(),
    })
}
