use std::fmt;
use std::fmt::Write as _;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use emulation::{Chain, ShellCommand};
use serde::Deserialize;

use super::{
    ClientStart, Launch, LoadError, LoadExpr, Region, launch_client, next_free_index,
    text_or_number,
};
use crate::error::ExpError;
use crate::iteration::IterationEnv;
use crate::remote::{Endpoint, RunOpts, expand_home};
use crate::sweep::Experiment;

/// Process name of one traffic generator server.
pub const ETG_SERVER_PROCESS: &str = "etgServer";

fn default_fanout() -> String {
    "1 100".to_string()
}

/// Request/response workload from the empirical traffic generator.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PoissonSpec {
    pub start_port: u16,
    /// One server per connection, on consecutive ports.
    pub conns: u16,
    #[serde(default)]
    pub backlogged: u32,
    pub reqs: u64,
    /// Key into `[distributions]`.
    pub dist: String,
    /// Fraction of the link rate, as an arithmetic expression.
    #[serde(deserialize_with = "text_or_number")]
    pub load: String,
    pub alg: String,
    #[serde(default)]
    pub start_delay: u32,
    #[serde(default = "default_fanout")]
    pub fanout: String,
}

impl PoissonSpec {
    /// Clamped at `u16::MAX`; ranges that overflow are rejected by
    /// [`TrafficSpec::check_region`](super::TrafficSpec::check_region).
    pub fn last_port(&self) -> u16 {
        self.start_port.saturating_add(self.conns.saturating_sub(1))
    }

    pub fn load_expr(&self) -> Result<LoadExpr, LoadError> {
        self.load.parse()
    }
}

/// A Poisson spec bound to one experiment.
#[derive(Debug, Clone, PartialEq)]
pub struct PoissonTraffic {
    pub spec: PoissonSpec,
    pub seed: u64,
    pub load_mbps: u64,
}

impl PoissonTraffic {
    pub fn bind(spec: &PoissonSpec, exp: &Experiment) -> Result<Self, ExpError> {
        let load_mbps = spec
            .load_expr()
            .and_then(|expr| expr.mbps(exp.rate))
            .map_err(|e| ExpError::config(format!("poisson load '{}': {e}", spec.load)))?;
        Ok(Self {
            spec: spec.clone(),
            seed: exp.seed,
            load_mbps,
        })
    }

    /// Workload description read by the client.
    pub fn etg_config(&self, server: IpAddr, dist_path: &Path) -> String {
        let s = &self.spec;
        let mut out = String::new();
        for port in s.start_port..=s.last_port() {
            let _ = writeln!(out, "server {server} {port}");
        }
        let _ = writeln!(out, "req_size_dist {}", dist_path.display());
        let _ = writeln!(out, "fanout {}", s.fanout);
        if s.backlogged > 0 {
            let _ = writeln!(out, "persistent_servers {}", s.backlogged);
        }
        let _ = writeln!(out, "load {}Mbps", self.load_mbps);
        let _ = writeln!(out, "num_reqs {}", s.reqs);
        out
    }

    /// Keyed by port so bundle and cross servers on different nodes never
    /// collide once fetched into one directory.
    pub fn server_log_name(&self) -> String {
        format!("etg_server_{}.log", self.spec.start_port)
    }

    pub fn server_command(&self, script: &Path) -> ShellCommand {
        ShellCommand::from_path(script)
            .arg(self.spec.start_port)
            .arg(self.spec.conns)
            .arg(&self.spec.alg)
    }

    /// The client resolves its config and output names relative to the
    /// iteration directory; it cannot handle long paths.
    fn client_chain(&self, client: &Path, dir: &Path, idx: usize) -> Chain {
        Chain::new().sleep(self.spec.start_delay).cd(dir).then(
            ShellCommand::from_path(client)
                .arg("-c")
                .arg(format!("etgConfig{idx}"))
                .arg("-l")
                .arg(idx)
                .arg("-s")
                .arg(self.seed),
        )
    }

    pub(super) fn start_server(
        &self,
        env: &mut IterationEnv<'_>,
        at: Endpoint<'_>,
    ) -> Result<PathBuf> {
        let log = env.path(self.server_log_name());
        let structure = &env.config.structure;

        let before = if env.dry_run {
            0
        } else {
            at.node.count_procs(ETG_SERVER_PROCESS)?
        };
        at.node.expect(
            &self.server_command(&structure.etg_server_path()).render(),
            &RunOpts::new()
                .background()
                .workdir(structure.etg_root())
                .log_to(&log),
            "Failed to start poisson servers",
        )?;
        env.record(at.role, log.clone());
        env.settle(env.config.timing.server_settle());

        let expected = usize::from(self.spec.conns);
        let running = if env.dry_run {
            expected
        } else {
            at.node
                .count_procs(ETG_SERVER_PROCESS)?
                .saturating_sub(before)
        };
        if running != expected {
            return Err(ExpError::ProcessCount {
                node: at.node.addr().to_string(),
                process: ETG_SERVER_PROCESS.to_string(),
                expected,
                running,
                log: log.clone(),
                log_tail: at.node.log_tail(&log),
            }
            .into());
        }
        Ok(log)
    }

    pub(super) fn start_client(
        &self,
        env: &mut IterationEnv<'_>,
        at: Endpoint<'_>,
        region: Region,
        launch: Launch,
    ) -> Result<ClientStart> {
        let config = env.config;
        let topology = &config.topology;
        let server_node = match region {
            Region::Bundle => &topology.sender,
            Region::Cross => &topology.receiver,
        };
        let server = server_node
            .primary_addr()
            .with_context(|| format!("{} has no usable address", server_node.name))?;

        let idx = next_free_index(env, at, |i| format!("etgConfig{i}"))?;
        let dist = config.structure.distribution_dir().join(&self.spec.dist);
        let dist = expand_home(&dist, &at.node.home()?);
        let config_path = env.path(format!("etgConfig{idx}"));
        at.node
            .put(self.etg_config(server, &dist).as_bytes(), &config_path)
            .with_context(|| format!("Failed to upload {}", config_path.display()))?;
        env.record(at.role, config_path);

        for suffix in ["flows.out", "reqs.out"] {
            env.record(at.role, env.path(format!("{idx}_{suffix}")));
        }
        let log = env.path(format!("etg_client{idx}.log"));
        env.record(at.role, log.clone());

        let chain = self.client_chain(&config.structure.etg_client_path(), &env.dir, idx);
        launch_client(at, chain, &log, launch, "poisson client")
    }
}

impl fmt::Display for PoissonTraffic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let family = self.spec.dist.split('_').next().unwrap_or_default();
        write!(f, "poisson.{family}.{}.{}", self.load_mbps, self.spec.alg)
    }
}
