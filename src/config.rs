//! Experiment description loaded from TOML.
//!
//! The document has four required sections (`topology`, `parameters`,
//! `experiment`, `structure`) plus the agent and distribution tables.
//! [`Config::check`] enforces every invariant before any node is contacted.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use emulation::{EcmpConfig, FifoQueue};
use serde::Deserialize;
use smallvec::SmallVec;
use tracing::debug;

use crate::error::ExpError;
use crate::sweep::{self, Algorithm, BUNDLE_AXIS, CROSS_AXIS};
use crate::traffic::{self, Region, Traffic, TrafficSpec};

/// Width of the background port window above `bg_port_start`.
pub const BG_PORT_SPAN: u16 = 1000;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub topology: Topology,
    pub parameters: Parameters,
    pub structure: Structure,
    /// Named sweep axes, each a non-empty array.
    pub experiment: toml::Table,
    /// Congestion-control agents by algorithm name.
    #[serde(default)]
    pub ccp: BTreeMap<String, CcpAgent>,
    /// Request-size distributions by name, as local file paths.
    #[serde(default)]
    pub distributions: BTreeMap<String, PathBuf>,
    #[serde(default)]
    pub timing: Timing,

    /// Derived from the config file stem.
    #[serde(skip)]
    pub name: String,
    #[serde(skip)]
    pub source: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Sender,
    Inbox,
    Outbox,
    Receiver,
}

impl Role {
    pub const ALL: [Role; 4] = [Role::Sender, Role::Inbox, Role::Outbox, Role::Receiver];

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Sender => "sender",
            Role::Inbox => "inbox",
            Role::Outbox => "outbox",
            Role::Receiver => "receiver",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Topology {
    pub sender: NodeConfig,
    pub inbox: NodeConfig,
    pub outbox: NodeConfig,
    pub receiver: NodeConfig,
}

impl Topology {
    pub fn node(&self, role: Role) -> &NodeConfig {
        match role {
            Role::Sender => &self.sender,
            Role::Inbox => &self.inbox,
            Role::Outbox => &self.outbox,
            Role::Receiver => &self.receiver,
        }
    }

    pub fn self_role(&self) -> Option<Role> {
        Role::ALL.into_iter().find(|r| self.node(*r).is_self)
    }

    /// Interface on the inbox facing the sender.
    pub fn inbox_ingress(&self) -> &Iface {
        &self.inbox.ifaces[0]
    }

    /// Interface on the inbox facing the outbox and receiver.
    pub fn inbox_egress(&self) -> &Iface {
        &self.inbox.ifaces[1]
    }

    pub fn inbox_listen_port(&self) -> u16 {
        self.inbox.listen_port.unwrap_or(DEFAULT_INBOX_PORT)
    }
}

pub const DEFAULT_INBOX_PORT: u16 = 28316;
pub const DEFAULT_INITCWND: u32 = 10;

#[derive(Debug, Clone, Deserialize)]
pub struct NodeConfig {
    /// Hostname used for SSH; roles sharing a name share a connection.
    pub name: String,
    #[serde(default)]
    pub ifaces: SmallVec<[Iface; 2]>,
    #[serde(default)]
    pub listen_port: Option<u16>,
    /// Marks the machine the orchestrator runs on.
    #[serde(default, rename = "self")]
    pub is_self: bool,
    #[serde(default)]
    pub user: Option<String>,
    /// SSH port.
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub initcwnd: Option<u32>,
}

impl NodeConfig {
    /// First interface that is not loopback.
    pub fn primary(&self) -> Option<&Iface> {
        self.ifaces.iter().find(|i| i.dev != "lo")
    }

    pub fn primary_addr(&self) -> Option<IpAddr> {
        self.primary().map(|i| i.addr)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Iface {
    pub dev: String,
    pub addr: IpAddr,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Parameters {
    pub initial_sample_rate: u32,
    pub bg_port_start: u16,
    /// Inbox queue size handed to `--buffer`.
    #[serde(default = "default_qdisc_buf_size")]
    pub qdisc_buf_size: u32,
    #[serde(default)]
    pub fifo_downlink: FifoQueue,
    #[serde(default)]
    pub fifo_uplink: FifoQueue,
    /// Emulate an ECMP fabric on the downlink instead of a single queue.
    #[serde(default)]
    pub ecmp: Option<EcmpConfig>,
}

fn default_qdisc_buf_size() -> u32 {
    15_000
}

impl Parameters {
    pub fn bg_port_end(&self) -> u16 {
        self.bg_port_start.saturating_add(BG_PORT_SPAN)
    }

    pub fn bundle_window(&self) -> PortWindow {
        PortWindow {
            start: self.bg_port_start,
            end: self.bg_port_end(),
        }
    }
}

/// Closed range of ports captured by the outbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortWindow {
    pub start: u16,
    pub end: u16,
}

impl PortWindow {
    pub fn contains(&self, port: u16) -> bool {
        (self.start..=self.end).contains(&port)
    }

    pub fn contains_all(&self, first: u16, last: u16) -> bool {
        self.contains(first) && self.contains(last)
    }

    pub fn overlaps(&self, first: u16, last: u16) -> bool {
        first <= self.end && last >= self.start
    }

    /// pcap filter matching traffic sourced from the window.
    pub fn pcap_filter(&self) -> String {
        format!("src portrange {}-{}", self.start, self.end)
    }
}

impl fmt::Display for PortWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

/// Where tools live on the nodes. Relative paths resolve against
/// `bundler_root`.
#[derive(Debug, Clone, Deserialize)]
pub struct Structure {
    pub bundler_root: PathBuf,
    #[serde(default = "default_box_dir")]
    pub box_dir: PathBuf,
    #[serde(default = "default_inbox_target")]
    pub inbox_target: PathBuf,
    #[serde(default = "default_outbox_target")]
    pub outbox_target: PathBuf,
    #[serde(default = "default_iperf_path")]
    pub iperf_path: PathBuf,
    #[serde(default = "default_etg_dir")]
    pub etg_dir: PathBuf,
    #[serde(default = "default_etg_client")]
    pub etg_client: PathBuf,
    #[serde(default = "default_etg_server")]
    pub etg_server: PathBuf,
}

fn default_box_dir() -> PathBuf {
    PathBuf::from("bundler")
}
fn default_inbox_target() -> PathBuf {
    PathBuf::from("target/release/inbox")
}
fn default_outbox_target() -> PathBuf {
    PathBuf::from("target/release/outbox")
}
fn default_iperf_path() -> PathBuf {
    PathBuf::from("iperf/src/iperf")
}
fn default_etg_dir() -> PathBuf {
    PathBuf::from("empirical-traffic-gen")
}
fn default_etg_client() -> PathBuf {
    PathBuf::from("bin/etgClient")
}
fn default_etg_server() -> PathBuf {
    PathBuf::from("run-servers.sh")
}

impl Structure {
    fn under_root(&self, path: &Path) -> PathBuf {
        if path.is_absolute() || path.starts_with("~") {
            path.to_path_buf()
        } else {
            self.bundler_root.join(path)
        }
    }

    pub fn box_root(&self) -> PathBuf {
        self.under_root(&self.box_dir)
    }

    pub fn inbox_binary(&self) -> PathBuf {
        self.box_root().join(&self.inbox_target)
    }

    pub fn outbox_binary(&self) -> PathBuf {
        self.box_root().join(&self.outbox_target)
    }

    pub fn iperf(&self) -> PathBuf {
        self.under_root(&self.iperf_path)
    }

    pub fn etg_root(&self) -> PathBuf {
        self.under_root(&self.etg_dir)
    }

    pub fn etg_client_path(&self) -> PathBuf {
        self.etg_root().join(&self.etg_client)
    }

    pub fn etg_server_path(&self) -> PathBuf {
        self.etg_root().join(&self.etg_server)
    }

    pub fn experiment_root(&self) -> PathBuf {
        self.bundler_root.join("experiments")
    }

    pub fn ccp_dir(&self) -> PathBuf {
        self.bundler_root.join("ccp")
    }

    pub fn distribution_dir(&self) -> PathBuf {
        self.bundler_root.join("distributions")
    }

    pub fn ccp_binary(&self, agent: &CcpAgent) -> PathBuf {
        if agent.binary.is_absolute() || agent.binary.starts_with("~") {
            agent.binary.clone()
        } else {
            self.ccp_dir().join(&agent.binary)
        }
    }
}

/// A congestion-control agent binary and the flags it always receives.
#[derive(Debug, Clone, Deserialize)]
pub struct CcpAgent {
    /// Relative paths resolve against `<bundler_root>/ccp`.
    pub binary: PathBuf,
    #[serde(default = "default_ipc")]
    pub ipc: String,
    #[serde(default)]
    pub args: BTreeMap<String, toml::Value>,
}

const COMM_LEN: usize = 15;

fn default_ipc() -> String {
    "netlink".to_string()
}

impl CcpAgent {
    /// Name `pgrep`/`pkill` see for this agent. The kernel keeps only the
    /// first 15 bytes of a command name.
    pub fn process_name(&self) -> String {
        self.binary
            .file_name()
            .map(|n| n.to_string_lossy().chars().take(COMM_LEN).collect())
            .unwrap_or_default()
    }
}

/// Fixed delays given to processes before their health is checked. Skipped
/// entirely in dry runs.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Timing {
    pub inbox_startup_secs: u64,
    pub server_settle_secs: u64,
    pub cbr_settle_secs: u64,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            inbox_startup_secs: 10,
            server_settle_secs: 1,
            cbr_settle_secs: 2,
        }
    }
}

impl Timing {
    pub fn zero() -> Self {
        Self {
            inbox_startup_secs: 0,
            server_settle_secs: 0,
            cbr_settle_secs: 0,
        }
    }

    pub fn inbox_startup(&self) -> Duration {
        Duration::from_secs(self.inbox_startup_secs)
    }

    pub fn server_settle(&self) -> Duration {
        Duration::from_secs(self.server_settle_secs)
    }

    pub fn cbr_settle(&self) -> Duration {
        Duration::from_secs(self.cbr_settle_secs)
    }
}

impl Config {
    /// Read and parse a config file. The experiment is named after the file
    /// stem. Does not validate; call [`Config::check`].
    pub fn from_file(path: &Path) -> Result<Self, ExpError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ExpError::config(format!("failed to read config file {}: {e}", path.display()))
        })?;
        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "experiment".to_string());
        let mut config = Self::from_toml_str(&content, &name)?;
        config.source = Some(path.to_path_buf());
        Ok(config)
    }

    pub fn from_toml_str(content: &str, name: &str) -> Result<Self, ExpError> {
        let mut config: Config = toml::from_str(content)
            .map_err(|e| ExpError::config(format!("failed to parse config: {e}")))?;
        config.name = name.to_string();
        Ok(config)
    }

    pub fn experiment_dir(&self) -> PathBuf {
        self.structure.experiment_root().join(&self.name)
    }

    /// Names `pkill` must clear between iterations.
    pub fn experiment_processes(&self) -> Vec<String> {
        let mut names = vec!["inbox".to_string(), "outbox".to_string()];
        names.extend(self.ccp.values().map(CcpAgent::process_name));
        names.extend(["iperf", "etgClient", "etgServer"].map(String::from));
        names.sort();
        names.dedup();
        names
    }

    /// Extended regex matching every experiment process.
    pub fn kill_pattern(&self) -> String {
        format!("({})", self.experiment_processes().join("|"))
    }

    pub fn check(&self) -> Result<(), ExpError> {
        self.check_topology()?;
        self.check_parameters()?;
        self.check_experiment()?;
        debug!(name = %self.name, "config checks passed");
        Ok(())
    }

    fn check_topology(&self) -> Result<(), ExpError> {
        for role in Role::ALL {
            let node = self.topology.node(role);
            if node.name.is_empty() {
                return Err(ExpError::config(format!("topology.{role} is missing 'name'")));
            }
            if node.ifaces.is_empty() {
                return Err(ExpError::config(format!(
                    "topology.{role} must have at least 1 interface"
                )));
            }
        }
        if self.topology.inbox.ifaces.len() < 2 {
            return Err(ExpError::config(
                "topology.inbox must have at least 2 interfaces",
            ));
        }
        for role in [Role::Sender, Role::Receiver] {
            if self.topology.node(role).primary().is_none() {
                return Err(ExpError::config(format!(
                    "topology.{role} has no non-loopback interface"
                )));
            }
        }

        let num_self = Role::ALL
            .iter()
            .filter(|r| self.topology.node(**r).is_self)
            .count();
        match num_self {
            0 => Err(ExpError::config(
                "one node in the topology section must be labeled with \"self = true\"",
            )),
            1 => Ok(()),
            _ => Err(ExpError::config(
                "only one node in the topology section can be labeled self",
            )),
        }
    }

    fn check_parameters(&self) -> Result<(), ExpError> {
        if self.parameters.bg_port_start > u16::MAX - BG_PORT_SPAN {
            return Err(ExpError::config(format!(
                "parameters.bg_port_start {} leaves no room for a {BG_PORT_SPAN}-port window",
                self.parameters.bg_port_start
            )));
        }
        if self.parameters.initial_sample_rate == 0 {
            return Err(ExpError::config(
                "parameters.initial_sample_rate must be positive",
            ));
        }
        Ok(())
    }

    fn check_experiment(&self) -> Result<(), ExpError> {
        for axis in [BUNDLE_AXIS, CROSS_AXIS] {
            if !self.experiment.contains_key(axis) {
                return Err(ExpError::config(format!(
                    "experiment.{axis} must list at least one traffic set"
                )));
            }
        }
        for (name, values) in &self.experiment {
            match values.as_array() {
                Some(list) if !list.is_empty() => {}
                _ => {
                    return Err(ExpError::config(format!(
                        "experiment.{name} must be a non-empty list"
                    )));
                }
            }
        }

        let window = self.parameters.bundle_window();
        for (axis, region) in [(BUNDLE_AXIS, Region::Bundle), (CROSS_AXIS, Region::Cross)] {
            for set in sweep::axis_values(&self.experiment, axis) {
                let specs = set
                    .clone()
                    .try_into::<Vec<TrafficSpec>>()
                    .map_err(|e| ExpError::config(format!("experiment.{axis}: {e}")))?;
                for spec in &specs {
                    spec.check_region(region, window)?;
                    self.check_traffic_requirements(axis, spec)?;
                }
            }
        }

        for value in sweep::axis_values(&self.experiment, sweep::ALG_AXIS) {
            let name = Algorithm::name_of(value)
                .ok_or_else(|| ExpError::config("experiment.alg entries need a 'name'"))?;
            if name != Algorithm::NO_BUNDLER && !self.ccp.contains_key(name) {
                return Err(ExpError::config(format!(
                    "algorithm '{name}' has no [ccp.{name}] agent"
                )));
            }
        }

        // every run must bind its traffic and own its iteration directory
        let mut names = HashSet::new();
        for exp in sweep::enumerate(&self.experiment)? {
            if exp.skipped() {
                continue;
            }
            let bundle = Traffic::all(&exp.bundle_traffic, Region::Bundle, &exp, window)?;
            let cross = Traffic::all(&exp.cross_traffic, Region::Cross, &exp, window)?;
            let name =
                exp.iteration_name(&traffic::describe(&bundle), &traffic::describe(&cross));
            if !names.insert(name.clone()) {
                return Err(ExpError::config(format!(
                    "more than one run maps to iteration directory {name} ({exp})"
                )));
            }
        }
        Ok(())
    }

    fn check_traffic_requirements(&self, axis: &str, spec: &TrafficSpec) -> Result<(), ExpError> {
        match spec {
            TrafficSpec::Cbr(_) if !self.ccp.contains_key(crate::traffic::CBR_AGENT) => {
                Err(ExpError::config(format!(
                    "{axis}: cbr traffic needs a [ccp.{}] agent",
                    crate::traffic::CBR_AGENT
                )))
            }
            TrafficSpec::Poisson(p) => {
                if !self.distributions.contains_key(&p.dist) {
                    return Err(ExpError::config(format!(
                        "{axis}: poisson distribution '{}' is not listed in [distributions]",
                        p.dist
                    )));
                }
                p.load_expr()
                    .map_err(|e| ExpError::config(format!("{axis}: poisson load: {e}")))?;
                Ok(())
            }
            _ => Ok(()),
        }
    }
}
