//! Command lines for the inbox and outbox binaries.

use std::path::{Path, PathBuf};

use emulation::ShellCommand;

use crate::config::Config;

pub const INBOX_PROCESS: &str = "inbox";
pub const OUTBOX_PROCESS: &str = "outbox";

/// Logged once the inbox has set up its qdisc and waits for the agent.
pub const INBOX_AWAITING_DATAPATH: &str = "Wait for CCP to install datapath program";
/// Logged once the agent has installed the datapath program.
pub const INBOX_READY: &str = "Inbox ready";

/// Interface name of the emulated link as seen from inside the shell.
pub const EMULATED_INGRESS: &str = "ingress";

pub fn inbox_log(dir: &Path) -> PathBuf {
    dir.join("inbox.log")
}

/// Log of the outbox running in emulated path `idx`.
pub fn outbox_log(dir: &Path, idx: usize) -> PathBuf {
    match idx {
        0 => dir.join("outbox.log"),
        n => dir.join(format!("outbox{n}.log")),
    }
}

/// The sending-side box: shapes bundle traffic on the inbox egress device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboxCommand {
    pub binary: PathBuf,
    pub iface: String,
    pub port: u16,
    pub sample_rate: u32,
    pub qtype: String,
    pub buffer: u32,
}

impl InboxCommand {
    pub fn new(config: &Config, qtype: &str) -> Self {
        Self {
            binary: config.structure.inbox_binary(),
            iface: config.topology.inbox_egress().dev.clone(),
            port: config.topology.inbox_listen_port(),
            sample_rate: config.parameters.initial_sample_rate,
            qtype: qtype.to_string(),
            buffer: config.parameters.qdisc_buf_size,
        }
    }

    pub fn command(&self) -> ShellCommand {
        ShellCommand::from_path(&self.binary)
            .opt("iface", &self.iface)
            .opt("port", self.port)
            .opt("sample_rate", self.sample_rate)
            .opt("qtype", &self.qtype)
            .opt("buffer", self.buffer)
    }
}

/// The receiving-side box: samples bundle packets and reports to the inbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboxCommand {
    pub binary: PathBuf,
    pub filter: String,
    pub iface: String,
    pub inbox: String,
    pub sample_rate: u32,
    /// Running behind the emulated link, which carries no ethernet header.
    pub emulated: bool,
}

impl OutboxCommand {
    pub fn new(config: &Config, emulated: bool) -> Self {
        let iface = if emulated {
            EMULATED_INGRESS.to_string()
        } else {
            config
                .topology
                .outbox
                .ifaces
                .first()
                .map(|i| i.dev.clone())
                .unwrap_or_default()
        };
        Self {
            binary: config.structure.outbox_binary(),
            filter: config.parameters.bundle_window().pcap_filter(),
            iface,
            inbox: format!(
                "{}:{}",
                config.topology.inbox_egress().addr,
                config.topology.inbox_listen_port()
            ),
            sample_rate: config.parameters.initial_sample_rate,
            emulated,
        }
    }

    pub fn command(&self) -> ShellCommand {
        let cmd = ShellCommand::from_path(&self.binary)
            .sudo()
            .arg("--filter")
            .arg(&self.filter)
            .arg("--iface")
            .arg(&self.iface)
            .arg("--inbox")
            .arg(&self.inbox)
            .arg("--sample_rate")
            .arg(self.sample_rate);
        if self.emulated {
            cmd.arg("--no_ethernet")
        } else {
            cmd
        }
    }
}
