use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use emulation::{Chain, ShellCommand};
use serde::Deserialize;

use super::{
    CBR_AGENT, ClientStart, Destination, Launch, REPORT_INTERVAL_SECS, Region, launch_client,
    start_iperf_server, text_or_number,
};
use crate::ccp::CCP_STARTED;
use crate::config::CcpAgent;
use crate::iteration::IterationEnv;
use crate::remote::{Endpoint, RunOpts};

/// A single flow paced by the constant-rate agent.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CbrSpec {
    pub port: u16,
    /// Seconds.
    pub length: u32,
    /// Rate handed to the agent verbatim.
    #[serde(deserialize_with = "text_or_number")]
    pub rate: String,
    pub cwnd_cap: u32,
    #[serde(default)]
    pub start_delay: u32,
}

impl CbrSpec {
    pub fn server_log(&self, dir: &Path) -> PathBuf {
        dir.join(format!("cbr_server_{}.log", self.port))
    }

    pub fn client_log(&self, dir: &Path) -> PathBuf {
        dir.join(format!("cbr_client_{}.log", self.port))
    }

    pub fn agent_log(dir: &Path) -> PathBuf {
        dir.join(format!("ccp_{CBR_AGENT}.log"))
    }

    pub fn agent_command(&self, binary: &Path, agent: &CcpAgent) -> ShellCommand {
        ShellCommand::from_path(binary)
            .opt("ipc", &agent.ipc)
            .opt("rate", &self.rate)
            .opt("cwnd_cap", self.cwnd_cap)
    }

    fn session(&self, cmd: ShellCommand) -> ShellCommand {
        cmd.arg("-p")
            .arg(self.port)
            .arg("--reverse")
            .arg("-i")
            .arg(REPORT_INTERVAL_SECS)
            .arg("-t")
            .arg(self.length)
    }

    pub fn server_command(&self, iperf: &Path) -> ShellCommand {
        self.session(ShellCommand::from_path(iperf).arg("-s"))
            .arg("-Z")
            .arg("ccp")
    }

    fn client_chain(&self, iperf: &Path, dest: Destination) -> Chain {
        let cmd = dest.push(ShellCommand::from_path(iperf).arg("-c"));
        Chain::new().sleep(self.start_delay).then(self.session(cmd))
    }

    /// Starts the agent, then the iperf server whose flows it paces.
    pub(super) fn start_server(
        &self,
        env: &mut IterationEnv<'_>,
        at: Endpoint<'_>,
    ) -> Result<PathBuf> {
        let agent = env
            .config
            .ccp
            .get(CBR_AGENT)
            .with_context(|| format!("cbr traffic needs a [ccp.{CBR_AGENT}] agent"))?;
        let agent_log = Self::agent_log(&env.dir);
        let binary = env.config.structure.ccp_binary(agent);
        at.node.expect(
            &self.agent_command(&binary, agent).render(),
            &RunOpts::new().sudo().background().log_to(&agent_log),
            "Failed to start constant-rate agent",
        )?;
        env.record(at.role, agent_log.clone());

        let cmd = self.server_command(&env.config.structure.iperf());
        let log = self.server_log(&env.dir);
        let settle = env.config.timing.cbr_settle();
        start_iperf_server(env, at, cmd, log.clone(), settle)?;

        at.node
            .check_proc(&agent.process_name(), &agent_log, &env.readiness.server)?;
        at.node
            .check_file(CCP_STARTED, &agent_log, &env.readiness.server)?;
        Ok(log)
    }

    pub(super) fn start_client(
        &self,
        env: &mut IterationEnv<'_>,
        at: Endpoint<'_>,
        region: Region,
        launch: Launch,
    ) -> Result<ClientStart> {
        let dest = Destination::for_region(env, region)?;
        let chain = self.client_chain(&env.config.structure.iperf(), dest);
        let log = self.client_log(&env.dir);
        env.record(at.role, log.clone());
        launch_client(at, chain, &log, launch, "cbr client")
    }
}
