use std::path::{Path, PathBuf};

use anyhow::Result;
use emulation::{Chain, ShellCommand};
use serde::Deserialize;

use super::{
    ClientStart, Destination, Launch, REPORT_INTERVAL_SECS, Region, launch_client,
    start_iperf_server,
};
use crate::iteration::IterationEnv;
use crate::remote::Endpoint;

/// Bulk TCP flows from reverse-mode iperf.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct IperfSpec {
    pub port: u16,
    pub flows: u32,
    /// Seconds.
    pub length: u32,
    /// Congestion control algorithm on the server socket.
    pub alg: String,
    #[serde(default)]
    pub start_delay: u32,
}

impl IperfSpec {
    pub fn server_log(&self, dir: &Path) -> PathBuf {
        dir.join(format!("iperf_server_{}.log", self.port))
    }

    pub fn client_log(&self, dir: &Path) -> PathBuf {
        dir.join(format!("iperf_client_{}.log", self.port))
    }

    /// Options shared by client and server so both agree on the session.
    fn session(&self, cmd: ShellCommand) -> ShellCommand {
        cmd.arg("-p")
            .arg(self.port)
            .arg("--reverse")
            .arg("-i")
            .arg(REPORT_INTERVAL_SECS)
            .arg("-t")
            .arg(self.length)
            .arg("-P")
            .arg(self.flows)
            .arg("-Z")
            .arg(&self.alg)
    }

    pub fn server_command(&self, iperf: &Path) -> ShellCommand {
        self.session(ShellCommand::from_path(iperf).arg("-s"))
    }

    fn client_chain(&self, iperf: &Path, dest: Destination) -> Chain {
        let cmd = dest.push(ShellCommand::from_path(iperf).arg("-c"));
        Chain::new().sleep(self.start_delay).then(self.session(cmd))
    }

    pub(super) fn start_server(
        &self,
        env: &mut IterationEnv<'_>,
        at: Endpoint<'_>,
    ) -> Result<PathBuf> {
        let cmd = self.server_command(&env.config.structure.iperf());
        let log = self.server_log(&env.dir);
        let settle = env.config.timing.server_settle();
        start_iperf_server(env, at, cmd, log, settle)
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
        launch_client(at, chain, &log, launch, "iperf client")
    }
}
