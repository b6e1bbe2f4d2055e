//! Congestion control agents.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use emulation::ShellCommand;
use toml::Value;

use crate::config::{CcpAgent, Config};
use crate::remote::RunOpts;
use crate::remote::readiness::RetryPolicy;
use crate::remote::{Endpoint, RemoteNode};
use crate::sweep::Algorithm;

/// Logged by every agent once it is connected to the datapath.
pub const CCP_STARTED: &str = "starting CCP";

pub fn agent_log(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("ccp_{name}.log"))
}

fn flag_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// `<binary> --ipc=<ipc> [--k=v for agent args] [--k=v for algorithm params]`
///
/// Algorithm parameters come last so a sweep can override an agent default.
pub fn agent_command(binary: &Path, agent: &CcpAgent, alg: &Algorithm) -> ShellCommand {
    let mut cmd = ShellCommand::from_path(binary).opt("ipc", &agent.ipc);
    for (k, v) in agent.args.iter().chain(&alg.params) {
        cmd = cmd.opt(k, flag_value(v));
    }
    cmd
}

/// Start the agent for `alg` on `at` and wait for it to come up.
pub fn start_agent(
    config: &Config,
    at: Endpoint<'_>,
    alg: &Algorithm,
    dir: &Path,
    policy: &RetryPolicy,
) -> Result<PathBuf> {
    let agent = config
        .ccp
        .get(&alg.name)
        .with_context(|| format!("no [ccp.{}] agent configured", alg.name))?;
    let binary = config.structure.ccp_binary(agent);
    let log = agent_log(dir, &alg.name);

    tracing::info!(node = at.node.addr(), alg = %alg, "starting ccp agent");
    at.node.expect(
        &agent_command(&binary, agent, alg).render(),
        &RunOpts::new().sudo().background().log_to(&log),
        &format!("Failed to start ccp agent {}", alg.name),
    )?;
    await_agent(at.node, agent, &log, policy)?;
    Ok(log)
}

fn await_agent(
    node: &dyn RemoteNode,
    agent: &CcpAgent,
    log: &Path,
    policy: &RetryPolicy,
) -> Result<()> {
    node.check_proc(&agent.process_name(), log, policy)?;
    node.check_file(CCP_STARTED, log, policy)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    #[test]
    fn agent_flags_then_algorithm_params() {
        let agent = CcpAgent {
            binary: PathBuf::from("ccp_copa/target/release/copa"),
            ipc: "netlink".into(),
            args: BTreeMap::from([("delta_mode".to_string(), Value::from("NoTCP"))]),
        };
        let mut alg = Algorithm::named("copa");
        alg.params
            .insert("default_delta".to_string(), Value::Float(0.125));

        let cmd = agent_command(Path::new("/b/ccp/copa"), &agent, &alg);
        assert_eq!(
            cmd.render(),
            "/b/ccp/copa --ipc=netlink --delta_mode=NoTCP --default_delta=0.125"
        );
    }

    #[test]
    fn log_is_named_after_algorithm() {
        assert_eq!(
            agent_log(Path::new("/exp/it"), "nimbus"),
            PathBuf::from("/exp/it/ccp_nimbus.log")
        );
    }
}
