//! One-time preparation of the testbed before any iteration runs.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};
use emulation::quote;
use tracing::{debug, info, warn};

use crate::config::{Config, Role};
use crate::error::ExpError;
use crate::iteration::OnExisting;
use crate::remote::{Machines, RemoteNode, RunOpts, expand_home, local_home, quote_path};

/// Route bundle traffic sender -> inbox -> outbox/receiver and back, and
/// turn off segmentation offloads everywhere.
pub fn setup_networking(config: &Config, machines: &Machines) -> Result<()> {
    let topo = &config.topology;
    let sender = topo
        .sender
        .primary_addr()
        .context("sender has no usable address")?;
    let receiver = topo
        .receiver
        .primary_addr()
        .context("receiver has no usable address")?;
    let ingress = topo.inbox_ingress();
    let egress = topo.inbox_egress();
    let sudo = RunOpts::new().sudo();

    info!("setting up routing tables");
    let initcwnd = topo
        .sender
        .initcwnd
        .unwrap_or(crate::config::DEFAULT_INITCWND);
    machines.sender().expect(
        &format!(
            "ip route del {receiver}; ip route add {receiver} via {} src {sender} initcwnd {initcwnd}",
            ingress.addr
        ),
        &sudo,
        "Failed to set routing tables at sender",
    )?;

    let inbox = machines.inbox();
    inbox.expect(
        "sysctl -w net.ipv4.ip_forward=1",
        &sudo,
        "Failed to set IP forwarding at inbox",
    )?;
    inbox.expect(
        &format!(
            "ip route del {receiver}; ip route add {receiver} dev {}",
            quote(&egress.dev)
        ),
        &sudo,
        "Failed to set forward route at inbox",
    )?;
    inbox.expect(
        &format!(
            "ip route del {sender}; ip route add {sender} dev {}",
            quote(&ingress.dev)
        ),
        &sudo,
        "Failed to set reverse route at inbox",
    )?;

    let outbox = machines.outbox();
    outbox.expect(
        &format!("ip route del {sender}; ip route add {sender} via {}", egress.addr),
        &sudo,
        "Failed to set routing tables at outbox",
    )?;
    outbox.expect(
        "sysctl -w net.ipv4.ip_forward=1",
        &sudo,
        "Failed to set IP forwarding at outbox",
    )?;

    info!("turning off TSO, GSO and GRO");
    for role in Role::ALL {
        for iface in &topo.node(role).ifaces {
            machines.role(role).expect(
                &format!("ethtool -K {} tso off gso off gro off", quote(&iface.dev)),
                &sudo,
                &format!("Failed to turn off offloads on {role} {}", iface.dev),
            )?;
        }
    }
    Ok(())
}

fn missing(node: &dyn RemoteNode, what: &str, path: &Path) -> anyhow::Error {
    ExpError::MissingTool {
        node: node.addr().to_string(),
        what: what.to_string(),
        path: path.display().to_string(),
    }
    .into()
}

fn require_file(node: &dyn RemoteNode, what: &str, path: &Path) -> Result<()> {
    if node.file_exists(path)? {
        Ok(())
    } else {
        Err(missing(node, what, path))
    }
}

/// Build a box binary with make if it is not there yet.
fn ensure_box_binary(config: &Config, node: &dyn RemoteNode, binary: &Path) -> Result<()> {
    if node.file_exists(binary)? {
        return Ok(());
    }
    let release = binary.components().any(|c| c.as_os_str() == "release");
    let mut cmd = format!("make -C {}", quote_path(&config.structure.box_root()));
    if release {
        cmd.push_str(" release");
    }
    node.expect(&cmd, &RunOpts::new(), "Failed to build bundler repository")?;
    require_file(node, "bundler binary", binary)
}

fn check_agents(config: &Config, node: &dyn RemoteNode) -> Result<()> {
    for (name, agent) in &config.ccp {
        let binary = config.structure.ccp_binary(agent);
        require_file(node, &format!("ccp agent '{name}'"), &binary)?;
    }
    Ok(())
}

/// The empirical traffic generator: client built, distributions uploaded,
/// server script executable.
fn check_etg(config: &Config, node: &dyn RemoteNode) -> Result<()> {
    let s = &config.structure;
    require_file(node, "empirical traffic generator", &s.etg_root())?;

    if !node.file_exists(&s.etg_client_path())? {
        node.expect(
            &format!("make -C {}", quote_path(&s.etg_root())),
            &RunOpts::new(),
            "Failed to build empirical traffic generator",
        )?;
    }

    let dist_dir = s.distribution_dir();
    node.expect(
        &format!("mkdir -p {}", quote_path(&dist_dir)),
        &RunOpts::new(),
        "Failed to create distributions directory",
    )?;
    for (name, local) in &config.distributions {
        let remote = dist_dir.join(name);
        if node.file_exists(&remote)? {
            continue;
        }
        let local = expand_home(local, &local_home()?);
        let contents = fs::read(&local)
            .with_context(|| format!("failed to read distribution {}", local.display()))?;
        node.put(&contents, &remote)
            .with_context(|| format!("Failed to upload distribution {name}"))?;
        debug!(node = node.addr(), dist = %name, "uploaded distribution");
    }

    node.expect(
        &format!("chmod +x {}", quote_path(&s.etg_server_path())),
        &RunOpts::new(),
        "Failed to make traffic generator server script executable",
    )?;
    Ok(())
}

/// Make sure every node has the tools its role needs, building what can be
/// built.
pub fn verify_tools(config: &Config, machines: &Machines) -> Result<()> {
    let s = &config.structure;

    info!(role = "sender", "checking tools");
    let sender = machines.sender();
    require_file(sender, "iperf", &s.iperf())?;
    check_etg(config, sender)?;

    info!(role = "inbox", "checking tools");
    let inbox = machines.inbox();
    ensure_box_binary(config, inbox, &s.inbox_binary())?;
    check_agents(config, inbox)?;

    info!(role = "outbox", "checking tools");
    ensure_box_binary(config, machines.outbox(), &s.outbox_binary())?;

    info!(role = "receiver", "checking tools");
    let receiver = machines.receiver();
    if !receiver.prog_exists("mm-delay")? {
        return Err(missing(receiver, "mahimahi", Path::new("mm-delay")));
    }
    require_file(receiver, "iperf", &s.iperf())?;
    check_etg(config, receiver)?;
    check_agents(config, receiver)?;
    Ok(())
}

/// Create the experiment directory on every node and keep a copy of the
/// config next to the results.
///
/// `confirm` is asked before existing results are overwritten.
pub fn prepare_experiment<F>(
    config: &Config,
    machines: &Machines,
    on_existing: OnExisting,
    dry_run: bool,
    confirm: F,
) -> Result<()>
where
    F: FnOnce() -> Result<bool>,
{
    let dir = config.experiment_dir();
    let local_dir = expand_home(&dir, &local_home()?);

    if local_dir.exists() {
        match on_existing {
            OnExisting::Abort => return Err(ExpError::ExistingResults(local_dir).into()),
            OnExisting::Skip => info!(dir = %local_dir.display(), "keeping existing results"),
            OnExisting::Overwrite => {}
        }
    }
    if on_existing == OnExisting::Overwrite {
        warn!(dir = %dir.display(), "existing results will be overwritten");
        if !confirm()? {
            bail!("not overwriting {}", dir.display());
        }
    }

    let quoted = quote_path(&dir);
    for node in machines.conns() {
        if on_existing == OnExisting::Overwrite {
            node.expect(
                &format!("rm -rf {quoted}"),
                &RunOpts::new(),
                &format!("Failed to remove existing experiment directory {}", dir.display()),
            )?;
        }
        node.expect(
            &format!("mkdir -p {quoted}"),
            &RunOpts::new(),
            &format!("Failed to create experiment directory {}", dir.display()),
        )?;
        node.expect(
            &format!("mkdir -p {}", quote_path(&config.structure.ccp_dir())),
            &RunOpts::new(),
            "Failed to create ccp directory",
        )?;
    }

    if dry_run {
        return Ok(());
    }
    if let Some(source) = &config.source {
        let name = source.file_name().context("config path has no file name")?;
        fs::create_dir_all(&local_dir)
            .with_context(|| format!("failed to create {}", local_dir.display()))?;
        fs::copy(source, local_dir.join(name))
            .with_context(|| format!("failed to copy config into {}", local_dir.display()))?;
    }
    Ok(())
}
