use std::cell::OnceCell;
use std::fs;
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use anyhow::{Context, Result, bail};
use tracing::{debug, trace};

use super::{RemoteNode, RunOpts, RunOutput, expand_home, quote_path};

/// Home directory of the account running the orchestrator.
pub fn local_home() -> Result<PathBuf> {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .context("HOME is not set")
}

/// Behavior shared by every node of a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NodeOptions {
    /// Print commands instead of executing them.
    pub dry_run: bool,
    /// Echo every command at info level.
    pub verbose: bool,
    /// Ask for confirmation before each command.
    pub interact: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transport {
    Local,
    Ssh {
        host: String,
        user: Option<String>,
        port: Option<u16>,
    },
}

/// A real machine, reached through the local shell or over ssh.
#[derive(Debug)]
pub struct Node {
    addr: String,
    transport: Transport,
    opts: NodeOptions,
    home: OnceCell<PathBuf>,
}

impl Node {
    pub fn local(addr: &str, opts: NodeOptions) -> Self {
        Self {
            addr: addr.to_string(),
            transport: Transport::Local,
            opts,
            home: OnceCell::new(),
        }
    }

    pub fn ssh(host: &str, user: Option<String>, port: Option<u16>, opts: NodeOptions) -> Self {
        Self {
            addr: host.to_string(),
            transport: Transport::Ssh {
                host: host.to_string(),
                user,
                port,
            },
            opts,
            home: OnceCell::new(),
        }
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    fn destination(host: &str, user: &Option<String>) -> String {
        match user {
            Some(user) => format!("{user}@{host}"),
            None => host.to_string(),
        }
    }

    fn announce(&self, what: &str) {
        if self.opts.dry_run {
            println!("[{}] {what}", self.addr);
        } else if self.opts.verbose {
            tracing::info!(node = %self.addr, "{what}");
        } else {
            debug!(node = %self.addr, "{what}");
        }
    }

    /// Returns false if the operator declined.
    fn confirm(&self) -> Result<bool> {
        if !self.opts.interact || self.opts.dry_run {
            return Ok(true);
        }
        eprint!("[{}] run? [Y/n] ", self.addr);
        io::stderr().flush()?;
        let mut answer = String::new();
        io::stdin()
            .lock()
            .read_line(&mut answer)
            .context("failed to read confirmation")?;
        Ok(!matches!(answer.trim(), "n" | "N" | "no"))
    }

    fn exec(&self, line: &str) -> Result<Output> {
        let output = match &self.transport {
            Transport::Local => Command::new("bash").arg("-c").arg(line).output(),
            Transport::Ssh { host, user, port } => {
                let mut cmd = Command::new("ssh");
                cmd.args(["-o", "BatchMode=yes"]);
                if let Some(port) = port {
                    cmd.arg("-p").arg(port.to_string());
                }
                cmd.arg(Self::destination(host, user)).arg(line);
                cmd.output()
            }
        };
        output.with_context(|| format!("failed to execute command on {}", self.addr))
    }

    fn scp(&self, from: &str, to: &str) -> Result<()> {
        let mut cmd = Command::new("scp");
        cmd.arg("-q");
        if let Transport::Ssh {
            port: Some(port), ..
        } = &self.transport
        {
            cmd.arg("-P").arg(port.to_string());
        }
        let status = cmd
            .arg(from)
            .arg(to)
            .status()
            .with_context(|| format!("failed to spawn scp for {}", self.addr))?;
        if !status.success() {
            bail!("scp {from} -> {to} failed with {status}");
        }
        Ok(())
    }

    fn remote_spec(&self, path: &Path) -> String {
        match &self.transport {
            Transport::Local => path.display().to_string(),
            Transport::Ssh { host, user, .. } => {
                format!("{}:{}", Self::destination(host, user), path.display())
            }
        }
    }
}

impl RemoteNode for Node {
    fn addr(&self) -> &str {
        &self.addr
    }

    fn is_local(&self) -> bool {
        self.transport == Transport::Local
    }

    fn is_dry_run(&self) -> bool {
        self.opts.dry_run
    }

    fn run(&self, cmd: &str, opts: &RunOpts) -> Result<RunOutput> {
        let line = opts.render(cmd);
        self.announce(&line);
        if self.opts.dry_run {
            return Ok(RunOutput::ok(""));
        }
        if !self.confirm()? {
            bail!("operator declined to run `{line}` on {}", self.addr);
        }

        let output = self.exec(&line)?;
        let out = RunOutput {
            status: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };
        trace!(node = %self.addr, status = out.status, stdout = %out.stdout.trim_end(), "finished");
        Ok(out)
    }

    fn put(&self, contents: &[u8], path: &Path) -> Result<()> {
        self.announce(&format!("put {} bytes -> {}", contents.len(), path.display()));
        if self.opts.dry_run {
            return Ok(());
        }
        match &self.transport {
            Transport::Local => {
                let target = expand_home(path, &self.home()?);
                fs::write(&target, contents)
                    .with_context(|| format!("failed to write {}", target.display()))
            }
            Transport::Ssh { .. } => {
                let mut tmp = tempfile::NamedTempFile::new()
                    .context("failed to create staging file for upload")?;
                tmp.write_all(contents)?;
                tmp.flush()?;
                self.scp(&tmp.path().display().to_string(), &self.remote_spec(path))
            }
        }
    }

    fn get(&self, remote: &Path, local: &Path) -> Result<()> {
        self.announce(&format!("get {} -> {}", remote.display(), local.display()));
        if self.opts.dry_run {
            return Ok(());
        }
        match &self.transport {
            Transport::Local => {
                let source = expand_home(remote, &self.home()?);
                if source == local {
                    return Ok(());
                }
                fs::copy(&source, local).with_context(|| {
                    format!("failed to copy {} to {}", source.display(), local.display())
                })?;
                Ok(())
            }
            Transport::Ssh { .. } => {
                self.scp(&self.remote_spec(remote), &local.display().to_string())
            }
        }
    }

    fn home(&self) -> Result<PathBuf> {
        if let Some(home) = self.home.get() {
            return Ok(home.clone());
        }
        let home = match &self.transport {
            Transport::Local => local_home()?,
            Transport::Ssh { .. } if self.opts.dry_run => PathBuf::from("~"),
            Transport::Ssh { .. } => {
                let out = self.exec("echo $HOME")?;
                let home = String::from_utf8_lossy(&out.stdout).trim().to_string();
                if !out.status.success() || home.is_empty() {
                    bail!("could not resolve home directory on {}", self.addr);
                }
                PathBuf::from(home)
            }
        };
        debug!(node = %self.addr, home = %quote_path(&home), "resolved home");
        Ok(self.home.get_or_init(|| home).clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dry() -> NodeOptions {
        NodeOptions {
            dry_run: true,
            ..NodeOptions::default()
        }
    }

    #[test]
    fn dry_run_reports_success_without_executing() {
        let node = Node::ssh("10.1.1.2", None, None, dry());
        let out = node
            .run("exit 3", &RunOpts::new().sudo())
            .expect("dry run never fails");
        assert!(out.success());
        assert!(node.file_exists(Path::new("/nonexistent")).unwrap());
    }

    #[test]
    fn local_node_runs_through_bash() {
        let node = Node::local("localhost", NodeOptions::default());
        let out = node.run("echo hi; exit 3", &RunOpts::new()).unwrap();
        assert_eq!(out.status, 3);
        assert_eq!(out.stdout, "hi\n");
    }

    #[test]
    fn local_put_and_get() {
        let dir = tempfile::tempdir().unwrap();
        let node = Node::local("localhost", NodeOptions::default());
        let remote = dir.path().join("a.sh");
        let local = dir.path().join("b.sh");
        node.put(b"#!/bin/bash\n", &remote).unwrap();
        node.get(&remote, &local).unwrap();
        assert_eq!(fs::read_to_string(local).unwrap(), "#!/bin/bash\n");
        assert!(node.file_exists(&remote).unwrap());
    }

    #[test]
    fn ssh_destination_includes_user() {
        assert_eq!(
            Node::destination("10.1.1.2", &Some("akshay".into())),
            "akshay@10.1.1.2"
        );
        assert_eq!(Node::destination("10.1.1.2", &None), "10.1.1.2");
    }
}
