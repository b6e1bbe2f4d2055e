//! Shared utilities for integration tests.
#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};

use tempfile::TempDir;

/// Sweep used when a test does not care about the experiment table.
pub const SMALL_SWEEP: &str = r#"
sch = ["fifo", "sfq"]
alg = ["copa", "nobundler"]
rate = [24, 96]
rtt = [50]
bdp = [2]
seed = [1]
bundle_traffic = [[{ source = "iperf", port = 5050, flows = 4, length = 10, alg = "cubic" }]]
cross_traffic = [[], [{ source = "cbr", port = 7100, length = 10, rate = "12", cwnd_cap = 100 }]]
"#;

/// A config for a four-host testbed whose `bundler_root` is a fresh
/// temporary directory. Nothing is ever contacted in a dry run.
pub struct Fixture {
    pub root: TempDir,
    pub path: PathBuf,
}

impl Fixture {
    pub fn new(name: &str, experiment: &str) -> Self {
        let root = tempfile::tempdir().expect("create temp dir");
        let dist = root.path().join("CAIDA_CDF");
        fs::write(&dist, "1 0\n100 1\n").expect("write distribution");
        let path = root.path().join(format!("{name}.toml"));
        fs::write(&path, config_toml(root.path(), experiment)).expect("write config");
        Self { root, path }
    }

    pub fn experiment_dir(&self) -> PathBuf {
        let name = self.path.file_stem().expect("config has a stem");
        self.root.path().join("experiments").join(name)
    }
}

pub fn config_toml(root: &Path, experiment: &str) -> String {
    format!(
        r#"
[topology.sender]
name = "sender.test"
ifaces = [{{ dev = "eth1", addr = "10.1.1.1" }}]

[topology.inbox]
name = "inbox.test"
ifaces = [{{ dev = "eth1", addr = "10.1.1.2" }}, {{ dev = "eth2", addr = "10.1.2.2" }}]

[topology.outbox]
name = "outbox.test"
ifaces = [{{ dev = "eth1", addr = "10.1.2.3" }}]

[topology.receiver]
name = "localhost"
self = true
ifaces = [{{ dev = "eth1", addr = "10.1.2.4" }}]

[parameters]
initial_sample_rate = 128
bg_port_start = 5000

[structure]
bundler_root = "{root}"

[ccp.copa]
binary = "ccp_copa/target/release/copa"

[ccp.const]
binary = "ccp_const/target/release/ccp_const"

[distributions]
CAIDA_CDF = "{root}/CAIDA_CDF"

[timing]
inbox_startup_secs = 0
server_settle_secs = 0
cbr_settle_secs = 0

[experiment]
{experiment}
"#,
        root = root.display(),
    )
}

/// Every file and directory below `dir`, relative to it.
pub fn tree(dir: &Path) -> Vec<PathBuf> {
    let mut out = Vec::new();
    let mut stack = vec![dir.to_path_buf()];
    while let Some(next) = stack.pop() {
        let Ok(entries) = fs::read_dir(&next) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path.clone());
            }
            if let Ok(rel) = path.strip_prefix(dir) {
                out.push(rel.to_path_buf());
            }
        }
    }
    out.sort();
    out
}
