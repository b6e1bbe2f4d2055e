#[cfg(test)]
mod tests {
    use std::path::{Path, PathBuf};

    use tempfile::TempDir;

    use crate::boxes;
    use crate::config::Config;
    use crate::error::{ExpError, Severity, find_exp_error, severity_of};
    use crate::iteration::{Coordinator, IterationOptions, IterationOutcome, OnExisting, TCPPROBE};
    use crate::remote::RemoteNode;
    use crate::remote::readiness::Readiness;
    use crate::sweep::{self, Experiment};
    use crate::test_helpers::{FakeNode, FakeTestbed, test_config};
    use crate::traffic::ETG_SERVER_PROCESS;

    const POISSON_BUNDLE: &str = r#"
sch = ["fifo"]
alg = ["copa"]
rate = [96]
rtt = [50]
bdp = [2]
seed = [1]
bundle_traffic = [[{ source = "poisson", start_port = 5100, conns = 3, reqs = 1000, dist = "CAIDA_CDF", load = "0.5", alg = "reno" }]]
cross_traffic = [[]]
"#;

    fn options(on_existing: OnExisting) -> IterationOptions {
        IterationOptions {
            on_existing,
            readiness: Readiness::immediate(),
            ..IterationOptions::default()
        }
    }

    fn fixture(experiment: Option<&str>) -> (TempDir, Config, Experiment) {
        let root = tempfile::tempdir().unwrap();
        let config = test_config(root.path(), experiment);
        let exp = sweep::enumerate(&config.experiment).unwrap().remove(0);
        (root, config, exp)
    }

    fn coordinator<'a>(
        config: &'a Config,
        testbed: &'a FakeTestbed,
        opts: IterationOptions,
    ) -> Coordinator<'a> {
        Coordinator::new(config, &testbed.machines, opts, PathBuf::from("/home/fake"))
    }

    fn path_str(path: &Path) -> String {
        path.display().to_string()
    }

    #[test]
    fn test_stages_run_in_order() {
        let (_root, config, exp) = fixture(None);
        let testbed = FakeTestbed::new();
        let mut coord = coordinator(&config, &testbed, options(OnExisting::Abort));

        let outcome = coord.run(&exp).unwrap();
        let IterationOutcome::Completed { dir, collected, .. } = &outcome else {
            panic!("iteration did not complete: {outcome:?}");
        };
        assert!(dir.ends_with("fifo_copa_96_50/b=iperf.cubic.4_c=/1"));
        assert!(collected.failed.is_empty());

        // inbox, then agent, then the ready marker
        let inbox = &testbed.inbox;
        let started = inbox
            .position(&path_str(&config.structure.inbox_binary()))
            .unwrap();
        let agent = inbox.position("ccp_copa/target/release/copa").unwrap();
        let ready = inbox.position(boxes::INBOX_READY).unwrap();
        assert!(started < agent && agent < ready);

        // servers listen before the emulation shell starts any client
        let sender = &testbed.sender;
        assert!(sender.ran("-s -p 5050 --reverse"));
        assert!(sender.ran("grep -q -F -- 'Server listening on TCP port'"));

        let receiver = &testbed.receiver;
        let outer = dir.join("mm_outer.sh");
        let script = receiver.put_contents(&dir.join("mm_inner0.sh")).unwrap();
        assert!(script.contains("--no_ethernet"));
        assert!(script.contains("-c 10.1.1.1 -p 5050"));
        assert!(receiver.put_contents(&outer).unwrap().contains("mm-delay 25 mm-link"));
        assert!(receiver.ran(&format!("&& {}", path_str(&outer))));

        // every node was cleared before and after
        for node in testbed.all() {
            assert_eq!(node.count("pkill -9"), 2, "{}", node.addr());
        }
    }

    #[test]
    fn test_artifacts_are_fetched_from_their_nodes() {
        let (_root, config, exp) = fixture(None);
        let testbed = FakeTestbed::new();
        let mut coord = coordinator(&config, &testbed, options(OnExisting::Abort));
        let IterationOutcome::Completed { dir, collected, .. } = coord.run(&exp).unwrap() else {
            panic!("iteration did not complete");
        };

        fn fetched(node: &FakeNode) -> Vec<PathBuf> {
            node.gets().into_iter().map(|(remote, _)| remote).collect()
        }
        assert!(fetched(&testbed.inbox).contains(&dir.join("inbox.log")));
        assert!(fetched(&testbed.inbox).contains(&dir.join("ccp_copa.log")));
        assert!(fetched(&testbed.sender).contains(&dir.join("iperf_server_5050.log")));
        let receiver = fetched(&testbed.receiver);
        for name in ["iperf_client_5050.log", "outbox.log", "downlink0.log"] {
            assert!(receiver.contains(&dir.join(name)), "{name} not fetched");
        }
        assert_eq!(collected.fetched, testbed.all().iter().map(|n| n.gets().len()).sum::<usize>());
        for (_, local) in testbed.receiver.gets() {
            assert_eq!(local.parent(), Some(dir.as_path()));
        }
    }

    #[test]
    fn test_missing_inbox_marker_stops_before_servers() {
        let (_root, config, exp) = fixture(None);
        let testbed = FakeTestbed::from_nodes(
            FakeNode::new("sender"),
            FakeNode::new("inbox").without_marker(boxes::INBOX_AWAITING_DATAPATH),
            FakeNode::new("outbox"),
            FakeNode::new("receiver"),
        );
        let mut coord = coordinator(&config, &testbed, options(OnExisting::Abort));

        let err = coord.run(&exp).unwrap_err();
        match find_exp_error(&err) {
            Some(ExpError::ReadinessTimeout { node, marker, log }) => {
                assert_eq!(node, "inbox");
                assert_eq!(marker, boxes::INBOX_AWAITING_DATAPATH);
                assert!(log.ends_with("inbox.log"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(severity_of(&err), Severity::FatalWarning);
        assert!(!testbed.sender.ran("nohup"));
        assert!(!testbed.inbox.ran("ccp_copa"));
        assert!(testbed.receiver.puts().is_empty());
    }

    #[test]
    fn test_dead_agent_is_reported_with_its_log() {
        let (_root, config, exp) = fixture(None);
        let testbed = FakeTestbed::from_nodes(
            FakeNode::new("sender"),
            FakeNode::new("inbox").with_dead_process("copa"),
            FakeNode::new("outbox"),
            FakeNode::new("receiver"),
        );
        let mut coord = coordinator(&config, &testbed, options(OnExisting::Abort));

        let err = coord.run(&exp).unwrap_err();
        match find_exp_error(&err) {
            Some(ExpError::ProcessNotRunning { process, log, log_tail, .. }) => {
                assert_eq!(process, "copa");
                assert!(log.ends_with("ccp_copa.log"));
                assert!(log_tail.contains("last lines"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_iteration_directory_is_never_reused() {
        let (_root, config, exp) = fixture(None);
        let testbed = FakeTestbed::new();
        let mut coord = coordinator(&config, &testbed, options(OnExisting::Overwrite));

        coord.run(&exp).unwrap();
        let err = coord.run(&exp).unwrap_err();
        assert!(matches!(
            find_exp_error(&err),
            Some(ExpError::IterationDirReused(_))
        ));
        assert_eq!(severity_of(&err), Severity::FatalError);
        assert_eq!(coord.session().len(), 1);
    }

    #[test]
    fn test_existing_results_are_left_alone_when_skipping() {
        let (_root, config, exp) = fixture(None);
        let dir = config.experiment_dir().join(exp.iteration_name("iperf.cubic.4", ""));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("inbox.log"), "old run").unwrap();

        let testbed = FakeTestbed::new();
        let mut coord = coordinator(&config, &testbed, options(OnExisting::Skip));
        assert_eq!(
            coord.run(&exp).unwrap(),
            IterationOutcome::SkippedExisting(dir.clone())
        );
        for node in testbed.all() {
            assert!(!node.ran("nohup"));
            assert!(!node.ran("rm -rf"));
        }
        assert_eq!(std::fs::read_to_string(dir.join("inbox.log")).unwrap(), "old run");
    }

    #[test]
    fn test_existing_results_abort_by_default() {
        let (_root, config, exp) = fixture(None);
        let dir = config.experiment_dir().join(exp.iteration_name("iperf.cubic.4", ""));
        std::fs::create_dir_all(&dir).unwrap();

        let testbed = FakeTestbed::new();
        let mut coord = coordinator(&config, &testbed, options(OnExisting::Abort));
        let err = coord.run(&exp).unwrap_err();
        assert!(matches!(
            find_exp_error(&err),
            Some(ExpError::ExistingResults(_))
        ));

        let testbed = FakeTestbed::new();
        let mut coord = coordinator(&config, &testbed, options(OnExisting::Overwrite));
        coord.run(&exp).unwrap();
        let removed = testbed.inbox.position("rm -rf").unwrap();
        let created = testbed.inbox.position("mkdir -p").unwrap();
        assert!(removed < created);
    }

    #[test]
    fn test_leftover_processes_warn_unless_strict() {
        let (_root, config, exp) = fixture(None);
        let pattern = config.kill_pattern();
        let leftover = || {
            FakeTestbed::from_nodes(
                FakeNode::new("sender"),
                FakeNode::new("inbox").with_pgrep_counts(&pattern, &[2]),
                FakeNode::new("outbox"),
                FakeNode::new("receiver"),
            )
        };

        let testbed = leftover();
        let mut coord = coordinator(&config, &testbed, options(OnExisting::Abort));
        assert!(matches!(
            coord.run(&exp).unwrap(),
            IterationOutcome::Completed { .. }
        ));

        let testbed = leftover();
        let opts = IterationOptions {
            strict: true,
            ..options(OnExisting::Abort)
        };
        let mut coord = coordinator(&config, &testbed, opts);
        let err = coord.run(&exp).unwrap_err();
        match find_exp_error(&err) {
            Some(ExpError::LeftoverProcesses { node, count }) => {
                assert_eq!(node, "inbox");
                assert_eq!(*count, 2);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(!testbed.inbox.ran("mkdir -p"));
    }

    #[test]
    fn test_poisson_servers_are_counted_against_baseline() {
        let (_root, config, exp) = fixture(Some(POISSON_BUNDLE));
        // one unrelated server was already running
        let testbed = FakeTestbed::from_nodes(
            FakeNode::new("sender").with_pgrep_counts(ETG_SERVER_PROCESS, &[1, 4]),
            FakeNode::new("inbox"),
            FakeNode::new("outbox"),
            FakeNode::new("receiver"),
        );
        let mut coord = coordinator(&config, &testbed, options(OnExisting::Abort));
        let IterationOutcome::Completed { dir, .. } = coord.run(&exp).unwrap() else {
            panic!("iteration did not complete");
        };
        assert!(testbed.sender.ran("run-servers.sh 5100 3 reno"));

        let etg = testbed.receiver.put_contents(&dir.join("etgConfig1")).unwrap();
        assert!(etg.starts_with("server 10.1.1.1 5100\n"));
        assert!(etg.contains("load 48Mbps\n"));
        let inner = testbed.receiver.put_contents(&dir.join("mm_inner0.sh")).unwrap();
        assert!(inner.contains("-c etgConfig1 -l 1 -s 1"));
    }

    #[test]
    fn test_poisson_server_shortfall_is_fatal() {
        let (_root, config, exp) = fixture(Some(POISSON_BUNDLE));
        let testbed = FakeTestbed::from_nodes(
            FakeNode::new("sender").with_pgrep_counts(ETG_SERVER_PROCESS, &[0, 2]),
            FakeNode::new("inbox"),
            FakeNode::new("outbox"),
            FakeNode::new("receiver"),
        );
        let mut coord = coordinator(&config, &testbed, options(OnExisting::Abort));
        let err = coord.run(&exp).unwrap_err();
        match find_exp_error(&err) {
            Some(ExpError::ProcessCount {
                expected, running, log, ..
            }) => {
                assert_eq!((*expected, *running), (3, 2));
                assert!(log.ends_with("etg_server_5100.log"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(testbed.receiver.puts().is_empty());
    }

    #[test]
    fn test_bundle_and_cross_poisson_logs_stay_apart() {
        let exp_toml = r#"
sch = ["fifo"]
alg = ["copa"]
rate = [96]
rtt = [50]
bdp = [2]
seed = [1]
bundle_traffic = [[{ source = "poisson", start_port = 5100, conns = 3, reqs = 1000, dist = "CAIDA_CDF", load = "0.5", alg = "reno" }]]
cross_traffic = [[{ source = "poisson", start_port = 7000, conns = 2, reqs = 1000, dist = "CAIDA_CDF", load = "0.25", alg = "cubic" }]]
"#;
        let (_root, config, exp) = fixture(Some(exp_toml));
        let testbed = FakeTestbed::from_nodes(
            FakeNode::new("sender").with_pgrep_counts(ETG_SERVER_PROCESS, &[0, 3]),
            FakeNode::new("inbox"),
            FakeNode::new("outbox"),
            FakeNode::new("receiver").with_pgrep_counts(ETG_SERVER_PROCESS, &[0, 2]),
        );
        let mut coord = coordinator(&config, &testbed, options(OnExisting::Abort));
        let IterationOutcome::Completed { dir, .. } = coord.run(&exp).unwrap() else {
            panic!("iteration did not complete");
        };
        assert!(testbed.sender.ran("run-servers.sh 5100 3 reno"));
        assert!(testbed.receiver.ran("run-servers.sh 7000 2 cubic"));

        let fetched: Vec<PathBuf> = testbed
            .all()
            .iter()
            .flat_map(|n| n.gets())
            .map(|(_, local)| local)
            .collect();
        let mut unique = fetched.clone();
        unique.sort();
        unique.dedup();
        assert_eq!(unique.len(), fetched.len(), "fetched paths collide: {fetched:?}");

        for log in ["etg_server_5100.log", "etg_server_7000.log"] {
            assert!(fetched.iter().any(|p| p.ends_with(log)), "{log} not fetched");
        }
        assert!(testbed.receiver.put_contents(&dir.join("etgConfig2")).is_some());
    }

    #[test]
    fn test_failed_fetch_does_not_fail_iteration() {
        let (_root, config, exp) = fixture(None);
        let testbed = FakeTestbed::from_nodes(
            FakeNode::new("sender"),
            FakeNode::new("inbox"),
            FakeNode::new("outbox"),
            FakeNode::new("receiver").failing_get(),
        );
        let mut coord = coordinator(&config, &testbed, options(OnExisting::Abort));
        let IterationOutcome::Completed { collected, .. } = coord.run(&exp).unwrap() else {
            panic!("iteration did not complete");
        };
        assert!(!collected.failed.is_empty());
        assert!(collected.fetched > 0);
    }

    #[test]
    fn test_local_node_artifacts_are_not_copied() {
        let (_root, config, exp) = fixture(None);
        let testbed = FakeTestbed::from_nodes(
            FakeNode::new("sender"),
            FakeNode::new("inbox"),
            FakeNode::new("outbox"),
            FakeNode::new("receiver").local(),
        );
        let mut coord = coordinator(&config, &testbed, options(OnExisting::Abort));
        coord.run(&exp).unwrap();
        assert!(testbed.receiver.gets().is_empty());
        assert!(!testbed.inbox.gets().is_empty());
    }

    #[test]
    fn test_nobundler_runs_plain_queue() {
        let exp_toml = r#"
sch = ["sfq", "fqcodel"]
alg = ["nobundler"]
rate = [96]
rtt = [50]
bdp = [2]
seed = [1]
bundle_traffic = [[{ source = "iperf", port = 5050, flows = 4, length = 10, alg = "cubic" }]]
cross_traffic = [[]]
"#;
        let (_root, config, _) = fixture(Some(exp_toml));
        let runs = sweep::enumerate(&config.experiment).unwrap();
        let testbed = FakeTestbed::new();
        let mut coord = coordinator(&config, &testbed, options(OnExisting::Abort));

        let fqcodel = runs.iter().find(|e| e.sch == "fqcodel").unwrap();
        assert_eq!(coord.run(fqcodel).unwrap(), IterationOutcome::SkippedCombination);
        assert!(testbed.all().iter().all(|n| n.commands().is_empty()));

        let sfq = runs.iter().find(|e| e.sch == "sfq").unwrap();
        let IterationOutcome::Completed { dir, .. } = coord.run(sfq).unwrap() else {
            panic!("iteration did not complete");
        };
        assert!(!testbed.inbox.ran("nohup"));
        let inner = testbed.receiver.put_contents(&dir.join("mm_inner0.sh")).unwrap();
        assert!(!inner.contains("outbox"));
        let outer = testbed.receiver.put_contents(&dir.join("mm_outer.sh")).unwrap();
        assert!(outer.contains("--downlink-queue=akshayfq"));
    }

    #[test]
    fn test_tcpprobe_needs_kernel_module() {
        let (_root, config, exp) = fixture(None);
        let testbed = FakeTestbed::from_nodes(
            FakeNode::new("sender").with_missing_file(TCPPROBE),
            FakeNode::new("inbox"),
            FakeNode::new("outbox"),
            FakeNode::new("receiver"),
        );
        let opts = IterationOptions {
            tcpprobe: true,
            ..options(OnExisting::Abort)
        };
        let mut coord = coordinator(&config, &testbed, opts);
        let err = coord.run(&exp).unwrap_err();
        assert!(matches!(
            find_exp_error(&err),
            Some(ExpError::MissingTool { .. })
        ));
        assert!(!testbed.sender.ran("-s -p 5050"));
    }

    #[test]
    fn test_tcpprobe_log_is_collected() {
        let (_root, config, exp) = fixture(None);
        let testbed = FakeTestbed::new();
        let opts = IterationOptions {
            tcpprobe: true,
            ..options(OnExisting::Abort)
        };
        let mut coord = coordinator(&config, &testbed, opts);
        let IterationOutcome::Completed { dir, .. } = coord.run(&exp).unwrap() else {
            panic!("iteration did not complete");
        };
        let probe = testbed.sender.position("dd if=/proc/net/tcpprobe").unwrap();
        let server = testbed.sender.position("-s -p 5050").unwrap();
        assert!(probe < server);
        assert!(
            testbed
                .sender
                .gets()
                .iter()
                .any(|(remote, _)| remote == &dir.join("tcpprobe.log"))
        );
    }
}
