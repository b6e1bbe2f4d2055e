mod common;

use bundler_eval::orchestrator::{self, Options};
use bundler_eval::{Config, ExpError, OnExisting, Severity, severity_of};
use common::{Fixture, SMALL_SWEEP, tree};

fn dry_run() -> Options {
    Options {
        dry_run: true,
        ..Options::default()
    }
}

#[test]
fn test_dry_run_plans_whole_sweep_without_side_effects() {
    let fixture = Fixture::new("dry", SMALL_SWEEP);
    let before = tree(fixture.root.path());
    let config = Config::from_file(&fixture.path).unwrap();
    assert_eq!(config.name, "dry");

    let summary = orchestrator::run(&config, &dry_run()).unwrap();
    // 2 schedulers x 2 algorithms x 2 rates x 2 cross sets
    assert_eq!(summary.planned, 16);
    assert_eq!(summary.skipped_combination, 0);
    assert_eq!(summary.completed, 16);
    assert_eq!(summary.fetch_failures, 0);

    assert_eq!(tree(fixture.root.path()), before);
    assert!(!fixture.experiment_dir().exists());
}

#[test]
fn test_dry_run_still_refuses_existing_results() {
    let fixture = Fixture::new("existing", SMALL_SWEEP);
    std::fs::create_dir_all(fixture.experiment_dir()).unwrap();
    let config = Config::from_file(&fixture.path).unwrap();

    let err = orchestrator::run(&config, &dry_run()).unwrap_err();
    assert_eq!(severity_of(&err), Severity::FatalError);
    assert!(err.chain().any(|c| matches!(
        c.downcast_ref::<ExpError>(),
        Some(ExpError::ExistingResults(_))
    )));

    let opts = Options {
        on_existing: OnExisting::Skip,
        ..dry_run()
    };
    let summary = orchestrator::run(&config, &opts).unwrap();
    assert_eq!(summary.completed, 16);
}

#[test]
fn test_dry_run_skips_meaningless_combinations() {
    let sweep = SMALL_SWEEP.replace(r#"sch = ["fifo", "sfq"]"#, r#"sch = ["fqcodel"]"#);
    let fixture = Fixture::new("fq", &sweep);
    let config = Config::from_file(&fixture.path).unwrap();

    let summary = orchestrator::run(&config, &dry_run()).unwrap();
    assert_eq!(summary.planned, 8);
    assert_eq!(summary.skipped_combination, 4);
    assert_eq!(summary.completed, 4);
}

#[test]
fn test_invalid_config_never_connects() {
    let sweep = SMALL_SWEEP.replace("port = 5050", "port = 6500");
    let fixture = Fixture::new("bad", &sweep);
    let config = Config::from_file(&fixture.path).unwrap();

    let err = orchestrator::run(&config, &dry_run()).unwrap_err();
    assert_eq!(severity_of(&err), Severity::FatalError);
    assert!(err.to_string().contains("outside of bundle capture region"));
}
