mod common;

use std::process::Command;

use common::{Fixture, SMALL_SWEEP};

fn bundler_eval() -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_bundler-eval"));
    cmd.env("RUST_LOG", "warn");
    cmd
}

#[test]
fn test_version_flag() {
    let out = bundler_eval().arg("-V").output().unwrap();
    assert!(out.status.success());
    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(stdout.starts_with(env!("CARGO_PKG_VERSION")));
    assert!(stdout.contains("[bundler-eval]"));
}

#[test]
fn test_config_is_required() {
    let out = bundler_eval().output().unwrap();
    assert!(!out.status.success());
}

#[test]
fn test_dry_run_prints_commands() {
    let fixture = Fixture::new("cli", SMALL_SWEEP);
    let out = bundler_eval()
        .arg("--dry-run")
        .arg(&fixture.path)
        .output()
        .unwrap();
    assert!(
        out.status.success(),
        "{}",
        String::from_utf8_lossy(&out.stderr)
    );
    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(stdout.contains("[inbox.test]"));
    assert!(stdout.contains("mm-delay 25 mm-link"));
    assert!(stdout.contains("ip route add 10.1.2.4 via 10.1.1.2"));
    assert!(!fixture.experiment_dir().exists());
}

#[test]
fn test_invalid_config_exits_with_two() {
    let fixture = Fixture::new("bad", &SMALL_SWEEP.replace("port = 7100", "port = 5100"));
    let out = bundler_eval().arg("--dry-run").arg(&fixture.path).output().unwrap();
    assert_eq!(out.status.code(), Some(2));
    assert!(String::from_utf8_lossy(&out.stderr).contains("cross traffic"));
}

#[test]
fn test_conflicting_existing_flags_are_rejected() {
    let fixture = Fixture::new("flags", SMALL_SWEEP);
    let out = bundler_eval()
        .args(["--dry-run", "--skip-existing", "--overwrite-existing"])
        .arg(&fixture.path)
        .output()
        .unwrap();
    assert!(!out.status.success());
    assert!(!fixture.experiment_dir().exists());
}
