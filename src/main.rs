use std::path::PathBuf;
use std::process::ExitCode;

use bundler_eval::config::Config;
use bundler_eval::orchestrator::{self, Options};
use bundler_eval::{OnExisting, Severity, severity_of};
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

// Use mimalloc as the global allocator for the binary (non-Windows only)
#[cfg(not(windows))]
#[global_allocator]
static ALLOC: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser, Debug)]
#[command(
    name = "bundler-eval",
    author,
    version,
    disable_version_flag = true,
    about = "Run bundler experiments across a sender/inbox/outbox/receiver testbed"
)]
struct Cli {
    /// Print the version and exit
    #[arg(short = 'V', long = "version", action = clap::ArgAction::SetTrue)]
    print_version: bool,

    /// Experiment config (TOML); results go under experiments/<file stem>
    #[arg(required_unless_present = "print_version")]
    config: Option<PathBuf>,

    /// Print every command instead of running it
    #[arg(long)]
    dry_run: bool,
    /// Log more (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
    /// Do not touch routing tables or NIC offloads
    #[arg(long)]
    skip_setup: bool,
    /// Do not check or build tools on the nodes
    #[arg(long)]
    skip_git: bool,
    /// Confirm every command before it runs
    #[arg(long)]
    interact: bool,
    /// Remove existing results and run again
    #[arg(long, conflicts_with = "skip_existing")]
    overwrite_existing: bool,
    /// Leave existing results alone
    #[arg(long)]
    skip_existing: bool,
    /// Record tcpprobe output on the sender
    #[arg(long)]
    tcpprobe: bool,
    /// Abort when processes survive the cleanup between iterations
    #[arg(long)]
    strict: bool,
    /// Do not ask before overwriting existing results
    #[arg(short = 'y', long)]
    yes: bool,
}

impl Cli {
    fn on_existing(&self) -> OnExisting {
        if self.overwrite_existing {
            OnExisting::Overwrite
        } else if self.skip_existing {
            OnExisting::Skip
        } else {
            OnExisting::Abort
        }
    }

    fn options(&self) -> Options {
        Options {
            dry_run: self.dry_run,
            verbose: self.verbose > 0,
            interact: self.interact,
            skip_setup: self.skip_setup,
            skip_git: self.skip_git,
            on_existing: self.on_existing(),
            tcpprobe: self.tcpprobe,
            strict: self.strict,
            assume_yes: self.yes,
            ..Options::default()
        }
    }
}

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn print_version() {
    let version = env!("CARGO_PKG_VERSION");
    let git_hash = env!("GIT_HASH");
    let git_branch = env!("GIT_BRANCH");
    let git_dirty = env!("GIT_DIRTY");

    println!(
        "{} ({}@{}{}) [{}]",
        version,
        git_branch,
        git_hash,
        git_dirty,
        env!("CARGO_PKG_NAME")
    );
}

fn main() -> ExitCode {
    let args = Cli::parse();
    init_tracing(args.verbose);

    if args.print_version {
        print_version();
        return ExitCode::SUCCESS;
    }
    let Some(path) = args.config.as_deref() else {
        error!("no config file given");
        return ExitCode::from(Severity::FatalError.exit_code());
    };

    let result = Config::from_file(path)
        .map_err(anyhow::Error::from)
        .and_then(|config| {
            info!(config = %path.display(), name = %config.name, "loaded config");
            orchestrator::run(&config, &args.options())
        });

    match result {
        Ok(summary) => {
            info!(
                planned = summary.planned,
                completed = summary.completed,
                "done"
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            let severity = severity_of(&e);
            error!(?severity, "{e:#}");
            ExitCode::from(severity.exit_code())
        }
    }
}
