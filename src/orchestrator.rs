//! Top level: setup, then every iteration of the sweep in turn.

use std::io::{self, BufRead, Write};

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::config::Config;
use crate::iteration::{Coordinator, IterationOptions, IterationOutcome, OnExisting};
use crate::remote::readiness::Readiness;
use crate::remote::{Machines, NodeOptions, local_home};
use crate::setup;
use crate::sweep;

#[derive(Debug, Clone, Copy, Default)]
pub struct Options {
    pub dry_run: bool,
    pub verbose: bool,
    pub interact: bool,
    pub skip_setup: bool,
    pub skip_git: bool,
    pub on_existing: OnExisting,
    pub tcpprobe: bool,
    pub strict: bool,
    /// Do not ask before overwriting existing results.
    pub assume_yes: bool,
    pub readiness: Readiness,
}

impl Options {
    pub fn node_options(&self) -> NodeOptions {
        NodeOptions {
            dry_run: self.dry_run,
            verbose: self.verbose || self.interact,
            interact: self.interact,
        }
    }

    fn iteration_options(&self) -> IterationOptions {
        IterationOptions {
            on_existing: self.on_existing,
            tcpprobe: self.tcpprobe,
            strict: self.strict,
            dry_run: self.dry_run,
            readiness: self.readiness,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Summary {
    pub planned: usize,
    pub completed: usize,
    pub skipped_existing: usize,
    pub skipped_combination: usize,
    pub fetch_failures: usize,
}

/// Check the config, connect to the topology and run the whole sweep.
pub fn run(config: &Config, opts: &Options) -> Result<Summary> {
    config.check()?;
    if opts.interact {
        warn!("interactive mode: every command is printed and waits for confirmation");
    }
    let machines = Machines::connect(&config.topology, opts.node_options());
    run_with(config, &machines, opts)
}

/// Run the sweep on already connected machines.
pub fn run_with(config: &Config, machines: &Machines, opts: &Options) -> Result<Summary> {
    if opts.skip_setup {
        info!("skipping network setup");
    } else {
        setup::setup_networking(config, machines).context("network setup failed")?;
    }

    info!(dir = %config.experiment_dir().display(), "preparing result directories");
    setup::prepare_experiment(config, machines, opts.on_existing, opts.dry_run, || {
        confirm_overwrite(opts)
    })?;

    if !opts.skip_git {
        setup::verify_tools(config, machines).context("tool verification failed")?;
    }

    let runs = sweep::plan(&config.experiment)?;
    let mut summary = Summary {
        planned: runs.len(),
        ..Summary::default()
    };
    let mut coordinator =
        Coordinator::new(config, machines, opts.iteration_options(), local_home()?);

    let width = runs.len().to_string().len();
    for (i, exp) in runs.iter().enumerate() {
        info!("{:0width$}/{} | {exp}", i + 1, runs.len());
        let outcome = coordinator
            .run(exp)
            .with_context(|| format!("iteration failed: {exp}"))?;
        match outcome {
            IterationOutcome::Completed { collected, .. } => {
                summary.completed += 1;
                summary.fetch_failures += collected.failed.len();
            }
            IterationOutcome::SkippedExisting(_) => summary.skipped_existing += 1,
            IterationOutcome::SkippedCombination => summary.skipped_combination += 1,
        }
    }

    info!(
        completed = summary.completed,
        skipped = summary.skipped_existing + summary.skipped_combination,
        fetch_failures = summary.fetch_failures,
        "sweep finished"
    );
    Ok(summary)
}

fn confirm_overwrite(opts: &Options) -> Result<bool> {
    if opts.assume_yes || opts.dry_run {
        return Ok(true);
    }
    let stdin = io::stdin();
    let mut lines = stdin.lock().lines();
    loop {
        eprint!("Overwrite existing results? (y/n) ");
        io::stderr().flush()?;
        match lines.next() {
            Some(line) => match line?.trim() {
                "y" => return Ok(true),
                "n" => return Ok(false),
                _ => continue,
            },
            None => return Ok(false),
        }
    }
}
