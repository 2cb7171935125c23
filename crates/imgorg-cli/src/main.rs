mod config;
mod logging;

use std::io;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use anyhow::Context;
use clap::{ArgAction, Parser};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{info, warn};

use config::FileConfig;
use imgorg_core::{
    CancellationToken, OrganizeControl, OrganizeOptions, ReportEntry, RunReport, TransferMode,
};

#[derive(Parser, Debug)]
#[command(
    name = "imgorg",
    version,
    about = "Organize photos into a date-based folder tree, skipping duplicate content"
)]
struct Cli {
    /// Directory to collect images from
    #[arg(short, long)]
    source: Option<PathBuf>,

    /// Root of the organized tree
    #[arg(short, long, visible_alias = "target")]
    dest: Option<PathBuf>,

    /// Report every decision without touching the filesystem
    #[arg(long)]
    dry_run: bool,

    /// Echo each decision; repeat for more log output
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,

    /// Naming template, e.g. "{year}/{month}/{name}" or "{year}/{camera}/{name}"
    #[arg(short, long)]
    template: Option<String>,

    /// Number of worker threads (default: one per core)
    #[arg(short, long)]
    workers: Option<usize>,

    /// Do not index files already in the destination before starting
    #[arg(long)]
    no_seed: bool,

    /// Copy files instead of moving them
    #[arg(long)]
    copy: bool,

    /// TOML file with default settings
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Also write the full report as JSON
    #[arg(long)]
    report_json: Option<PathBuf>,
}

/// Merge command line flags over the config file.
fn build_options(cli: &Cli, file: FileConfig) -> anyhow::Result<OrganizeOptions> {
    let defaults = OrganizeOptions::default();
    let source = cli
        .source
        .clone()
        .or(file.source)
        .context("no source directory given (use --source)")?;
    let dest = cli
        .dest
        .clone()
        .or(file.dest)
        .context("no destination directory given (use --dest)")?;

    let mode = if cli.copy {
        TransferMode::Copy
    } else {
        file.mode.unwrap_or(defaults.mode)
    };

    Ok(OrganizeOptions {
        source,
        dest,
        template: cli.template.clone().or(file.template).unwrap_or(defaults.template),
        dry_run: cli.dry_run || file.dry_run.unwrap_or(false),
        workers: cli.workers.or(file.workers),
        seed_from_destination: !cli.no_seed
            && file
                .seed_from_destination
                .unwrap_or(defaults.seed_from_destination),
        mode,
        retry_backoff_ms: file.retry_backoff_ms.unwrap_or(defaults.retry_backoff_ms),
        max_suffix: file.max_suffix.unwrap_or(defaults.max_suffix),
    })
}

fn new_spinner() -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::with_template("{spinner:.cyan} {pos} files processed {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏"),
    );
    pb.enable_steady_tick(Duration::from_millis(80));
    pb
}

fn echo_decision(entry: &ReportEntry) {
    let dest = entry
        .destination_path
        .as_ref()
        .map(|p| format!(" -> {}", p.display()))
        .unwrap_or_default();
    let note = entry
        .error_kind
        .map(|k| format!(" [{}]", k.as_str()))
        .unwrap_or_default();
    eprintln!(
        "{:<12} {}{}{}",
        entry.outcome.as_str(),
        entry.source_path.display(),
        dest,
        note
    );
}

/// Any file failed, or the run was cut short.
const EXIT_FAILURES: u8 = 1;
/// The run could not start: bad arguments, config, template or roots.
const EXIT_SETUP: u8 = 2;
/// Second Ctrl-C, conventional 128 + SIGINT.
const EXIT_INTERRUPTED: u8 = 130;

fn load_options(cli: &Cli) -> anyhow::Result<OrganizeOptions> {
    let file = match &cli.config {
        Some(path) => FileConfig::load(path)?,
        None => FileConfig::default(),
    };
    build_options(cli, file)
}

/// Cancel the run; returns true if it was already cancelled, meaning the
/// user asked twice and no longer wants to wait.
fn interrupt(token: &CancellationToken) -> bool {
    let again = token.is_cancelled();
    token.cancel();
    again
}

fn install_interrupt_handler(token: CancellationToken) -> Result<(), ctrlc::Error> {
    ctrlc::set_handler(move || {
        if interrupt(&token) {
            eprintln!("\nInterrupted again, exiting now");
            std::process::exit(i32::from(EXIT_INTERRUPTED));
        }
        eprintln!("\nInterrupted, finishing files already in progress (Ctrl-C again to quit)...");
    })
}

fn write_reports(report: &RunReport, json_path: Option<&Path>) -> anyhow::Result<()> {
    report
        .write_csv(io::stdout().lock())
        .context("cannot write report to stdout")?;
    if let Some(path) = json_path {
        report
            .write_json(path)
            .with_context(|| format!("cannot write JSON report {}", path.display()))?;
        info!("JSON report written to {}", path.display());
    }
    Ok(())
}

fn outcome_code(report: &RunReport) -> u8 {
    if report.has_failures() || report.cancelled {
        EXIT_FAILURES
    } else {
        0
    }
}

fn run(cli: Cli) -> u8 {
    let options = match load_options(&cli) {
        Ok(options) => options,
        Err(err) => {
            eprintln!("Error: {:#}", err);
            return EXIT_SETUP;
        }
    };

    let token = CancellationToken::new();
    if let Err(e) = install_interrupt_handler(token.clone()) {
        warn!("Cannot install Ctrl-C handler, interrupting will not be graceful: {}", e);
    }
    let control = OrganizeControl::new().with_cancel_token(token);

    let verbose = cli.verbose > 0;
    let spinner = (!verbose).then(new_spinner);

    let progress_spinner = spinner.clone();
    let progress = move |_stage: &str, _current: u64, total: u64, _message: &str| {
        if let Some(pb) = &progress_spinner {
            pb.set_message(format!("({} found)", total));
        }
    };
    let decision_spinner = spinner.clone();
    let on_decision = move |entry: &ReportEntry| {
        if verbose {
            echo_decision(entry);
        } else if let Some(pb) = &decision_spinner {
            pb.inc(1);
        }
    };

    let result = imgorg_core::organize_with_control(&options, &control, &progress, &on_decision);
    if let Some(pb) = &spinner {
        pb.finish_and_clear();
    }
    let report = match result {
        Ok(report) => report,
        Err(err) => {
            eprintln!("Error: {}", err);
            return EXIT_SETUP;
        }
    };

    let written = write_reports(&report, cli.report_json.as_deref());
    eprintln!("{}", report.summary());
    match written {
        Ok(()) => outcome_code(&report),
        Err(err) => {
            eprintln!("Error: {:#}", err);
            EXIT_FAILURES
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    logging::init_logger(cli.verbose);
    ExitCode::from(run(cli))
}
