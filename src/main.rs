//! Binary entry point: argument parsing, wiring, and exit codes.
//!
//! Exit codes: 0 when every entry succeeded (or validation passed),
//! 1 when the run completed but at least one entry failed, 2 when the
//! run could not start at all.

use clap::Parser;
use packferry::cancel::CancelFlag;
use packferry::catalog;
use packferry::cli::{Cli, Command, CommonArgs, RunArgs};
use packferry::config::{Credentials, RunConfig};
use packferry::error::{Result, SetupError};
use packferry::exec::SystemCommandExecutor;
use packferry::fetch::HttpFetcher;
use packferry::ledger::RunReport;
use packferry::output::{run_summary, write_stderr_line};
use packferry::pipeline::{self, PipelineContext, ProgressSink};
use packferry::publish::HttpEndpoint;
use packferry::reputation::{HttpReputationClient, RateLimiter, ReputationGate};
use packferry::verify::CommandSignatureReader;
use std::process::ExitCode;
use std::sync::{Arc, Mutex};

fn main() -> ExitCode {
    let cli = Cli::parse();
    match execute(&cli) {
        Ok(Some(report)) if report.has_failures() => ExitCode::from(1),
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            write_stderr_line(&mut std::io::stderr(), format!("error: {e}"));
            ExitCode::from(2)
        }
    }
}

fn execute(cli: &Cli) -> Result<Option<RunReport>> {
    match &cli.command {
        Some(Command::Validate) => {
            validate(&cli.common)?;
            Ok(None)
        }
        Some(Command::Run(args)) => run(&cli.common, args).map(Some),
        None => run(&cli.common, &RunArgs::default()).map(Some),
    }
}

/// Check configuration, catalog, and credentials without touching the
/// network.
fn validate(common: &CommonArgs) -> Result<()> {
    let config = RunConfig::load(&common.config)?;
    let entries = catalog::load(&common.catalog)?;
    let _ = Credentials::from_env(config.reputation.enabled)?;
    if !common.quiet {
        write_stderr_line(
            &mut std::io::stderr(),
            format!("configuration valid: {} catalog entries", entries.len()),
        );
    }
    Ok(())
}

/// Load everything, wire the production implementations, run the
/// pipeline, and write the report.
fn run(common: &CommonArgs, args: &RunArgs) -> Result<RunReport> {
    let mut config = RunConfig::load(&common.config)?;
    if let Some(jobs) = args.jobs {
        config.run.jobs = jobs.max(1);
    }
    if args.retain_artifacts {
        config.run.retain_artifacts = true;
    }

    let mut entries = catalog::load(&common.catalog)?;
    if !args.only.is_empty() {
        entries.retain(|entry| args.only.iter().any(|name| name == &entry.name));
    }

    let credentials = Credentials::from_env(config.reputation.enabled)?;
    let cancel = CancelFlag::new();
    install_interrupt_handler(&cancel);

    let reputation = config.reputation.enabled.then(|| {
        ReputationGate::new(
            Arc::new(HttpReputationClient::new(
                config.reputation.base_url.clone(),
                credentials.scan_api_key.clone().unwrap_or_default(),
            )),
            Arc::new(RateLimiter::per_minute(config.reputation.requests_per_minute)),
            &config.reputation,
        )
    });

    let report_path = config.run.report_path.clone();
    let ctx = PipelineContext {
        fetcher: Arc::new(HttpFetcher),
        signatures: Arc::new(CommandSignatureReader::new(SystemCommandExecutor)),
        reputation,
        endpoint: Arc::new(HttpEndpoint::new(
            config.distribution.base_url.clone(),
            credentials.dist_username,
            credentials.dist_password,
        )),
        config,
        cancel,
    };

    let progress: ProgressSink = if common.quiet {
        Mutex::new(Box::new(std::io::sink()))
    } else {
        Mutex::new(Box::new(std::io::stderr()))
    };

    let report = pipeline::run(&ctx, &entries, &progress);
    report
        .write_to(&report_path)
        .map_err(|source| SetupError::ReportWrite {
            path: report_path.clone(),
            source,
        })?;

    if !common.quiet {
        let mut stderr = std::io::stderr();
        write_stderr_line(&mut stderr, run_summary(&report));
        write_stderr_line(&mut stderr, format!("report written to {report_path}"));
    }
    Ok(report)
}

#[cfg(unix)]
fn install_interrupt_handler(cancel: &CancelFlag) {
    if let Err(e) = signal_hook::flag::register(signal_hook::consts::SIGINT, cancel.handle()) {
        log::warn!("failed to install interrupt handler: {e}");
    }
}

#[cfg(not(unix))]
fn install_interrupt_handler(_cancel: &CancelFlag) {}
