//! Command-line interface definition.

use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand};

/// Fetch, verify, normalize, scan, and publish third-party installer
/// packages.
#[derive(Debug, Parser)]
#[command(name = "packferry", version, about)]
pub struct Cli {
    /// Subcommand; a bare invocation runs the pipeline.
    #[command(subcommand)]
    pub command: Option<Command>,

    /// Arguments shared by every subcommand.
    #[command(flatten)]
    pub common: CommonArgs,
}

/// Arguments shared by every subcommand.
#[derive(Debug, Args)]
pub struct CommonArgs {
    /// Path to the catalog file.
    #[arg(long, global = true, default_value = "apps.json")]
    pub catalog: Utf8PathBuf,

    /// Path to the run configuration file.
    #[arg(long, global = true, default_value = "packferry.toml")]
    pub config: Utf8PathBuf,

    /// Suppress progress output.
    #[arg(long, global = true)]
    pub quiet: bool,
}

/// The operations the binary offers.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the full pipeline over the catalog.
    Run(RunArgs),
    /// Check configuration, catalog, and credentials without any
    /// network activity.
    Validate,
}

/// Options specific to a pipeline run.
#[derive(Debug, Default, Args)]
pub struct RunArgs {
    /// Override the configured worker count.
    #[arg(long)]
    pub jobs: Option<usize>,

    /// Process only the named catalog entries.
    #[arg(long = "only", value_name = "NAME")]
    pub only: Vec<String>,

    /// Keep per-entry working directories after the run.
    #[arg(long)]
    pub retain_artifacts: bool,
}
