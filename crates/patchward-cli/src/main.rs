use std::io::{IsTerminal, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anstyle::{AnsiColor, Effects, Style};
use anyhow::{Context, Result};
use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use indicatif::{ProgressBar, ProgressStyle};
use patchward_core::{HostConfig, PackageKind, CONFIG_FILE_NAME};
use patchward_installer::{
    default_host_root, installed_package_ids, read_active_transaction, read_transaction_metadata,
    transaction_owner_process_alive, HostLayout,
};
use patchward_orchestrator::{
    recover_interrupted, HostServices, RecoveryOutcome, ShutdownHooks, UpgradeError,
    UpgradeOrchestrator, UpgradeOutcome, UpgradeRequest,
};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "patchward")]
#[command(about = "Crash-safe plugin and theme upgrades", long_about = None)]
struct Cli {
    /// Host installation root (defaults to PATCHWARD_HOST_ROOT, then the config, then the current directory).
    #[arg(long, global = true)]
    host_root: Option<PathBuf>,
    /// Config file (defaults to <host root>/patchward.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Upgrade an installed package, or install one from an archive.
    Upgrade {
        #[arg(long, value_enum, default_value_t = CliPackageKind::Plugin)]
        kind: CliPackageKind,
        /// Installed package identifier, e.g. `alpha/alpha.pkg` or a theme slug.
        #[arg(long)]
        package: Option<String>,
        /// Archive path or http(s) URL to upgrade from.
        #[arg(long)]
        archive: Option<String>,
        /// Put the host in maintenance mode while files change.
        #[arg(long)]
        maintenance: bool,
        /// Back the package up and restore it at exit if the upgrade breaks it.
        #[arg(long)]
        crash_recovery: bool,
        /// Version to record for an archive-sourced upgrade.
        #[arg(long)]
        target_version: Option<String>,
    },
    /// Roll back an upgrade left unfinished by a process that died.
    Recover,
    /// Show the host layout and transaction health.
    Doctor,
    /// Print a shell completion script.
    Completions {
        #[arg(value_enum)]
        shell: CliCompletionShell,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum CliPackageKind {
    Plugin,
    Theme,
}

impl From<CliPackageKind> for PackageKind {
    fn from(value: CliPackageKind) -> Self {
        match value {
            CliPackageKind::Plugin => PackageKind::Plugin,
            CliPackageKind::Theme => PackageKind::Theme,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum CliCompletionShell {
    Bash,
    Zsh,
    Fish,
    Powershell,
}

impl From<CliCompletionShell> for Shell {
    fn from(value: CliCompletionShell) -> Self {
        match value {
            CliCompletionShell::Bash => Shell::Bash,
            CliCompletionShell::Zsh => Shell::Zsh,
            CliCompletionShell::Fish => Shell::Fish,
            CliCompletionShell::Powershell => Shell::PowerShell,
        }
    }
}

include!("config.rs");
include!("render.rs");
include!("completion.rs");
include!("dispatch.rs");
include!("tests.rs");

fn init_tracing() {
    let filter = EnvFilter::try_from_env("PATCHWARD_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();

    match run_cli(cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!(
                "{}",
                render_status_line(current_output_style(), "error", &format!("{err:#}"))
            );
            ExitCode::FAILURE
        }
    }
}
