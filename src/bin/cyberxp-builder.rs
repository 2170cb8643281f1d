//! cyberxp-builder - builds the CyberXP-OS live ISO.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use cyberxp_builder::buildroot::SystemMounter;
use cyberxp_builder::mirror::HttpFetcher;
use cyberxp_builder::overlay::OverlayBundle;
use cyberxp_builder::preflight::{self, SystemProbe};
use cyberxp_builder::process::SystemExecutor;
use cyberxp_builder::{config, BuildError, CancelToken, Host, Pipeline, State};

const EXIT_STAGE_FAILED: u8 = 1;
const EXIT_PRECONDITION: u8 = 2;
const EXIT_LOCKED: u8 = 3;
const EXIT_INTERRUPTED: u8 = 130;

#[derive(Parser)]
#[command(name = "cyberxp-builder")]
#[command(about = "CyberXP-OS live ISO builder")]
#[command(
    after_help = "QUICK START:\n  cyberxp-builder validate --config cyberxp.toml\n  cyberxp-builder preflight --config cyberxp.toml\n  sudo cyberxp-builder build --config cyberxp.toml"
)]
struct Cli {
    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build the ISO (needs root, network and the host tools)
    Build {
        #[arg(long)]
        config: PathBuf,
        /// Keep the build directory as a rootfs cache for the next run
        #[arg(long)]
        keep_build_dir: bool,
    },

    /// Check host prerequisites without building
    Preflight {
        #[arg(long)]
        config: PathBuf,
    },

    /// Compose the overlay archive only (no network, no root)
    Overlay {
        #[arg(long)]
        config: PathBuf,
        #[arg(long)]
        out: PathBuf,
    },

    /// Parse and validate a build config
    Validate {
        #[arg(long)]
        config: PathBuf,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let result = match cli.command {
        Commands::Build {
            config,
            keep_build_dir,
        } => build(&config, keep_build_dir),
        Commands::Preflight { config } => run_preflight(&config),
        Commands::Overlay { config, out } => compose_overlay(&config, &out),
        Commands::Validate { config } => validate(&config),
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::from(EXIT_PRECONDITION)
        }
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_target(false))
            .init();
    }
}

fn build(config_path: &Path, keep_build_dir: bool) -> Result<ExitCode> {
    let mut ctx = config::load(config_path)?;
    if keep_build_dir {
        ctx.keep_build_dir = true;
    }

    let cancel = CancelToken::new();
    if let Err(e) = cancel.install_interrupt_handler() {
        warn!(error = %e, "could not install interrupt handler; Ctrl-C will not tear down cleanly");
    }

    let exec = SystemExecutor::new(cancel.clone());
    let mounter = SystemMounter::new();
    let fetcher = HttpFetcher::new().context("creating HTTP client")?;
    let probe = SystemProbe;
    let host = Host {
        exec: &exec,
        mounter: &mounter,
        fetcher: &fetcher,
        probe: &probe,
    };

    match Pipeline::new(&ctx, host, cancel).run() {
        Ok(summary) => {
            print!("{}", summary.render());
            Ok(ExitCode::SUCCESS)
        }
        Err(failure) => {
            eprint!("{}", failure.summary.render());
            error!("{}", failure);
            Ok(ExitCode::from(exit_code(failure.stage, &failure.error)))
        }
    }
}

fn exit_code(stage: State, error: &BuildError) -> u8 {
    match error {
        BuildError::Interrupted => EXIT_INTERRUPTED,
        BuildError::Locked { .. } => EXIT_LOCKED,
        BuildError::Config(_) => EXIT_PRECONDITION,
        _ if stage == State::Preflight => EXIT_PRECONDITION,
        _ => EXIT_STAGE_FAILED,
    }
}

fn run_preflight(config_path: &Path) -> Result<ExitCode> {
    let ctx = config::load(config_path)?;
    let report = preflight::run_checks(&ctx, &SystemProbe);
    report.print();
    if report.all_passed() {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::from(EXIT_PRECONDITION))
    }
}

fn compose_overlay(config_path: &Path, out: &Path) -> Result<ExitCode> {
    let ctx = config::load(config_path)?;
    let bundle = OverlayBundle::compose(&ctx).context("composing overlay")?;
    bundle
        .write_archive(out)
        .with_context(|| format!("writing overlay archive '{}'", out.display()))?;
    info!(files = bundle.manifest().len(), path = %out.display(), "overlay composed");
    warn!("{}", bundle.placeholder_warning());
    Ok(ExitCode::SUCCESS)
}

fn validate(config_path: &Path) -> Result<ExitCode> {
    let ctx = config::load(config_path)?;
    println!("config OK: {}", config_path.display());
    println!("  image:     {} (label {})", ctx.artifact_path().display(), ctx.label);
    println!("  base:      {} {} via {}", ctx.distro, ctx.release, ctx.base.label());
    println!("  mirrors:   {}", ctx.mirrors.len());
    println!(
        "  packages:  {} essential, {} optional ({})",
        ctx.packages.essential.len(),
        ctx.packages.optional.len(),
        ctx.packages.manager
    );
    println!("  build dir: {}", ctx.build_dir.display());
    Ok(ExitCode::SUCCESS)
}
