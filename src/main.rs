//! pepinstall - Main entry point
//!
//! Parses the command line, sets up logging and the cancellation handler,
//! runs one session and maps its outcome to an exit code.

use pepinstall::cancel::CancelToken;
use pepinstall::cli::{Cli, Commands};
use pepinstall::config_file::EngineConfig;
use pepinstall::error::{EXIT_SUCCESS, InstallError, Result};
use pepinstall::presenter::{ConsolePresenter, Presenter, UnattendedPresenter};
use pepinstall::registry::Manifest;
use pepinstall::resolver::{self, UninstallScript};
use pepinstall::session::{InstallSession, SessionController, run_uninstall};
use pepinstall::types::Platform;
use std::io;
use std::process::ExitCode;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

/// Initialize tracing on stderr; stdout belongs to the presenter.
fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .init();
}

fn main() -> ExitCode {
    let cli = Cli::parse_args();
    init_tracing(cli.verbose);
    info!("pepinstall {} starting", env!("CARGO_PKG_VERSION"));

    let cancel = CancelToken::new();
    let handler_token = cancel.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        warn!("Cancellation requested; stopping after the current operation");
        handler_token.cancel();
    }) {
        warn!("Failed to install the interrupt handler: {}", e);
    }
    debug!("Interrupt handler installed");

    match run(cli, cancel) {
        Ok(()) => ExitCode::from(EXIT_SUCCESS as u8),
        Err(e) => {
            let code = e.exit_code();
            error!("{}", e);
            eprintln!("✗ {}", e);
            if let Some(instructions) = e.cleanup_instructions() {
                eprintln!("{}", instructions);
            }
            ExitCode::from(u8::try_from(code).unwrap_or(1))
        }
    }
}

/// Pick the presenter for this session and hand it to `f`.
fn with_presenter<T>(unattended: bool, f: impl FnOnce(&mut dyn Presenter) -> Result<T>) -> Result<T> {
    if unattended {
        f(&mut UnattendedPresenter)
    } else {
        let stdin = io::stdin();
        let mut presenter = ConsolePresenter::new(stdin.lock(), io::stdout());
        f(&mut presenter)
    }
}

fn platform_or_host(platform: Option<Platform>) -> Result<Platform> {
    match platform {
        Some(platform) => Ok(platform),
        None => Platform::current(),
    }
}

fn run(cli: Cli, cancel: CancelToken) -> Result<()> {
    let config = match &cli.config {
        Some(path) => {
            info!("Loading engine configuration from {}", path.display());
            EngineConfig::load(path)?
        }
        None => EngineConfig::default(),
    };

    match cli.command {
        Commands::Install {
            target,
            offline,
            unattended,
            components,
            manifest,
            platform,
            desktop_shortcut,
            launch,
        } => {
            let manifest = Manifest::load(&manifest)?;
            let session = InstallSession {
                target,
                components,
                platform: platform_or_host(platform)?,
                offline,
                unattended,
                desktop_shortcut,
                launch,
            };
            let mut controller = SessionController::new(&manifest, &config, cancel);
            let outcome = with_presenter(session.is_unattended(), |presenter| {
                controller.run_install(&session, presenter)
            })?;
            println!(
                "✓ Installed {} into {} ({} operation(s))",
                manifest.product_name(),
                outcome.report.target.display(),
                outcome.report.applied
            );
        }
        Commands::Uninstall {
            target,
            script,
            unattended,
        } => {
            let (raw_target, unattended) = match (target, script) {
                (Some(target), _) => (target, unattended),
                (None, Some(path)) => {
                    let script = UninstallScript::load(&path)?;
                    info!("Uninstalling as requested by {}", path.display());
                    (
                        script.target.to_string_lossy().into_owned(),
                        unattended || script.unattended,
                    )
                }
                (None, None) => {
                    return Err(InstallError::config("uninstall needs --target or --script"));
                }
            };
            let platform = Platform::current()?;
            let report = with_presenter(unattended, |presenter| {
                run_uninstall(&raw_target, platform, &config, cancel, presenter)
            })?;
            println!(
                "✓ Removed {} operation(s) from {}",
                report.reverted,
                report.target.display()
            );
        }
        Commands::Plan {
            target,
            components,
            offline,
            manifest,
            platform,
            desktop_shortcut,
        } => {
            let manifest = Manifest::load(&manifest)?;
            let platform = platform_or_host(platform)?;
            let target = resolver::normalize(&target, platform)?;
            let components = components.unwrap_or_else(|| manifest.default_selection(platform));
            let controller = SessionController::new(&manifest, &config, cancel);
            let plan = controller.plan(&target, &components, platform, offline, desktop_shortcut)?;
            println!("{}", plan);
        }
        Commands::Validate { manifest: path } => {
            info!("Validating manifest {}", path.display());
            let manifest = Manifest::load(&path)?;
            println!(
                "✓ Manifest is valid: {} ({} component(s), {} prerequisite(s))",
                manifest.name,
                manifest.components.len(),
                manifest.prerequisites.len()
            );
        }
    }

    Ok(())
}
