//! Session Controller
//!
//! Drives the wizard state machine for one install (or uninstall) session.
//! Each page's entry action asks the [`Presenter`]; the answers feed the
//! target resolver, the planner and the executor.
//!
//! ```text
//! Introduction → LicenseAgreement → TargetDirectory → ComponentSelection
//!   → ReadyToInstall → PerformInstall → Finished
//!                          │
//!                          └─(previous install found)→ UninstallRedirect
//! ```
//!
//! Any error before `Finished` leaves the wizard in `Failed`. By then the
//! executor has already rolled back whatever it applied.

use crate::cancel::CancelToken;
use crate::config_file::EngineConfig;
use crate::engine::{
    Executor, InstallPlan, InstallReport, PlanRequest, UninstallReport, oplog, plan_install,
};
use crate::error::{InstallError, Result};
use crate::install_state::{WizardContext, WizardPage};
use crate::presenter::{
    ComponentChoice, ComponentSelectionRequest, ExistingInstallRequest, FinishedRequest,
    IntroductionRequest, LicenseRequest, PageResponse, Presenter, ReadyToInstallRequest,
    TargetDirectoryRequest, UninstallRequest,
};
use crate::process::{CommandSpec, spawn_detached};
use crate::registry::Manifest;
use crate::resolver::{self, Resolution};
use crate::types::{LauncherStrategy, Platform};
use crate::variables::{Variable, VariableMap};
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

/// What the user asked for on the command line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallSession {
    /// Requested target; the presenter is offered `@HomeDir@/@Name@` otherwise
    pub target: Option<String>,
    /// Requested components; the manifest defaults otherwise
    pub components: Option<Vec<String>>,
    pub platform: Platform,
    pub offline: bool,
    pub unattended: bool,
    pub desktop_shortcut: bool,
    pub launch: bool,
}

impl InstallSession {
    /// Offline installs never prompt.
    pub fn is_unattended(&self) -> bool {
        self.unattended || self.offline
    }
}

/// A completed install session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallOutcome {
    pub report: InstallReport,
    pub launched: bool,
}

/// Owns the wizard and the executor for one session.
pub struct SessionController<'a> {
    manifest: &'a Manifest,
    config: &'a EngineConfig,
    executor: Executor,
    wizard: WizardContext,
}

/// Turn a page response into its value, or `Cancelled`.
fn proceed<T>(response: PageResponse<T>) -> Result<T> {
    match response {
        PageResponse::Next(value) => Ok(value),
        PageResponse::Cancel => Err(InstallError::Cancelled),
    }
}

impl<'a> SessionController<'a> {
    pub fn new(manifest: &'a Manifest, config: &'a EngineConfig, cancel: CancelToken) -> Self {
        Self {
            manifest,
            config,
            executor: Executor::new(config, cancel),
            wizard: WizardContext::new(),
        }
    }

    pub fn wizard(&self) -> &WizardContext {
        &self.wizard
    }

    /// Run the whole install wizard.
    ///
    /// # Errors
    ///
    /// - `Cancelled` / `UserDeclined` when the presenter backs out
    /// - `ExistingInstallRemoved` after redirecting to a previous install's uninstaller
    /// - any resolver, planner or executor error
    pub fn run_install(
        &mut self,
        session: &InstallSession,
        presenter: &mut dyn Presenter,
    ) -> Result<InstallOutcome> {
        let result = self.drive(session, presenter);
        if let Err(e) = &result {
            let page = self.wizard.current_page();
            if !page.is_terminal() {
                error!("Session failed at {}: {}", page, e);
                if let Err(transition) = self.wizard.fail() {
                    warn!("{}", transition);
                }
            }
        }
        result
    }

    fn drive(
        &mut self,
        session: &InstallSession,
        presenter: &mut dyn Presenter,
    ) -> Result<InstallOutcome> {
        let platform = session.platform;
        let manifest = self.manifest;
        let product = manifest.product_name().to_string();
        let dirs = self.config.install_dirs(platform, &product)?;

        // Introduction
        proceed(presenter.introduction(&IntroductionRequest {
            product: product.clone(),
            version: manifest.version.clone(),
        })?)?;

        // License
        self.next_page()?;
        let accepted = proceed(presenter.license(&LicenseRequest {
            product: product.clone(),
            text: manifest.license_text()?,
            default_accept: true,
        })?)?;
        if !accepted {
            return Err(InstallError::UserDeclined {
                page: WizardPage::LicenseAgreement.to_string(),
            });
        }

        // Target
        self.next_page()?;
        let default_target = match &session.target {
            Some(raw) => PathBuf::from(raw),
            None => dirs.home_dir.join(&manifest.name),
        };
        let raw = proceed(presenter.target_directory(&TargetDirectoryRequest { default_target })?)?;
        let target = match resolver::resolve(&raw, platform, &manifest.maintenance_tool_name)? {
            Resolution::Ready(resolved) => resolved.path,
            Resolution::ExistingInstall {
                target,
                uninstaller,
            } => return Err(self.redirect(target, uninstaller, presenter)),
        };
        info!("Target directory: {}", target.display());

        // Components
        self.next_page()?;
        let offer_desktop_shortcut =
            platform.launcher_strategy() == LauncherStrategy::StartMenuShortcuts;
        let selection = proceed(presenter.component_selection(&ComponentSelectionRequest {
            available: manifest
                .available(platform)
                .into_iter()
                .map(|c| ComponentChoice {
                    id: c.id.clone(),
                    display_name: c.display_name.clone(),
                })
                .collect(),
            default_selection: session
                .components
                .clone()
                .unwrap_or_else(|| manifest.default_selection(platform)),
            offer_desktop_shortcut,
            default_desktop_shortcut: session.desktop_shortcut,
        })?)?;
        let selected = manifest.select(&selection.selected, platform)?;
        if selected.is_empty() {
            return Err(InstallError::manifest(format!(
                "no selected component applies to {}",
                platform
            )));
        }
        let desktop_shortcut = offer_desktop_shortcut && selection.desktop_shortcut;

        // Ready
        self.next_page()?;
        let summary = ready_summary(
            &product,
            &target,
            &selected.iter().map(|c| c.display_name.as_str()).collect::<Vec<_>>(),
            platform,
            desktop_shortcut,
        );
        proceed(presenter.ready_to_install(&ReadyToInstallRequest {
            target: target.clone(),
            summary,
        })?)?;
        self.wizard.confirm_install();

        // Install
        self.next_page()?;
        let plan = self.plan(
            &target,
            &selection.selected,
            platform,
            session.offline,
            desktop_shortcut,
        )?;
        let report = self
            .executor
            .install(manifest, &plan, &mut |progress| presenter.progress(progress))?;

        // Finished
        self.wizard.advance()?;
        let vars = VariableMap::for_session(manifest, platform, &target, &dirs)?;
        let run_program = PathBuf::from(vars.get(Variable::RunProgram).unwrap_or_default());
        let launch = match presenter.finished(&FinishedRequest {
            product,
            run_program: run_program.clone(),
            default_launch: session.launch,
        })? {
            PageResponse::Next(launch) => launch,
            PageResponse::Cancel => false,
        };

        let launched = launch && launch_product(&run_program);
        Ok(InstallOutcome { report, launched })
    }

    /// Advance the wizard unless a cancellation arrived while the page was up.
    fn next_page(&mut self) -> Result<()> {
        if self.executor.cancel_token().is_cancelled() {
            return Err(InstallError::Cancelled);
        }
        self.wizard.advance()?;
        Ok(())
    }

    /// Hand over to the maintenance tool of a previous install.
    ///
    /// Always ends the session with an error: declined, or `ExistingInstallRemoved`.
    fn redirect(
        &mut self,
        target: PathBuf,
        uninstaller: PathBuf,
        presenter: &mut dyn Presenter,
    ) -> InstallError {
        let confirmed = presenter.confirm_existing_uninstall(&ExistingInstallRequest {
            target: target.clone(),
            uninstaller: uninstaller.clone(),
            default_remove: true,
        });
        match confirmed.and_then(proceed) {
            Ok(true) => {}
            Ok(false) => {
                return InstallError::UserDeclined {
                    page: WizardPage::TargetDirectory.to_string(),
                };
            }
            Err(e) => return e,
        }

        if let Err(e) = self.wizard.redirect() {
            return e.into();
        }
        info!("Removing the previous installation in {}", target.display());
        match resolver::run_existing_uninstaller(
            &target,
            &uninstaller,
            self.config.process_timeout(),
            self.executor.cancel_token(),
        ) {
            Ok(()) => InstallError::ExistingInstallRemoved { target },
            Err(e) => e,
        }
    }

    /// Probe prerequisites and plan an install without applying it.
    pub fn plan(
        &self,
        target: &Path,
        components: &[String],
        platform: Platform,
        offline: bool,
        desktop_shortcut: bool,
    ) -> Result<InstallPlan> {
        let dirs = self
            .config
            .install_dirs(platform, self.manifest.product_name())?;
        let selected = self.manifest.select(components, platform)?;
        let vars = VariableMap::for_session(self.manifest, platform, target, &dirs)?;
        let prerequisites = self.manifest.required_prerequisites(&selected, platform);
        let probes = self.executor.probe_prerequisites(&prerequisites, &vars);
        let tool_source = self.config.maintenance_tool_source();

        plan_install(&PlanRequest {
            manifest: self.manifest,
            platform,
            target,
            components,
            offline,
            desktop_shortcut,
            dirs: &dirs,
            maintenance_tool_source: tool_source.as_deref(),
            probes: &probes,
        })
    }
}

fn ready_summary(
    product: &str,
    target: &Path,
    components: &[&str],
    platform: Platform,
    desktop_shortcut: bool,
) -> String {
    let mut lines = vec![
        format!("Ready to install {}.", product),
        format!("  Target:     {}", target.display()),
        format!("  Components: {}", components.join(", ")),
        format!("  Launcher:   {}", platform.launcher_strategy()),
    ];
    if desktop_shortcut {
        lines.push("  Desktop shortcut: yes".to_string());
    }
    lines.join("\n")
}

/// Start the installed product. Failure to launch does not fail the session.
fn launch_product(run_program: &Path) -> bool {
    let spec = CommandSpec::new(run_program.to_string_lossy());
    match spawn_detached(&spec) {
        Ok(pid) => {
            info!("Launched {} (PID {})", run_program.display(), pid);
            true
        }
        Err(e) => {
            warn!("{:#}", e);
            false
        }
    }
}

/// Uninstall whatever the operation log under `raw_target` records.
///
/// The presenter is asked to confirm first (unattended: yes).
///
/// # Errors
///
/// - `PathConflict` if there is no install at the target
/// - `UserDeclined` / `Cancelled` if the presenter backs out
/// - `RollbackFailed` if some artifact could not be removed
pub fn run_uninstall(
    raw_target: &str,
    platform: Platform,
    config: &EngineConfig,
    cancel: CancelToken,
    presenter: &mut dyn Presenter,
) -> Result<UninstallReport> {
    let target = resolver::normalize(raw_target, platform)?;
    if !oplog::log_path(&target).is_file() {
        return Err(InstallError::path_conflict(
            &target,
            "no installation found (missing operation log)",
        ));
    }
    let state = oplog::InstalledState::load(&target)?;

    let confirmed = proceed(presenter.confirm_uninstall(&UninstallRequest {
        product: state.product.clone(),
        target: target.clone(),
        default_confirm: true,
    })?)?;
    if !confirmed {
        return Err(InstallError::UserDeclined {
            page: "uninstall confirmation".to_string(),
        });
    }

    let executor = Executor::new(config, cancel);
    executor.uninstall(&target, &mut |progress| presenter.progress(progress))
}
