//! pepinstall Library
//!
//! Installer and uninstaller engine for the Pep/9 tool suite: a package
//! registry, a deterministic operation planner, a transactional executor
//! with an operation log, and the wizard session that drives them.

pub mod cancel;
pub mod cli;
pub mod config_file;
pub mod engine;
pub mod error;
pub mod install_state;
pub mod lock;
pub mod platform;
pub mod presenter;
pub mod process;
pub mod registry;
pub mod resolver;
pub mod session;
pub mod types;
pub mod variables;

// Re-export main types for convenience
pub use cancel::CancelToken;
pub use config_file::EngineConfig;
pub use engine::{
    Executor, InstallPlan, InstallReport, Operation, Phase, PlanRequest, ProbeReport, Progress,
    UninstallReport, plan_install,
};
pub use error::{InstallError, Result, RollbackFailure};
pub use install_state::{InstallTransitionError, WizardContext, WizardPage};
pub use platform::InstallDirs;
pub use presenter::{ConsolePresenter, PageResponse, Presenter, UnattendedPresenter};
pub use process::{CommandOutput, CommandProcessGroup, CommandSpec, run_command};
pub use registry::{Component, Manifest, Prerequisite};
pub use resolver::{Resolution, UninstallScript};
pub use session::{InstallOutcome, InstallSession, SessionController, run_uninstall};
pub use types::{LauncherStrategy, Platform};
pub use variables::{Variable, VariableMap};
