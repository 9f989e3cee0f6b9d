//! Wizard State Machine
//!
//! This module is the authoritative source of truth for where a session is in
//! the install wizard. It enforces valid page transitions and makes it
//! impossible to skip a page programmatically.
//!
//! # Design Principles
//!
//! - **Single Source of Truth**: The `WizardContext` owns the current page
//! - **Validated Transitions**: Only forward transitions to the next page are allowed
//! - **No Global State**: State is owned by `WizardContext`, not global/static
//! - **Fail Fast**: Invalid transitions return errors immediately
//!
//! # Page Flow
//!
//! ```text
//! Introduction
//!     ↓
//! LicenseAgreement
//!     ↓
//! TargetDirectory ──→ UninstallRedirect (existing install found)
//!     ↓
//! ComponentSelection
//!     ↓
//! ReadyToInstall
//!     ↓
//! PerformInstall   (requires confirmation)
//!     ↓
//! Finished
//!
//! (Any non-terminal page can transition to Failed)
//! ```

use chrono::{DateTime, Utc};
use std::fmt;
use thiserror::Error;

/// Wizard pages in sequential order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum WizardPage {
    Introduction = 0,
    LicenseAgreement = 1,
    TargetDirectory = 2,
    ComponentSelection = 3,
    ReadyToInstall = 4,
    /// Applies the plan; entering it requires explicit confirmation
    PerformInstall = 5,
    /// Install completed (terminal)
    Finished = 6,
    /// An existing install was handed to its uninstaller (terminal)
    UninstallRedirect = 200,
    /// Session failed (terminal)
    Failed = 255,
}

impl WizardPage {
    #[inline]
    pub const fn order(self) -> u8 {
        self as u8
    }

    /// Returns true for Finished, UninstallRedirect and Failed
    #[inline]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::UninstallRedirect | Self::Failed)
    }

    /// Returns true if entering this page changes the machine
    #[inline]
    pub const fn requires_confirmation(self) -> bool {
        matches!(self, Self::PerformInstall)
    }

    /// Returns the next page in the sequence, or None at a terminal page
    pub const fn next(self) -> Option<Self> {
        match self {
            Self::Introduction => Some(Self::LicenseAgreement),
            Self::LicenseAgreement => Some(Self::TargetDirectory),
            Self::TargetDirectory => Some(Self::ComponentSelection),
            Self::ComponentSelection => Some(Self::ReadyToInstall),
            Self::ReadyToInstall => Some(Self::PerformInstall),
            Self::PerformInstall => Some(Self::Finished),
            Self::Finished | Self::UninstallRedirect | Self::Failed => None,
        }
    }

    pub const fn description(self) -> &'static str {
        match self {
            Self::Introduction => "Introduction",
            Self::LicenseAgreement => "License agreement",
            Self::TargetDirectory => "Installation folder",
            Self::ComponentSelection => "Select components",
            Self::ReadyToInstall => "Ready to install",
            Self::PerformInstall => "Installing",
            Self::Finished => "Finished",
            Self::UninstallRedirect => "Removing previous installation",
            Self::Failed => "Installation failed",
        }
    }

    /// Returns the linear pages in order (excluding the side/terminal states)
    pub const fn all_pages() -> &'static [Self] {
        &[
            Self::Introduction,
            Self::LicenseAgreement,
            Self::TargetDirectory,
            Self::ComponentSelection,
            Self::ReadyToInstall,
            Self::PerformInstall,
            Self::Finished,
        ]
    }
}

impl fmt::Display for WizardPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.description())
    }
}

/// Errors that can occur during page transitions
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InstallTransitionError {
    #[error("Cannot skip from {from} to {to} (must pass through intermediate pages)")]
    SkippedStage { from: WizardPage, to: WizardPage },

    #[error("Cannot go back from {from} to {to} (the wizard is forward-only)")]
    BackwardTransition { from: WizardPage, to: WizardPage },

    #[error("Cannot leave terminal page {from}")]
    FromTerminalState { from: WizardPage },

    #[error("{stage} requires explicit confirmation")]
    MissingConfirmation { stage: WizardPage },

    #[error("Already at {stage}")]
    AlreadyAtStage { stage: WizardPage },

    /// Redirect to the uninstaller is only possible from the target page
    #[error("Cannot redirect to the uninstaller from {from}")]
    RedirectNotAllowed { from: WizardPage },
}

/// Tracks the wizard's position for one session.
///
/// # Example
///
/// ```
/// use pepinstall::install_state::{WizardContext, WizardPage};
///
/// let mut ctx = WizardContext::new();
/// assert_eq!(ctx.current_page(), WizardPage::Introduction);
///
/// ctx.advance().unwrap();
/// assert_eq!(ctx.current_page(), WizardPage::LicenseAgreement);
///
/// // Cannot skip pages
/// assert!(ctx.transition_to(WizardPage::ReadyToInstall).is_err());
/// ```
#[derive(Debug, Clone)]
pub struct WizardContext {
    current: WizardPage,
    failed_at: Option<WizardPage>,
    /// Every page entered, with the time it was entered
    page_history: Vec<(WizardPage, DateTime<Utc>)>,
    install_confirmed: bool,
}

impl Default for WizardContext {
    fn default() -> Self {
        Self::new()
    }
}

impl WizardContext {
    pub fn new() -> Self {
        let mut ctx = Self {
            current: WizardPage::Introduction,
            failed_at: None,
            page_history: Vec::with_capacity(WizardPage::all_pages().len()),
            install_confirmed: false,
        };
        ctx.record(WizardPage::Introduction);
        ctx
    }

    #[inline]
    pub fn current_page(&self) -> WizardPage {
        self.current
    }

    #[inline]
    pub fn failed_at(&self) -> Option<WizardPage> {
        self.failed_at
    }

    #[inline]
    pub fn is_finished(&self) -> bool {
        self.current == WizardPage::Finished
    }

    #[inline]
    pub fn is_failed(&self) -> bool {
        self.current == WizardPage::Failed
    }

    pub fn page_history(&self) -> &[(WizardPage, DateTime<Utc>)] {
        &self.page_history
    }

    /// Confirm the install; required before entering `PerformInstall`.
    pub fn confirm_install(&mut self) {
        self.install_confirmed = true;
    }

    #[inline]
    pub fn is_install_confirmed(&self) -> bool {
        self.install_confirmed
    }

    /// Advance to the next page.
    ///
    /// # Errors
    ///
    /// - `FromTerminalState` at a terminal page
    /// - `MissingConfirmation` when entering `PerformInstall` unconfirmed
    pub fn advance(&mut self) -> Result<WizardPage, InstallTransitionError> {
        let Some(next) = self.current.next() else {
            return Err(InstallTransitionError::FromTerminalState { from: self.current });
        };
        self.enter(next)
    }

    /// Transition to `target`, which must be the next page.
    ///
    /// # Errors
    ///
    /// - `FromTerminalState` at a terminal page
    /// - `AlreadyAtStage` if `target` is the current page
    /// - `BackwardTransition` if `target` comes earlier
    /// - `SkippedStage` if `target` is not the immediate next page
    /// - `MissingConfirmation` when entering `PerformInstall` unconfirmed
    pub fn transition_to(&mut self, target: WizardPage) -> Result<WizardPage, InstallTransitionError> {
        if self.current.is_terminal() {
            return Err(InstallTransitionError::FromTerminalState { from: self.current });
        }
        if target == self.current {
            return Err(InstallTransitionError::AlreadyAtStage { stage: target });
        }
        if matches!(target, WizardPage::Failed | WizardPage::UninstallRedirect) {
            // Side exits go through fail() / redirect()
            return Err(InstallTransitionError::SkippedStage {
                from: self.current,
                to: target,
            });
        }
        if target.order() < self.current.order() {
            return Err(InstallTransitionError::BackwardTransition {
                from: self.current,
                to: target,
            });
        }
        if self.current.next() != Some(target) {
            return Err(InstallTransitionError::SkippedStage {
                from: self.current,
                to: target,
            });
        }
        self.enter(target)
    }

    /// Leave `TargetDirectory` for the uninstaller of an existing install.
    pub fn redirect(&mut self) -> Result<(), InstallTransitionError> {
        if self.current != WizardPage::TargetDirectory {
            return Err(InstallTransitionError::RedirectNotAllowed { from: self.current });
        }
        self.record(WizardPage::UninstallRedirect);
        self.current = WizardPage::UninstallRedirect;
        Ok(())
    }

    /// Mark the session as failed, remembering where.
    pub fn fail(&mut self) -> Result<(), InstallTransitionError> {
        if self.current.is_terminal() {
            return Err(InstallTransitionError::FromTerminalState { from: self.current });
        }
        self.failed_at = Some(self.current);
        self.record(WizardPage::Failed);
        self.current = WizardPage::Failed;
        Ok(())
    }

    fn enter(&mut self, page: WizardPage) -> Result<WizardPage, InstallTransitionError> {
        if page.requires_confirmation() && !self.install_confirmed {
            return Err(InstallTransitionError::MissingConfirmation { stage: page });
        }
        self.record(page);
        self.current = page;
        Ok(page)
    }

    fn record(&mut self, page: WizardPage) {
        self.page_history.push((page, Utc::now()));
    }
}

impl From<InstallTransitionError> for crate::error::InstallError {
    fn from(err: InstallTransitionError) -> Self {
        crate::error::InstallError::Transition(err.to_string())
    }
}
