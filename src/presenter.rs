//! Presentation callback contract
//!
//! The session controller never renders anything itself. For every wizard
//! page it sends a typed request to a [`Presenter`] and gets back
//! [`PageResponse::Next`] with the page's value, or [`PageResponse::Cancel`].
//! Every request carries the defaults that [`UnattendedPresenter`] answers
//! with, so batch mode is just "accept every default".
//!
//! [`ConsolePresenter`] is a line-oriented implementation over any
//! `BufRead`/`Write` pair; the binary wires it to stdin/stdout.

use crate::engine::Progress;
use crate::error::Result;
use std::io::{BufRead, Write};
use std::path::PathBuf;
use tracing::info;

/// Answer to one wizard page
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageResponse<T> {
    Next(T),
    Cancel,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntroductionRequest {
    pub product: String,
    pub version: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LicenseRequest {
    pub product: String,
    pub text: Option<String>,
    pub default_accept: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetDirectoryRequest {
    pub default_target: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExistingInstallRequest {
    pub target: PathBuf,
    pub uninstaller: PathBuf,
    /// Run the existing uninstaller
    pub default_remove: bool,
}

/// One entry on the component page
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComponentChoice {
    pub id: String,
    pub display_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComponentSelectionRequest {
    pub available: Vec<ComponentChoice>,
    pub default_selection: Vec<String>,
    /// Whether this platform offers a desktop shortcut at all
    pub offer_desktop_shortcut: bool,
    pub default_desktop_shortcut: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComponentSelection {
    pub selected: Vec<String>,
    pub desktop_shortcut: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadyToInstallRequest {
    pub target: PathBuf,
    pub summary: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinishedRequest {
    pub product: String,
    pub run_program: PathBuf,
    pub default_launch: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UninstallRequest {
    pub product: String,
    pub target: PathBuf,
    pub default_confirm: bool,
}

/// The callback contract between the session controller and a UI
pub trait Presenter {
    fn introduction(&mut self, request: &IntroductionRequest) -> Result<PageResponse<()>>;

    /// `Next(true)` accepts the license
    fn license(&mut self, request: &LicenseRequest) -> Result<PageResponse<bool>>;

    /// `Next(path)` is the requested target, not yet validated
    fn target_directory(&mut self, request: &TargetDirectoryRequest) -> Result<PageResponse<String>>;

    /// `Next(true)` runs the existing uninstaller
    fn confirm_existing_uninstall(
        &mut self,
        request: &ExistingInstallRequest,
    ) -> Result<PageResponse<bool>>;

    fn component_selection(
        &mut self,
        request: &ComponentSelectionRequest,
    ) -> Result<PageResponse<ComponentSelection>>;

    fn ready_to_install(&mut self, request: &ReadyToInstallRequest) -> Result<PageResponse<()>>;

    /// `Next(true)` launches the installed product
    fn finished(&mut self, request: &FinishedRequest) -> Result<PageResponse<bool>>;

    /// `Next(true)` goes ahead with the uninstall
    fn confirm_uninstall(&mut self, request: &UninstallRequest) -> Result<PageResponse<bool>>;

    fn progress(&mut self, progress: &Progress);
}

// ============================================================================
// Unattended
// ============================================================================

/// Answers every page with its default
#[derive(Debug, Clone, Copy, Default)]
pub struct UnattendedPresenter;

impl Presenter for UnattendedPresenter {
    fn introduction(&mut self, _request: &IntroductionRequest) -> Result<PageResponse<()>> {
        Ok(PageResponse::Next(()))
    }

    fn license(&mut self, request: &LicenseRequest) -> Result<PageResponse<bool>> {
        Ok(PageResponse::Next(request.default_accept))
    }

    fn target_directory(&mut self, request: &TargetDirectoryRequest) -> Result<PageResponse<String>> {
        Ok(PageResponse::Next(
            request.default_target.to_string_lossy().into_owned(),
        ))
    }

    fn confirm_existing_uninstall(
        &mut self,
        request: &ExistingInstallRequest,
    ) -> Result<PageResponse<bool>> {
        Ok(PageResponse::Next(request.default_remove))
    }

    fn component_selection(
        &mut self,
        request: &ComponentSelectionRequest,
    ) -> Result<PageResponse<ComponentSelection>> {
        Ok(PageResponse::Next(ComponentSelection {
            selected: request.default_selection.clone(),
            desktop_shortcut: request.offer_desktop_shortcut && request.default_desktop_shortcut,
        }))
    }

    fn ready_to_install(&mut self, _request: &ReadyToInstallRequest) -> Result<PageResponse<()>> {
        Ok(PageResponse::Next(()))
    }

    fn finished(&mut self, request: &FinishedRequest) -> Result<PageResponse<bool>> {
        Ok(PageResponse::Next(request.default_launch))
    }

    fn confirm_uninstall(&mut self, request: &UninstallRequest) -> Result<PageResponse<bool>> {
        Ok(PageResponse::Next(request.default_confirm))
    }

    fn progress(&mut self, progress: &Progress) {
        info!(
            "[{:>3}%] {}/{} {}",
            progress.percent(),
            progress.completed,
            progress.total,
            progress.operation
        );
    }
}

// ============================================================================
// Console
// ============================================================================

/// Line-oriented prompts. An empty answer takes the default; `q` or end of
/// input cancels.
pub struct ConsolePresenter<R, W> {
    input: R,
    output: W,
}

impl<R: BufRead, W: Write> ConsolePresenter<R, W> {
    pub fn new(input: R, output: W) -> Self {
        Self { input, output }
    }

    pub fn into_output(self) -> W {
        self.output
    }

    /// Print `prompt` and read one trimmed line; `None` on EOF or `q`.
    fn ask(&mut self, prompt: &str) -> Result<Option<String>> {
        write!(self.output, "{}", prompt)?;
        self.output.flush()?;

        let mut line = String::new();
        if self.input.read_line(&mut line)? == 0 {
            return Ok(None);
        }
        let answer = line.trim();
        if answer.eq_ignore_ascii_case("q") {
            return Ok(None);
        }
        Ok(Some(answer.to_string()))
    }

    /// Yes/no question; `None` on cancel.
    fn ask_yes_no(&mut self, question: &str, default: bool) -> Result<Option<bool>> {
        let hint = if default { "[Y/n]" } else { "[y/N]" };
        loop {
            let Some(answer) = self.ask(&format!("{} {} ", question, hint))? else {
                return Ok(None);
            };
            match answer.to_ascii_lowercase().as_str() {
                "" => return Ok(Some(default)),
                "y" | "yes" => return Ok(Some(true)),
                "n" | "no" => return Ok(Some(false)),
                _ => writeln!(self.output, "Please answer y or n (q cancels).")?,
            }
        }
    }
}

fn respond<T>(answer: Option<T>) -> PageResponse<T> {
    match answer {
        Some(value) => PageResponse::Next(value),
        None => PageResponse::Cancel,
    }
}

impl<R: BufRead, W: Write> Presenter for ConsolePresenter<R, W> {
    fn introduction(&mut self, request: &IntroductionRequest) -> Result<PageResponse<()>> {
        match &request.version {
            Some(version) => writeln!(self.output, "Welcome to the {} {} setup.", request.product, version)?,
            None => writeln!(self.output, "Welcome to the {} setup.", request.product)?,
        }
        let answer = self.ask("Press Enter to continue (q to quit): ")?;
        Ok(respond(answer.map(|_| ())))
    }

    fn license(&mut self, request: &LicenseRequest) -> Result<PageResponse<bool>> {
        if let Some(text) = &request.text {
            writeln!(self.output, "{}", text.trim_end())?;
            writeln!(self.output)?;
        }
        let answer = self.ask_yes_no("Do you accept the license agreement?", request.default_accept)?;
        Ok(respond(answer))
    }

    fn target_directory(&mut self, request: &TargetDirectoryRequest) -> Result<PageResponse<String>> {
        let default = request.default_target.to_string_lossy().into_owned();
        let answer = self.ask(&format!("Installation folder [{}]: ", default))?;
        Ok(respond(answer.map(|a| if a.is_empty() { default } else { a })))
    }

    fn confirm_existing_uninstall(
        &mut self,
        request: &ExistingInstallRequest,
    ) -> Result<PageResponse<bool>> {
        writeln!(
            self.output,
            "A previous installation was found in {}.",
            request.target.display()
        )?;
        let answer = self.ask_yes_no(
            "Uninstall it now? The installer will exit afterwards.",
            request.default_remove,
        )?;
        Ok(respond(answer))
    }

    fn component_selection(
        &mut self,
        request: &ComponentSelectionRequest,
    ) -> Result<PageResponse<ComponentSelection>> {
        writeln!(self.output, "Available components:")?;
        for choice in &request.available {
            let mark = if request.default_selection.contains(&choice.id) { "x" } else { " " };
            writeln!(self.output, "  [{}] {:<16} {}", mark, choice.id, choice.display_name)?;
        }

        let defaults = request.default_selection.join(",");
        let Some(answer) = self.ask(&format!("Components to install [{}]: ", defaults))? else {
            return Ok(PageResponse::Cancel);
        };
        let selected = if answer.is_empty() {
            request.default_selection.clone()
        } else {
            split_ids(&answer)
        };

        let desktop_shortcut = if request.offer_desktop_shortcut {
            match self.ask_yes_no("Create a desktop shortcut?", request.default_desktop_shortcut)? {
                Some(choice) => choice,
                None => return Ok(PageResponse::Cancel),
            }
        } else {
            false
        };

        Ok(PageResponse::Next(ComponentSelection {
            selected,
            desktop_shortcut,
        }))
    }

    fn ready_to_install(&mut self, request: &ReadyToInstallRequest) -> Result<PageResponse<()>> {
        writeln!(self.output, "{}", request.summary)?;
        let answer = self.ask_yes_no(
            &format!("Install into {} now?", request.target.display()),
            true,
        )?;
        Ok(match answer {
            Some(true) => PageResponse::Next(()),
            Some(false) | None => PageResponse::Cancel,
        })
    }

    fn finished(&mut self, request: &FinishedRequest) -> Result<PageResponse<bool>> {
        writeln!(self.output, "{} has been installed.", request.product)?;
        let answer = self.ask_yes_no(
            &format!("Launch {} now?", request.product),
            request.default_launch,
        )?;
        // Cancelling the last page just means "don't launch"
        Ok(PageResponse::Next(answer.unwrap_or(false)))
    }

    fn confirm_uninstall(&mut self, request: &UninstallRequest) -> Result<PageResponse<bool>> {
        let answer = self.ask_yes_no(
            &format!(
                "Remove {} from {}?",
                request.product,
                request.target.display()
            ),
            request.default_confirm,
        )?;
        Ok(respond(answer))
    }

    fn progress(&mut self, progress: &Progress) {
        let _ = writeln!(
            self.output,
            "[{:>3}%] {}",
            progress.percent(),
            progress.operation
        );
    }
}

/// Split a comma-separated id list, dropping blanks and duplicates.
pub fn split_ids(list: &str) -> Vec<String> {
    let mut ids: Vec<String> = Vec::new();
    for id in list.split(',').map(str::trim).filter(|id| !id.is_empty()) {
        if !ids.iter().any(|seen| seen == id) {
            ids.push(id.to_string());
        }
    }
    ids
}
