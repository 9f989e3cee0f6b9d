//! Session variables and `@Placeholder@` substitution
//!
//! Manifest templates refer to session values as `@TargetDir@`, `@Name@`, and
//! so on. The set of placeholders is closed: each one is a [`Variable`], and a
//! template that names anything else, or a variable the session has not set,
//! fails at plan time with `UnresolvedPlaceholder`.

use crate::error::{InstallError, Result};
use crate::platform::InstallDirs;
use crate::registry::Manifest;
use crate::types::Platform;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use strum::{Display, EnumIter, EnumString};

/// A placeholder that may appear in a template
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Display, EnumString, EnumIter)]
pub enum Variable {
    TargetDir,
    ProductName,
    Name,
    MaintenanceToolName,
    BinaryName,
    RunProgram,
    StartMenuDir,
    DesktopDir,
    ApplicationsDir,
    HomeDir,
}

impl Variable {
    /// The placeholder as written in templates, e.g. `@TargetDir@`.
    pub fn placeholder(self) -> String {
        format!("@{}@", self)
    }
}

/// Typed mapping from [`Variable`] to its value for one session
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VariableMap {
    values: BTreeMap<Variable, String>,
}

impl VariableMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the full variable set for an install of `manifest` into `target`.
    ///
    /// `@RunProgram@` is itself expanded here, so templates may use it freely.
    pub fn for_session(
        manifest: &Manifest,
        platform: Platform,
        target: &Path,
        dirs: &InstallDirs,
    ) -> Result<Self> {
        let mut vars = Self::new();
        vars.insert_path(Variable::TargetDir, target);
        vars.insert(Variable::Name, &manifest.name);
        vars.insert(Variable::ProductName, manifest.product_name());
        vars.insert(Variable::BinaryName, manifest.product_name());
        vars.insert(Variable::MaintenanceToolName, &manifest.maintenance_tool_name);
        vars.insert_path(Variable::StartMenuDir, &dirs.start_menu_dir);
        vars.insert_path(Variable::DesktopDir, &dirs.desktop_dir);
        vars.insert_path(Variable::ApplicationsDir, &dirs.applications_dir);
        vars.insert_path(Variable::HomeDir, &dirs.home_dir);

        let run_program = vars.substitute(run_program_template(platform))?;
        vars.insert(Variable::RunProgram, run_program);
        Ok(vars)
    }

    pub fn insert(&mut self, var: Variable, value: impl Into<String>) {
        self.values.insert(var, value.into());
    }

    fn insert_path(&mut self, var: Variable, path: &Path) {
        self.insert(var, path.to_string_lossy().into_owned());
    }

    pub fn get(&self, var: Variable) -> Option<&str> {
        self.values.get(&var).map(String::as_str)
    }

    /// Replace every `@Variable@` in `template`.
    ///
    /// An `@` that does not open a well-formed `@Identifier@` pair is kept
    /// literally (so `user@example.org` passes through). Substituted values are
    /// not scanned again.
    ///
    /// # Errors
    ///
    /// `UnresolvedPlaceholder` for an unknown identifier or an unset variable.
    pub fn substitute(&self, template: &str) -> Result<String> {
        let mut out = String::with_capacity(template.len());
        let mut rest = template;

        while let Some(start) = rest.find('@') {
            out.push_str(&rest[..start]);
            let after = &rest[start + 1..];

            let Some(end) = after.find('@') else {
                out.push_str(&rest[start..]);
                return Ok(out);
            };

            let ident = &after[..end];
            if ident.is_empty() || !ident.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
                // Not a placeholder; keep this '@' and rescan from the next one
                out.push('@');
                rest = after;
                continue;
            }

            let value = ident
                .parse::<Variable>()
                .ok()
                .and_then(|var| self.get(var))
                .ok_or_else(|| InstallError::UnresolvedPlaceholder {
                    placeholder: ident.to_string(),
                    template: template.to_string(),
                })?;
            out.push_str(value);
            rest = &after[end + 1..];
        }

        out.push_str(rest);
        Ok(out)
    }

    /// [`substitute`](Self::substitute) for templates that name a path.
    pub fn substitute_path(&self, template: &str) -> Result<PathBuf> {
        self.substitute(template).map(PathBuf::from)
    }

    /// Substitute every element of `templates`.
    pub fn substitute_all(&self, templates: &[String]) -> Result<Vec<String>> {
        templates.iter().map(|t| self.substitute(t)).collect()
    }
}

/// Where the product's main executable lives inside the target.
fn run_program_template(platform: Platform) -> &'static str {
    match platform {
        Platform::Windows => "@TargetDir@/@ProductName@.exe",
        Platform::MacOs => "@TargetDir@/Contents/MacOS/@ProductName@",
        Platform::Linux => "@TargetDir@/@ProductName@",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> VariableMap {
        let mut vars = VariableMap::new();
        vars.insert(Variable::TargetDir, "/opt/pep9");
        vars.insert(Variable::ProductName, "Pep9Term");
        vars.insert(Variable::Name, "Pep9Term");
        vars
    }

    #[test]
    fn test_substitutes_known_variables() {
        let vars = sample();
        assert_eq!(
            vars.substitute("@TargetDir@/@ProductName@.exe").expect("resolves"),
            "/opt/pep9/Pep9Term.exe"
        );
    }

    #[test]
    fn test_unset_variable_fails_fast() {
        let vars = sample();
        let err = vars.substitute("@StartMenuDir@/@Name@.lnk").unwrap_err();
        assert!(matches!(
            err,
            InstallError::UnresolvedPlaceholder { ref placeholder, .. } if placeholder == "StartMenuDir"
        ));
    }

    #[test]
    fn test_unknown_placeholder_fails_fast() {
        let vars = sample();
        let err = vars.substitute("@Bogus@").unwrap_err();
        assert!(matches!(err, InstallError::UnresolvedPlaceholder { .. }));
    }

    #[test]
    fn test_lone_at_sign_is_literal() {
        let vars = sample();
        assert_eq!(
            vars.substitute("mail me@example.org").expect("no placeholder"),
            "mail me@example.org"
        );
        assert_eq!(
            vars.substitute("a @ b @TargetDir@").expect("resolves"),
            "a @ b /opt/pep9"
        );
    }

    #[test]
    fn test_values_are_not_rescanned() {
        let mut vars = sample();
        vars.insert(Variable::Name, "@TargetDir@");
        assert_eq!(vars.substitute("@Name@").expect("resolves"), "@TargetDir@");
    }

    #[test]
    fn test_placeholder_spelling() {
        assert_eq!(Variable::MaintenanceToolName.placeholder(), "@MaintenanceToolName@");
    }

    #[test]
    fn test_run_program_per_platform() {
        assert!(run_program_template(Platform::Windows).ends_with(".exe"));
        assert!(run_program_template(Platform::MacOs).contains("Contents/MacOS"));
        assert_eq!(run_program_template(Platform::Linux), "@TargetDir@/@ProductName@");
    }
}
