//! Package Registry
//!
//! The manifest is the static description of what can be installed: the
//! components, their payload directories, which platforms they apply to, the
//! prerequisite runtimes they need, and the extra operation templates they
//! declare. It is loaded once, validated, and never mutated afterwards.
//!
//! # Manifest Format
//!
//! ```json
//! {
//!   "name": "Pep9Term",
//!   "maintenance_tool_name": "Pep9-Updater",
//!   "prerequisites": [{
//!     "id": "msvc-runtime",
//!     "display_name": "MSVC runtime",
//!     "platforms": ["windows"],
//!     "probe": { "kind": "command", "program": "reg", "args": ["QUERY", "HKLM\\..."] },
//!     "install": { "program": "@TargetDir@/vc_redist.x64.exe", "args": ["/quiet"] }
//!   }],
//!   "components": [{
//!     "id": "pep9term",
//!     "display_name": "Pep/9 Terminal",
//!     "platforms": ["windows", "macos", "linux"],
//!     "payload": "packages/pep9term/data",
//!     "requires": ["msvc-runtime"]
//!   }]
//! }
//! ```
//!
//! Payload and license paths are relative to the manifest's directory.

use crate::error::{InstallError, Result};
use crate::types::Platform;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::fs;
use std::path::{Component as PathComponent, Path, PathBuf};
use tracing::debug;

/// A program invocation whose program and arguments may contain placeholders
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandTemplate {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

/// How to tell whether a prerequisite is already present
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProbeSpec {
    /// Present if the command exits successfully (e.g. a registry query)
    Command {
        program: String,
        #[serde(default)]
        args: Vec<String>,
    },
    /// Present if the path exists
    PathExists { path: String },
}

/// A runtime that must be on the machine before components that need it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Prerequisite {
    pub id: String,
    pub display_name: String,
    pub platforms: BTreeSet<Platform>,
    pub probe: ProbeSpec,
    pub install: CommandTemplate,
}

/// The operation kinds a component may declare in its manifest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TemplateKind {
    CreateShortcut {
        target: String,
        link: String,
        #[serde(default)]
        working_dir: Option<String>,
    },
    /// `file` is relative to `@ApplicationsDir@` unless it expands to an absolute path
    CreateDesktopEntry { file: String, contents: String },
    RunExecutable {
        program: String,
        #[serde(default)]
        args: Vec<String>,
        /// Run on rollback and uninstall
        #[serde(default)]
        undo: Option<CommandTemplate>,
    },
}

/// An operation template, optionally restricted to some platforms
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationTemplate {
    #[serde(flatten)]
    pub kind: TemplateKind,
    #[serde(default)]
    pub platforms: Option<BTreeSet<Platform>>,
}

impl OperationTemplate {
    pub fn applies_to(&self, platform: Platform) -> bool {
        self.platforms
            .as_ref()
            .is_none_or(|platforms| platforms.contains(&platform))
    }
}

/// One installable component
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Component {
    pub id: String,
    pub display_name: String,
    pub platforms: BTreeSet<Platform>,
    /// Payload directory, relative to the manifest
    #[serde(default)]
    pub payload: Option<PathBuf>,
    /// Prerequisite ids
    #[serde(default)]
    pub requires: Vec<String>,
    /// Selected when the user does not choose explicitly
    #[serde(default = "default_true")]
    pub default: bool,
    #[serde(default)]
    pub operations: Vec<OperationTemplate>,
}

fn default_true() -> bool {
    true
}

impl Component {
    pub fn applies_to(&self, platform: Platform) -> bool {
        self.platforms.contains(&platform)
    }
}

/// The full manifest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    /// Display name (`@Name@`)
    pub name: String,
    /// Executable base name (`@ProductName@`), defaults to `name`
    #[serde(default)]
    pub product_name: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    /// Maintenance tool / uninstaller base name, e.g. `Pep9-Updater`
    pub maintenance_tool_name: String,
    /// License text shown on the license page
    #[serde(default)]
    pub license: Option<PathBuf>,
    #[serde(default)]
    pub prerequisites: Vec<Prerequisite>,
    pub components: Vec<Component>,

    /// Directory the manifest was loaded from
    #[serde(skip)]
    base_dir: PathBuf,
}

impl Manifest {
    /// Load and validate a manifest file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            InstallError::manifest(format!("failed to read {}: {}", path.display(), e))
        })?;
        let base_dir = path.parent().map(Path::to_path_buf).unwrap_or_default();
        let manifest = Self::from_json(&content, base_dir)?;
        debug!(
            "Loaded manifest {} with {} component(s)",
            path.display(),
            manifest.components.len()
        );
        Ok(manifest)
    }

    /// Parse and validate manifest JSON whose relative paths resolve against `base_dir`.
    pub fn from_json(content: &str, base_dir: impl Into<PathBuf>) -> Result<Self> {
        let mut manifest: Self = serde_json::from_str(content)
            .map_err(|e| InstallError::manifest(format!("invalid manifest JSON: {}", e)))?;
        manifest.base_dir = base_dir.into();
        manifest.validate()?;
        Ok(manifest)
    }

    /// Validate internal consistency.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(InstallError::manifest("name must not be empty"));
        }

        let tool = self.maintenance_tool_name.trim();
        if tool.is_empty() || tool.contains(['/', '\\']) {
            return Err(InstallError::manifest(
                "maintenance_tool_name must be a plain file name",
            ));
        }

        if self.components.is_empty() {
            return Err(InstallError::manifest("at least one component is required"));
        }

        let mut prerequisite_ids = HashSet::new();
        for prerequisite in &self.prerequisites {
            if prerequisite.id.trim().is_empty() {
                return Err(InstallError::manifest("prerequisite id must not be empty"));
            }
            if !prerequisite_ids.insert(prerequisite.id.as_str()) {
                return Err(InstallError::manifest(format!(
                    "duplicate prerequisite id '{}'",
                    prerequisite.id
                )));
            }
        }

        let mut component_ids = HashSet::new();
        for component in &self.components {
            if component.id.trim().is_empty() {
                return Err(InstallError::manifest("component id must not be empty"));
            }
            if component.id.contains(',') {
                return Err(InstallError::manifest(format!(
                    "component id '{}' must not contain ','",
                    component.id
                )));
            }
            if !component_ids.insert(component.id.as_str()) {
                return Err(InstallError::manifest(format!(
                    "duplicate component id '{}'",
                    component.id
                )));
            }
            if component.platforms.is_empty() {
                return Err(InstallError::manifest(format!(
                    "component '{}' applies to no platform",
                    component.id
                )));
            }
            for required in &component.requires {
                if !prerequisite_ids.contains(required.as_str()) {
                    return Err(InstallError::manifest(format!(
                        "component '{}' requires unknown prerequisite '{}'",
                        component.id, required
                    )));
                }
            }
            if let Some(payload) = &component.payload {
                validate_relative(payload).map_err(|reason| {
                    InstallError::manifest(format!(
                        "component '{}' payload {:?}: {}",
                        component.id, payload, reason
                    ))
                })?;
            }
        }

        if let Some(license) = &self.license {
            validate_relative(license)
                .map_err(|reason| InstallError::manifest(format!("license {:?}: {}", license, reason)))?;
        }

        Ok(())
    }

    /// `@ProductName@`
    pub fn product_name(&self) -> &str {
        self.product_name.as_deref().unwrap_or(&self.name)
    }

    pub fn component(&self, id: &str) -> Option<&Component> {
        self.components.iter().find(|c| c.id == id)
    }

    pub fn prerequisite(&self, id: &str) -> Option<&Prerequisite> {
        self.prerequisites.iter().find(|p| p.id == id)
    }

    /// Components available on `platform`, in manifest order.
    pub fn available(&self, platform: Platform) -> Vec<&Component> {
        self.components
            .iter()
            .filter(|c| c.applies_to(platform))
            .collect()
    }

    /// Ids of components selected by default on `platform`.
    pub fn default_selection(&self, platform: Platform) -> Vec<String> {
        self.available(platform)
            .into_iter()
            .filter(|c| c.default)
            .map(|c| c.id.clone())
            .collect()
    }

    /// Resolve selected ids into components, in manifest order.
    ///
    /// Components that do not apply to `platform` are dropped; duplicates are
    /// ignored.
    ///
    /// # Errors
    ///
    /// `UnknownComponent` for an id that is not in the manifest.
    pub fn select(&self, ids: &[String], platform: Platform) -> Result<Vec<&Component>> {
        for id in ids {
            if self.component(id).is_none() {
                return Err(InstallError::UnknownComponent(id.clone()));
            }
        }
        Ok(self
            .components
            .iter()
            .filter(|c| ids.iter().any(|id| id == &c.id))
            .filter(|c| c.applies_to(platform))
            .collect())
    }

    /// Prerequisites needed by `components` on `platform`, deduplicated, in manifest order.
    pub fn required_prerequisites(
        &self,
        components: &[&Component],
        platform: Platform,
    ) -> Vec<&Prerequisite> {
        self.prerequisites
            .iter()
            .filter(|p| p.platforms.contains(&platform))
            .filter(|p| components.iter().any(|c| c.requires.contains(&p.id)))
            .collect()
    }

    /// Absolute payload directory of `component`, if it has one.
    pub fn payload_dir(&self, component: &Component) -> Option<PathBuf> {
        component.payload.as_ref().map(|p| self.base_dir.join(p))
    }

    /// License text, if the manifest names one.
    pub fn license_text(&self) -> Result<Option<String>> {
        match &self.license {
            Some(path) => {
                let path = self.base_dir.join(path);
                let text = fs::read_to_string(&path).map_err(|e| {
                    InstallError::manifest(format!("failed to read license {}: {}", path.display(), e))
                })?;
                Ok(Some(text))
            }
            None => Ok(None),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }
}

/// Reject absolute paths and paths that climb out of the manifest directory.
fn validate_relative(path: &Path) -> std::result::Result<(), &'static str> {
    if path.as_os_str().is_empty() {
        return Err("path is empty");
    }
    for component in path.components() {
        match component {
            PathComponent::Normal(_) | PathComponent::CurDir => {}
            PathComponent::ParentDir => return Err("must not contain '..'"),
            PathComponent::RootDir | PathComponent::Prefix(_) => {
                return Err("must be relative to the manifest");
            }
        }
    }
    Ok(())
}
