//! Engine configuration file handling.
//!
//! The engine reads an optional JSON configuration (`--config`). Every field
//! has a default, so an empty object `{}` is a valid configuration.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::InstallError;
use crate::platform::InstallDirs;
use crate::types::Platform;

/// Upper bound on the payload copy worker pool
pub const MAX_WORKERS: usize = 64;

/// Engine configuration loaded from `--config`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Timeout for every external process (probes, prerequisite installers,
    /// the uninstaller of a previous installation)
    pub process_timeout_secs: u64,

    /// Worker threads for copying independent payload files
    pub workers: usize,

    // Integration directory overrides (platform defaults when unset)
    pub start_menu_dir: Option<PathBuf>,
    pub desktop_dir: Option<PathBuf>,
    pub applications_dir: Option<PathBuf>,
    pub home_dir: Option<PathBuf>,

    /// Binary copied into the target as the maintenance tool
    /// (defaults to the running executable)
    pub maintenance_tool_source: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            process_timeout_secs: 600,
            workers: 4,
            start_menu_dir: None,
            desktop_dir: None,
            applications_dir: None,
            home_dir: None,
            maintenance_tool_source: None,
        }
    }
}

impl EngineConfig {
    /// Load configuration from a JSON file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read configuration from {:?}", path.as_ref()))?;

        let config: Self =
            serde_json::from_str(&content).context("Failed to parse configuration JSON")?;

        Ok(config)
    }

    /// Load and validate, converting into the engine's error type.
    pub fn load(path: &Path) -> Result<Self, InstallError> {
        let config =
            Self::load_from_file(path).map_err(|e| InstallError::config(format!("{:#}", e)))?;
        config
            .validate()
            .map_err(|e| InstallError::config(e.to_string()))?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.process_timeout_secs == 0 {
            anyhow::bail!("process_timeout_secs must be greater than zero");
        }

        if self.workers == 0 || self.workers > MAX_WORKERS {
            anyhow::bail!("workers must be between 1 and {}", MAX_WORKERS);
        }

        for (name, dir) in [
            ("start_menu_dir", &self.start_menu_dir),
            ("desktop_dir", &self.desktop_dir),
            ("applications_dir", &self.applications_dir),
            ("home_dir", &self.home_dir),
        ] {
            if let Some(dir) = dir {
                if !dir.is_absolute() {
                    anyhow::bail!("{} must be an absolute path, got {:?}", name, dir);
                }
            }
        }

        Ok(())
    }

    /// Timeout applied to external processes
    pub fn process_timeout(&self) -> Duration {
        Duration::from_secs(self.process_timeout_secs)
    }

    /// Integration directories for `platform`, with overrides applied.
    ///
    /// Platform detection only runs when at least one directory is not overridden.
    pub fn install_dirs(&self, platform: Platform, product: &str) -> Result<InstallDirs, InstallError> {
        let fully_overridden = self.start_menu_dir.is_some()
            && self.desktop_dir.is_some()
            && self.applications_dir.is_some()
            && self.home_dir.is_some();

        let mut dirs = if fully_overridden {
            InstallDirs {
                start_menu_dir: PathBuf::new(),
                desktop_dir: PathBuf::new(),
                applications_dir: PathBuf::new(),
                home_dir: PathBuf::new(),
            }
        } else {
            InstallDirs::detect(platform, product)?
        };

        if let Some(dir) = &self.start_menu_dir {
            dirs.start_menu_dir = dir.clone();
        }
        if let Some(dir) = &self.desktop_dir {
            dirs.desktop_dir = dir.clone();
        }
        if let Some(dir) = &self.applications_dir {
            dirs.applications_dir = dir.clone();
        }
        if let Some(dir) = &self.home_dir {
            dirs.home_dir = dir.clone();
        }
        Ok(dirs)
    }

    /// Source binary for the maintenance tool, falling back to this executable.
    pub fn maintenance_tool_source(&self) -> Option<PathBuf> {
        self.maintenance_tool_source
            .clone()
            .or_else(|| std::env::current_exe().ok())
    }
}
