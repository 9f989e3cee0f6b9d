//! Per-user integration directories
//!
//! Resolves where shortcuts, desktop entries and application links land on
//! each platform. Detection uses the `dirs` crate; every directory can be
//! overridden from the engine configuration (tests point them into a temp dir).

use crate::error::{InstallError, Result};
use crate::types::Platform;
use std::path::PathBuf;

/// Directories outside the target that the planner may write into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallDirs {
    /// Start-menu folder for this product (`@StartMenuDir@`)
    pub start_menu_dir: PathBuf,
    /// The user's desktop (`@DesktopDir@`)
    pub desktop_dir: PathBuf,
    /// Where application launchers are registered (`@ApplicationsDir@`)
    pub applications_dir: PathBuf,
    /// The user's home directory (`@HomeDir@`)
    pub home_dir: PathBuf,
}

impl InstallDirs {
    /// Detect the platform defaults for the current user.
    ///
    /// `product` names the start-menu folder, as the Qt installer did.
    ///
    /// # Errors
    ///
    /// `Config` if the home directory cannot be determined.
    pub fn detect(platform: Platform, product: &str) -> Result<Self> {
        let home_dir = dirs::home_dir()
            .ok_or_else(|| InstallError::config("cannot determine the user's home directory"))?;
        let desktop_dir = dirs::desktop_dir().unwrap_or_else(|| home_dir.join("Desktop"));
        let data_dir = dirs::data_dir().unwrap_or_else(|| home_dir.join(".local").join("share"));

        Ok(Self::for_platform(platform, product, home_dir, desktop_dir, data_dir))
    }

    /// Lay out the per-platform directories from already-known base paths.
    pub fn for_platform(
        platform: Platform,
        product: &str,
        home_dir: PathBuf,
        desktop_dir: PathBuf,
        data_dir: PathBuf,
    ) -> Self {
        match platform {
            Platform::Windows => {
                // dirs::data_dir() is %APPDATA% (Roaming) on Windows
                let programs = data_dir
                    .join("Microsoft")
                    .join("Windows")
                    .join("Start Menu")
                    .join("Programs");
                Self {
                    start_menu_dir: programs.join(product),
                    applications_dir: programs,
                    desktop_dir,
                    home_dir,
                }
            }
            Platform::MacOs => {
                let applications = home_dir.join("Applications");
                Self {
                    start_menu_dir: applications.clone(),
                    applications_dir: applications,
                    desktop_dir,
                    home_dir,
                }
            }
            Platform::Linux => {
                let applications = data_dir.join("applications");
                Self {
                    start_menu_dir: applications.clone(),
                    applications_dir: applications,
                    desktop_dir,
                    home_dir,
                }
            }
        }
    }
}
