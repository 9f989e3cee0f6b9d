//! Type-safe platform and launcher types
//!
//! Platform strings arrive from the CLI, the manifest, and the original
//! installer vocabulary (`win`, `mac`, `x11`). They are parsed exactly once
//! into [`Platform`], and everything downstream matches on the enum.

use crate::error::InstallError;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString, IntoEnumIterator};

/// Target operating system family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[derive(Display, EnumString, EnumIter)]
#[serde(rename_all = "lowercase")]
#[strum(ascii_case_insensitive)]
pub enum Platform {
    #[serde(alias = "win")]
    #[strum(to_string = "windows", serialize = "win")]
    Windows,
    #[serde(alias = "mac")]
    #[strum(to_string = "macos", serialize = "mac", serialize = "osx")]
    MacOs,
    #[serde(alias = "x11")]
    #[strum(to_string = "linux", serialize = "x11")]
    Linux,
}

impl Platform {
    /// Parse a user-supplied platform name.
    ///
    /// # Errors
    ///
    /// `UnsupportedPlatform` for anything that is not one of the known names.
    pub fn parse(value: &str) -> Result<Self, InstallError> {
        value
            .trim()
            .parse()
            .map_err(|_| InstallError::UnsupportedPlatform(value.to_string()))
    }

    /// The platform this binary was compiled for.
    ///
    /// # Errors
    ///
    /// `UnsupportedPlatform` on hosts other than Windows, macOS and Linux.
    pub fn current() -> Result<Self, InstallError> {
        match std::env::consts::OS {
            "windows" => Ok(Self::Windows),
            "macos" => Ok(Self::MacOs),
            "linux" => Ok(Self::Linux),
            other => Err(InstallError::UnsupportedPlatform(other.to_string())),
        }
    }

    /// File name of an executable called `stem` on this platform.
    pub fn executable_name(self, stem: &str) -> String {
        match self {
            Self::Windows => format!("{}.exe", stem),
            Self::MacOs | Self::Linux => stem.to_string(),
        }
    }

    /// How installed products are surfaced to the user on this platform.
    pub const fn launcher_strategy(self) -> LauncherStrategy {
        match self {
            Self::Windows => LauncherStrategy::StartMenuShortcuts,
            Self::MacOs => LauncherStrategy::ApplicationLink,
            Self::Linux => LauncherStrategy::DesktopEntry,
        }
    }

    /// All supported platforms, in declaration order.
    pub fn all() -> Vec<Self> {
        Self::iter().collect()
    }
}

/// Per-platform strategy for making the installed product launchable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum LauncherStrategy {
    /// `.lnk` shortcuts in the start menu (plus an optional desktop shortcut)
    #[strum(serialize = "start-menu shortcuts")]
    StartMenuShortcuts,
    /// Freedesktop `.desktop` entry in the applications directory
    #[strum(serialize = "desktop entry")]
    DesktopEntry,
    /// Symlink to the application bundle in the Applications folder
    #[strum(serialize = "application link")]
    ApplicationLink,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_original_installer_names() {
        assert_eq!(Platform::parse("win").expect("win"), Platform::Windows);
        assert_eq!(Platform::parse("mac").expect("mac"), Platform::MacOs);
        assert_eq!(Platform::parse("x11").expect("x11"), Platform::Linux);
        assert_eq!(Platform::parse("Linux").expect("Linux"), Platform::Linux);
    }

    #[test]
    fn test_parse_unknown_platform_fails() {
        let err = Platform::parse("beos").unwrap_err();
        assert!(matches!(err, InstallError::UnsupportedPlatform(ref p) if p == "beos"));
    }

    #[test]
    fn test_display_is_canonical_name() {
        assert_eq!(Platform::Windows.to_string(), "windows");
        assert_eq!(Platform::MacOs.to_string(), "macos");
        assert_eq!(Platform::Linux.to_string(), "linux");
    }

    #[test]
    fn test_every_platform_has_a_launcher_strategy() {
        let strategies: Vec<_> = Platform::all()
            .into_iter()
            .map(Platform::launcher_strategy)
            .collect();
        assert_eq!(strategies.len(), 3);
        assert!(strategies.contains(&LauncherStrategy::StartMenuShortcuts));
        assert!(strategies.contains(&LauncherStrategy::DesktopEntry));
        assert!(strategies.contains(&LauncherStrategy::ApplicationLink));
    }

    #[test]
    fn test_executable_name() {
        assert_eq!(Platform::Windows.executable_name("Pep9-Updater"), "Pep9-Updater.exe");
        assert_eq!(Platform::Linux.executable_name("Pep9-Updater"), "Pep9-Updater");
    }

    #[test]
    fn test_serde_accepts_aliases() {
        let p: Platform = serde_json::from_str("\"win\"").expect("alias");
        assert_eq!(p, Platform::Windows);
        let json = serde_json::to_string(&Platform::MacOs).expect("serialize");
        assert_eq!(json, "\"macos\"");
    }
}
