//! Target Resolver
//!
//! Turns the requested install location into a normalized, writable target,
//! or detects that a previous install lives there.
//!
//! A previous install is recognized by its sentinel: the maintenance tool
//! (`Pep9-Updater.exe` on Windows, `Pep9-Updater` elsewhere) sitting in the
//! target. Such a target is never installed over. Instead the existing
//! maintenance tool is run as an uninstaller, driven by a generated uninstall
//! script, and the session ends asking the user to run the installer again.

use crate::cancel::CancelToken;
use crate::engine::oplog;
use crate::error::{InstallError, Result};
use crate::process::{CommandSpec, run_command};
use crate::types::Platform;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Uninstall script written into the target before redirecting
pub const UNINSTALL_SCRIPT_NAME: &str = "uninstall-script.json";

/// Characters Windows refuses in file names
const WINDOWS_RESERVED: &[char] = &['<', '>', ':', '"', '|', '?', '*'];

/// A target that passed every check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedTarget {
    pub path: PathBuf,
    /// The directory already existed before this session
    pub existed: bool,
}

/// Outcome of resolving a target
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Free to install here
    Ready(ResolvedTarget),
    /// A previous install is present; `uninstaller` is its maintenance tool
    ExistingInstall { target: PathBuf, uninstaller: PathBuf },
}

/// Instructions handed to the maintenance tool of a previous install
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UninstallScript {
    pub target: PathBuf,
    #[serde(default = "default_unattended")]
    pub unattended: bool,
}

fn default_unattended() -> bool {
    true
}

impl UninstallScript {
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}

/// Where the maintenance tool of an install into `target` lives.
pub fn sentinel_path(target: &Path, platform: Platform, maintenance_tool_name: &str) -> PathBuf {
    target.join(platform.executable_name(maintenance_tool_name))
}

/// Validate and normalize a user-supplied path.
///
/// Relative paths are made absolute against the current directory; `.` and
/// `..` are folded lexically.
pub fn normalize(raw: &str, platform: Platform) -> Result<PathBuf> {
    if raw.trim().is_empty() {
        return Err(InstallError::path_invalid(raw, "path is empty"));
    }
    if raw.contains('\0') {
        return Err(InstallError::path_invalid(raw, "path contains a NUL byte"));
    }

    let path = Path::new(raw);
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()?.join(path)
    };

    let mut normalized = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            Component::Normal(name) => {
                if platform == Platform::Windows
                    && name.to_string_lossy().contains(WINDOWS_RESERVED)
                {
                    return Err(InstallError::path_invalid(
                        raw,
                        "contains a character Windows does not allow in file names",
                    ));
                }
                normalized.push(name);
            }
            other => normalized.push(other.as_os_str()),
        }
    }
    Ok(normalized)
}

/// Resolve `raw` into an install target.
///
/// # Errors
///
/// - `PathInvalid` for an empty or malformed path
/// - `SessionAlreadyActive` if an operation log exists without a sentinel
/// - `PathConflict` if the target (or its nearest existing ancestor) is not a
///   writable directory
pub fn resolve(raw: &str, platform: Platform, maintenance_tool_name: &str) -> Result<Resolution> {
    let path = normalize(raw, platform)?;
    debug!("Resolving target {}", path.display());

    let sentinel = sentinel_path(&path, platform, maintenance_tool_name);
    if sentinel.is_file() {
        info!("Existing installation detected at {}", path.display());
        return Ok(Resolution::ExistingInstall {
            target: path,
            uninstaller: sentinel,
        });
    }

    if oplog::log_path(&path).exists() {
        return Err(InstallError::SessionAlreadyActive { target: path });
    }

    let existed = path.exists();
    if existed {
        ensure_writable_dir(&path, &path)?;
    } else {
        let ancestor = path
            .ancestors()
            .skip(1)
            .find(|p| p.exists())
            .ok_or_else(|| InstallError::path_conflict(&path, "no existing parent directory"))?;
        ensure_writable_dir(ancestor, &path)?;
    }

    Ok(Resolution::Ready(ResolvedTarget { path, existed }))
}

fn ensure_writable_dir(dir: &Path, target: &Path) -> Result<()> {
    if !dir.is_dir() {
        return Err(InstallError::path_conflict(
            target,
            format!("{} is not a directory", dir.display()),
        ));
    }
    tempfile::Builder::new()
        .prefix(".pepinstall-probe")
        .tempfile_in(dir)
        .map(drop)
        .map_err(|e| {
            InstallError::path_conflict(target, format!("{} is not writable: {}", dir.display(), e))
        })
}

/// Run the maintenance tool of a previous install as an unattended uninstaller.
///
/// Writes `<target>/uninstall-script.json`, runs
/// `<uninstaller> uninstall --script=<script>` and waits for it. The tool
/// deletes the script when it succeeds; it is removed here otherwise.
///
/// # Errors
///
/// `PathConflict` if the uninstaller could not be run or reported failure.
pub fn run_existing_uninstaller(
    target: &Path,
    uninstaller: &Path,
    timeout: Duration,
    cancel: &CancelToken,
) -> Result<()> {
    let script_path = target.join(UNINSTALL_SCRIPT_NAME);
    UninstallScript {
        target: target.to_path_buf(),
        unattended: true,
    }
    .save(&script_path)?;

    let spec = CommandSpec::new(uninstaller.to_string_lossy())
        .arg("uninstall")
        .arg(format!("--script={}", script_path.display()));
    info!("Running existing uninstaller: {}", spec);

    let result = run_command(&spec, timeout, Some(cancel))
        .and_then(|output| output.ensure_success("existing uninstaller"));

    if script_path.exists() {
        if let Err(e) = fs::remove_file(&script_path) {
            warn!("Failed to remove {}: {}", script_path.display(), e);
        }
    }

    result.map_err(|e| InstallError::path_conflict(target, format!("{:#}", e)))
}
