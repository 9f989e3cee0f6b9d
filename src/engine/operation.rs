//! Reversible operations
//!
//! An [`Operation`] is one action the installer performs on the machine. The
//! planner produces them; the executor applies them one at a time (payload
//! copies in parallel batches) and records the [`UndoData`] captured at apply
//! time, which is everything the inverse needs: the directories this
//! operation created, the artifact it wrote, where an overwritten file was
//! backed up, and the undo command for executables.
//!
//! # Atomicity
//!
//! - File writes go to a temp file in the destination directory and are
//!   renamed into place.
//! - If an apply fails, whatever it already did (backups, created parents) is
//!   undone before the error is returned. A failed operation leaves nothing.
//!
//! # Idempotence
//!
//! Creating a directory that exists is a no-op with empty undo data.
//! Re-applying a file write replaces the file and backs up the previous one.

use crate::process::{CommandSpec, ps_quote, run_command};
use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use strum::Display;
use tempfile::NamedTempFile;
use tracing::{debug, warn};

/// Ordering phases of a plan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Phase {
    Directories,
    Payload,
    Prerequisites,
    MaintenanceTool,
    Integration,
    PostInstall,
}

/// A single reversible action
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Operation {
    CreateDirectory {
        path: PathBuf,
    },
    CopyFile {
        source: PathBuf,
        destination: PathBuf,
    },
    /// Shell link (`.lnk`) on Windows hosts, launcher file elsewhere
    CreateShortcut {
        link: PathBuf,
        target: PathBuf,
        working_dir: Option<PathBuf>,
    },
    CreateDesktopEntry {
        path: PathBuf,
        contents: String,
    },
    /// Symlink `link` to `target` (application bundles)
    LinkApplication {
        link: PathBuf,
        target: PathBuf,
    },
    RunExecutable {
        command: CommandSpec,
        undo: Option<CommandSpec>,
    },
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CreateDirectory { path } => write!(f, "CreateDirectory({})", path.display()),
            Self::CopyFile {
                source,
                destination,
            } => write!(
                f,
                "CopyFile({} -> {})",
                source.display(),
                destination.display()
            ),
            Self::CreateShortcut { link, target, .. } => {
                write!(f, "CreateShortcut({} -> {})", link.display(), target.display())
            }
            Self::CreateDesktopEntry { path, .. } => {
                write!(f, "CreateDesktopEntry({})", path.display())
            }
            Self::LinkApplication { link, target } => {
                write!(f, "LinkApplication({} -> {})", link.display(), target.display())
            }
            Self::RunExecutable { command, .. } => write!(f, "RunExecutable({})", command),
        }
    }
}

impl Operation {
    /// The path this operation creates on disk, if any.
    pub fn artifact(&self) -> Option<&Path> {
        match self {
            Self::CreateDirectory { path } => Some(path),
            Self::CopyFile { destination, .. } => Some(destination),
            Self::CreateShortcut { link, .. } | Self::LinkApplication { link, .. } => Some(link),
            Self::CreateDesktopEntry { path, .. } => Some(path),
            Self::RunExecutable { .. } => None,
        }
    }

    /// Payload copies may run concurrently with each other.
    pub fn is_parallel_safe(&self) -> bool {
        matches!(self, Self::CopyFile { .. })
    }
}

/// Everything the inverse of an applied operation needs
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UndoData {
    /// Directories created by this operation, outermost first
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub created_dirs: Vec<PathBuf>,
    /// File or link written by this operation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_path: Option<PathBuf>,
    /// Where the file previously at `created_path` was moved
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup: Option<PathBuf>,
    /// Command that reverses a `RunExecutable`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<CommandSpec>,
}

impl UndoData {
    /// Paths from this undo data that still exist on disk, including an
    /// unrestored backup.
    pub fn remaining(&self) -> Vec<PathBuf> {
        self.created_path
            .iter()
            .chain(self.backup.iter())
            .chain(self.created_dirs.iter().rev())
            .filter(|p| p.symlink_metadata().is_ok())
            .cloned()
            .collect()
    }
}

/// Per-run settings the operations need while applying
#[derive(Debug, Clone)]
pub struct ApplyContext {
    /// Overwritten files are moved to `<backup_dir>/<seq>`
    pub backup_dir: PathBuf,
    pub process_timeout: Duration,
}

impl Operation {
    /// Apply this operation as sequence number `seq`.
    pub fn apply(&self, seq: u64, ctx: &ApplyContext) -> Result<UndoData> {
        debug!("Applying #{} {}", seq, self);
        match self {
            Self::CreateDirectory { path } => {
                if path.symlink_metadata().is_ok() && !path.is_dir() {
                    bail!("{} exists and is not a directory", path.display());
                }
                let created_dirs = create_dirs_tracked(path)?;
                Ok(UndoData {
                    created_dirs,
                    ..UndoData::default()
                })
            }
            Self::CopyFile {
                source,
                destination,
            } => write_file(destination, seq, ctx, |tmp| {
                let mut src = File::open(source)
                    .with_context(|| format!("Failed to open {}", source.display()))?;
                io::copy(&mut src, tmp)?;
                let permissions = src.metadata()?.permissions();
                tmp.as_file().set_permissions(permissions)?;
                Ok(())
            }),
            #[cfg(windows)]
            Self::CreateShortcut {
                link,
                target,
                working_dir,
            } => shell_link(link, target, working_dir.as_deref(), seq, ctx),
            #[cfg(not(windows))]
            Self::CreateShortcut {
                link,
                target,
                working_dir,
            } => {
                let contents = shortcut_contents(target, working_dir.as_deref());
                write_file(link, seq, ctx, |tmp| {
                    tmp.write_all(contents.as_bytes())?;
                    Ok(())
                })
            }
            Self::CreateDesktopEntry { path, contents } => write_file(path, seq, ctx, |tmp| {
                tmp.write_all(contents.as_bytes())?;
                Ok(())
            }),
            Self::LinkApplication { link, target } => link_application(link, target, seq, ctx),
            // Runs to completion or timeout; cancellation waits for the next operation
            Self::RunExecutable { command, undo } => {
                let output = run_command(command, ctx.process_timeout, None)?;
                output.ensure_success(&command.program)?;
                Ok(UndoData {
                    command: undo.clone(),
                    ..UndoData::default()
                })
            }
        }
    }

    /// Reverse an applied operation using its recorded undo data.
    ///
    /// Artifacts that are already gone and directories that still hold files
    /// the installer did not put there are logged and left alone.
    pub fn revert(&self, undo: &UndoData, process_timeout: Duration) -> Result<()> {
        debug!("Reverting {}", self);

        if let Some(command) = &undo.command {
            let output = run_command(command, process_timeout, None)?;
            output.ensure_success(&command.program)?;
        }

        if let Some(path) = &undo.created_path {
            match fs::remove_file(path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    warn!("{} is already gone", path.display());
                }
                Err(e) => {
                    return Err(e).with_context(|| format!("Failed to remove {}", path.display()));
                }
            }
            if let Some(backup) = &undo.backup {
                move_file(backup, path).with_context(|| {
                    format!("Failed to restore {} from {}", path.display(), backup.display())
                })?;
            }
        }

        remove_dirs_if_empty(&undo.created_dirs)
    }
}

/// INI-style launcher written for `CreateShortcut` on non-Windows hosts.
pub fn shortcut_contents(target: &Path, working_dir: Option<&Path>) -> String {
    let working_dir = working_dir.or_else(|| target.parent()).unwrap_or(Path::new(""));
    format!(
        "[Shortcut]\nTarget={}\nWorkingDirectory={}\n",
        target.display(),
        working_dir.display()
    )
}

/// PowerShell that saves a shell link at `link` through `WScript.Shell`.
pub fn shell_link_script(link: &Path, target: &Path, working_dir: Option<&Path>) -> String {
    let working_dir = working_dir.or_else(|| target.parent()).unwrap_or(Path::new(""));
    format!(
        "$WshShell = New-Object -ComObject WScript.Shell; \
         $Shortcut = $WshShell.CreateShortcut({}); \
         $Shortcut.TargetPath = {}; \
         $Shortcut.WorkingDirectory = {}; \
         $Shortcut.Save();",
        ps_quote(&link.to_string_lossy()),
        ps_quote(&target.to_string_lossy()),
        ps_quote(&working_dir.to_string_lossy())
    )
}

/// Create a `.lnk` under a staging name, then rename it over `link`.
#[cfg(windows)]
fn shell_link(
    link: &Path,
    target: &Path,
    working_dir: Option<&Path>,
    seq: u64,
    ctx: &ApplyContext,
) -> Result<UndoData> {
    let parent = link
        .parent()
        .with_context(|| format!("{} has no parent directory", link.display()))?;
    let created_dirs = create_dirs_tracked(parent)?;

    let backup = match backup_existing(link, seq, ctx) {
        Ok(backup) => backup,
        Err(e) => {
            abandon(link, None, &created_dirs);
            return Err(e);
        }
    };

    let staged = parent.join(format!(".pepinstall-{}.lnk", seq));
    let spec = CommandSpec::new("powershell").args([
        "-NoProfile".to_string(),
        "-NonInteractive".to_string(),
        "-Command".to_string(),
        shell_link_script(&staged, target, working_dir),
    ]);
    let saved = run_command(&spec, ctx.process_timeout, None)
        .and_then(|output| output.ensure_success("powershell"))
        .and_then(|()| fs::rename(&staged, link).map_err(anyhow::Error::from));
    if let Err(e) = saved {
        let _ = fs::remove_file(&staged);
        abandon(link, backup.as_deref(), &created_dirs);
        return Err(e).with_context(|| format!("Failed to create shortcut {}", link.display()));
    }

    Ok(UndoData {
        created_dirs,
        created_path: Some(link.to_path_buf()),
        backup,
        command: None,
    })
}

/// `create_dir_all` that reports which directories it actually created,
/// outermost first.
pub fn create_dirs_tracked(path: &Path) -> Result<Vec<PathBuf>> {
    let mut missing = Vec::new();
    let mut cursor = Some(path);
    while let Some(dir) = cursor {
        if dir.as_os_str().is_empty() || dir.is_dir() {
            break;
        }
        missing.push(dir.to_path_buf());
        cursor = dir.parent();
    }
    missing.reverse();

    let mut created = Vec::new();
    for dir in missing {
        match fs::create_dir(&dir) {
            Ok(()) => created.push(dir),
            // Raced with a parallel copy creating the same parent
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists && dir.is_dir() => {}
            Err(e) => {
                let _ = remove_dirs_if_empty(&created);
                return Err(e).with_context(|| format!("Failed to create {}", dir.display()));
            }
        }
    }
    Ok(created)
}

/// Remove `dirs` innermost first, leaving non-empty ones in place.
pub fn remove_dirs_if_empty(dirs: &[PathBuf]) -> Result<()> {
    for dir in dirs.iter().rev() {
        let mut entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                warn!("{} is already gone", dir.display());
                continue;
            }
            Err(e) => return Err(e).with_context(|| format!("Failed to read {}", dir.display())),
        };
        if entries.next().is_some() {
            warn!("{} is not empty, leaving it in place", dir.display());
            continue;
        }
        fs::remove_dir(dir).with_context(|| format!("Failed to remove {}", dir.display()))?;
    }
    Ok(())
}

/// Move a file, falling back to copy + fsync + delete across filesystems.
pub fn move_file(src: &Path, dst: &Path) -> io::Result<()> {
    match fs::rename(src, dst) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::CrossesDevices => {
            debug!(
                "Cross-filesystem move ({} -> {}), using copy fallback",
                src.display(),
                dst.display()
            );
            fs::copy(src, dst)?;
            File::open(dst)?.sync_all()?;
            fs::remove_file(src)
        }
        Err(e) => Err(e),
    }
}

/// Move whatever sits at `path` into the backup area.
fn backup_existing(path: &Path, seq: u64, ctx: &ApplyContext) -> Result<Option<PathBuf>> {
    let Ok(meta) = path.symlink_metadata() else {
        return Ok(None);
    };
    if meta.is_dir() {
        bail!("{} exists and is a directory", path.display());
    }
    fs::create_dir_all(&ctx.backup_dir)?;
    let backup = ctx.backup_dir.join(seq.to_string());
    move_file(path, &backup)
        .with_context(|| format!("Failed to back up {}", path.display()))?;
    debug!("Backed up {} to {}", path.display(), backup.display());
    Ok(Some(backup))
}

/// Undo the side effects of a half-applied write.
fn abandon(path: &Path, backup: Option<&Path>, created_dirs: &[PathBuf]) {
    if let Some(backup) = backup {
        if let Err(e) = move_file(backup, path) {
            warn!("Failed to restore {} from backup: {}", path.display(), e);
        }
    }
    if let Err(e) = remove_dirs_if_empty(created_dirs) {
        warn!("Failed to clean up parents of {}: {:#}", path.display(), e);
    }
}

/// Write `path` atomically; `fill` writes the contents into the temp file.
fn write_file<F>(path: &Path, seq: u64, ctx: &ApplyContext, fill: F) -> Result<UndoData>
where
    F: FnOnce(&mut NamedTempFile) -> Result<()>,
{
    let parent = path
        .parent()
        .with_context(|| format!("{} has no parent directory", path.display()))?;
    let created_dirs = create_dirs_tracked(parent)?;

    let backup = match backup_existing(path, seq, ctx) {
        Ok(backup) => backup,
        Err(e) => {
            abandon(path, None, &created_dirs);
            return Err(e);
        }
    };

    let written = NamedTempFile::new_in(parent)
        .map_err(anyhow::Error::from)
        .and_then(|mut tmp| {
            fill(&mut tmp)?;
            tmp.as_file().sync_all()?;
            tmp.persist(path).map_err(|e| e.error)?;
            Ok(())
        })
        .with_context(|| format!("Failed to write {}", path.display()));

    if let Err(e) = written {
        abandon(path, backup.as_deref(), &created_dirs);
        return Err(e);
    }

    Ok(UndoData {
        created_dirs,
        created_path: Some(path.to_path_buf()),
        backup,
        command: None,
    })
}

fn link_application(link: &Path, target: &Path, seq: u64, ctx: &ApplyContext) -> Result<UndoData> {
    let parent = link
        .parent()
        .with_context(|| format!("{} has no parent directory", link.display()))?;
    let created_dirs = create_dirs_tracked(parent)?;

    let backup = match backup_existing(link, seq, ctx) {
        Ok(backup) => backup,
        Err(e) => {
            abandon(link, None, &created_dirs);
            return Err(e);
        }
    };

    let staged = parent.join(format!(".pepinstall-link-{}", seq));
    if let Err(e) = symlink(target, &staged).and_then(|()| fs::rename(&staged, link)) {
        let _ = fs::remove_file(&staged);
        abandon(link, backup.as_deref(), &created_dirs);
        return Err(e).with_context(|| format!("Failed to link {}", link.display()));
    }

    Ok(UndoData {
        created_dirs,
        created_path: Some(link.to_path_buf()),
        backup,
        command: None,
    })
}

#[cfg(unix)]
fn symlink(target: &Path, link: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(target, link)
}

#[cfg(not(unix))]
fn symlink(_target: &Path, _link: &Path) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "application links are only supported on unix hosts",
    ))
}
