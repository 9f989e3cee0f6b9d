//! Error handling module for pepinstall
//!
//! Provides centralized error handling with proper error types using thiserror.
//! Every failure the engine can surface maps to one variant here, and every
//! variant maps to one process exit code (see [`InstallError::exit_code`]).

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Exit code for a clean run.
pub const EXIT_SUCCESS: i32 = 0;
/// Exit code for a user-recoverable failure (nothing left behind).
pub const EXIT_RECOVERABLE: i32 = 1;
/// Exit code for a fatal failure (manual cleanup may be required).
pub const EXIT_FATAL: i32 = 2;

/// One inverse operation that could not be applied during rollback or uninstall.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RollbackFailure {
    /// Human-readable form of the operation being undone
    pub operation: String,
    /// Why the inverse failed
    pub reason: String,
}

impl fmt::Display for RollbackFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.operation, self.reason)
    }
}

/// Main error type for pepinstall
#[derive(Error, Debug)]
pub enum InstallError {
    /// Target exists but cannot be used (not a directory, not writable)
    #[error("Path conflict at {}: {reason}", path.display())]
    PathConflict { path: PathBuf, reason: String },

    /// Target path is malformed
    #[error("Invalid path '{path}': {reason}")]
    PathInvalid { path: String, reason: String },

    /// Platform string not recognized, or host platform not supported
    #[error("Unsupported platform: {0}")]
    UnsupportedPlatform(String),

    /// A prerequisite probe could not run (absorbed and logged by callers)
    #[error("Prerequisite check for '{prerequisite}' failed: {reason}")]
    PrerequisiteCheckFailed { prerequisite: String, reason: String },

    /// A single operation failed to apply
    #[error("Operation #{index} ({operation}) failed: {reason}")]
    OperationApplyFailed {
        index: usize,
        operation: String,
        reason: String,
    },

    /// Install halted and every applied operation was rolled back
    #[error("Installation aborted at {failed_operation}: {cause} (all changes rolled back)")]
    InstallAborted {
        failed_operation: String,
        cause: String,
    },

    /// Rollback (or uninstall) left artifacts behind
    #[error("Rollback failed: {} inverse operation(s) could not be applied", failures.len())]
    RollbackFailed {
        /// What triggered the rollback (None for a plain uninstall)
        cause: Option<String>,
        failures: Vec<RollbackFailure>,
        /// Paths still on disk that need manual removal
        remaining: Vec<PathBuf>,
    },

    /// Another session holds the target, or a completed install is already there
    #[error("Another installer session is active or already completed for {}", target.display())]
    SessionAlreadyActive { target: PathBuf },

    /// A prior install was found and its uninstaller was run; the user should retry
    #[error("Existing installation in {} was removed; run the installer again", target.display())]
    ExistingInstallRemoved { target: PathBuf },

    /// A template still contains an `@Placeholder@` after substitution
    #[error("Unresolved placeholder @{placeholder}@ in '{template}'")]
    UnresolvedPlaceholder { placeholder: String, template: String },

    /// Selected component id is not in the manifest
    #[error("Unknown component: {0}")]
    UnknownComponent(String),

    /// Manifest errors (loading, parsing, validation)
    #[error("Manifest error: {0}")]
    Manifest(String),

    /// The operation log under the target is unreadable or inconsistent
    #[error("Corrupt operation log: {0}")]
    CorruptLog(String),

    /// Configuration errors (loading, parsing, validation)
    #[error("Configuration error: {0}")]
    Config(String),

    /// The user (or a signal) cancelled the session
    #[error("Cancelled by user")]
    Cancelled,

    /// The user declined a wizard page
    #[error("Declined at {page}")]
    UserDeclined { page: String },

    /// Wizard state machine transition errors
    #[error("Wizard transition error: {0}")]
    Transition(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for pepinstall operations
pub type Result<T> = std::result::Result<T, InstallError>;

// Convenient error constructors
impl InstallError {
    /// Create a path conflict error
    pub fn path_conflict(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::PathConflict {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create a path invalid error
    pub fn path_invalid(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::PathInvalid {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create a manifest error
    pub fn manifest(msg: impl Into<String>) -> Self {
        Self::Manifest(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Process exit code for this error.
    ///
    /// `1` means the system is as it was before the run; `2` means it may not be.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::RollbackFailed { .. }
            | Self::CorruptLog(_)
            | Self::Io(_)
            | Self::Json(_) => EXIT_FATAL,
            _ => EXIT_RECOVERABLE,
        }
    }

    /// Returns true if the user can simply re-run the installer.
    pub fn is_recoverable(&self) -> bool {
        self.exit_code() == EXIT_RECOVERABLE
    }

    /// Multi-line manual-cleanup instructions for a failed rollback.
    pub fn cleanup_instructions(&self) -> Option<String> {
        let Self::RollbackFailed {
            cause,
            failures,
            remaining,
        } = self
        else {
            return None;
        };

        let mut lines = Vec::new();
        if let Some(cause) = cause {
            lines.push(format!("The installation failed: {}", cause));
        }
        lines.push("The following changes could not be undone:".to_string());
        for failure in failures {
            lines.push(format!("  - {}", failure));
        }
        if !remaining.is_empty() {
            lines.push("Still on disk (backups under .install-state/backup hold replaced files):".to_string());
            for path in remaining {
                lines.push(format!("  {}", path.display()));
            }
        }
        Some(lines.join("\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = InstallError::path_invalid("", "path is empty");
        assert_eq!(err.to_string(), "Invalid path '': path is empty");

        let err = InstallError::UnsupportedPlatform("solaris".to_string());
        assert_eq!(err.to_string(), "Unsupported platform: solaris");
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: InstallError = io_err.into();
        assert!(matches!(err, InstallError::Io(_)));
        assert_eq!(err.exit_code(), EXIT_FATAL);
    }

    #[test]
    fn test_exit_codes() {
        let aborted = InstallError::InstallAborted {
            failed_operation: "CopyFile(a -> b)".to_string(),
            cause: "disk full".to_string(),
        };
        assert_eq!(aborted.exit_code(), EXIT_RECOVERABLE);
        assert!(aborted.is_recoverable());

        let rollback = InstallError::RollbackFailed {
            cause: None,
            failures: vec![],
            remaining: vec![],
        };
        assert_eq!(rollback.exit_code(), EXIT_FATAL);

        let redirect = InstallError::ExistingInstallRemoved {
            target: PathBuf::from("/opt/pep9"),
        };
        assert_eq!(redirect.exit_code(), EXIT_RECOVERABLE);
    }

    #[test]
    fn test_cleanup_instructions_enumerate_state() {
        let err = InstallError::RollbackFailed {
            cause: Some("copy failed".to_string()),
            failures: vec![RollbackFailure {
                operation: "CreateShortcut(/menu/Pep9.lnk)".to_string(),
                reason: "permission denied".to_string(),
            }],
            remaining: vec![PathBuf::from("/menu/Pep9.lnk")],
        };
        let text = err.cleanup_instructions().expect("rollback failure has instructions");
        assert!(text.contains("copy failed"));
        assert!(text.contains("permission denied"));
        assert!(text.contains("/menu/Pep9.lnk"));

        assert!(InstallError::Cancelled.cleanup_instructions().is_none());
    }
}
