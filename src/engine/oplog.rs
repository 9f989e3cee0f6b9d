//! Append-only operation log
//!
//! The log is the one thing an install leaves behind besides its artifacts:
//! it is what uninstall replays. One JSON record per line, tagged by `type`:
//!
//! ```text
//! {"type":"Begin","product":"Pep9Term","platform":"linux",...}
//! {"type":"Applied","seq":0,"operation":{"kind":"create_directory",...},"undo":{...}}
//! {"type":"Commit","operations":42,...}
//! {"type":"Reverted","seq":41,...}
//! ```
//!
//! Every record is fsync'd before the executor moves on, so after a crash the
//! log names every operation that may have reached the disk. `Reverted`
//! records are written as an interrupted uninstall or rollback undoes
//! operations, so a retry only replays what is still in effect.

use crate::engine::operation::{Operation, UndoData};
use crate::error::{InstallError, Result};
use crate::types::Platform;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// State directory inside the target
pub const STATE_DIR_NAME: &str = ".install-state";
/// Log file inside the state directory
pub const LOG_FILE_NAME: &str = "operations.jsonl";
/// Backups of overwritten files, inside the state directory
pub const BACKUP_DIR_NAME: &str = "backup";

pub fn state_dir(target: &Path) -> PathBuf {
    target.join(STATE_DIR_NAME)
}

pub fn log_path(target: &Path) -> PathBuf {
    state_dir(target).join(LOG_FILE_NAME)
}

pub fn backup_dir(target: &Path) -> PathBuf {
    state_dir(target).join(BACKUP_DIR_NAME)
}

/// A record in the operation log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum LogRecord {
    /// Session started
    Begin {
        product: String,
        #[serde(default)]
        version: Option<String>,
        platform: Platform,
        components: Vec<String>,
        /// The target directory did not exist before this install
        created_target: bool,
        /// Directories created to make the target, outermost first
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        created_dirs: Vec<PathBuf>,
        timestamp: DateTime<Utc>,
    },

    /// One operation applied successfully
    Applied {
        seq: u64,
        operation: Operation,
        undo: UndoData,
        timestamp: DateTime<Utc>,
    },

    /// Install completed
    Commit {
        operations: usize,
        timestamp: DateTime<Utc>,
    },

    /// The `Applied` record `seq` was undone
    Reverted { seq: u64, timestamp: DateTime<Utc> },
}

/// Writer half of the log
#[derive(Debug)]
pub struct OperationLog {
    path: PathBuf,
    file: File,
}

impl OperationLog {
    /// Create a new log. Fails if one already exists.
    pub fn create(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create_new(true)
            .append(true)
            .open(path)?;
        debug!("Created operation log {}", path.display());
        Ok(Self {
            path: path.to_path_buf(),
            file,
        })
    }

    /// Open an existing log for appending.
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().append(true).open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record and fsync it.
    pub fn append(&mut self, record: &LogRecord) -> Result<()> {
        let json = serde_json::to_string(record)?;
        writeln!(self.file, "{}", json)?;
        self.file.flush()?;
        self.file.sync_data()?;
        Ok(())
    }

    /// Read every record from the log at `path`.
    ///
    /// A torn final line (crash mid-write) is dropped with a warning; a bad
    /// line anywhere else is an error.
    pub fn read(path: &Path) -> Result<Vec<LogRecord>> {
        let file = File::open(path)?;
        let lines: Vec<String> = BufReader::new(file)
            .lines()
            .collect::<io::Result<_>>()?;
        let last = lines.iter().rposition(|l| !l.trim().is_empty());

        let mut records = Vec::with_capacity(lines.len());
        for (index, line) in lines.iter().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(line) {
                Ok(record) => records.push(record),
                Err(e) if Some(index) == last => {
                    warn!(
                        "Ignoring incomplete final record in {} (line {}): {}",
                        path.display(),
                        index + 1,
                        e
                    );
                }
                Err(e) => {
                    return Err(InstallError::CorruptLog(format!(
                        "{} line {}: {}",
                        path.display(),
                        index + 1,
                        e
                    )));
                }
            }
        }
        Ok(records)
    }
}

/// An applied operation that has not been reverted
#[derive(Debug, Clone, PartialEq)]
pub struct AppliedOperation {
    pub seq: u64,
    pub operation: Operation,
    pub undo: UndoData,
}

/// What an operation log says about a target
#[derive(Debug, Clone, PartialEq)]
pub struct InstalledState {
    pub product: String,
    pub platform: Platform,
    pub components: Vec<String>,
    pub created_target: bool,
    pub created_dirs: Vec<PathBuf>,
    /// Applied operations still in effect, in apply order
    pub applied: Vec<AppliedOperation>,
    pub committed: bool,
}

impl InstalledState {
    /// Fold log records into a summary.
    pub fn from_records(records: Vec<LogRecord>) -> Result<Self> {
        let mut iter = records.into_iter();
        let Some(LogRecord::Begin {
            product,
            platform,
            components,
            created_target,
            created_dirs,
            ..
        }) = iter.next()
        else {
            return Err(InstallError::CorruptLog(
                "operation log does not start with a Begin record".to_string(),
            ));
        };

        let mut state = Self {
            product,
            platform,
            components,
            created_target,
            created_dirs,
            applied: Vec::new(),
            committed: false,
        };
        for record in iter {
            match record {
                LogRecord::Applied {
                    seq,
                    operation,
                    undo,
                    ..
                } => state.applied.push(AppliedOperation {
                    seq,
                    operation,
                    undo,
                }),
                LogRecord::Commit { .. } => state.committed = true,
                LogRecord::Reverted { seq, .. } => state.applied.retain(|op| op.seq != seq),
                LogRecord::Begin { .. } => {
                    return Err(InstallError::CorruptLog(
                        "operation log contains more than one Begin record".to_string(),
                    ));
                }
            }
        }
        Ok(state)
    }

    /// Load the state recorded under `target`.
    pub fn load(target: &Path) -> Result<Self> {
        Self::from_records(OperationLog::read(&log_path(target))?)
    }
}
