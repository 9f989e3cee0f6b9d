//! Operation Executor
//!
//! Applies an [`InstallPlan`] transactionally and replays the operation log in
//! reverse to uninstall.
//!
//! # Install
//!
//! 1. Create the target (and any missing parents) if needed, take the
//!    session lock, refuse if a log already exists.
//! 2. Apply operations in plan order. Runs of consecutive payload copies are
//!    spread over a bounded rayon pool; their results are logged in plan
//!    order. Everything else is serialized.
//! 3. After every success append an `Applied` record (fsync'd) and notify the
//!    progress callback.
//! 4. Between operations (and batches) honour the cancel token. A running
//!    executable is never interrupted; only its timeout bounds it.
//! 5. On any failure, including a failed `Commit`, undo every applied
//!    operation in reverse, then remove the state directory and the
//!    directories this run created for the target. If an inverse fails the
//!    state directory stays, with its log and backups.
//!
//! # Uninstall
//!
//! Same lock, then every `Applied` record still in effect is reverted newest
//! first, each success followed by a `Reverted` record. Missing artifacts and
//! directories holding user data are warnings; any other inverse failure is
//! collected and reported as `RollbackFailed`, with the log kept so a retry
//! replays only what is left. A successful run also deletes the uninstall
//! script it may have been driven by. The running maintenance tool cannot
//! delete itself on Windows, so its removal is handed to a detached helper
//! that runs after this process exits.

use crate::cancel::CancelToken;
use crate::config_file::EngineConfig;
use crate::engine::operation::{ApplyContext, UndoData, create_dirs_tracked};
use crate::engine::oplog::{self, AppliedOperation, InstalledState, LogRecord, OperationLog};
use crate::engine::planner::{InstallPlan, PlannedOperation, ProbeReport};
use crate::error::{InstallError, Result, RollbackFailure};
use crate::lock::SessionLock;
use crate::process::{self, CommandSpec, run_command};
use crate::registry::{Manifest, Prerequisite, ProbeSpec};
use crate::resolver::UNINSTALL_SCRIPT_NAME;
use crate::variables::VariableMap;
use chrono::Utc;
use rayon::prelude::*;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Progress notification sent after each applied (or reverted) operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Progress {
    pub completed: usize,
    pub total: usize,
    pub operation: String,
}

impl Progress {
    pub fn percent(&self) -> u8 {
        if self.total == 0 {
            return 100;
        }
        ((self.completed * 100) / self.total).min(100) as u8
    }
}

/// Result of a completed install
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallReport {
    pub target: PathBuf,
    pub applied: usize,
    pub created_target: bool,
}

/// Result of a completed uninstall
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UninstallReport {
    pub target: PathBuf,
    pub reverted: usize,
    /// The target directory itself was removed
    pub target_removed: bool,
}

/// Why an install run stopped early
struct Interruption {
    failed_operation: String,
    error: InstallError,
}

/// What replaying inverses left behind
#[derive(Debug, Default)]
struct RevertOutcome {
    failures: Vec<RollbackFailure>,
    remaining: Vec<PathBuf>,
    /// Artifacts that are the running executable, removed after exit
    deferred: Vec<PathBuf>,
}

/// Applies plans and reverts logs
#[derive(Debug, Clone)]
pub struct Executor {
    workers: usize,
    process_timeout: Duration,
    cancel: CancelToken,
    #[cfg(test)]
    fail_commit: bool,
}

impl Executor {
    pub fn new(config: &EngineConfig, cancel: CancelToken) -> Self {
        Self {
            workers: config.workers.max(1),
            process_timeout: config.process_timeout(),
            cancel,
            #[cfg(test)]
            fail_commit: false,
        }
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    // ========================================================================
    // Probes
    // ========================================================================

    /// Probe each prerequisite. Read-only, never logged.
    ///
    /// A probe that cannot run is reported as `PrerequisiteCheckFailed`,
    /// logged as a warning, and counted as missing.
    pub fn probe_prerequisites(&self, prerequisites: &[&Prerequisite], vars: &VariableMap) -> ProbeReport {
        let mut report = ProbeReport::new();
        for prerequisite in prerequisites {
            let present = match self.probe(prerequisite, vars) {
                Ok(present) => present,
                Err(e) => {
                    warn!("{}; assuming it is missing", e);
                    false
                }
            };
            info!(
                "Prerequisite '{}' is {}",
                prerequisite.id,
                if present { "present" } else { "missing" }
            );
            report.record(&prerequisite.id, present);
        }
        report
    }

    fn probe(&self, prerequisite: &Prerequisite, vars: &VariableMap) -> Result<bool> {
        let failed = |reason: String| InstallError::PrerequisiteCheckFailed {
            prerequisite: prerequisite.id.clone(),
            reason,
        };

        match &prerequisite.probe {
            ProbeSpec::PathExists { path } => Ok(vars.substitute_path(path)?.exists()),
            ProbeSpec::Command { program, args } => {
                let spec = CommandSpec {
                    program: vars.substitute(program)?,
                    args: vars.substitute_all(args)?,
                };
                let output = run_command(&spec, self.process_timeout, Some(&self.cancel))
                    .map_err(|e| failed(format!("{:#}", e)))?;
                if output.timed_out {
                    return Err(failed(format!("{} timed out", spec)));
                }
                Ok(output.success)
            }
        }
    }

    // ========================================================================
    // Install
    // ========================================================================

    /// Apply `plan` for `manifest`.
    ///
    /// # Errors
    ///
    /// - `SessionAlreadyActive` if the target is locked or already has a log
    /// - `Cancelled` / `InstallAborted` after a clean rollback
    /// - `RollbackFailed` if some inverse could not be applied
    pub fn install(
        &self,
        manifest: &Manifest,
        plan: &InstallPlan,
        on_progress: &mut dyn FnMut(&Progress),
    ) -> Result<InstallReport> {
        let target = plan.target.as_path();
        let created_dirs = create_dirs_tracked(target)
            .map_err(|e| InstallError::path_conflict(target, format!("{:#}", e)))?;
        let created_target = !created_dirs.is_empty();
        if created_target {
            debug!("Created target {}", target.display());
        }

        let state_dir = oplog::state_dir(target);
        let lock = match SessionLock::try_acquire(&state_dir, target) {
            Ok(lock) => lock,
            Err(e) => {
                if created_target {
                    if let Err(err) = fs::remove_dir_all(&state_dir) {
                        if err.kind() != io::ErrorKind::NotFound {
                            warn!("Failed to remove {}: {}", state_dir.display(), err);
                        }
                    }
                    remove_created_dirs(target, &created_dirs);
                }
                return Err(e);
            }
        };

        let log_path = oplog::log_path(target);
        if log_path.exists() {
            return Err(InstallError::SessionAlreadyActive {
                target: target.to_path_buf(),
            });
        }

        info!(
            "Installing {} operation(s) into {}",
            plan.len(),
            target.display()
        );

        let mut log = OperationLog::create(&log_path)?;
        let mut applied: Vec<AppliedOperation> = Vec::with_capacity(plan.len());
        let begin = LogRecord::Begin {
            product: manifest.name.clone(),
            version: manifest.version.clone(),
            platform: plan.platform,
            components: plan.components.clone(),
            created_target,
            created_dirs: created_dirs.clone(),
            timestamp: Utc::now(),
        };

        match self.run_plan(plan, &begin, &mut log, &mut applied, on_progress) {
            Ok(()) => {
                drop(lock);
                info!("Installed {} operation(s) into {}", applied.len(), target.display());
                Ok(InstallReport {
                    target: target.to_path_buf(),
                    applied: applied.len(),
                    created_target,
                })
            }
            Err(interruption) => Err(self.roll_back(
                target,
                &created_dirs,
                lock,
                log,
                applied,
                interruption,
            )),
        }
    }

    /// Begin, apply everything, Commit.
    fn run_plan(
        &self,
        plan: &InstallPlan,
        begin: &LogRecord,
        log: &mut OperationLog,
        applied: &mut Vec<AppliedOperation>,
        on_progress: &mut dyn FnMut(&Progress),
    ) -> std::result::Result<(), Interruption> {
        log.append(begin).map_err(|e| Interruption {
            failed_operation: "operation log".to_string(),
            error: e,
        })?;
        self.apply_all(plan, log, applied, on_progress)?;
        self.commit(log, applied.len()).map_err(|e| Interruption {
            failed_operation: "operation log commit".to_string(),
            error: e,
        })
    }

    fn commit(&self, log: &mut OperationLog, operations: usize) -> Result<()> {
        #[cfg(test)]
        if self.fail_commit {
            return Err(InstallError::Io(io::Error::other("commit record not written")));
        }
        log.append(&LogRecord::Commit {
            operations,
            timestamp: Utc::now(),
        })
    }

    fn apply_all(
        &self,
        plan: &InstallPlan,
        log: &mut OperationLog,
        applied: &mut Vec<AppliedOperation>,
        on_progress: &mut dyn FnMut(&Progress),
    ) -> std::result::Result<(), Interruption> {
        let ctx = ApplyContext {
            backup_dir: oplog::backup_dir(&plan.target),
            process_timeout: self.process_timeout,
        };
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.workers)
            .build()
            .map_err(|e| Interruption {
                failed_operation: "worker pool".to_string(),
                error: InstallError::config(format!("failed to start {} workers: {}", self.workers, e)),
            })?;

        let total = plan.len();
        let mut index = 0;
        while index < total {
            if self.cancel.is_cancelled() {
                warn!("Cancellation requested before operation #{}", index);
                return Err(Interruption {
                    failed_operation: plan.operations[index].operation.to_string(),
                    error: InstallError::Cancelled,
                });
            }

            let batch = next_batch(&plan.operations[index..]);
            let results: Vec<anyhow::Result<UndoData>> = if batch.len() > 1 && self.workers > 1 {
                debug!("Copying {} payload file(s) on {} workers", batch.len(), self.workers);
                pool.install(|| {
                    batch
                        .par_iter()
                        .enumerate()
                        .map(|(offset, planned)| planned.operation.apply((index + offset) as u64, &ctx))
                        .collect()
                })
            } else {
                let mut results = Vec::with_capacity(batch.len());
                for (offset, planned) in batch.iter().enumerate() {
                    let result = planned.operation.apply((index + offset) as u64, &ctx);
                    let failed = result.is_err();
                    results.push(result);
                    if failed {
                        break;
                    }
                }
                results
            };

            // Log every success in plan order, even past a failure in the same batch
            let mut first_failure = None;
            for (offset, result) in results.into_iter().enumerate() {
                let seq = index + offset;
                let operation = &plan.operations[seq].operation;
                match result {
                    Ok(undo) => {
                        applied.push(AppliedOperation {
                            seq: seq as u64,
                            operation: operation.clone(),
                            undo: undo.clone(),
                        });
                        log.append(&LogRecord::Applied {
                            seq: seq as u64,
                            operation: operation.clone(),
                            undo,
                            timestamp: Utc::now(),
                        })
                        .map_err(|e| Interruption {
                            failed_operation: operation.to_string(),
                            error: e,
                        })?;
                        on_progress(&Progress {
                            completed: applied.len(),
                            total,
                            operation: operation.to_string(),
                        });
                    }
                    Err(e) if first_failure.is_none() => {
                        error!("Operation #{} {} failed: {:#}", seq, operation, e);
                        first_failure = Some(Interruption {
                            failed_operation: operation.to_string(),
                            error: InstallError::OperationApplyFailed {
                                index: seq,
                                operation: operation.to_string(),
                                reason: format!("{:#}", e),
                            },
                        });
                    }
                    Err(e) => {
                        error!("Operation #{} {} failed: {:#}", seq, operation, e);
                    }
                }
            }
            if let Some(failure) = first_failure {
                return Err(failure);
            }
            index += batch.len();
        }
        Ok(())
    }

    fn roll_back(
        &self,
        target: &Path,
        created_dirs: &[PathBuf],
        lock: SessionLock,
        mut log: OperationLog,
        applied: Vec<AppliedOperation>,
        interruption: Interruption,
    ) -> InstallError {
        warn!(
            "Rolling back {} operation(s) after: {}",
            applied.len(),
            interruption.error
        );

        let mut outcome = self.revert_all(&applied, &mut log, &mut |_| {});
        drop(log);

        if let Err(e) = lock.release_and_remove() {
            warn!("Failed to remove session lock: {}", e);
        }

        let state_dir = oplog::state_dir(target);
        if !outcome.failures.is_empty() {
            // The log and backups are what a later uninstall needs
            error!(
                "Rollback left {} failure(s); keeping {}",
                outcome.failures.len(),
                state_dir.display()
            );
            outcome.remaining.push(oplog::log_path(target));
            return InstallError::RollbackFailed {
                cause: Some(interruption.error.to_string()),
                failures: outcome.failures,
                remaining: outcome.remaining,
            };
        }

        if let Err(e) = fs::remove_dir_all(&state_dir) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!("Failed to remove {}: {}", state_dir.display(), e);
            }
        }
        let target_removed = remove_created_dirs(target, created_dirs);
        schedule_deferred(&outcome.deferred, target_removed, created_dirs, target);

        info!("Rollback complete");
        match interruption.error {
            InstallError::Cancelled => InstallError::Cancelled,
            error => InstallError::InstallAborted {
                failed_operation: interruption.failed_operation,
                cause: error.to_string(),
            },
        }
    }

    /// Revert `applied` newest first, recording each success in `log`.
    fn revert_all(
        &self,
        applied: &[AppliedOperation],
        log: &mut OperationLog,
        on_progress: &mut dyn FnMut(&Progress),
    ) -> RevertOutcome {
        let mut outcome = RevertOutcome::default();
        let total = applied.len();

        for (done, entry) in applied.iter().rev().enumerate() {
            let operation = &entry.operation;
            let reverted = match operation.revert(&entry.undo, self.process_timeout) {
                Ok(()) => {
                    debug!("Reverted {}", operation);
                    true
                }
                Err(e) => match operation.artifact().filter(|path| process::is_current_exe(path)) {
                    Some(path) => {
                        warn!("{} is running and will be removed after exit: {:#}", path.display(), e);
                        outcome.deferred.push(path.to_path_buf());
                        true
                    }
                    None => {
                        error!("Failed to revert {}: {:#}", operation, e);
                        outcome.failures.push(RollbackFailure {
                            operation: operation.to_string(),
                            reason: format!("{:#}", e),
                        });
                        outcome.remaining.extend(entry.undo.remaining());
                        false
                    }
                },
            };

            if reverted {
                let record = LogRecord::Reverted {
                    seq: entry.seq,
                    timestamp: Utc::now(),
                };
                if let Err(e) = log.append(&record) {
                    // Going on would let the log and the disk disagree
                    error!("Failed to record revert of {}: {}", operation, e);
                    outcome.failures.push(RollbackFailure {
                        operation: operation.to_string(),
                        reason: format!("reverted, but the operation log could not record it: {}", e),
                    });
                    for pending in applied.iter().rev().skip(done + 1) {
                        outcome.remaining.extend(pending.undo.remaining());
                    }
                    break;
                }
            }

            on_progress(&Progress {
                completed: done + 1,
                total,
                operation: operation.to_string(),
            });
        }
        outcome
    }

    // ========================================================================
    // Uninstall
    // ========================================================================

    /// Replay the log under `target` in reverse.
    ///
    /// # Errors
    ///
    /// - `PathConflict` if `target` has no operation log
    /// - `SessionAlreadyActive` if another session holds the lock
    /// - `RollbackFailed` if some inverse failed (the log is kept for a retry)
    pub fn uninstall(&self, target: &Path, on_progress: &mut dyn FnMut(&Progress)) -> Result<UninstallReport> {
        let log_path = oplog::log_path(target);
        if !log_path.is_file() {
            return Err(InstallError::path_conflict(
                target,
                "no operation log found; nothing to uninstall",
            ));
        }

        let state_dir = oplog::state_dir(target);
        let lock = SessionLock::try_acquire(&state_dir, target)?;
        let state = InstalledState::load(target)?;
        if !state.committed {
            warn!("{} holds an incomplete install; reverting what was applied", target.display());
        }

        info!(
            "Uninstalling {} ({} operation(s)) from {}",
            state.product,
            state.applied.len(),
            target.display()
        );

        let mut log = OperationLog::open(&log_path)?;
        let outcome = self.revert_all(&state.applied, &mut log, on_progress);
        drop(log);
        if !outcome.failures.is_empty() {
            drop(lock);
            return Err(InstallError::RollbackFailed {
                cause: None,
                failures: outcome.failures,
                remaining: outcome.remaining,
            });
        }

        lock.release_and_remove()?;
        fs::remove_dir_all(&state_dir)?;
        let script = target.join(UNINSTALL_SCRIPT_NAME);
        if script.is_file() {
            fs::remove_file(&script)?;
            debug!("Removed {}", script.display());
        }
        let target_removed = if state.created_dirs.is_empty() {
            state.created_target && remove_if_empty(target)
        } else {
            remove_created_dirs(target, &state.created_dirs)
        };
        schedule_deferred(&outcome.deferred, target_removed, &state.created_dirs, target);

        info!("Uninstalled {} from {}", state.product, target.display());
        Ok(UninstallReport {
            target: target.to_path_buf(),
            reverted: state.applied.len(),
            target_removed,
        })
    }
}

/// The run of operations starting at `ops[0]` that can be applied together.
fn next_batch(ops: &[PlannedOperation]) -> &[PlannedOperation] {
    if !ops[0].operation.is_parallel_safe() {
        return &ops[..1];
    }
    let len = ops
        .iter()
        .take_while(|planned| planned.operation.is_parallel_safe())
        .count();
    &ops[..len]
}

/// Remove the directories created for `target`, innermost first, stopping at
/// the first one still in use. Returns whether the target itself is gone.
fn remove_created_dirs(target: &Path, created_dirs: &[PathBuf]) -> bool {
    for dir in created_dirs.iter().rev() {
        if !remove_if_empty(dir) {
            break;
        }
    }
    target.symlink_metadata().is_err()
}

/// Hand removal of still-running artifacts to a helper that outlives us.
fn schedule_deferred(deferred: &[PathBuf], target_removed: bool, created_dirs: &[PathBuf], target: &Path) {
    if deferred.is_empty() {
        return;
    }
    let prune = (!target_removed && !created_dirs.is_empty()).then_some(target);
    if let Err(e) = process::remove_after_exit(deferred, prune) {
        warn!("Failed to schedule removal of {:?}: {:#}", deferred, e);
    }
}

/// Remove `dir` if it is empty; returns whether it was removed.
fn remove_if_empty(dir: &Path) -> bool {
    match fs::remove_dir(dir) {
        Ok(()) => {
            debug!("Removed {}", dir.display());
            true
        }
        Err(e) => {
            if dir.exists() {
                warn!("Leaving {} in place: {}", dir.display(), e);
            }
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::operation::{Operation, Phase};
    use crate::types::Platform;
    use tempfile::TempDir;

    fn manifest() -> Manifest {
        Manifest::from_json(
            r#"{
                "name": "Pep9Term",
                "maintenance_tool_name": "Pep9-Updater",
                "components": [{ "id": "pep9term", "display_name": "Pep/9", "platforms": ["linux"] }]
            }"#,
            "/",
        )
        .expect("manifest")
    }

    fn executor() -> Executor {
        let config = EngineConfig {
            workers: 2,
            process_timeout_secs: 10,
            ..EngineConfig::default()
        };
        Executor::new(&config, CancelToken::new())
    }

    fn plan_of(target: &Path, ops: Vec<Operation>) -> InstallPlan {
        InstallPlan {
            target: target.to_path_buf(),
            platform: Platform::Linux,
            components: vec!["pep9term".to_string()],
            operations: ops
                .into_iter()
                .map(|operation| PlannedOperation {
                    phase: Phase::Payload,
                    operation,
                })
                .collect(),
        }
    }

    fn copy_ops(dir: &Path, target: &Path, count: usize) -> Vec<Operation> {
        (0..count)
            .map(|i| {
                let source = dir.join(format!("src-{}", i));
                fs::write(&source, format!("file {}", i)).expect("source");
                Operation::CopyFile {
                    source,
                    destination: target.join(format!("file-{}", i)),
                }
            })
            .collect()
    }

    #[test]
    fn test_next_batch_groups_copies() {
        let ops: Vec<PlannedOperation> = [
            Operation::CopyFile {
                source: "a".into(),
                destination: "b".into(),
            },
            Operation::CopyFile {
                source: "c".into(),
                destination: "d".into(),
            },
            Operation::CreateDirectory { path: "e".into() },
        ]
        .into_iter()
        .map(|operation| PlannedOperation {
            phase: Phase::Payload,
            operation,
        })
        .collect();
        assert_eq!(next_batch(&ops).len(), 2);
        assert_eq!(next_batch(&ops[2..]).len(), 1);
    }

    #[test]
    fn test_install_then_uninstall_removes_everything() {
        let dir = TempDir::new().expect("tempdir");
        let target = dir.path().join("pep9");
        let mut ops = vec![Operation::CreateDirectory { path: target.clone() }];
        ops.extend(copy_ops(dir.path(), &target, 5));
        let plan = plan_of(&target, ops);

        let mut events = Vec::new();
        let report = executor()
            .install(&manifest(), &plan, &mut |p| events.push(p.clone()))
            .expect("install");
        assert_eq!(report.applied, 6);
        assert!(report.created_target);
        assert_eq!(events.len(), 6);
        assert_eq!(events.last().expect("progress").percent(), 100);
        assert!(target.join("file-4").is_file());

        let state = InstalledState::load(&target).expect("log");
        assert!(state.committed);
        assert_eq!(state.applied.len(), 6);

        let report = executor().uninstall(&target, &mut |_| {}).expect("uninstall");
        assert_eq!(report.reverted, 6);
        assert!(report.target_removed);
        assert!(!target.exists());
    }

    #[test]
    fn test_failure_rolls_back_and_leaves_nothing() {
        let dir = TempDir::new().expect("tempdir");
        let target = dir.path().join("pep9");
        let mut ops = vec![Operation::CreateDirectory { path: target.join("lib") }];
        ops.extend(copy_ops(dir.path(), &target, 3));
        ops.push(Operation::CopyFile {
            source: dir.path().join("does-not-exist"),
            destination: target.join("lib/broken"),
        });
        let plan = plan_of(&target, ops);

        let err = executor()
            .install(&manifest(), &plan, &mut |_| {})
            .unwrap_err();
        assert!(matches!(err, InstallError::InstallAborted { .. }), "{:?}", err);
        assert!(err.is_recoverable());
        assert!(!target.exists());
    }

    #[test]
    fn test_cancelled_before_start_rolls_back() {
        let dir = TempDir::new().expect("tempdir");
        let target = dir.path().join("pep9");
        let plan = plan_of(&target, copy_ops(dir.path(), &target, 2));

        let executor = executor();
        executor.cancel_token().cancel();
        let err = executor.install(&manifest(), &plan, &mut |_| {}).unwrap_err();
        assert!(matches!(err, InstallError::Cancelled));
        assert!(!target.exists());
    }

    #[test]
    fn test_second_install_refused() {
        let dir = TempDir::new().expect("tempdir");
        let target = dir.path().join("pep9");
        let plan = plan_of(&target, copy_ops(dir.path(), &target, 1));

        executor().install(&manifest(), &plan, &mut |_| {}).expect("first install");
        let err = executor().install(&manifest(), &plan, &mut |_| {}).unwrap_err();
        assert!(matches!(err, InstallError::SessionAlreadyActive { .. }));
        assert!(target.join("file-0").is_file());
    }

    #[test]
    fn test_uninstall_without_log_is_conflict() {
        let dir = TempDir::new().expect("tempdir");
        let err = executor().uninstall(dir.path(), &mut |_| {}).unwrap_err();
        assert!(matches!(err, InstallError::PathConflict { .. }));
    }

    #[test]
    fn test_uninstall_keeps_user_data() {
        let dir = TempDir::new().expect("tempdir");
        let target = dir.path().join("pep9");
        let plan = plan_of(&target, vec![Operation::CreateDirectory { path: target.join("data") }]);
        executor().install(&manifest(), &plan, &mut |_| {}).expect("install");

        fs::write(target.join("data/notes.txt"), "mine").expect("user data");
        let report = executor().uninstall(&target, &mut |_| {}).expect("uninstall");
        assert!(!report.target_removed);
        assert!(target.join("data/notes.txt").is_file());
        assert!(!oplog::state_dir(&target).exists());
    }

    #[test]
    fn test_missing_probe_command_counts_as_missing() {
        let prerequisite: Prerequisite = serde_json::from_str(
            r#"{
                "id": "runtime", "display_name": "Runtime", "platforms": ["linux"],
                "probe": { "kind": "command", "program": "/nonexistent/probe" },
                "install": { "program": "true" }
            }"#,
        )
        .expect("prerequisite");
        let report = executor().probe_prerequisites(&[&prerequisite], &VariableMap::new());
        assert!(!report.is_present("runtime"));
    }

    #[test]
    fn test_path_probe() {
        let dir = TempDir::new().expect("tempdir");
        let marker = dir.path().join("runtime.dll");
        fs::write(&marker, "").expect("marker");
        let prerequisite: Prerequisite = serde_json::from_value(serde_json::json!({
            "id": "runtime", "display_name": "Runtime", "platforms": ["windows"],
            "probe": { "kind": "path_exists", "path": marker.to_string_lossy() },
            "install": { "program": "setup.exe" }
        }))
        .expect("prerequisite");
        let report = executor().probe_prerequisites(&[&prerequisite], &VariableMap::new());
        assert!(report.is_present("runtime"));
    }

    #[test]
    fn test_created_parents_are_removed_on_rollback_and_uninstall() {
        let dir = TempDir::new().expect("tempdir");
        let target = dir.path().join("a/b/pep9");

        let broken = plan_of(
            &target,
            vec![Operation::CopyFile {
                source: dir.path().join("does-not-exist"),
                destination: target.join("Pep9Term"),
            }],
        );
        let err = executor().install(&manifest(), &broken, &mut |_| {}).unwrap_err();
        assert!(matches!(err, InstallError::InstallAborted { .. }), "{:?}", err);
        assert!(!dir.path().join("a").exists());

        let plan = plan_of(&target, copy_ops(dir.path(), &target, 2));
        executor().install(&manifest(), &plan, &mut |_| {}).expect("install");
        assert_eq!(
            InstalledState::load(&target).expect("log").created_dirs,
            vec![dir.path().join("a"), dir.path().join("a/b"), target.clone()]
        );
        let report = executor().uninstall(&target, &mut |_| {}).expect("uninstall");
        assert!(report.target_removed);
        assert!(!dir.path().join("a").exists());
    }

    #[test]
    fn test_commit_failure_rolls_back() {
        let dir = TempDir::new().expect("tempdir");
        let target = dir.path().join("pep9");
        let plan = plan_of(&target, copy_ops(dir.path(), &target, 3));

        let executor = Executor {
            fail_commit: true,
            ..executor()
        };
        let err = executor.install(&manifest(), &plan, &mut |_| {}).unwrap_err();
        match err {
            InstallError::InstallAborted {
                failed_operation, ..
            } => assert_eq!(failed_operation, "operation log commit"),
            other => panic!("expected InstallAborted, got {:?}", other),
        }
        assert!(!target.exists());
    }

    #[test]
    fn test_cancel_after_an_operation_rolls_back() {
        let dir = TempDir::new().expect("tempdir");
        let target = dir.path().join("pep9");
        let ops = (0..5)
            .map(|i| Operation::CreateDirectory {
                path: target.join(format!("d{}", i)),
            })
            .collect();
        let plan = plan_of(&target, ops);

        let executor = executor();
        let token = executor.cancel_token().clone();
        let mut seen = 0;
        let err = executor
            .install(&manifest(), &plan, &mut |progress| {
                seen = progress.completed;
                if progress.completed == 2 {
                    token.cancel();
                }
            })
            .unwrap_err();
        assert!(matches!(err, InstallError::Cancelled), "{:?}", err);
        assert_eq!(seen, 2);
        assert!(!target.exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_cancel_lets_running_executable_finish() {
        let dir = TempDir::new().expect("tempdir");
        let target = dir.path().join("pep9");
        let marker = dir.path().join("installer-finished");
        let plan = plan_of(
            &target,
            vec![
                Operation::RunExecutable {
                    command: CommandSpec::new("sh")
                        .args(["-c", &format!("sleep 1; touch '{}'", marker.display())]),
                    undo: None,
                },
                Operation::CreateDirectory {
                    path: target.join("lib"),
                },
            ],
        );

        let executor = executor();
        let token = executor.cancel_token().clone();
        let canceller = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(300));
            token.cancel();
        });
        let err = executor.install(&manifest(), &plan, &mut |_| {}).unwrap_err();
        canceller.join().expect("canceller");

        assert!(matches!(err, InstallError::Cancelled), "{:?}", err);
        assert!(marker.is_file());
        assert!(!target.join("lib").exists());
        assert!(!target.exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_rollback_reverts_in_reverse_order() {
        let dir = TempDir::new().expect("tempdir");
        let target = dir.path().join("pep9");
        let order = dir.path().join("order.txt");
        let mut ops: Vec<Operation> = (1..=3)
            .map(|i| Operation::RunExecutable {
                command: CommandSpec::new("true"),
                undo: Some(
                    CommandSpec::new("sh")
                        .args(["-c", &format!("echo {} >> '{}'", i, order.display())]),
                ),
            })
            .collect();
        ops.push(Operation::RunExecutable {
            command: CommandSpec::new("sh").args(["-c", "exit 1"]),
            undo: None,
        });
        let plan = plan_of(&target, ops);

        let err = executor().install(&manifest(), &plan, &mut |_| {}).unwrap_err();
        assert!(matches!(err, InstallError::InstallAborted { .. }), "{:?}", err);
        let lines: Vec<String> = fs::read_to_string(&order)
            .expect("undo commands ran")
            .lines()
            .map(str::to_string)
            .collect();
        assert_eq!(lines, ["3", "2", "1"]);
    }

    #[cfg(unix)]
    #[test]
    fn test_timeout_aborts_and_rolls_back() {
        let dir = TempDir::new().expect("tempdir");
        let target = dir.path().join("pep9");
        let plan = plan_of(
            &target,
            vec![
                Operation::CreateDirectory {
                    path: target.join("lib"),
                },
                Operation::RunExecutable {
                    command: CommandSpec::new("sh").args(["-c", "sleep 30"]),
                    undo: None,
                },
            ],
        );

        let config = EngineConfig {
            process_timeout_secs: 1,
            ..EngineConfig::default()
        };
        let started = std::time::Instant::now();
        let err = Executor::new(&config, CancelToken::new())
            .install(&manifest(), &plan, &mut |_| {})
            .unwrap_err();
        assert!(started.elapsed() < Duration::from_secs(20));
        match err {
            InstallError::InstallAborted { cause, .. } => assert!(cause.contains("timed out"), "{}", cause),
            other => panic!("expected InstallAborted, got {:?}", other),
        }
        assert!(!target.exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_failed_inverse_keeps_log_and_backup() {
        let dir = TempDir::new().expect("tempdir");
        let target = dir.path().join("pep9");
        fs::create_dir(&target).expect("existing target");
        let config = target.join("config.ini");
        fs::write(&config, "ORIGINAL USER DATA").expect("user file");
        let source = dir.path().join("config.ini");
        fs::write(&source, "shipped").expect("source");

        let plan = plan_of(
            &target,
            vec![
                Operation::CopyFile {
                    source,
                    destination: config.clone(),
                },
                // Leaves a directory where the copied file was
                Operation::RunExecutable {
                    command: CommandSpec::new("sh").args([
                        "-c",
                        &format!("rm '{0}' && mkdir '{0}'", config.display()),
                    ]),
                    undo: None,
                },
                Operation::RunExecutable {
                    command: CommandSpec::new("sh").args(["-c", "exit 1"]),
                    undo: None,
                },
            ],
        );

        let err = executor().install(&manifest(), &plan, &mut |_| {}).unwrap_err();
        let backup = oplog::backup_dir(&target).join("0");
        match &err {
            InstallError::RollbackFailed { remaining, .. } => {
                assert!(remaining.contains(&backup), "{:?}", remaining);
                assert!(remaining.contains(&oplog::log_path(&target)));
            }
            other => panic!("expected RollbackFailed, got {:?}", other),
        }
        assert_eq!(fs::read_to_string(&backup).expect("backup kept"), "ORIGINAL USER DATA");
        let instructions = err.cleanup_instructions().expect("instructions");
        assert!(instructions.contains(&backup.display().to_string()));
    }

    #[cfg(unix)]
    #[test]
    fn test_uninstall_retry_skips_reverted_operations() {
        let dir = TempDir::new().expect("tempdir");
        let target = dir.path().join("pep9");
        fs::create_dir(&target).expect("existing target");
        let config = target.join("config.ini");
        fs::write(&config, "ORIGINAL USER DATA").expect("user file");
        let source = dir.path().join("config.ini");
        fs::write(&source, "shipped").expect("source");

        let plan = plan_of(
            &target,
            vec![
                Operation::CreateDirectory {
                    path: target.join("sub"),
                },
                Operation::CopyFile {
                    source,
                    destination: config.clone(),
                },
            ],
        );
        executor().install(&manifest(), &plan, &mut |_| {}).expect("install");

        // A file where the created directory was makes its inverse fail
        fs::remove_dir(target.join("sub")).expect("remove dir");
        fs::write(target.join("sub"), "in the way").expect("blocking file");
        let err = executor().uninstall(&target, &mut |_| {}).unwrap_err();
        assert!(matches!(err, InstallError::RollbackFailed { .. }), "{:?}", err);
        assert_eq!(fs::read_to_string(&config).expect("restored"), "ORIGINAL USER DATA");

        let state = InstalledState::load(&target).expect("log kept");
        assert_eq!(state.applied.len(), 1);
        assert_eq!(state.applied[0].seq, 0);

        fs::remove_file(target.join("sub")).expect("clear blocker");
        executor().uninstall(&target, &mut |_| {}).expect("retry");
        assert_eq!(fs::read_to_string(&config).expect("still restored"), "ORIGINAL USER DATA");
        assert!(!oplog::state_dir(&target).exists());
    }
}
