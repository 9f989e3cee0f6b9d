//! Engine modules: the part that turns a component selection into changes on disk.
//!
//! The planner produces an ordered, validated list of operations; the
//! executor applies it transactionally, records it in the operation log, and
//! replays that log in reverse to uninstall.

pub mod executor;
pub mod operation;
pub mod oplog;
pub mod planner;

pub use executor::{Executor, InstallReport, Progress, UninstallReport};
pub use operation::{Operation, Phase, UndoData};
pub use oplog::{AppliedOperation, InstalledState, LogRecord, OperationLog};
pub use planner::{InstallPlan, PlanRequest, PlannedOperation, ProbeReport, plan_install};
