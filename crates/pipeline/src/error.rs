use thiserror::Error;

use crate::model::{AccountTask, CellRef};

#[derive(Debug, Error)]
pub enum PipelineError {
    /// TOML parse / deserialization error.
    #[error("config parse error: {0}")]
    ConfigParse(String),
    /// Config validation error (overlapping ranges, bad floor, etc.).
    #[error("config validation error: {0}")]
    ConfigValidation(String),
    /// The monitor already halted; nothing may be observed afterwards.
    #[error("contamination monitor is halted; refused observation for account {account_code}")]
    MonitorHalted { account_code: u32 },
    /// Two decisions were recorded for the same output coordinate.
    #[error("conflicting decisions for {sheet}!{cell}")]
    DecisionConflict { sheet: String, cell: CellRef },
    /// Task list handed to the orchestrator is not strictly ordered / unique.
    #[error("task list is not sorted by (year, account_code) or has duplicates at {0}")]
    UnorderedTasks(AccountTask),
    #[error(transparent)]
    Recovery(#[from] RecoveryError),
    /// Checkpoint store failed to persist.
    #[error("checkpoint store error: {0}")]
    Checkpoint(String),
    /// Run log sink failed to persist.
    #[error("run log error: {0}")]
    Log(String),
    #[error("worker pool error: {0}")]
    WorkerPool(String),
    /// Source inventory could not be listed.
    #[error("source error: {0}")]
    Source(String),
}

/// Startup failures of `resume`. Fatal; the run must restart from task 0.
#[derive(Debug, Error)]
pub enum RecoveryError {
    #[error("no checkpoint found for run {run_id}")]
    Missing { run_id: String },
    #[error("checkpoint is corrupt: {0}")]
    Corrupt(String),
    #[error("checkpoint belongs to run {found}, expected {expected}")]
    RunMismatch { expected: String, found: String },
    #[error("checkpoint task list differs from the planned tasks")]
    TaskListMismatch,
    #[error("source fingerprint changed since the checkpoint ({stored} -> {current})")]
    FingerprintMismatch { stored: String, current: String },
    #[error("run {run_id} halted on contamination ({kind} in account {account_code}); restore the source and clear the halt marker")]
    Halted {
        run_id: String,
        account_code: u32,
        kind: String,
    },
}
