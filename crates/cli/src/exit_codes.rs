//! CLI Exit Code Registry
//!
//! This is the single source of truth for all `lscan` exit codes.
//! Exit codes are part of the shell contract: batch scripts decide whether a
//! ledger run may be handed to a reviewer based on them.
//!
//! # Exit Code Ranges
//!
//! | Range   | Domain     | Description                                   |
//! |---------|------------|-----------------------------------------------|
//! | 0       | Universal  | Success, no contamination, no structural errors |
//! | 1       | Universal  | General error (unspecified)                   |
//! | 2       | Universal  | CLI usage error (bad args, missing source)    |
//! | 3-9     | setup      | Config, filesystem and source workbook codes  |
//! | 10-19   | extract    | Run finished but the result is not clean      |
//! | 20-29   | recover    | Checkpoint cannot be resumed                  |
//! | 30-39   | verify     | Post-run verification                         |
//!
//! # Adding New Exit Codes
//!
//! 1. Add the constant in the appropriate range
//! 2. Document what triggers it
//! 3. Update the table above
//! 4. Wire it into `pipeline_exit_code` or the command's error handling

use ledgerscan_pipeline::{PipelineError, RecoveryError};

// =============================================================================
// Universal (0-2)
// =============================================================================

/// Success - run completed with zero contamination and zero unresolved
/// structural errors. Marked (uncertain) cells do not affect the exit code.
pub const EXIT_SUCCESS: u8 = 0;

/// General error - unspecified failure.
/// Avoid using this; prefer a specific error code.
pub const EXIT_ERROR: u8 = 1;

/// Usage error - bad arguments, missing required options.
pub const EXIT_USAGE: u8 = 2;

// =============================================================================
// Setup (3-9)
// =============================================================================

/// Config file could not be parsed or failed validation.
pub const EXIT_CONFIG: u8 = 3;

/// Filesystem error (run directory, report, output workbook).
pub const EXIT_IO: u8 = 4;

/// A source workbook could not be opened or listed.
pub const EXIT_SOURCE: u8 = 5;

// =============================================================================
// Extract (10-19)
// =============================================================================

/// Run completed but one or more tasks ended in a structural error
/// (missing sheet, missing columns, unreadable sheet).
pub const EXIT_STRUCTURAL: u8 = 10;

/// Run halted on cross-account contamination. No outputs were written.
pub const EXIT_CONTAMINATION: u8 = 11;

/// A fresh run was started in a directory that already holds a checkpoint.
pub const EXIT_RUN_EXISTS: u8 = 12;

// =============================================================================
// Recover (20-29)
// =============================================================================

/// No checkpoint was saved for the run.
pub const EXIT_RECOVERY_MISSING: u8 = 20;

/// Checkpoint file is unreadable or violates its own invariants.
pub const EXIT_RECOVERY_CORRUPT: u8 = 21;

/// Checkpoint does not match the run (run id, task list or source fingerprint).
pub const EXIT_RECOVERY_MISMATCH: u8 = 22;

/// Run previously halted on contamination; resuming is refused.
pub const EXIT_RECOVERY_HALTED: u8 = 23;

// =============================================================================
// Verify (30-39)
// =============================================================================

/// One or more verification checks failed.
pub const EXIT_VERIFY_FAILED: u8 = 30;

/// Map a pipeline error to its exit code.
pub fn pipeline_exit_code(err: &PipelineError) -> u8 {
    match err {
        PipelineError::ConfigParse(_) | PipelineError::ConfigValidation(_) => EXIT_CONFIG,
        PipelineError::Source(_) => EXIT_SOURCE,
        PipelineError::Checkpoint(_) | PipelineError::Log(_) => EXIT_IO,
        PipelineError::Recovery(r) => match r {
            RecoveryError::Missing { .. } => EXIT_RECOVERY_MISSING,
            RecoveryError::Corrupt(_) => EXIT_RECOVERY_CORRUPT,
            RecoveryError::RunMismatch { .. }
            | RecoveryError::TaskListMismatch
            | RecoveryError::FingerprintMismatch { .. } => EXIT_RECOVERY_MISMATCH,
            RecoveryError::Halted { .. } => EXIT_RECOVERY_HALTED,
        },
        PipelineError::MonitorHalted { .. }
        | PipelineError::DecisionConflict { .. }
        | PipelineError::UnorderedTasks(_)
        | PipelineError::WorkerPool(_) => EXIT_ERROR,
    }
}
