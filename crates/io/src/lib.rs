//! Filesystem side of ledgerscan: ledger workbook
//! import, marked output export, the run directory with its checkpoint store
//! and JSONL run log, the JSON report document and post-run verification.

pub mod error;
pub mod output;
pub mod report;
pub mod rundir;
pub mod verify;
pub mod workbook;

pub use error::IoError;
pub use output::{output_path, write_output, OutputStats};
pub use report::{read_report, report_path, write_report, ReportDocument};
pub use rundir::{new_run_id, FileCheckpointStore, JsonlLogSink, Manifest, RunDir};
pub use verify::{verify_report_file, Verification};
pub use workbook::{fingerprint_sources, WorkbookSource};
