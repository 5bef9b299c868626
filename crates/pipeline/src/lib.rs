//! `ledgerscan-pipeline`: ledger extraction and validation engine.
//!
//! Pure engine crate: receives loaded sheets through [`SheetSource`], returns
//! a [`FinalReport`]. Durable storage, workbook parsing and HTTP live in the
//! sibling crates and plug in through the traits exported here.

pub mod accounts;
pub mod analysis;
pub mod checkpoint;
pub mod classify;
pub mod config;
pub mod error;
pub mod extract;
pub mod marker;
pub mod model;
pub mod monitor;
pub mod orchestrator;
pub mod report;
pub mod runlog;

pub use analysis::{Judgment, PatternAnalysisClient, TransactionRecord};
pub use checkpoint::{Checkpoint, CheckpointRecoveryManager, CheckpointStore};
pub use config::PipelineConfig;
pub use error::{PipelineError, RecoveryError};
pub use extract::ExtractionEngine;
pub use model::{AccountTask, ExtractedBalance, LedgerSheet, MarkedCell, RawCell};
pub use monitor::ContaminationMonitor;
pub use orchestrator::{SheetSource, StreamingOrchestrator};
pub use report::FinalReport;
pub use runlog::{LogSink, RunLog};
