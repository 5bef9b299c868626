// JSON report document: run metadata around the pipeline's FinalReport.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use ledgerscan_pipeline::FinalReport;
use serde::{Deserialize, Serialize};

use crate::error::IoError;
use crate::rundir::{read_json, write_json_atomic};

pub const REPORT_FORMAT: &str = "ledgerscan-report/1";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportMeta {
    pub format: String,
    pub tool_version: String,
    pub generated_at: String,
    pub run_dir: PathBuf,
    /// Run log backing the marking list.
    pub log_file: PathBuf,
    pub sources: BTreeMap<i32, PathBuf>,
    /// Marked output workbook per year.
    pub outputs: BTreeMap<i32, PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportDocument {
    pub meta: ReportMeta,
    pub report: FinalReport,
}

impl ReportDocument {
    pub fn new(
        report: FinalReport,
        run_dir: &Path,
        log_file: &Path,
        sources: BTreeMap<i32, PathBuf>,
        outputs: BTreeMap<i32, PathBuf>,
    ) -> Self {
        Self {
            meta: ReportMeta {
                format: REPORT_FORMAT.to_string(),
                tool_version: env!("CARGO_PKG_VERSION").to_string(),
                generated_at: chrono::Utc::now().to_rfc3339(),
                run_dir: run_dir.to_path_buf(),
                log_file: log_file.to_path_buf(),
                sources,
                outputs,
            },
            report,
        }
    }
}

/// `<output_dir>/ledgerscan_report_<run_id>.json`
pub fn report_path(output_dir: &Path, run_id: &str) -> PathBuf {
    output_dir.join(format!("ledgerscan_report_{run_id}.json"))
}

pub fn write_report(path: &Path, doc: &ReportDocument) -> Result<(), IoError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| IoError::file(parent, e))?;
    }
    write_json_atomic(path, doc)
}

pub fn read_report(path: &Path) -> Result<ReportDocument, IoError> {
    read_json(path)
}
