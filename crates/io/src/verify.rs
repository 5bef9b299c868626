//! Re-check a finished run from its artifacts alone: the report document, the
//! run log it references and the marked output workbooks.

use std::collections::BTreeMap;
use std::path::Path;

use calamine::Reader;
use ledgerscan_pipeline::marker::{find_trace_conflict, MarkingLedger};
use ledgerscan_pipeline::model::CellRef;
use ledgerscan_pipeline::report::RunStatus;
use ledgerscan_pipeline::RawCell;
use serde::Serialize;

use crate::error::IoError;
use crate::report::{read_report, ReportDocument};
use crate::rundir::read_log;
use crate::workbook;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Check {
    pub name: &'static str,
    pub passed: bool,
    pub detail: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Verification {
    pub run_id: String,
    pub checks: Vec<Check>,
}

impl Verification {
    pub fn passed(&self) -> bool {
        self.checks.iter().all(|c| c.passed)
    }

    pub fn failures(&self) -> impl Iterator<Item = &Check> {
        self.checks.iter().filter(|c| !c.passed)
    }
}

fn check(name: &'static str, passed: bool, detail: impl Into<String>) -> Check {
    Check {
        name,
        passed,
        detail: detail.into(),
    }
}

pub fn verify_report_file(path: &Path, strict: bool) -> Result<Verification, IoError> {
    let doc = read_report(path)?;
    verify_document(&doc, strict)
}

/// Structural problems in the artifacts are failed checks, not errors; only
/// an unreadable report is an `Err`.
pub fn verify_document(doc: &ReportDocument, strict: bool) -> Result<Verification, IoError> {
    let report = &doc.report;
    let mut checks = Vec::new();

    checks.push(match find_trace_conflict(&report.certain, &report.marks) {
        None => check(
            "decision_trace",
            true,
            format!("{} certain, {} marked", report.certain.len(), report.marks.len()),
        ),
        Some((year, sheet, cell)) => check(
            "decision_trace",
            false,
            format!("{year} {sheet}!{cell} is both written and marked"),
        ),
    });

    checks.push(match read_log(&doc.meta.log_file) {
        Ok(entries) => {
            let mut ledger = MarkingLedger::new();
            ledger.extend(report.marks.iter().cloned());
            let parity = ledger.parity(&entries);
            check(
                "log_parity",
                parity.consistent,
                format!(
                    "{} marked cells, {} marked log entries",
                    parity.marked_cells, parity.marked_log_entries
                ),
            )
        }
        Err(e) => check("log_parity", false, e.to_string()),
    });

    for (year, path) in &doc.meta.outputs {
        checks.push(match check_output(doc, *year, path) {
            Ok(problems) if problems.is_empty() => check("output_cells", true, format!("{year}: {}", path.display())),
            Ok(problems) => check(
                "output_cells",
                false,
                format!("{year}: {} problem(s), first: {}", problems.len(), problems[0]),
            ),
            Err(e) => check("output_cells", false, e.to_string()),
        });
    }

    let clean = report.status == RunStatus::Completed && !report.contamination.detected;
    checks.push(check(
        "contamination",
        clean,
        match &report.contamination.alert {
            Some(alert) => format!(
                "{} in account {} ({}-{:02}): {}",
                alert.kind, alert.account_code, alert.year, alert.month, alert.evidence
            ),
            None => "none detected".to_string(),
        },
    ));

    if strict {
        checks.push(check(
            "structural_errors",
            report.structural_errors.is_empty(),
            format!("{} unresolved", report.structural_errors.len()),
        ));
    }

    Ok(Verification {
        run_id: report.run_id.clone(),
        checks,
    })
}

/// Certain cells must hold their value; marked cells must be empty.
fn check_output(doc: &ReportDocument, year: i32, path: &Path) -> Result<Vec<String>, IoError> {
    let report = &doc.report;
    let mut expected: BTreeMap<&str, Vec<(CellRef, Option<i64>)>> = BTreeMap::new();
    for c in report.certain.iter().filter(|c| c.year == year) {
        expected.entry(c.sheet.as_str()).or_default().push((c.cell, Some(c.value)));
    }
    for m in report.marks.iter().filter(|m| m.year == year) {
        expected.entry(m.sheet.as_str()).or_default().push((m.cell, None));
    }

    let mut book = workbook::open(path)?;
    let names = book.sheet_names();
    let mut problems = Vec::new();
    for (sheet, cells) in expected {
        if !names.iter().any(|n| n == sheet) {
            problems.push(format!("sheet '{sheet}' missing"));
            continue;
        }
        let rows = workbook::read_sheet(&mut book, path, sheet)?;
        for (cell, value) in cells {
            let actual = rows
                .get(cell.row as usize - 1)
                .and_then(|r| r.get(cell.col as usize))
                .unwrap_or(&RawCell::Empty);
            match (value, actual) {
                (None, a) if a.is_blank() => {}
                (None, a) => problems.push(format!("{sheet}!{cell} should be empty, holds {}", a.display())),
                (Some(v), RawCell::Number(n)) if *n == v as f64 => {}
                (Some(v), a) => problems.push(format!("{sheet}!{cell} should hold {v}, holds '{}'", a.display())),
            }
        }
    }
    Ok(problems)
}
