//! Uncertainty marking.
//!
//! [`UncertainMarker`] is the per-sheet decision trace: every output
//! coordinate the engine touches gets exactly one decision, either a CERTAIN
//! value or a mark. [`MarkingLedger`] accumulates marks for the run and
//! checks them against the run log.

use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::error::PipelineError;
use crate::model::{CellRef, CertainCell, IssueKind, MarkedCell, RawCell};
use crate::runlog::{LogEntry, LogTag};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Certain(i64),
    Marked(IssueKind),
}

pub struct UncertainMarker {
    year: i32,
    sheet: String,
    account_code: u32,
    decisions: BTreeMap<CellRef, Decision>,
    certain: Vec<CertainCell>,
    marks: Vec<MarkedCell>,
}

impl UncertainMarker {
    pub fn new(sheet: &str, year: i32, account_code: u32) -> Self {
        Self {
            year,
            sheet: sheet.to_string(),
            account_code,
            decisions: BTreeMap::new(),
            certain: Vec::new(),
            marks: Vec::new(),
        }
    }

    fn decide(&mut self, cell: CellRef, decision: Decision) -> Result<(), PipelineError> {
        match self.decisions.entry(cell) {
            Entry::Occupied(_) => Err(PipelineError::DecisionConflict {
                sheet: self.sheet.clone(),
                cell,
            }),
            Entry::Vacant(slot) => {
                slot.insert(decision);
                Ok(())
            }
        }
    }

    pub fn accept(&mut self, cell: CellRef, month: Option<u8>, value: i64) -> Result<(), PipelineError> {
        self.decide(cell, Decision::Certain(value))?;
        self.certain.push(CertainCell {
            year: self.year,
            sheet: self.sheet.clone(),
            cell,
            account_code: self.account_code,
            month,
            value,
        });
        Ok(())
    }

    /// Record an UNCERTAIN decision. The output cell at `cell` will be empty.
    pub fn mark(
        &mut self,
        cell: CellRef,
        month: Option<u8>,
        issue: IssueKind,
        detail: impl Into<String>,
        original: &RawCell,
    ) -> Result<(), PipelineError> {
        self.decide(cell, Decision::Marked(issue))?;
        self.marks.push(MarkedCell {
            year: self.year,
            sheet: self.sheet.clone(),
            cell,
            account_code: self.account_code,
            month,
            issue,
            detail: detail.into(),
            original_value: original.display(),
        });
        Ok(())
    }

    pub fn decision(&self, cell: CellRef) -> Option<Decision> {
        self.decisions.get(&cell).copied()
    }

    pub fn into_parts(self) -> (Vec<CertainCell>, Vec<MarkedCell>) {
        (self.certain, self.marks)
    }
}

// ---------------------------------------------------------------------------
// Run-level ledger
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogParity {
    pub marked_cells: usize,
    pub marked_log_entries: usize,
    pub consistent: bool,
}

#[derive(Debug, Default)]
pub struct MarkingLedger {
    marks: Vec<MarkedCell>,
}

impl MarkingLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, marks: impl IntoIterator<Item = MarkedCell>) {
        self.marks.extend(marks);
    }

    pub fn len(&self) -> usize {
        self.marks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.marks.is_empty()
    }

    pub fn marks(&self) -> &[MarkedCell] {
        &self.marks
    }

    pub fn into_marks(self) -> Vec<MarkedCell> {
        self.marks
    }

    /// 1:1 between marks and `marked` log entries, matched on
    /// (sheet, coordinate) as well as count.
    pub fn parity(&self, log: &[LogEntry]) -> LogParity {
        let logged: Vec<&LogEntry> = log.iter().filter(|e| e.tag == LogTag::Marked).collect();
        let marked: BTreeSet<(i32, &str, String)> = self
            .marks
            .iter()
            .map(|m| (m.year, m.sheet.as_str(), m.cell.to_string()))
            .collect();
        let logged_locations: BTreeSet<(i32, &str, String)> = logged
            .iter()
            .filter_map(|e| Some((e.year?, e.sheet.as_deref()?, e.location.clone()?)))
            .collect();

        LogParity {
            marked_cells: self.marks.len(),
            marked_log_entries: logged.len(),
            consistent: self.marks.len() == logged.len() && marked == logged_locations,
        }
    }
}

/// Every (year, sheet, cell) appears at most once across certain values and
/// marks. Returns the first coordinate that violates it.
pub fn find_trace_conflict(certain: &[CertainCell], marks: &[MarkedCell]) -> Option<(i32, String, CellRef)> {
    let mut seen = BTreeSet::new();
    let coords = certain
        .iter()
        .map(|c| (c.year, c.sheet.as_str(), c.cell))
        .chain(marks.iter().map(|m| (m.year, m.sheet.as_str(), m.cell)));
    for (year, sheet, cell) in coords {
        if !seen.insert((year, sheet, cell)) {
            return Some((year, sheet.to_string(), cell));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runlog::LogEntry;

    #[test]
    fn one_decision_per_coordinate() {
        let mut marker = UncertainMarker::new("(10300) 보통예금", 2023, 10300);
        let g5 = CellRef::new(5, 6);
        marker.accept(g5, None, 100).unwrap();
        let err = marker
            .mark(g5, None, IssueKind::LabelMismatch, "x", &RawCell::Empty)
            .unwrap_err();
        assert!(matches!(err, PipelineError::DecisionConflict { .. }));
        assert_eq!(marker.decision(g5), Some(Decision::Certain(100)));

        let (certain, marks) = marker.into_parts();
        assert_eq!(certain.len(), 1);
        assert!(marks.is_empty());
    }

    #[test]
    fn mark_keeps_original_text() {
        let mut marker = UncertainMarker::new("s", 2023, 10300);
        marker
            .mark(CellRef::new(9, 6), Some(1), IssueKind::NonNumeric, "bad", &RawCell::Text("N/A".into()))
            .unwrap();
        let (_, marks) = marker.into_parts();
        assert_eq!(marks[0].original_value, "N/A");
        assert_eq!(marks[0].month, Some(1));
    }

    #[test]
    fn parity_matches_locations() {
        let mut marker = UncertainMarker::new("s", 2023, 10300);
        marker
            .mark(CellRef::new(5, 6), None, IssueKind::LabelMismatch, "", &RawCell::Empty)
            .unwrap();
        let (_, marks) = marker.into_parts();
        let mut ledger = MarkingLedger::new();
        ledger.extend(marks);

        let entry = LogEntry::marked_for_test(2023, "s", "G5");
        assert!(ledger.parity(&[entry.clone()]).consistent);

        let elsewhere = LogEntry::marked_for_test(2023, "s", "G6");
        let p = ledger.parity(&[elsewhere]);
        assert_eq!(p.marked_log_entries, 1);
        assert!(!p.consistent);

        assert!(!ledger.parity(&[entry.clone(), entry]).consistent);
    }

    #[test]
    fn trace_conflict_across_tasks() {
        let certain = vec![CertainCell {
            year: 2023,
            sheet: "s".into(),
            cell: CellRef::new(5, 6),
            account_code: 1,
            month: None,
            value: 1,
        }];
        let marks = vec![MarkedCell {
            year: 2023,
            sheet: "s".into(),
            cell: CellRef::new(5, 6),
            account_code: 1,
            month: None,
            issue: IssueKind::EmptyValue,
            detail: String::new(),
            original_value: String::new(),
        }];
        assert!(find_trace_conflict(&certain, &[]).is_none());
        assert!(find_trace_conflict(&certain, &marks).is_some());
    }
}
