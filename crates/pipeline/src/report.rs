use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::marker::{LogParity, MarkingLedger};
use crate::model::{
    CertainCell, ContaminationAlert, ExtractedBalance, MarkedCell, StructuralErrorRecord, TaskOutcome, TaskResult,
};
use crate::runlog::LogEntry;

// ---------------------------------------------------------------------------
// Report types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    Halted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContaminationStatus {
    pub detected: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alert: Option<ContaminationAlert>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportSummary {
    pub tasks_planned: usize,
    pub tasks_processed: usize,
    pub tasks_extracted: usize,
    pub tasks_failed: usize,
    /// Planned but never started because the run halted.
    pub tasks_not_started: usize,
    pub certain_values: usize,
    pub marked_cells: usize,
    pub accounts_with_marks: usize,
    pub analysis_uncertain: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Integrity {
    Intact,
    Compromised,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityMetrics {
    pub score: i32,
    pub grade: char,
    pub integrity: Integrity,
    pub processing_accuracy_pct: f64,
}

/// Everything a run produced, in task order. Contains no wall-clock data so
/// that an interrupted-and-resumed run compares equal to an uninterrupted one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalReport {
    pub run_id: String,
    pub status: RunStatus,
    pub source_fingerprint: String,
    pub summary: ReportSummary,
    pub balances: Vec<ExtractedBalance>,
    /// Decision trace: every value written to the output.
    pub certain: Vec<CertainCell>,
    pub marks: Vec<MarkedCell>,
    pub structural_errors: Vec<StructuralErrorRecord>,
    pub contamination: ContaminationStatus,
    pub parity: LogParity,
    pub quality: QualityMetrics,
    pub recommendations: Vec<String>,
}

pub struct ReportInput<'a> {
    pub run_id: &'a str,
    pub source_fingerprint: &'a str,
    pub tasks_planned: usize,
    pub results: &'a [TaskResult],
    /// Sheets that never became tasks (no account code).
    pub sheet_errors: &'a [StructuralErrorRecord],
    pub alert: Option<&'a ContaminationAlert>,
    pub log: &'a [LogEntry],
}

impl FinalReport {
    pub fn build(input: ReportInput<'_>) -> Self {
        let mut balances = Vec::new();
        let mut certain = Vec::new();
        let mut ledger = MarkingLedger::new();
        let mut structural_errors: Vec<StructuralErrorRecord> = input.sheet_errors.to_vec();

        for result in input.results {
            match &result.outcome {
                TaskOutcome::Extracted(x) => {
                    balances.push(x.balance.clone());
                    certain.extend(x.certain.iter().cloned());
                    ledger.extend(x.marks.iter().cloned());
                }
                TaskOutcome::Failed(record) => structural_errors.push(record.clone()),
            }
        }

        let parity = ledger.parity(input.log);
        let marks = ledger.into_marks();
        let tasks_failed = input
            .results
            .iter()
            .filter(|r| matches!(r.outcome, TaskOutcome::Failed(_)))
            .count();
        let accounts_with_marks = marks
            .iter()
            .map(|m| (m.year, m.account_code))
            .collect::<BTreeSet<_>>()
            .len();
        let analysis_accounts = marks
            .iter()
            .filter(|m| m.issue.is_analysis())
            .map(|m| (m.year, m.account_code))
            .collect::<BTreeSet<_>>()
            .len();
        let analysis_uncertain = marks.iter().filter(|m| m.issue.is_analysis()).count();
        let halted = input.alert.is_some();
        // The halting task is neither recorded nor counted as processed.
        let processed = input.results.len();

        let summary = ReportSummary {
            tasks_planned: input.tasks_planned,
            tasks_processed: processed,
            tasks_extracted: processed - tasks_failed,
            tasks_failed,
            tasks_not_started: if halted {
                input.tasks_planned.saturating_sub(processed + 1)
            } else {
                input.tasks_planned.saturating_sub(processed)
            },
            certain_values: certain.len(),
            marked_cells: marks.len(),
            accounts_with_marks,
            analysis_uncertain,
        };

        let quality = quality_metrics(marks.len(), analysis_uncertain, halted, summary.tasks_extracted, analysis_accounts);
        let recommendations = recommendations(&summary, &structural_errors, halted, quality.score);

        Self {
            run_id: input.run_id.to_string(),
            status: if halted { RunStatus::Halted } else { RunStatus::Completed },
            source_fingerprint: input.source_fingerprint.to_string(),
            summary,
            balances,
            certain,
            marks,
            structural_errors,
            contamination: ContaminationStatus {
                detected: halted,
                alert: input.alert.cloned(),
            },
            parity,
            quality,
            recommendations,
        }
    }

    /// Zero contamination and zero unresolved structural errors.
    pub fn is_clean(&self) -> bool {
        self.status == RunStatus::Completed && !self.contamination.detected && self.structural_errors.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Quality
// ---------------------------------------------------------------------------

/// 100 minus penalties: 2 per marked cell (max 30), 5 per analysis-uncertain
/// cell (max 25), 40 on contamination. Grade is taken before clamping at 0.
pub fn quality_metrics(
    marked: usize,
    analysis_uncertain: usize,
    contaminated: bool,
    accounts: usize,
    analysis_accounts: usize,
) -> QualityMetrics {
    let mut score: i32 = 100;
    score -= (marked as i32).saturating_mul(2).min(30);
    score -= (analysis_uncertain as i32).saturating_mul(5).min(25);
    if contaminated {
        score -= 40;
    }
    let grade = match score {
        s if s >= 90 => 'A',
        s if s >= 80 => 'B',
        s if s >= 70 => 'C',
        _ => 'D',
    };
    let accuracy = accounts.saturating_sub(analysis_accounts) as f64 / accounts.max(1) as f64 * 100.0;

    QualityMetrics {
        score: score.max(0),
        grade,
        integrity: if contaminated {
            Integrity::Compromised
        } else {
            Integrity::Intact
        },
        processing_accuracy_pct: (accuracy * 100.0).round() / 100.0,
    }
}

fn recommendations(
    summary: &ReportSummary,
    structural_errors: &[StructuralErrorRecord],
    halted: bool,
    score: i32,
) -> Vec<String> {
    let mut out = Vec::new();
    if summary.marked_cells > 10 {
        out.push(format!(
            "{} cells are marked uncertain; review data quality in the output workbook",
            summary.marked_cells
        ));
    }
    if summary.analysis_uncertain > 5 {
        out.push(format!(
            "{} values lack a confident pattern-analysis judgment; manual review recommended",
            summary.analysis_uncertain
        ));
    }
    if halted {
        out.push(
            "Contamination detected: restore the source workbook from backup and review the affected accounts before re-running"
                .to_string(),
        );
    }
    if score < 80 {
        out.push(format!("Quality score is {score}; additional verification is needed"));
    }
    if !structural_errors.is_empty() {
        out.push(format!(
            "{} sheet(s) failed structural validation; check the listed accounts",
            structural_errors.len()
        ));
    }
    if out.is_empty() {
        out.push("All checks passed".to_string());
    }
    out
}
