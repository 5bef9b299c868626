//! Ledger extraction.
//!
//! One sheet in, one [`SheetExtraction`] (or a [`StructuralErrorRecord`]) out.
//! Positional rules only: the carry-forward pair on a fixed row, month
//! context from `MM-DD` dates, and month-end balances read from the last
//! transaction row before each month-total row. PL accounts additionally get
//! monthly activity (debit minus credit). Every candidate goes through the
//! [`CellClassifier`]; anything not CERTAIN is marked and omitted.

use std::collections::BTreeMap;

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::debug;

use crate::accounts::{classify_account, parse_account_code, AccountKind};
use crate::analysis::{analyze_with_retry, AnalysisOutcome, PatternAnalysisClient, RetryPolicy, TransactionRecord};
use crate::classify::{parse_numeric, CellClassifier, Classification, FieldKind, Numeric, SemanticEvidence};
use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::marker::UncertainMarker;
use crate::model::{
    AccountTask, CellRef, ExtractedBalance, IssueKind, LedgerSheet, RawCell, SheetExtraction, StructuralErrorRecord,
    StructuralKind,
};

static MONTH_DAY: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(\d{1,2})-(\d{1,2})$").expect("static regex"));

/// Month of an `MM-DD` date cell, if it is one.
pub fn parse_month(cell: &RawCell) -> Option<u8> {
    let text = cell.as_text()?.trim();
    let caps = MONTH_DAY.captures(text)?;
    let month: u8 = caps[1].parse().ok()?;
    let day: u8 = caps[2].parse().ok()?;
    ((1..=12).contains(&month) && (1..=31).contains(&day)).then_some(month)
}

/// Description text with whitespace and the `[ ]` decoration removed, so
/// `[ 월         계 ]` compares equal to `월계`.
fn marker_text(s: &str) -> String {
    s.chars()
        .filter(|c| !c.is_whitespace() && !matches!(c, '[' | ']'))
        .collect()
}

/// A month closed by a month-total row.
#[derive(Debug)]
struct ClosedMonth {
    month: u8,
    marker_row: u32,
    /// Balance cell of the last transaction row before the marker.
    candidate: Option<CellRef>,
    records: Vec<TransactionRecord>,
}

/// Rows that make up one month's activity.
#[derive(Debug)]
struct ActivitySpan {
    month: u8,
    /// `None` when the month ended without a month-total row.
    total_row: Option<u32>,
    /// Dated rows inside the month.
    rows: Vec<u32>,
}

#[derive(Debug, Default)]
struct MonthScan {
    closed: Vec<ClosedMonth>,
    activity: Vec<ActivitySpan>,
}

pub struct ExtractionEngine<'a> {
    config: &'a PipelineConfig,
    classifier: CellClassifier,
    analysis: Option<&'a dyn PatternAnalysisClient>,
    retry: RetryPolicy,
}

impl<'a> ExtractionEngine<'a> {
    pub fn new(config: &'a PipelineConfig, analysis: Option<&'a dyn PatternAnalysisClient>) -> Self {
        Self {
            config,
            classifier: CellClassifier,
            analysis,
            retry: RetryPolicy::from_config(&config.analysis),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Parse one account sheet. The sheet is only read.
    pub fn extract(&self, sheet: &LedgerSheet) -> Result<SheetExtraction, StructuralErrorRecord> {
        let failure = |task: Option<AccountTask>, kind: StructuralKind, detail: String| StructuralErrorRecord {
            task,
            sheet: Some(sheet.name().to_string()),
            kind,
            detail,
        };

        let Some(code) = parse_account_code(sheet.name()) else {
            return Err(failure(
                None,
                StructuralKind::UnparseableAccountCode,
                format!("no '(digits)' group in sheet name '{}'", sheet.name()),
            ));
        };
        let task = Some(AccountTask::new(sheet.year(), code));

        let layout = &self.config.layout;
        if sheet.width() < layout.required_width() {
            return Err(failure(
                task,
                StructuralKind::MissingColumns,
                format!(
                    "sheet has {} column(s); balance column {} required",
                    sheet.width(),
                    layout.balance_column
                ),
            ));
        }
        if sheet.height() < layout.carry_forward_row {
            return Err(failure(
                task,
                StructuralKind::SheetTooShort,
                format!("sheet has {} row(s); carry-forward row is {}", sheet.height(), layout.carry_forward_row),
            ));
        }

        let mut marker = UncertainMarker::new(sheet.name(), sheet.year(), code);
        let mut balance = ExtractedBalance::empty(code, sheet.year());

        self.extract_carry_forward(sheet, code, &mut marker, &mut balance)
            .map_err(|e| failure(task, StructuralKind::DecisionConflict, e.to_string()))?;

        let scan = self.scan_months(sheet, code);
        self.resolve_months(sheet, code, scan.closed, &mut marker, &mut balance)
            .map_err(|e| failure(task, StructuralKind::DecisionConflict, e.to_string()))?;
        if classify_account(code, &self.config.accounts) == AccountKind::Pl {
            self.resolve_activity(sheet, code, &scan.activity, &mut marker, &mut balance)
                .map_err(|e| failure(task, StructuralKind::DecisionConflict, e.to_string()))?;
        }

        let (certain, marks) = marker.into_parts();
        Ok(SheetExtraction {
            sheet: sheet.name().to_string(),
            balance,
            certain,
            marks,
        })
    }

    fn extract_carry_forward(
        &self,
        sheet: &LedgerSheet,
        code: u32,
        marker: &mut UncertainMarker,
        balance: &mut ExtractedBalance,
    ) -> Result<(), PipelineError> {
        let layout = &self.config.layout;
        let row = layout.carry_forward_row;
        let label = sheet.cell(CellRef::new(row, layout.description_column.0));
        let at = CellRef::new(row, layout.balance_column.0);
        let raw = sheet.cell(at);

        let field = FieldKind::CarryForward {
            label,
            expected: &self.config.markers.carry_forward,
        };
        match self.classifier.classify(sheet.contains(at).then_some(raw), code, field) {
            Classification::Certain(v) => {
                marker.accept(at, None, v)?;
                balance.carry_forward = Some(v);
            }
            Classification::Uncertain { issue, detail } => {
                marker.mark(at, None, issue, detail, raw)?;
            }
            // Width and height were checked before; nothing to record.
            Classification::StructuralError(detail) => {
                debug!(sheet = sheet.name(), %detail, "carry-forward cell outside sheet");
            }
        }
        Ok(())
    }

    /// Walk the rows after the carry-forward row and collect every month
    /// closed by a month-total row, plus the row spans for activity.
    fn scan_months(&self, sheet: &LedgerSheet, code: u32) -> MonthScan {
        let layout = &self.config.layout;
        let month_total = marker_text(&self.config.markers.month_total);
        let cumulative = marker_text(&self.config.markers.cumulative_total);

        let mut scan = MonthScan::default();
        let mut current: Option<u8> = None;
        let mut last_txn: Option<u32> = None;
        let mut records: Vec<TransactionRecord> = Vec::new();
        let mut dated: Vec<u32> = Vec::new();

        for row in layout.carry_forward_row + 1..=sheet.height() {
            let description = marker_text(&sheet.cell(CellRef::new(row, layout.description_column.0)).display());

            if description == month_total {
                match current.take() {
                    Some(month) => {
                        scan.closed.push(ClosedMonth {
                            month,
                            marker_row: row,
                            candidate: last_txn.map(|r| CellRef::new(r, layout.balance_column.0)),
                            records: std::mem::take(&mut records),
                        });
                        scan.activity.push(ActivitySpan {
                            month,
                            total_row: Some(row),
                            rows: std::mem::take(&mut dated),
                        });
                    }
                    None => debug!(sheet = sheet.name(), row, "month-total row without month context"),
                }
                last_txn = None;
                records.clear();
                dated.clear();
                continue;
            }
            if !cumulative.is_empty() && description == cumulative {
                continue;
            }

            if let Some(month) = parse_month(sheet.cell(CellRef::new(row, layout.date_column.0))) {
                if let Some(previous) = current.filter(|&m| m != month) {
                    scan.activity.push(ActivitySpan {
                        month: previous,
                        total_row: None,
                        rows: std::mem::take(&mut dated),
                    });
                }
                current = Some(month);
                dated.push(row);
            }

            let balance_cell = sheet.cell(CellRef::new(row, layout.balance_column.0));
            if current.is_some() && !balance_cell.is_blank() {
                last_txn = Some(row);
                records.push(self.transaction_record(sheet, row, code));
            }
        }

        if let Some(month) = current {
            debug!(sheet = sheet.name(), month, "month never closed by a month-total row; balance omitted");
            scan.activity.push(ActivitySpan {
                month,
                total_row: None,
                rows: dated,
            });
        }
        scan
    }

    fn transaction_record(&self, sheet: &LedgerSheet, row: u32, code: u32) -> TransactionRecord {
        let layout = &self.config.layout;
        let text = |col: u16| sheet.cell(CellRef::new(row, col)).display().trim().to_string();
        let amount_of = |col: u16| match parse_numeric(sheet.cell(CellRef::new(row, col))) {
            Numeric::Integer(v) => Some(v),
            _ => None,
        };
        let amount = amount_of(layout.debit_column.0)
            .filter(|v| *v != 0)
            .or_else(|| amount_of(layout.credit_column.0))
            .unwrap_or(0);

        TransactionRecord {
            counterpart: text(layout.counterpart_column.0),
            amount,
            description: text(layout.description_column.0),
            account_code: code,
        }
    }

    fn resolve_months(
        &self,
        sheet: &LedgerSheet,
        code: u32,
        closed: Vec<ClosedMonth>,
        marker: &mut UncertainMarker,
        balance: &mut ExtractedBalance,
    ) -> Result<(), PipelineError> {
        let mut occurrences: BTreeMap<u8, usize> = BTreeMap::new();
        for c in &closed {
            *occurrences.entry(c.month).or_default() += 1;
        }

        let semantic = classify_account(code, &self.config.accounts) == AccountKind::Vat;
        let outcome = if semantic {
            Some(self.judge(&closed))
        } else {
            None
        };

        // Judgments come back flat; walk them month by month.
        let mut offset = 0usize;
        for month in &closed {
            let judged_range = offset..offset + month.records.len();
            offset = judged_range.end;

            let Some(at) = month.candidate else {
                debug!(
                    sheet = sheet.name(),
                    month = month.month,
                    row = month.marker_row,
                    "no transaction before month-total row; month omitted"
                );
                continue;
            };
            let raw = sheet.cell(at);

            if occurrences.get(&month.month).copied().unwrap_or(0) > 1 {
                marker.mark(
                    at,
                    Some(month.month),
                    IssueKind::DuplicateMonth,
                    format!("month {} is closed more than once", month.month),
                    raw,
                )?;
                continue;
            }

            let field = match &outcome {
                None => FieldKind::Numeric,
                Some(AnalysisOutcome::Judged(judgments)) => FieldKind::Semantic(SemanticEvidence::Judged {
                    judgments: &judgments[judged_range],
                    floor: self.config.analysis.confidence_floor,
                }),
                Some(AnalysisOutcome::Unavailable { reason, .. }) => {
                    FieldKind::Semantic(SemanticEvidence::Unavailable { reason: reason.as_str() })
                }
            };

            match self.classifier.classify(sheet.contains(at).then_some(raw), code, field) {
                Classification::Certain(v) => {
                    marker.accept(at, Some(month.month), v)?;
                    balance.monthly.insert(month.month, v);
                }
                Classification::Uncertain { issue, detail } => {
                    marker.mark(at, Some(month.month), issue, detail, raw)?;
                }
                Classification::StructuralError(detail) => {
                    debug!(sheet = sheet.name(), %detail, "month-end cell outside sheet");
                }
            }
        }
        Ok(())
    }

    /// Debit minus credit per month. The month-total row's own debit and
    /// credit cells are used when it carries any; otherwise the dated rows of
    /// the month are summed. A month with any non-CERTAIN amount is omitted,
    /// as is a month that appears in more than one span.
    fn resolve_activity(
        &self,
        sheet: &LedgerSheet,
        code: u32,
        spans: &[ActivitySpan],
        marker: &mut UncertainMarker,
        balance: &mut ExtractedBalance,
    ) -> Result<(), PipelineError> {
        let layout = &self.config.layout;
        let debit = layout.debit_column.0;
        let credit = layout.credit_column.0;

        let mut occurrences: BTreeMap<u8, usize> = BTreeMap::new();
        for span in spans {
            *occurrences.entry(span.month).or_default() += 1;
        }

        for span in spans {
            if occurrences.get(&span.month).copied().unwrap_or(0) > 1 {
                debug!(sheet = sheet.name(), month = span.month, "month split across blocks; activity omitted");
                continue;
            }

            let totals = span.total_row.filter(|&row| {
                !sheet.cell(CellRef::new(row, debit)).is_blank() || !sheet.cell(CellRef::new(row, credit)).is_blank()
            });
            let rows = match totals {
                Some(row) => vec![row],
                None => span.rows.clone(),
            };

            let mut net: i64 = 0;
            let mut readable = true;
            for row in rows {
                for col in [debit, credit] {
                    let at = CellRef::new(row, col);
                    let raw = sheet.cell(at);
                    if raw.is_blank() {
                        continue;
                    }
                    match self.classifier.classify(sheet.contains(at).then_some(raw), code, FieldKind::Numeric) {
                        Classification::Certain(v) => {
                            marker.accept(at, Some(span.month), v)?;
                            net = if col == debit { net.saturating_add(v) } else { net.saturating_sub(v) };
                        }
                        Classification::Uncertain { issue, detail } => {
                            marker.mark(at, Some(span.month), issue, detail, raw)?;
                            readable = false;
                        }
                        Classification::StructuralError(detail) => {
                            debug!(sheet = sheet.name(), %detail, "activity cell outside sheet");
                            readable = false;
                        }
                    }
                }
            }

            if readable && net != 0 {
                balance.activity.insert(span.month, net);
            }
        }
        Ok(())
    }

    /// One batch per sheet holding the records of every closed month.
    fn judge(&self, closed: &[ClosedMonth]) -> AnalysisOutcome {
        let records: Vec<TransactionRecord> = closed.iter().flat_map(|c| c.records.iter().cloned()).collect();
        if records.is_empty() {
            return AnalysisOutcome::Judged(Vec::new());
        }
        analyze_with_retry(self.analysis, &records, self.retry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::{Confidence, Judgment, StubAnalysisClient};
    use std::time::Duration;

    fn t(s: &str) -> RawCell {
        RawCell::Text(s.into())
    }

    fn n(v: f64) -> RawCell {
        RawCell::Number(v)
    }

    fn e() -> RawCell {
        RawCell::Empty
    }

    /// Header rows 1-4, carry-forward on row 5, then the given body rows.
    fn sheet(name: &str, label: RawCell, carry: RawCell, body: Vec<Vec<RawCell>>) -> LedgerSheet {
        let mut rows = vec![
            vec![t("일자"), t("적요"), t("코드"), t("거래처"), t("차변"), t("대변"), t("잔액")],
            vec![e(); 7],
            vec![e(); 7],
            vec![e(); 7],
            vec![e(), label, e(), e(), e(), e(), carry],
        ];
        rows.extend(body);
        LedgerSheet::new(name, 2023, rows)
    }

    fn txn(date: &str, desc: &str, debit: f64, balance: f64) -> Vec<RawCell> {
        vec![t(date), t(desc), e(), t("(주)거래처"), n(debit), e(), n(balance)]
    }

    fn month_total() -> Vec<RawCell> {
        vec![e(), t("[ 월         계 ]"), e(), e(), n(1.0), e(), e()]
    }

    fn cumulative() -> Vec<RawCell> {
        vec![e(), t("[ 누         계 ]"), e(), e(), e(), e(), e()]
    }

    fn engine(config: &PipelineConfig) -> ExtractionEngine<'_> {
        ExtractionEngine::new(config, None)
    }

    #[test]
    fn month_recognition() {
        assert_eq!(parse_month(&t("01-15")), Some(1));
        assert_eq!(parse_month(&t("12-31")), Some(12));
        assert_eq!(parse_month(&t("13-01")), None);
        assert_eq!(parse_month(&t("2023-01-05")), None);
        assert_eq!(parse_month(&n(1.0)), None);
    }

    #[test]
    fn carry_forward_and_month_end() {
        let config = PipelineConfig::default();
        let s = sheet(
            "(10300) 보통예금",
            t("전기이월"),
            n(371554641.0),
            vec![
                txn("01-05", "입금", 100.0, 16_000_000.0),
                txn("01-28", "입금", 100.0, 17_015_929.0),
                month_total(),
                cumulative(),
                txn("02-03", "출금", 100.0, 15_000_000.0),
                month_total(),
                cumulative(),
            ],
        );
        let out = engine(&config).extract(&s).unwrap();
        assert_eq!(out.balance.carry_forward, Some(371554641));
        assert_eq!(out.balance.monthly.get(&1), Some(&17_015_929));
        assert_eq!(out.balance.monthly.get(&2), Some(&15_000_000));
        assert!(out.marks.is_empty());
        // G5 + two month ends
        assert_eq!(out.certain.len(), 3);
        assert_eq!(out.certain[1].cell, CellRef::parse("G7").unwrap());
        // balance-sheet accounts carry no activity
        assert!(out.balance.activity.is_empty());
    }

    #[test]
    fn month_words_in_descriptions_do_not_close_the_month() {
        let config = PipelineConfig::default();
        let s = sheet(
            "(10300) 보통예금",
            t("전기이월"),
            n(1.0),
            vec![
                txn("05-03", "5월 계좌이체", 500.0, 500.0),
                month_total(),
                txn("06-02", "입금", 1000.0, 1000.0),
                txn("06-15", "6월 계약금 입금", 1000.0, 2000.0),
                txn("06-30", "입금", 1000.0, 3000.0),
                month_total(),
                cumulative(),
            ],
        );
        let out = engine(&config).extract(&s).unwrap();
        assert_eq!(out.balance.monthly.get(&5), Some(&500));
        assert_eq!(out.balance.monthly.get(&6), Some(&3000));
        assert!(out.marks.is_empty());
    }

    #[test]
    fn marker_text_drops_brackets_and_spacing() {
        assert_eq!(marker_text("[ 월         계 ]"), "월계");
        assert_eq!(marker_text("월계"), "월계");
        assert_eq!(marker_text("6월 계약금"), "6월계약금");
    }

    fn pl_row(date: &str, debit: Option<f64>, credit: Option<f64>, balance: Option<f64>) -> Vec<RawCell> {
        let amount = |v: Option<f64>| v.map(n).unwrap_or(RawCell::Empty);
        vec![t(date), t("매출"), e(), t("(주)고객"), amount(debit), amount(credit), amount(balance)]
    }

    fn totals_row(debit: RawCell, credit: RawCell) -> Vec<RawCell> {
        vec![e(), t("[ 월         계 ]"), e(), e(), debit, credit, e()]
    }

    #[test]
    fn pl_activity_per_month() {
        let config = PipelineConfig::default();
        let s = sheet(
            "(40100) 상품매출",
            t("전기이월"),
            n(0.0),
            vec![
                pl_row("01-05", None, Some(500.0), Some(500.0)),
                pl_row("01-20", Some(300.0), Some(1000.0), Some(1200.0)),
                totals_row(n(300.0), n(1500.0)),
                cumulative(),
                pl_row("02-03", Some(100.0), None, Some(1100.0)),
                pl_row("02-17", None, Some(40.0), Some(1140.0)),
                // no amounts on the month-total row: the dated rows are summed
                totals_row(e(), e()),
                // never closed
                pl_row("03-02", Some(70.0), None, Some(1070.0)),
            ],
        );
        let out = engine(&config).extract(&s).unwrap();
        assert!(out.marks.is_empty());

        let activity: Vec<(u8, i64)> = out.balance.activity.iter().map(|(m, v)| (*m, *v)).collect();
        assert_eq!(activity, vec![(1, -1200), (2, 60), (3, 70)]);
        // month-end balances are unaffected
        assert_eq!(out.balance.monthly.get(&1), Some(&1200));
        assert_eq!(out.balance.monthly.get(&2), Some(&1140));
        assert_eq!(out.balance.monthly.get(&3), None);

        let cells: Vec<String> = out.certain.iter().map(|c| c.cell.to_string()).collect();
        assert_eq!(cells, vec!["G5", "G7", "G11", "E8", "F8", "E10", "F11", "E13"]);
    }

    #[test]
    fn unreadable_activity_is_marked() {
        let config = PipelineConfig::default();
        let s = sheet(
            "(40100) 상품매출",
            t("전기이월"),
            n(0.0),
            vec![
                pl_row("04-01", Some(10.0), None, Some(10.0)),
                totals_row(n(10.0), t("확인")),
            ],
        );
        let out = engine(&config).extract(&s).unwrap();
        assert!(out.balance.activity.is_empty());
        assert_eq!(out.balance.monthly.get(&4), Some(&10));
        assert_eq!(out.marks.len(), 1);
        assert_eq!(out.marks[0].cell.to_string(), "F7");
        assert_eq!(out.marks[0].issue, IssueKind::NonNumeric);
        assert_eq!(out.marks[0].month, Some(4));
    }

    #[test]
    fn month_total_without_transactions_is_omitted() {
        let config = PipelineConfig::default();
        let s = sheet(
            "(10300) 보통예금",
            t("전기이월"),
            n(1.0),
            vec![
                vec![t("03-01"), t("메모"), e(), e(), e(), e(), e()],
                month_total(),
            ],
        );
        let out = engine(&config).extract(&s).unwrap();
        assert!(out.balance.monthly.is_empty());
        assert!(out.marks.is_empty());
    }

    #[test]
    fn unclosed_month_is_omitted() {
        let config = PipelineConfig::default();
        let s = sheet(
            "(10300) 보통예금",
            t("전기이월"),
            n(1.0),
            vec![txn("04-01", "입금", 1.0, 500.0)],
        );
        let out = engine(&config).extract(&s).unwrap();
        assert!(out.balance.monthly.is_empty());
    }

    #[test]
    fn mismatched_label_marks_g5() {
        let config = PipelineConfig::default();
        let s = sheet("(10300) 보통예금", t("이월잔액"), n(371554641.0), vec![]);
        let out = engine(&config).extract(&s).unwrap();
        assert_eq!(out.balance.carry_forward, None);
        assert_eq!(out.marks.len(), 1);
        assert_eq!(out.marks[0].issue, IssueKind::LabelMismatch);
        assert_eq!(out.marks[0].cell.to_string(), "G5");
        assert_eq!(out.marks[0].original_value, "371554641");
    }

    #[test]
    fn non_numeric_month_end_is_marked() {
        let config = PipelineConfig::default();
        let mut bad = txn("01-10", "입금", 1.0, 0.0);
        bad[6] = t("확인필요");
        let s = sheet("(10300) 보통예금", t("전기이월"), n(1.0), vec![bad, month_total()]);
        let out = engine(&config).extract(&s).unwrap();
        assert!(out.balance.monthly.is_empty());
        assert_eq!(out.marks.len(), 1);
        assert_eq!(out.marks[0].issue, IssueKind::NonNumeric);
        assert_eq!(out.marks[0].month, Some(1));
    }

    #[test]
    fn repeated_month_is_marked_twice() {
        let config = PipelineConfig::default();
        let s = sheet(
            "(10300) 보통예금",
            t("전기이월"),
            n(1.0),
            vec![
                txn("01-10", "a", 1.0, 10.0),
                month_total(),
                txn("01-20", "b", 1.0, 20.0),
                month_total(),
            ],
        );
        let out = engine(&config).extract(&s).unwrap();
        assert!(out.balance.monthly.is_empty());
        assert_eq!(out.marks.len(), 2);
        assert!(out.marks.iter().all(|m| m.issue == IssueKind::DuplicateMonth));
    }

    #[test]
    fn structural_failures() {
        let config = PipelineConfig::default();

        let no_code = sheet("보통예금", t("전기이월"), n(1.0), vec![]);
        let err = engine(&config).extract(&no_code).unwrap_err();
        assert_eq!(err.kind, StructuralKind::UnparseableAccountCode);
        assert!(err.task.is_none());

        let narrow = LedgerSheet::new("(10300) 보통예금", 2023, vec![vec![t("a"), t("b")]; 6]);
        let err = engine(&config).extract(&narrow).unwrap_err();
        assert_eq!(err.kind, StructuralKind::MissingColumns);
        assert_eq!(err.task, Some(AccountTask::new(2023, 10300)));

        let short = LedgerSheet::new("(10300) 보통예금", 2023, vec![vec![e(); 7]; 3]);
        let err = engine(&config).extract(&short).unwrap_err();
        assert_eq!(err.kind, StructuralKind::SheetTooShort);
    }

    fn vat_sheet() -> LedgerSheet {
        sheet(
            "(13500) 부가세대급금",
            t("전기이월"),
            n(1000.0),
            vec![
                txn("01-05", "매입 부가세", 100.0, 1100.0),
                txn("01-20", "매입 부가세", 200.0, 1300.0),
                month_total(),
                txn("02-05", "매입 부가세", 300.0, 1600.0),
                month_total(),
            ],
        )
    }

    fn fast() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::ZERO,
        }
    }

    #[test]
    fn vat_month_needs_every_judgment() {
        let config = PipelineConfig::default();
        // February's only record is ambiguous.
        let client = StubAnalysisClient::new(|r| {
            if r.amount == 300 {
                Judgment::new("UNCERTAIN", Confidence::High, "memo unclear")
            } else {
                Judgment::new("VAT_INCLUDED", Confidence::High, "")
            }
        });
        let out = ExtractionEngine::new(&config, Some(&client))
            .with_retry(fast())
            .extract(&vat_sheet())
            .unwrap();
        assert_eq!(client.calls(), 1);
        assert_eq!(out.balance.monthly.get(&1), Some(&1300));
        assert_eq!(out.balance.monthly.get(&2), None);
        assert_eq!(out.marks.len(), 1);
        assert_eq!(out.marks[0].issue, IssueKind::AnalysisUncertain);
        assert_eq!(out.marks[0].cell.to_string(), "G9");
        // carry-forward is not a semantic field
        assert_eq!(out.balance.carry_forward, Some(1000));
    }

    #[test]
    fn vat_without_analysis_is_unavailable() {
        let config = PipelineConfig::default();
        let client = StubAnalysisClient::always_failing();
        let out = ExtractionEngine::new(&config, Some(&client))
            .with_retry(fast())
            .extract(&vat_sheet())
            .unwrap();
        assert_eq!(client.calls(), 3);
        assert!(out.balance.monthly.is_empty());
        assert_eq!(out.marks.len(), 2);
        assert!(out.marks.iter().all(|m| m.issue == IssueKind::AnalysisUnavailable));
    }

    #[test]
    fn medium_floor_accepts_medium() {
        let mut config = PipelineConfig::default();
        config.analysis.confidence_floor = Confidence::Medium;
        let client = StubAnalysisClient::uniform(Judgment::new("VAT_INCLUDED", Confidence::Medium, ""));
        let out = ExtractionEngine::new(&config, Some(&client))
            .with_retry(fast())
            .extract(&vat_sheet())
            .unwrap();
        assert_eq!(out.balance.monthly.len(), 2);
    }

    #[test]
    fn source_sheet_is_untouched() {
        let config = PipelineConfig::default();
        let s = vat_sheet();
        let before = format!("{s:?}");
        let _ = engine(&config).extract(&s);
        assert_eq!(format!("{s:?}"), before);
    }
}
