use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Tasks
// ---------------------------------------------------------------------------

/// Unit of work. Ordering is (year, account_code), which is the processing
/// order and the index space checkpoints refer to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AccountTask {
    pub year: i32,
    pub account_code: u32,
}

impl AccountTask {
    pub fn new(year: i32, account_code: u32) -> Self {
        Self { year, account_code }
    }
}

impl fmt::Display for AccountTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.year, self.account_code)
    }
}

// ---------------------------------------------------------------------------
// Cells
// ---------------------------------------------------------------------------

/// A1-style coordinate. `row` is 1-based, `col` is 0-based (A = 0).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CellRef {
    pub row: u32,
    pub col: u16,
}

impl CellRef {
    pub fn new(row: u32, col: u16) -> Self {
        Self { row, col }
    }

    pub fn parse(a1: &str) -> Option<Self> {
        let a1 = a1.trim();
        let split = a1.find(|c: char| c.is_ascii_digit())?;
        let (letters, digits) = a1.split_at(split);
        let col = parse_column(letters)?;
        let row: u32 = digits.parse().ok()?;
        if row == 0 {
            return None;
        }
        Some(Self { row, col })
    }
}

impl fmt::Display for CellRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", column_letters(self.col), self.row)
    }
}

impl From<CellRef> for String {
    fn from(cell: CellRef) -> Self {
        cell.to_string()
    }
}

impl TryFrom<String> for CellRef {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        CellRef::parse(&value).ok_or_else(|| format!("invalid cell reference '{value}'"))
    }
}

/// `0 -> "A"`, `25 -> "Z"`, `26 -> "AA"`.
pub fn column_letters(col: u16) -> String {
    let mut n = col as u32 + 1;
    let mut out = Vec::new();
    while n > 0 {
        let rem = (n - 1) % 26;
        out.push(b'A' + rem as u8);
        n = (n - 1) / 26;
    }
    out.reverse();
    String::from_utf8(out).unwrap_or_default()
}

/// Inverse of [`column_letters`]. Case-insensitive.
pub fn parse_column(letters: &str) -> Option<u16> {
    if letters.is_empty() || letters.len() > 3 {
        return None;
    }
    let mut n: u32 = 0;
    for c in letters.chars() {
        if !c.is_ascii_alphabetic() {
            return None;
        }
        n = n * 26 + (c.to_ascii_uppercase() as u32 - 'A' as u32 + 1);
    }
    u16::try_from(n - 1).ok()
}

/// Cell content as loaded from a workbook, before any interpretation.
#[derive(Debug, Clone, PartialEq)]
pub enum RawCell {
    Empty,
    Text(String),
    Number(f64),
    Bool(bool),
    Error(String),
}

static EMPTY_CELL: RawCell = RawCell::Empty;

impl RawCell {
    /// Empty cells and whitespace-only text.
    pub fn is_blank(&self) -> bool {
        match self {
            RawCell::Empty => true,
            RawCell::Text(s) => s.trim().is_empty(),
            _ => false,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            RawCell::Text(s) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Rendering used for `original_value` in marks and for log details.
    pub fn display(&self) -> String {
        match self {
            RawCell::Empty => String::new(),
            RawCell::Text(s) => s.clone(),
            RawCell::Number(n) if n.fract() == 0.0 && n.abs() < 1e15 => format!("{}", *n as i64),
            RawCell::Number(n) => n.to_string(),
            RawCell::Bool(b) => b.to_string(),
            RawCell::Error(e) => format!("#{e}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Sheets
// ---------------------------------------------------------------------------

/// Read-only view of one account sheet. Rows are 1-based when addressed
/// through [`CellRef`].
#[derive(Debug, Clone)]
pub struct LedgerSheet {
    name: String,
    year: i32,
    rows: Vec<Vec<RawCell>>,
    width: u16,
}

impl LedgerSheet {
    pub fn new(name: impl Into<String>, year: i32, rows: Vec<Vec<RawCell>>) -> Self {
        let width = rows.iter().map(|r| r.len()).max().unwrap_or(0);
        Self {
            name: name.into(),
            year,
            rows,
            width: u16::try_from(width).unwrap_or(u16::MAX),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn year(&self) -> i32 {
        self.year
    }

    /// Number of rows (last 1-based row index).
    pub fn height(&self) -> u32 {
        self.rows.len() as u32
    }

    /// Number of columns in the widest row.
    pub fn width(&self) -> u16 {
        self.width
    }

    /// Out-of-range coordinates read as empty.
    pub fn cell(&self, at: CellRef) -> &RawCell {
        if at.row == 0 {
            return &EMPTY_CELL;
        }
        self.rows
            .get(at.row as usize - 1)
            .and_then(|r| r.get(at.col as usize))
            .unwrap_or(&EMPTY_CELL)
    }

    pub fn contains(&self, at: CellRef) -> bool {
        at.row >= 1 && at.row <= self.height() && at.col < self.width
    }
}

// ---------------------------------------------------------------------------
// Extraction results
// ---------------------------------------------------------------------------

/// One per task. A month missing from `monthly` was either never closed by a
/// month-total row or was marked; it is never an implicit zero.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractedBalance {
    pub account_code: u32,
    pub year: i32,
    pub carry_forward: Option<i64>,
    pub monthly: BTreeMap<u8, i64>,
    /// PL accounts only: debit minus credit for the month. Zero and
    /// unreadable months are absent.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub activity: BTreeMap<u8, i64>,
}

impl ExtractedBalance {
    pub fn empty(account_code: u32, year: i32) -> Self {
        Self {
            account_code,
            year,
            carry_forward: None,
            monthly: BTreeMap::new(),
            activity: BTreeMap::new(),
        }
    }
}

/// A value written to the output because it classified CERTAIN.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertainCell {
    pub year: i32,
    pub sheet: String,
    pub cell: CellRef,
    pub account_code: u32,
    /// `None` for the carry-forward value.
    pub month: Option<u8>,
    pub value: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    CarryForwardAmbiguous,
    LabelMismatch,
    NonNumeric,
    NonIntegral,
    EmptyValue,
    AnalysisUncertain,
    AnalysisUnavailable,
    DuplicateMonth,
}

impl IssueKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CarryForwardAmbiguous => "carry_forward_ambiguous",
            Self::LabelMismatch => "label_mismatch",
            Self::NonNumeric => "non_numeric",
            Self::NonIntegral => "non_integral",
            Self::EmptyValue => "empty_value",
            Self::AnalysisUncertain => "analysis_uncertain",
            Self::AnalysisUnavailable => "analysis_unavailable",
            Self::DuplicateMonth => "duplicate_month",
        }
    }

    /// Issues raised by the semantic judgment step.
    pub fn is_analysis(&self) -> bool {
        matches!(self, Self::AnalysisUncertain | Self::AnalysisUnavailable)
    }
}

impl fmt::Display for IssueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A location deliberately left empty. The output cell must hold no value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkedCell {
    pub year: i32,
    pub sheet: String,
    pub cell: CellRef,
    pub account_code: u32,
    pub month: Option<u8>,
    pub issue: IssueKind,
    pub detail: String,
    pub original_value: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StructuralKind {
    MissingColumns,
    SheetTooShort,
    UnparseableAccountCode,
    MissingSheet,
    SheetUnreadable,
    DuplicateSheet,
    DecisionConflict,
}

impl fmt::Display for StructuralKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::MissingColumns => "missing_columns",
            Self::SheetTooShort => "sheet_too_short",
            Self::UnparseableAccountCode => "unparseable_account_code",
            Self::MissingSheet => "missing_sheet",
            Self::SheetUnreadable => "sheet_unreadable",
            Self::DuplicateSheet => "duplicate_sheet",
            Self::DecisionConflict => "decision_conflict",
        };
        f.write_str(s)
    }
}

/// Task-local failure. Aborts only the task it belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StructuralErrorRecord {
    /// `None` for sheets that never became a task (no account code).
    pub task: Option<AccountTask>,
    pub sheet: Option<String>,
    pub kind: StructuralKind,
    pub detail: String,
}

/// Everything one successfully parsed sheet produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SheetExtraction {
    pub sheet: String,
    pub balance: ExtractedBalance,
    pub certain: Vec<CertainCell>,
    pub marks: Vec<MarkedCell>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TaskOutcome {
    Extracted(SheetExtraction),
    Failed(StructuralErrorRecord),
}

/// A completed task as stored in the checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskResult {
    pub index: usize,
    pub task: AccountTask,
    pub outcome: TaskOutcome,
}

// ---------------------------------------------------------------------------
// Contamination
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    RevenueSign,
    DuplicateAmount,
    OrphanWrite,
}

impl fmt::Display for AlertKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RevenueSign => write!(f, "revenue_sign"),
            Self::DuplicateAmount => write!(f, "duplicate_amount"),
            Self::OrphanWrite => write!(f, "orphan_write"),
        }
    }
}

/// Raising one of these halts the run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContaminationAlert {
    pub task_index: usize,
    pub account_code: u32,
    pub year: i32,
    pub month: u8,
    pub kind: AlertKind,
    pub evidence: String,
}
