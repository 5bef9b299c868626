use std::collections::BTreeSet;
use std::path::PathBuf;

use serde::Deserialize;

use crate::analysis::Confidence;
use crate::error::PipelineError;
use crate::model::{column_letters, parse_column};

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PipelineConfig {
    /// One workbook per fiscal year.
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
    #[serde(default)]
    pub layout: LayoutConfig,
    #[serde(default)]
    pub markers: MarkersConfig,
    #[serde(default)]
    pub accounts: AccountsConfig,
    #[serde(default)]
    pub analysis: AnalysisConfig,
    #[serde(default)]
    pub run: RunConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub year: i32,
    pub workbook: PathBuf,
}

// ---------------------------------------------------------------------------
// Sheet layout
// ---------------------------------------------------------------------------

/// Column letter deserialized from `"A"`..`"XFD"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub struct Column(pub u16);

impl TryFrom<String> for Column {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        parse_column(value.trim())
            .map(Column)
            .ok_or_else(|| format!("invalid column letter '{value}'"))
    }
}

impl std::fmt::Display for Column {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&column_letters(self.0))
    }
}

/// Positional rules for ledger sheets. Defaults match the standard export:
/// A date, B description, D counterpart, E debit, F credit, G balance, and
/// the carry-forward pair on row 5.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LayoutConfig {
    pub carry_forward_row: u32,
    pub date_column: Column,
    pub description_column: Column,
    pub counterpart_column: Column,
    pub debit_column: Column,
    pub credit_column: Column,
    pub balance_column: Column,
}

impl Default for LayoutConfig {
    fn default() -> Self {
        Self {
            carry_forward_row: 5,
            date_column: Column(0),
            description_column: Column(1),
            counterpart_column: Column(3),
            debit_column: Column(4),
            credit_column: Column(5),
            balance_column: Column(6),
        }
    }
}

impl LayoutConfig {
    /// Minimum sheet width for a sheet to be structurally valid.
    pub fn required_width(&self) -> u16 {
        [
            self.date_column,
            self.description_column,
            self.balance_column,
        ]
        .iter()
        .map(|c| c.0 + 1)
        .max()
        .unwrap_or(0)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MarkersConfig {
    pub carry_forward: String,
    /// Whitespace inside the cell is ignored when matching.
    pub month_total: String,
    pub cumulative_total: String,
}

impl Default for MarkersConfig {
    fn default() -> Self {
        Self {
            carry_forward: "전기이월".into(),
            month_total: "월계".into(),
            cumulative_total: "누계".into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Accounts
// ---------------------------------------------------------------------------

/// Half-open code range `[start, end)`, written as `[start, end]` in TOML.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(from = "[u32; 2]")]
pub struct CodeRange {
    pub start: u32,
    pub end: u32,
}

impl From<[u32; 2]> for CodeRange {
    fn from([start, end]: [u32; 2]) -> Self {
        Self { start, end }
    }
}

impl CodeRange {
    pub const fn new(start: u32, end: u32) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, code: u32) -> bool {
        code >= self.start && code < self.end
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AccountsConfig {
    pub balance_sheet: Vec<CodeRange>,
    pub revenue: Vec<CodeRange>,
    pub expense: Vec<CodeRange>,
    /// Accounts whose month-end values need a semantic judgment.
    pub vat: Vec<u32>,
    /// Sheets whose name contains one of these (case-insensitive) are skipped.
    pub excluded_sheet_keywords: Vec<String>,
}

impl Default for AccountsConfig {
    fn default() -> Self {
        Self {
            balance_sheet: vec![
                CodeRange::new(10000, 25000),
                CodeRange::new(25000, 30000),
                CodeRange::new(33000, 38000),
            ],
            revenue: vec![CodeRange::new(40000, 42100), CodeRange::new(90000, 92100)],
            expense: vec![
                CodeRange::new(45000, 46100),
                CodeRange::new(52000, 53100),
                CodeRange::new(80000, 84100),
                CodeRange::new(93000, 96100),
            ],
            vat: vec![13500, 25500],
            excluded_sheet_keywords: vec![
                "분석".into(),
                "summary".into(),
                "temp".into(),
                "요약".into(),
            ],
        }
    }
}

// ---------------------------------------------------------------------------
// Analysis + run
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    /// HTTP endpoint of the pattern-analysis service. Without one, every
    /// semantic judgment degrades to `analysis_unavailable`.
    pub endpoint: Option<String>,
    pub timeout_secs: u64,
    pub max_attempts: u32,
    pub backoff_ms: u64,
    pub confidence_floor: Confidence,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            timeout_secs: 30,
            max_attempts: 3,
            backoff_ms: 500,
            confidence_floor: Confidence::High,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Root for run directories (`<work_dir>/<run_id>/`).
    pub work_dir: PathBuf,
    /// Extraction workers. 1 = strictly sequential.
    pub workers: usize,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            work_dir: PathBuf::from(".ledgerscan"),
            workers: 1,
        }
    }
}

// ---------------------------------------------------------------------------
// Parse + Validate
// ---------------------------------------------------------------------------

impl PipelineConfig {
    pub fn from_toml(input: &str) -> Result<Self, PipelineError> {
        let config: PipelineConfig =
            toml::from_str(input).map_err(|e| PipelineError::ConfigParse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), PipelineError> {
        let mut years = BTreeSet::new();
        for source in &self.sources {
            if !years.insert(source.year) {
                return Err(PipelineError::ConfigValidation(format!(
                    "year {} has more than one source workbook",
                    source.year
                )));
            }
        }

        if self.layout.carry_forward_row == 0 {
            return Err(PipelineError::ConfigValidation(
                "layout.carry_forward_row is 1-based and must be > 0".into(),
            ));
        }

        if self.markers.carry_forward.trim().is_empty() || self.markers.month_total.trim().is_empty() {
            return Err(PipelineError::ConfigValidation(
                "markers.carry_forward and markers.month_total must be non-empty".into(),
            ));
        }

        for range in self
            .accounts
            .balance_sheet
            .iter()
            .chain(&self.accounts.revenue)
            .chain(&self.accounts.expense)
        {
            if range.start >= range.end {
                return Err(PipelineError::ConfigValidation(format!(
                    "account range [{}, {}) is empty",
                    range.start, range.end
                )));
            }
        }

        if self.analysis.confidence_floor < Confidence::Medium {
            return Err(PipelineError::ConfigValidation(
                "analysis.confidence_floor must be \"medium\" or \"high\"".into(),
            ));
        }

        if self.analysis.max_attempts == 0 {
            return Err(PipelineError::ConfigValidation(
                "analysis.max_attempts must be at least 1".into(),
            ));
        }

        if self.run.workers == 0 {
            return Err(PipelineError::ConfigValidation(
                "run.workers must be at least 1".into(),
            ));
        }

        Ok(())
    }

    pub fn source_for(&self, year: i32) -> Option<&SourceConfig> {
        self.sources.iter().find(|s| s.year == year)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const FULL: &str = r#"
[[sources]]
year = 2023
workbook = "ledger_2023.xlsx"

[[sources]]
year = 2024
workbook = "ledger_2024.xlsx"

[layout]
carry_forward_row = 6
balance_column = "H"

[accounts]
revenue = [[40000, 42100]]
vat = [13500]

[analysis]
endpoint = "http://localhost:8080/judge"
confidence_floor = "medium"
max_attempts = 2

[run]
work_dir = "/tmp/ls"
workers = 4
"#;

    #[test]
    fn parse_full() {
        let config = PipelineConfig::from_toml(FULL).unwrap();
        assert_eq!(config.sources.len(), 2);
        assert_eq!(config.source_for(2024).unwrap().workbook, PathBuf::from("ledger_2024.xlsx"));
        assert_eq!(config.layout.carry_forward_row, 6);
        assert_eq!(config.layout.balance_column, Column(7));
        // untouched layout fields keep their defaults
        assert_eq!(config.layout.description_column, Column(1));
        assert_eq!(config.accounts.revenue, vec![CodeRange::new(40000, 42100)]);
        assert_eq!(config.accounts.vat, vec![13500]);
        assert_eq!(config.analysis.confidence_floor, Confidence::Medium);
        assert_eq!(config.analysis.max_attempts, 2);
        assert_eq!(config.analysis.timeout_secs, 30);
        assert_eq!(config.run.workers, 4);
    }

    #[test]
    fn empty_input_uses_defaults() {
        let config = PipelineConfig::from_toml("").unwrap();
        assert!(config.sources.is_empty());
        assert_eq!(config.layout.carry_forward_row, 5);
        assert_eq!(config.markers.carry_forward, "전기이월");
        assert_eq!(config.analysis.confidence_floor, Confidence::High);
        assert_eq!(config.accounts.revenue.len(), 2);
        assert_eq!(config.run.workers, 1);
    }

    #[test]
    fn required_width_covers_balance_column() {
        let layout = LayoutConfig::default();
        assert_eq!(layout.required_width(), 7);
    }

    #[test]
    fn reject_low_confidence_floor() {
        let err = PipelineConfig::from_toml("[analysis]\nconfidence_floor = \"low\"\n").unwrap_err();
        assert!(err.to_string().contains("confidence_floor"));
    }

    #[test]
    fn reject_duplicate_year() {
        let input = r#"
[[sources]]
year = 2023
workbook = "a.xlsx"
[[sources]]
year = 2023
workbook = "b.xlsx"
"#;
        let err = PipelineConfig::from_toml(input).unwrap_err();
        assert!(err.to_string().contains("year 2023"));
    }

    #[test]
    fn reject_bad_column_letter() {
        let err = PipelineConfig::from_toml("[layout]\nbalance_column = \"7\"\n").unwrap_err();
        assert!(matches!(err, PipelineError::ConfigParse(_)));
    }

    #[test]
    fn reject_empty_range() {
        let err = PipelineConfig::from_toml("[accounts]\nrevenue = [[5, 5]]\n").unwrap_err();
        assert!(err.to_string().contains("[5, 5)"));
    }

    #[test]
    fn reject_zero_workers() {
        let err = PipelineConfig::from_toml("[run]\nworkers = 0\n").unwrap_err();
        assert!(err.to_string().contains("workers"));
    }
}
