use once_cell::sync::Lazy;
use regex::Regex;

use crate::analysis::{Confidence, Judgment};
use crate::model::{IssueKind, RawCell};

/// Plain integer, optionally grouped by thousands, optionally with a decimal
/// tail. `1,234,567`, `-500`, `1200.00`.
static NUMERIC_TEXT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^([+-])?(\d{1,3}(?:,\d{3})+|\d+)(?:\.(\d+))?$").expect("static regex")
});

/// Interpretation of a raw cell as an amount.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Numeric {
    Empty,
    Integer(i64),
    Fractional(f64),
    NotNumeric,
}

pub fn parse_numeric(raw: &RawCell) -> Numeric {
    match raw {
        RawCell::Empty => Numeric::Empty,
        RawCell::Text(s) if s.trim().is_empty() => Numeric::Empty,
        RawCell::Text(s) => parse_numeric_text(s.trim()),
        RawCell::Number(n) if !n.is_finite() => Numeric::NotNumeric,
        RawCell::Number(n) if n.fract() != 0.0 => Numeric::Fractional(*n),
        // Beyond 2^53 an f64 no longer identifies a unique integer.
        RawCell::Number(n) if n.abs() > 9_007_199_254_740_992.0 => Numeric::NotNumeric,
        RawCell::Number(n) => Numeric::Integer(*n as i64),
        RawCell::Bool(_) | RawCell::Error(_) => Numeric::NotNumeric,
    }
}

fn parse_numeric_text(s: &str) -> Numeric {
    let Some(caps) = NUMERIC_TEXT.captures(s) else {
        return Numeric::NotNumeric;
    };
    let negative = caps.get(1).is_some_and(|m| m.as_str() == "-");
    let digits: String = caps[2].chars().filter(|c| *c != ',').collect();
    let Ok(mut value) = digits.parse::<i64>() else {
        return Numeric::NotNumeric;
    };
    if negative {
        value = -value;
    }
    match caps.get(3) {
        Some(frac) if frac.as_str().chars().any(|c| c != '0') => match s.replace(',', "").parse() {
            Ok(f) => Numeric::Fractional(f),
            Err(_) => Numeric::NotNumeric,
        },
        _ => Numeric::Integer(value),
    }
}

/// What a value is being read as.
#[derive(Debug, Clone, Copy)]
pub enum FieldKind<'a> {
    /// Running balance at a month boundary.
    Numeric,
    /// Carry-forward balance; `label` is the adjacent label cell.
    CarryForward { label: &'a RawCell, expected: &'a str },
    /// Numeric value that additionally needs the external judgment.
    Semantic(SemanticEvidence<'a>),
}

#[derive(Debug, Clone, Copy)]
pub enum SemanticEvidence<'a> {
    Judged {
        judgments: &'a [Judgment],
        floor: Confidence,
    },
    Unavailable {
        reason: &'a str,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    Certain(i64),
    Uncertain { issue: IssueKind, detail: String },
    StructuralError(String),
}

impl Classification {
    fn uncertain(issue: IssueKind, detail: impl Into<String>) -> Self {
        Self::Uncertain {
            issue,
            detail: detail.into(),
        }
    }
}

/// Decides CERTAIN / UNCERTAIN / STRUCTURAL_ERROR for one value. No rule
/// produces a value that is not literally present in the cell.
#[derive(Debug, Clone, Copy, Default)]
pub struct CellClassifier;

impl CellClassifier {
    /// `raw` is `None` when the coordinate lies outside the sheet.
    pub fn classify(&self, raw: Option<&RawCell>, account_code: u32, field: FieldKind<'_>) -> Classification {
        let Some(raw) = raw else {
            return Classification::StructuralError(format!(
                "account {account_code}: value cell outside the sheet"
            ));
        };

        let value = match parse_numeric(raw) {
            Numeric::NotNumeric => {
                return Classification::uncertain(
                    IssueKind::NonNumeric,
                    format!("'{}' is not a number", raw.display()),
                );
            }
            Numeric::Integer(v) => Ok(v),
            Numeric::Empty => Err(Classification::uncertain(IssueKind::EmptyValue, "value cell is empty")),
            Numeric::Fractional(f) => Err(Classification::uncertain(
                IssueKind::NonIntegral,
                format!("{f} has a fractional part"),
            )),
        };

        if let FieldKind::CarryForward { label, expected } = field {
            let text = label.display();
            let text = text.trim();
            if text.is_empty() {
                return Classification::uncertain(
                    IssueKind::CarryForwardAmbiguous,
                    "carry-forward label cell is empty",
                );
            }
            if text != expected.trim() {
                return Classification::uncertain(
                    IssueKind::LabelMismatch,
                    format!("label '{text}' is not '{expected}'"),
                );
            }
        }

        let value = match value {
            Ok(v) => v,
            Err(uncertain) => return uncertain,
        };

        if let FieldKind::Semantic(evidence) = field {
            match evidence {
                SemanticEvidence::Unavailable { reason } => {
                    return Classification::uncertain(
                        IssueKind::AnalysisUnavailable,
                        format!("pattern analysis unavailable: {reason}"),
                    );
                }
                SemanticEvidence::Judged { judgments, floor } => {
                    if judgments.is_empty() {
                        return Classification::uncertain(
                            IssueKind::AnalysisUncertain,
                            "no transactions to judge",
                        );
                    }
                    if let Some(j) = judgments.iter().find(|j| !j.is_definitive(floor)) {
                        return Classification::uncertain(
                            IssueKind::AnalysisUncertain,
                            format!(
                                "judgment {} ({}) below {floor}: {}",
                                j.classification, j.confidence, j.reasoning
                            ),
                        );
                    }
                }
            }
        }

        Classification::Certain(value)
    }
}
