//! Account codes and account kinds.

use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::config::AccountsConfig;

static ACCOUNT_CODE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\((\d+)\)").expect("static regex"));

/// Extract the account code from a sheet name such as `"(10300) 보통예금"`.
/// The first parenthesized digit group wins.
pub fn parse_account_code(sheet_name: &str) -> Option<u32> {
    ACCOUNT_CODE
        .captures(sheet_name)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AccountKind {
    /// Balance sheet.
    Bs,
    /// Profit and loss.
    Pl,
    /// VAT receivable / payable; month-end values need a semantic judgment.
    Vat,
    Unknown,
}

impl AccountKind {
    /// Parse the `--type` filter. `none` means no filter.
    pub fn parse_filter(s: &str) -> Result<Option<Self>, String> {
        match s.trim().to_ascii_uppercase().as_str() {
            "BS" => Ok(Some(Self::Bs)),
            "PL" => Ok(Some(Self::Pl)),
            "VAT" => Ok(Some(Self::Vat)),
            "NONE" | "" => Ok(None),
            other => Err(format!("unknown account type '{other}' (expected BS, PL, VAT or none)")),
        }
    }

    /// Whether an account of this kind satisfies a `--type` filter. VAT
    /// accounts live inside the balance sheet ranges and match `BS` too.
    pub fn matches(&self, filter: AccountKind) -> bool {
        *self == filter || (*self == Self::Vat && filter == Self::Bs)
    }
}

impl fmt::Display for AccountKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bs => write!(f, "BS"),
            Self::Pl => write!(f, "PL"),
            Self::Vat => write!(f, "VAT"),
            Self::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

pub fn classify_account(code: u32, accounts: &AccountsConfig) -> AccountKind {
    if accounts.vat.contains(&code) {
        AccountKind::Vat
    } else if accounts.balance_sheet.iter().any(|r| r.contains(code)) {
        AccountKind::Bs
    } else if accounts
        .revenue
        .iter()
        .chain(&accounts.expense)
        .any(|r| r.contains(code))
    {
        AccountKind::Pl
    } else {
        AccountKind::Unknown
    }
}

pub fn is_revenue(code: u32, accounts: &AccountsConfig) -> bool {
    accounts.revenue.iter().any(|r| r.contains(code))
}

/// False for analysis / summary / scratch sheets.
pub fn is_ledger_sheet(sheet_name: &str, accounts: &AccountsConfig) -> bool {
    let lower = sheet_name.to_lowercase();
    !accounts
        .excluded_sheet_keywords
        .iter()
        .any(|k| lower.contains(&k.to_lowercase()))
}
