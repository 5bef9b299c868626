//! Cross-account contamination monitor.
//!
//! States: `Monitoring` (initial) and `Halted` (terminal). Each observation
//! runs three detectors in a fixed order: revenue sign, duplicate amount,
//! orphan write. The first positive halts and yields exactly one alert. A
//! balance is committed into the monitor's view only after it passes.

use std::collections::{BTreeMap, BTreeSet};

use tracing::error;

use crate::config::CodeRange;
use crate::error::PipelineError;
use crate::model::{AlertKind, ContaminationAlert, ExtractedBalance};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorState {
    Monitoring,
    Halted(ContaminationAlert),
}

pub struct ContaminationMonitor {
    revenue: Vec<CodeRange>,
    /// (year, account_code) pairs that have a source sheet.
    inventory: BTreeSet<(i32, u32)>,
    /// (year, month) -> non-zero value -> first account that reported it.
    seen: BTreeMap<(i32, u8), BTreeMap<i64, u32>>,
    state: MonitorState,
}

impl ContaminationMonitor {
    pub fn new(revenue: Vec<CodeRange>, inventory: impl IntoIterator<Item = (i32, u32)>) -> Self {
        Self {
            revenue,
            inventory: inventory.into_iter().collect(),
            seen: BTreeMap::new(),
            state: MonitorState::Monitoring,
        }
    }

    pub fn state(&self) -> &MonitorState {
        &self.state
    }

    pub fn is_halted(&self) -> bool {
        matches!(self.state, MonitorState::Halted(_))
    }

    pub fn alert(&self) -> Option<&ContaminationAlert> {
        match &self.state {
            MonitorState::Halted(alert) => Some(alert),
            MonitorState::Monitoring => None,
        }
    }

    /// Re-add a balance that already passed in an earlier session.
    pub fn seed(&mut self, balance: &ExtractedBalance) {
        self.commit(balance);
    }

    /// Inspect one task's balance. `Ok(Some(alert))` means the monitor just
    /// halted; observing after that is an error.
    pub fn observe(
        &mut self,
        task_index: usize,
        balance: &ExtractedBalance,
    ) -> Result<Option<ContaminationAlert>, PipelineError> {
        if self.is_halted() {
            return Err(PipelineError::MonitorHalted {
                account_code: balance.account_code,
            });
        }

        let found = self
            .revenue_sign(task_index, balance)
            .or_else(|| self.duplicate_amount(task_index, balance))
            .or_else(|| self.orphan_write(task_index, balance));

        match found {
            Some(alert) => {
                error!(
                    task = task_index,
                    account = alert.account_code,
                    year = alert.year,
                    month = alert.month,
                    kind = %alert.kind,
                    "contamination detected; halting"
                );
                self.state = MonitorState::Halted(alert.clone());
                Ok(Some(alert))
            }
            None => {
                self.commit(balance);
                Ok(None)
            }
        }
    }

    fn commit(&mut self, balance: &ExtractedBalance) {
        for (&month, &value) in &balance.monthly {
            if value != 0 {
                self.seen
                    .entry((balance.year, month))
                    .or_default()
                    .entry(value)
                    .or_insert(balance.account_code);
            }
        }
    }

    fn revenue_sign(&self, task_index: usize, b: &ExtractedBalance) -> Option<ContaminationAlert> {
        if !self.revenue.iter().any(|r| r.contains(b.account_code)) {
            return None;
        }
        let (&month, &value) = b.monthly.iter().find(|(_, v)| **v < 0)?;
        Some(ContaminationAlert {
            task_index,
            account_code: b.account_code,
            year: b.year,
            month,
            kind: AlertKind::RevenueSign,
            evidence: format!("revenue account carries negative monthly value {value}"),
        })
    }

    fn duplicate_amount(&self, task_index: usize, b: &ExtractedBalance) -> Option<ContaminationAlert> {
        b.monthly.iter().find_map(|(&month, &value)| {
            if value == 0 {
                return None;
            }
            let other = *self.seen.get(&(b.year, month))?.get(&value)?;
            (other != b.account_code).then(|| ContaminationAlert {
                task_index,
                account_code: b.account_code,
                year: b.year,
                month,
                kind: AlertKind::DuplicateAmount,
                evidence: format!("value {value} also reported by account {other} for {}-{month:02}", b.year),
            })
        })
    }

    fn orphan_write(&self, task_index: usize, b: &ExtractedBalance) -> Option<ContaminationAlert> {
        if self.inventory.contains(&(b.year, b.account_code)) {
            return None;
        }
        let (&month, &value) = b.monthly.iter().find(|(_, v)| **v != 0)?;
        Some(ContaminationAlert {
            task_index,
            account_code: b.account_code,
            year: b.year,
            month,
            kind: AlertKind::OrphanWrite,
            evidence: format!("value {value} written for an account with no source sheet in {}", b.year),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AccountsConfig;

    fn balance(code: u32, months: &[(u8, i64)]) -> ExtractedBalance {
        let mut b = ExtractedBalance::empty(code, 2023);
        b.monthly.extend(months.iter().copied());
        b
    }

    fn monitor(inventory: &[u32]) -> ContaminationMonitor {
        ContaminationMonitor::new(
            AccountsConfig::default().revenue,
            inventory.iter().map(|c| (2023, *c)),
        )
    }

    #[test]
    fn clean_balances_pass() {
        let mut m = monitor(&[10300, 40100]);
        assert!(m.observe(0, &balance(10300, &[(1, 500), (2, 700)])).unwrap().is_none());
        assert!(m.observe(1, &balance(40100, &[(1, 900)])).unwrap().is_none());
        assert_eq!(m.state(), &MonitorState::Monitoring);
    }

    #[test]
    fn negative_revenue_halts() {
        let mut m = monitor(&[40100]);
        let alert = m.observe(3, &balance(40100, &[(1, 10), (5, -20)])).unwrap().unwrap();
        assert_eq!(alert.kind, AlertKind::RevenueSign);
        assert_eq!(alert.month, 5);
        assert_eq!(alert.task_index, 3);
        assert!(m.is_halted());
    }

    #[test]
    fn negative_non_revenue_is_fine() {
        let mut m = monitor(&[10300]);
        assert!(m.observe(0, &balance(10300, &[(1, -20)])).unwrap().is_none());
    }

    #[test]
    fn duplicate_across_accounts_halts() {
        let mut m = monitor(&[10300, 10800]);
        m.observe(0, &balance(10300, &[(3, 4_200_000)])).unwrap();
        let alert = m.observe(1, &balance(10800, &[(3, 4_200_000)])).unwrap().unwrap();
        assert_eq!(alert.kind, AlertKind::DuplicateAmount);
        assert!(alert.evidence.contains("10300"));
    }

    #[test]
    fn duplicate_ignores_zero_and_other_months() {
        let mut m = monitor(&[10300, 10800]);
        m.observe(0, &balance(10300, &[(3, 0), (4, 55)])).unwrap();
        assert!(m.observe(1, &balance(10800, &[(3, 0), (5, 55)])).unwrap().is_none());
    }

    #[test]
    fn orphan_write_halts() {
        let mut m = monitor(&[10300]);
        let alert = m.observe(0, &balance(10800, &[(1, 5)])).unwrap().unwrap();
        assert_eq!(alert.kind, AlertKind::OrphanWrite);
    }

    #[test]
    fn detector_order_is_fixed() {
        // Negative revenue that is also an orphan reports the sign first.
        let mut m = monitor(&[]);
        let alert = m.observe(0, &balance(40100, &[(1, -5)])).unwrap().unwrap();
        assert_eq!(alert.kind, AlertKind::RevenueSign);
    }

    #[test]
    fn halted_rejects_observations() {
        let mut m = monitor(&[40100, 10300]);
        m.observe(0, &balance(40100, &[(1, -1)])).unwrap();
        let err = m.observe(1, &balance(10300, &[(1, 1)])).unwrap_err();
        assert!(matches!(err, PipelineError::MonitorHalted { account_code: 10300 }));
    }

    #[test]
    fn halting_balance_is_not_committed() {
        let mut m = monitor(&[10300, 10800, 40100]);
        m.observe(0, &balance(40100, &[(1, -7), (2, 99)])).unwrap();
        assert!(m.seen.is_empty());
    }

    #[test]
    fn seeded_values_count_for_duplicates() {
        let mut m = monitor(&[10300, 10800]);
        m.seed(&balance(10300, &[(6, 123)]));
        let alert = m.observe(1, &balance(10800, &[(6, 123)])).unwrap();
        assert!(alert.is_some());
    }
}
