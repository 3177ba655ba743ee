use std::collections::BTreeMap;

use serde::Serialize;
use tracing::{debug, info, warn};
use ucm_core::{
    convert, Account, IntegrityIssue, IssueSeverity, DENOMINATIONS, LARGE_CONVERSION_THRESHOLD,
};
use ucm_store::LedgerStore;

use crate::EngineError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AccountIssue {
    pub account_id: String,
    #[serde(skip)]
    pub issue: IntegrityIssue,
    pub kind: &'static str,
    pub detail: String,
}

impl AccountIssue {
    fn new(account_id: &str, issue: IntegrityIssue) -> Self {
        Self {
            account_id: account_id.to_string(),
            kind: issue.kind(),
            detail: issue.describe(),
            issue,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ValidationReport {
    pub accounts_scanned: usize,
    pub issues: Vec<AccountIssue>,
}

impl ValidationReport {
    /// Warnings never block a run; only error-severity issues make the
    /// ledger invalid.
    pub fn is_valid(&self) -> bool {
        self.error_count() == 0
    }

    pub fn error_count(&self) -> usize {
        self.issues
            .iter()
            .filter(|entry| entry.issue.severity() == IssueSeverity::Error)
            .count()
    }

    pub fn warning_count(&self) -> usize {
        self.issues.len() - self.error_count()
    }

    pub fn counts_by_kind(&self) -> BTreeMap<&'static str, usize> {
        let mut counts = BTreeMap::new();
        for entry in &self.issues {
            *counts.entry(entry.issue.kind()).or_insert(0) += 1;
        }
        counts
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FixSummary {
    pub accounts_fixed: usize,
    pub issues_fixed: usize,
}

pub fn issues_for(account: &Account) -> Vec<IntegrityIssue> {
    let mut issues = Vec::new();

    for denomination in DENOMINATIONS {
        let value = account.legacy.get(denomination);
        if value < 0 {
            issues.push(IntegrityIssue::NegativeBalance {
                denomination,
                value,
            });
        }
    }

    let expected = convert(&account.legacy);
    if account.migration_completed && account.unified_balance == 0 && expected > 0 {
        issues.push(IntegrityIssue::InconsistentMigration { expected });
    }
    if !account.migration_completed && account.unified_balance > 0 {
        issues.push(IntegrityIssue::OrphanedBalance {
            unified_balance: account.unified_balance,
        });
    }
    if expected > LARGE_CONVERSION_THRESHOLD {
        issues.push(IntegrityIssue::LargeConversion { amount: expected });
    }

    issues
}

pub fn validate(
    store: &LedgerStore,
    account_id: Option<&str>,
) -> Result<ValidationReport, EngineError> {
    let accounts = match account_id {
        Some(id) => match store.account(id)? {
            Some(account) => vec![account],
            None => {
                return Err(EngineError::NotFound {
                    account_id: id.to_string(),
                })
            }
        },
        None => store.accounts()?,
    };

    let mut report = ValidationReport {
        accounts_scanned: accounts.len(),
        issues: Vec::new(),
    };

    for account in &accounts {
        for issue in issues_for(account) {
            debug!(
                event = "integrity_issue",
                account_id = %account.id,
                kind = issue.kind(),
                detail = %issue.describe(),
            );
            report.issues.push(AccountIssue::new(&account.id, issue));
        }
    }

    info!(
        event = "validation_complete",
        accounts_scanned = report.accounts_scanned,
        errors = report.error_count(),
        warnings = report.warning_count(),
    );
    Ok(report)
}

/// Repairs every repairable issue in `report`, one transaction per
/// account. Repairs write no ledger records: they are data hygiene, not
/// economic events, so the audit trail stays a record of real currency
/// movements.
pub fn auto_fix(
    store: &mut LedgerStore,
    report: &ValidationReport,
) -> Result<FixSummary, EngineError> {
    let mut by_account: BTreeMap<&str, Vec<&IntegrityIssue>> = BTreeMap::new();
    for entry in &report.issues {
        by_account
            .entry(entry.account_id.as_str())
            .or_default()
            .push(&entry.issue);
    }

    let mut summary = FixSummary::default();
    for (account_id, issues) in by_account {
        let fixed = store.with_txn::<usize, EngineError, _>(|txn| {
            let Some(mut account) = txn.account(account_id)? else {
                // Account disappeared between scan and repair; nothing to fix.
                return Ok(0);
            };

            let mut fixed = 0;
            for issue in &issues {
                match issue {
                    IntegrityIssue::NegativeBalance { denomination, .. } => {
                        account.legacy.set(*denomination, 0);
                        fixed += 1;
                    }
                    IntegrityIssue::InconsistentMigration { .. } => {
                        // Return the account to pre-migration state so a
                        // later run can migrate it cleanly.
                        account.migration_completed = false;
                        account.unified_balance = 0;
                        fixed += 1;
                    }
                    IntegrityIssue::OrphanedBalance { .. } => {
                        account.unified_balance = 0;
                        fixed += 1;
                    }
                    IntegrityIssue::LargeConversion { .. } => {}
                }
            }

            if fixed > 0 {
                account.updated_at = chrono::Utc::now();
                txn.update_account(&account)?;
            }
            Ok(fixed)
        })?;

        if fixed > 0 {
            info!(
                event = "account_repaired",
                account_id,
                issues_fixed = fixed,
            );
            summary.accounts_fixed += 1;
            summary.issues_fixed += fixed;
        } else if issues
            .iter()
            .any(|issue| issue.severity() == IssueSeverity::Error)
        {
            warn!(event = "repair_skipped", account_id);
        }
    }

    Ok(summary)
}
