use std::thread;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tracing::{info, warn};
use ucm_core::{
    Account, Category, Direction, TransactionMetadata, TransactionRecord, COMPENSATION_TRIGGER,
    DEFAULT_BATCH_DELAY_MS, DEFAULT_BATCH_SIZE, ENGINE_SOURCE, MIGRATION_REASON, ROLLBACK_REASON,
};
use ucm_store::{LedgerStore, LedgerTxn, TargetSelector};

use crate::{EngineError, RunStats};

#[derive(Debug, Clone)]
pub struct RollbackConfig {
    pub dry_run: bool,
    pub batch_size: usize,
    pub batch_delay: Duration,
    pub target: TargetSelector,
    pub emergency: bool,
    pub preserve_logs: bool,
}

impl Default for RollbackConfig {
    fn default() -> Self {
        Self {
            dry_run: false,
            batch_size: DEFAULT_BATCH_SIZE,
            batch_delay: Duration::from_millis(DEFAULT_BATCH_DELAY_MS),
            target: TargetSelector::Migrated,
            emergency: false,
            preserve_logs: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Eligibility {
    pub eligible: bool,
    pub reason: Option<String>,
    pub account: Option<Account>,
    pub original_record: Option<TransactionRecord>,
    pub has_spent: bool,
    pub total_spent: i64,
}

impl Eligibility {
    fn refused(reason: &str) -> Self {
        Self {
            eligible: false,
            reason: Some(reason.to_string()),
            account: None,
            original_record: None,
            has_spent: false,
            total_spent: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RollbackOutcome {
    RolledBack { amount: i64 },
    Skipped { reason: String },
    DryRun { amount: i64 },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RollbackValidation {
    pub still_migrated: usize,
    pub orphaned_balances: i64,
    pub rollback_records_written: i64,
}

pub struct RollbackEngine {
    config: RollbackConfig,
}

impl RollbackEngine {
    pub fn new(config: RollbackConfig) -> Self {
        Self { config }
    }

    pub fn check_eligibility(
        &self,
        store: &LedgerStore,
        account_id: &str,
    ) -> Result<Eligibility, EngineError> {
        let Some(account) = store.account(account_id)? else {
            return Ok(Eligibility::refused("account_not_found"));
        };
        let original = store.latest_migration_record(account_id, MIGRATION_REASON)?;
        let spend = match &original {
            Some(record) => store.spend_since(account_id, record.created_at, ENGINE_SOURCE)?,
            None => Default::default(),
        };
        Ok(self.evaluate(account, original, spend.total))
    }

    // The rollback transaction re-runs eligibility against the same
    // snapshot it writes to; record linkage is re-queried rather than
    // trusted from an earlier read.
    fn eligibility_in_txn(
        &self,
        txn: &LedgerTxn<'_>,
        account_id: &str,
    ) -> Result<Eligibility, EngineError> {
        let Some(account) = txn.account(account_id)? else {
            return Ok(Eligibility::refused("account_not_found"));
        };
        let original = txn.latest_migration_record(account_id, MIGRATION_REASON)?;
        let spend = match &original {
            Some(record) => txn.spend_since(account_id, record.created_at, ENGINE_SOURCE)?,
            None => Default::default(),
        };
        Ok(self.evaluate(account, original, spend.total))
    }

    fn evaluate(
        &self,
        account: Account,
        original: Option<TransactionRecord>,
        total_spent: i64,
    ) -> Eligibility {
        if !account.migration_completed {
            return Eligibility::refused("not_migrated");
        }
        let Some(original) = original else {
            return Eligibility::refused("migration_record_not_found");
        };

        let has_spent = total_spent > 0;
        if has_spent && !self.config.emergency {
            // Standard mode protects accounts that already used their
            // converted balance; emergency mode waives this and records
            // the waiver in the rollback metadata.
            return Eligibility {
                eligible: false,
                reason: Some("spent_since_migration".to_string()),
                account: Some(account),
                original_record: Some(original),
                has_spent,
                total_spent,
            };
        }

        Eligibility {
            eligible: true,
            reason: None,
            account: Some(account),
            original_record: Some(original),
            has_spent,
            total_spent,
        }
    }

    pub fn rollback_account(
        &self,
        store: &mut LedgerStore,
        account_id: &str,
    ) -> Result<RollbackOutcome, EngineError> {
        self.rollback_account_inner(store, account_id, None)
    }

    fn rollback_account_inner(
        &self,
        store: &mut LedgerStore,
        account_id: &str,
        trigger: Option<&str>,
    ) -> Result<RollbackOutcome, EngineError> {
        let config = &self.config;
        store.with_txn::<RollbackOutcome, EngineError, _>(|txn| {
            let eligibility = self.eligibility_in_txn(txn, account_id)?;
            if !eligibility.eligible {
                let reason = eligibility.reason.unwrap_or_else(|| "ineligible".to_string());
                return Ok(RollbackOutcome::Skipped { reason });
            }

            let (mut account, original) = match (eligibility.account, eligibility.original_record)
            {
                (Some(account), Some(original)) => (account, original),
                _ => {
                    return Ok(RollbackOutcome::Skipped {
                        reason: "ineligible".to_string(),
                    })
                }
            };
            let amount = account.unified_balance;

            if config.dry_run {
                return Ok(RollbackOutcome::DryRun { amount });
            }

            account.unified_balance = 0;
            account.migration_completed = false;
            account.updated_at = Utc::now();
            txn.update_account(&account)?;

            let metadata = TransactionMetadata {
                original_transaction_id: Some(original.id.clone()),
                amount_reverted: Some(amount),
                emergency_mode: Some(config.emergency),
                had_spent_mana: Some(eligibility.has_spent),
                spend_waived: Some(eligibility.has_spent && config.emergency),
                trigger: trigger.map(|value| value.to_string()),
                ..TransactionMetadata::default()
            };
            let record = TransactionRecord::new(
                account_id,
                Direction::Debit,
                amount,
                ROLLBACK_REASON,
                Category::MigrationRollback,
                ENGINE_SOURCE,
                metadata,
            );
            txn.insert_record(&record)?;

            // Never delete audit evidence: the original migration record
            // is marked superseded unless the operator asked to leave the
            // trail untouched.
            if !config.preserve_logs {
                txn.mark_superseded(&original.id, &record.id)?;
            }

            Ok(RollbackOutcome::RolledBack { amount })
        })
    }

    pub fn run(
        &self,
        store: &mut LedgerStore,
        stats: &mut RunStats,
    ) -> Result<RollbackValidation, EngineError> {
        let run_started = Utc::now();
        let ids = store.target_account_ids(&self.config.target)?;
        stats.total_accounts = ids.len();

        info!(
            event = "rollback_run_start",
            total_accounts = stats.total_accounts,
            dry_run = self.config.dry_run,
            emergency = self.config.emergency,
        );

        for (batch_index, batch) in ids.chunks(self.config.batch_size.max(1)).enumerate() {
            // Emergency rollbacks trade throttling for speed.
            if batch_index > 0 && !self.config.emergency && !self.config.dry_run {
                thread::sleep(self.config.batch_delay);
            }

            for account_id in batch {
                match self.rollback_account(store, account_id) {
                    Ok(RollbackOutcome::RolledBack { amount }) => {
                        stats.successful += 1;
                        stats.rolled_back += 1;
                        info!(event = "account_rolled_back", account_id = %account_id, amount);
                    }
                    Ok(RollbackOutcome::DryRun { amount }) => {
                        stats.successful += 1;
                        info!(event = "rollback_dry_run", account_id = %account_id, amount);
                    }
                    Ok(RollbackOutcome::Skipped { reason }) => {
                        stats.skipped += 1;
                        info!(event = "rollback_skipped", account_id = %account_id, reason = %reason);
                    }
                    Err(err) => {
                        warn!(event = "rollback_failed", account_id = %account_id, error = %err);
                        stats.record_failure(account_id, &err);
                    }
                }
            }
        }

        let validation = self.post_run_validation(store, &ids, run_started)?;
        info!(
            event = "rollback_run_complete",
            rolled_back = stats.rolled_back,
            skipped = stats.skipped,
            failed = stats.failed,
            still_migrated = validation.still_migrated,
        );
        Ok(validation)
    }

    /// Used by the migration circuit breaker: unwind the accounts a
    /// failing run already migrated, tagging each rollback record with
    /// the triggering condition.
    pub fn compensate(
        &self,
        store: &mut LedgerStore,
        account_ids: &[String],
    ) -> Result<usize, EngineError> {
        let mut rolled_back = 0;
        for account_id in account_ids {
            match self.rollback_account_inner(store, account_id, Some(COMPENSATION_TRIGGER)) {
                Ok(RollbackOutcome::RolledBack { amount }) => {
                    rolled_back += 1;
                    info!(event = "compensating_rollback", account_id = %account_id, amount);
                }
                Ok(outcome) => {
                    warn!(event = "compensation_skipped", account_id = %account_id, outcome = ?outcome);
                }
                Err(err) => {
                    warn!(event = "compensation_failed", account_id = %account_id, error = %err);
                }
            }
        }
        Ok(rolled_back)
    }

    fn post_run_validation(
        &self,
        store: &LedgerStore,
        target_ids: &[String],
        run_started: chrono::DateTime<Utc>,
    ) -> Result<RollbackValidation, EngineError> {
        let mut still_migrated = 0;
        for account_id in target_ids {
            if let Some(account) = store.account(account_id)? {
                if account.migration_completed {
                    still_migrated += 1;
                }
            }
        }

        let validation = RollbackValidation {
            still_migrated,
            orphaned_balances: store.orphaned_balance_count()?,
            rollback_records_written: store
                .record_count_since(&Category::MigrationRollback, run_started)?,
        };

        if !self.config.dry_run && validation.still_migrated > 0 {
            warn!(
                event = "rollback_incomplete",
                still_migrated = validation.still_migrated,
            );
        }
        if validation.orphaned_balances > 0 {
            warn!(
                event = "orphaned_balances_detected",
                count = validation.orphaned_balances,
            );
        }
        Ok(validation)
    }
}
