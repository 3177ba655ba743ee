use std::thread;
use std::time::Duration;

use chrono::Utc;
use tracing::{error, info, warn};
use ucm_core::{
    convert, Category, Direction, TransactionMetadata, TransactionRecord, CRITICAL_ERROR_RATIO,
    DEFAULT_BATCH_DELAY_MS, DEFAULT_BATCH_SIZE, ENGINE_SOURCE, MIGRATION_REASON,
};
use ucm_store::{LedgerStore, TargetSelector};

use crate::rollback::{RollbackConfig, RollbackEngine};
use crate::validator;
use crate::{EngineError, RunStats};

#[derive(Debug, Clone)]
pub struct MigrationConfig {
    pub dry_run: bool,
    pub batch_size: usize,
    pub batch_delay: Duration,
    pub target: TargetSelector,
    pub auto_fix: bool,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            dry_run: false,
            batch_size: DEFAULT_BATCH_SIZE,
            batch_delay: Duration::from_millis(DEFAULT_BATCH_DELAY_MS),
            target: TargetSelector::NotMigrated,
            auto_fix: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MigrationOutcome {
    Migrated { amount: i64 },
    Skipped { reason: String },
    DryRun { amount: i64 },
}

pub struct MigrationEngine {
    config: MigrationConfig,
}

impl MigrationEngine {
    pub fn new(config: MigrationConfig) -> Self {
        Self { config }
    }

    pub fn migrate_account(
        &self,
        store: &mut LedgerStore,
        account_id: &str,
    ) -> Result<MigrationOutcome, EngineError> {
        let dry_run = self.config.dry_run;
        store.with_txn::<MigrationOutcome, EngineError, _>(|txn| {
            let Some(mut account) = txn.account(account_id)? else {
                return Err(EngineError::NotFound {
                    account_id: account_id.to_string(),
                });
            };

            if account.migration_completed {
                return Ok(MigrationOutcome::Skipped {
                    reason: "already_migrated".to_string(),
                });
            }

            let amount = convert(&account.legacy);
            if dry_run {
                return Ok(MigrationOutcome::DryRun { amount });
            }

            let record = TransactionRecord::new(
                account_id,
                Direction::Credit,
                amount,
                MIGRATION_REASON,
                Category::Migration,
                ENGINE_SOURCE,
                TransactionMetadata::for_migration(&account.legacy),
            );
            txn.insert_record(&record)?;

            account.unified_balance = amount;
            account.migration_completed = true;
            account.updated_at = Utc::now();
            txn.update_account(&account)?;

            Ok(MigrationOutcome::Migrated { amount })
        })
    }

    pub fn run(&self, store: &mut LedgerStore, stats: &mut RunStats) -> Result<(), EngineError> {
        self.pre_run_validation(store)?;

        let ids = store.target_account_ids(&self.config.target)?;
        stats.total_accounts = ids.len();

        info!(
            event = "migration_run_start",
            total_accounts = stats.total_accounts,
            batch_size = self.config.batch_size,
            dry_run = self.config.dry_run,
        );

        for (batch_index, batch) in ids.chunks(self.config.batch_size.max(1)).enumerate() {
            if batch_index > 0 && !self.config.dry_run {
                thread::sleep(self.config.batch_delay);
            }

            for account_id in batch {
                match self.migrate_account(store, account_id) {
                    Ok(MigrationOutcome::Migrated { amount }) => {
                        stats.successful += 1;
                        stats.total_converted += amount;
                        stats.migrated_ids.push(account_id.clone());
                        info!(event = "account_migrated", account_id = %account_id, amount);
                    }
                    Ok(MigrationOutcome::DryRun { amount }) => {
                        stats.successful += 1;
                        stats.total_converted += amount;
                        info!(event = "migration_dry_run", account_id = %account_id, amount);
                    }
                    Ok(MigrationOutcome::Skipped { reason }) => {
                        stats.skipped += 1;
                        info!(event = "migration_skipped", account_id = %account_id, reason = %reason);
                    }
                    Err(err) => {
                        warn!(event = "migration_failed", account_id = %account_id, error = %err);
                        stats.record_failure(account_id, &err);
                    }
                }
            }

            if stats.failure_ratio() > CRITICAL_ERROR_RATIO {
                return Err(self.trip_circuit_breaker(store, stats));
            }
        }

        self.post_run_validation(store)?;
        info!(
            event = "migration_run_complete",
            successful = stats.successful,
            failed = stats.failed,
            skipped = stats.skipped,
            total_converted = stats.total_converted,
        );
        Ok(())
    }

    /// The run's only self-healing action: unwind everything this run
    /// migrated, then surface a hard error so the operator sees a failed
    /// run rather than a half-converted ledger.
    fn trip_circuit_breaker(&self, store: &mut LedgerStore, stats: &mut RunStats) -> EngineError {
        error!(
            event = "critical_error_threshold",
            failed = stats.failed,
            total_accounts = stats.total_accounts,
            migrated_so_far = stats.migrated_ids.len(),
        );

        // Emergency mode: compensation must not be blocked by spend that
        // happened mid-run, and there is no reason to throttle an abort.
        let rollback = RollbackEngine::new(RollbackConfig {
            emergency: true,
            ..RollbackConfig::default()
        });
        match rollback.compensate(store, &stats.migrated_ids) {
            Ok(rolled_back) => stats.rolled_back = rolled_back,
            Err(err) => {
                error!(event = "compensation_error", error = %err);
            }
        }

        EngineError::CriticalErrorThresholdExceeded {
            failed: stats.failed,
            total: stats.total_accounts,
            rolled_back: stats.rolled_back,
        }
    }

    fn pre_run_validation(&self, store: &mut LedgerStore) -> Result<(), EngineError> {
        let report = validator::validate(store, None)?;
        if report.is_valid() {
            return Ok(());
        }

        if !self.config.auto_fix {
            return Err(EngineError::Validation {
                error_count: report.error_count(),
            });
        }

        let summary = validator::auto_fix(store, &report)?;
        info!(
            event = "pre_run_auto_fix",
            accounts_fixed = summary.accounts_fixed,
            issues_fixed = summary.issues_fixed,
        );

        let recheck = validator::validate(store, None)?;
        if !recheck.is_valid() {
            return Err(EngineError::Validation {
                error_count: recheck.error_count(),
            });
        }
        Ok(())
    }

    // Non-blocking: migrations that introduced new inconsistencies are
    // reported, never unwound here.
    fn post_run_validation(&self, store: &LedgerStore) -> Result<(), EngineError> {
        let report = validator::validate(store, None)?;
        for entry in &report.issues {
            warn!(
                event = "post_run_issue",
                account_id = %entry.account_id,
                kind = entry.kind,
                detail = %entry.detail,
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ucm_core::{Account, LegacyBalances};

    fn test_config(target: TargetSelector) -> MigrationConfig {
        MigrationConfig {
            batch_delay: Duration::from_millis(0),
            target,
            ..MigrationConfig::default()
        }
    }

    fn seeded_store(accounts: &[(&str, LegacyBalances)]) -> LedgerStore {
        let store = LedgerStore::open_in_memory().expect("open store");
        for (id, legacy) in accounts {
            store
                .put_account(&Account::new(*id, *legacy, Utc::now()))
                .expect("seed account");
        }
        store
    }

    #[test]
    fn migration_converts_and_writes_one_credit_record() {
        let mut store = seeded_store(&[("acct-1", LegacyBalances::new(5, 0, 0))]);
        let engine = MigrationEngine::new(test_config(TargetSelector::NotMigrated));

        let outcome = engine
            .migrate_account(&mut store, "acct-1")
            .expect("migrate");
        assert_eq!(outcome, MigrationOutcome::Migrated { amount: 50 });

        let account = store.account("acct-1").expect("load").expect("present");
        assert!(account.migration_completed);
        assert_eq!(account.unified_balance, 50);

        let records = store.records_for_account("acct-1").expect("records");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].direction, Direction::Credit);
        assert_eq!(records[0].category, Category::Migration);
        assert_eq!(records[0].unified_amount, 50);
        assert_eq!(records[0].metadata.legacy_low, Some(5));
        assert_eq!(records[0].metadata.rate_low, Some(10));
    }

    #[test]
    fn second_migration_is_idempotent_noop() {
        let mut store = seeded_store(&[("acct-1", LegacyBalances::new(3, 2, 1))]);
        let engine = MigrationEngine::new(test_config(TargetSelector::NotMigrated));

        let first = engine
            .migrate_account(&mut store, "acct-1")
            .expect("first migrate");
        assert_eq!(first, MigrationOutcome::Migrated { amount: 1_230 });

        let second = engine
            .migrate_account(&mut store, "acct-1")
            .expect("second migrate");
        assert_eq!(
            second,
            MigrationOutcome::Skipped {
                reason: "already_migrated".to_string()
            }
        );

        let account = store.account("acct-1").expect("load").expect("present");
        assert_eq!(account.unified_balance, 1_230);
        assert_eq!(
            store
                .record_count_for_account("acct-1")
                .expect("record count"),
            1
        );
    }

    #[test]
    fn dry_run_reports_without_writing() {
        let mut store = seeded_store(&[("acct-1", LegacyBalances::new(5, 0, 0))]);
        let engine = MigrationEngine::new(MigrationConfig {
            dry_run: true,
            ..test_config(TargetSelector::NotMigrated)
        });

        let mut stats = RunStats::default();
        engine.run(&mut store, &mut stats).expect("dry run");

        assert_eq!(stats.successful, 1);
        assert_eq!(stats.total_converted, 50);
        assert!(stats.migrated_ids.is_empty());

        let account = store.account("acct-1").expect("load").expect("present");
        assert!(!account.migration_completed);
        assert_eq!(account.unified_balance, 0);
        assert_eq!(
            store
                .record_count_for_account("acct-1")
                .expect("record count"),
            0
        );
    }

    #[test]
    fn run_skips_already_migrated_accounts() {
        let mut store = seeded_store(&[
            ("acct-1", LegacyBalances::new(5, 0, 0)),
            ("acct-2", LegacyBalances::new(0, 1, 0)),
        ]);
        let engine = MigrationEngine::new(test_config(TargetSelector::NotMigrated));

        let mut first = RunStats::default();
        engine.run(&mut store, &mut first).expect("first run");
        assert_eq!(first.successful, 2);
        assert_eq!(first.total_converted, 150);

        // A restarted run re-scans everything and skips idempotently.
        let engine = MigrationEngine::new(test_config(TargetSelector::Ids(vec![
            "acct-1".to_string(),
            "acct-2".to_string(),
        ])));
        let mut second = RunStats::default();
        engine.run(&mut store, &mut second).expect("second run");
        assert_eq!(second.successful, 0);
        assert_eq!(second.skipped, 2);
    }

    #[test]
    fn invalid_ledger_blocks_run_without_auto_fix() {
        let mut store = seeded_store(&[("acct-1", LegacyBalances::new(-1, 0, 0))]);
        let engine = MigrationEngine::new(test_config(TargetSelector::NotMigrated));

        let mut stats = RunStats::default();
        let result = engine.run(&mut store, &mut stats);
        assert!(matches!(
            result,
            Err(EngineError::Validation { error_count: 1 })
        ));
        assert_eq!(stats.successful, 0);
    }

    #[test]
    fn auto_fix_repairs_then_migrates() {
        let mut store = seeded_store(&[("acct-1", LegacyBalances::new(-1, 2, 0))]);
        let engine = MigrationEngine::new(MigrationConfig {
            auto_fix: true,
            ..test_config(TargetSelector::NotMigrated)
        });

        let mut stats = RunStats::default();
        engine.run(&mut store, &mut stats).expect("run");

        let account = store.account("acct-1").expect("load").expect("present");
        assert!(account.migration_completed);
        // The negative low balance was clamped before conversion.
        assert_eq!(account.unified_balance, 200);
    }

    #[test]
    fn circuit_breaker_rolls_back_run_and_aborts() {
        let mut store = seeded_store(&[
            ("acct-1", LegacyBalances::new(5, 0, 0)),
            ("acct-2", LegacyBalances::new(0, 1, 0)),
        ]);

        // Two of four targets do not exist: 50% failure, far past the
        // 10% threshold after the only batch.
        let engine = MigrationEngine::new(test_config(TargetSelector::Ids(vec![
            "acct-1".to_string(),
            "acct-2".to_string(),
            "ghost-1".to_string(),
            "ghost-2".to_string(),
        ])));

        let mut stats = RunStats::default();
        let result = engine.run(&mut store, &mut stats);
        assert!(matches!(
            result,
            Err(EngineError::CriticalErrorThresholdExceeded {
                failed: 2,
                total: 4,
                rolled_back: 2,
            })
        ));
        assert_eq!(stats.rolled_back, 2);

        // Both accounts migrated before the trip were compensated.
        for id in ["acct-1", "acct-2"] {
            let account = store.account(id).expect("load").expect("present");
            assert!(!account.migration_completed);
            assert_eq!(account.unified_balance, 0);

            let records = store.records_for_account(id).expect("records");
            let rollback = records
                .iter()
                .find(|record| record.category == Category::MigrationRollback)
                .expect("compensating rollback record");
            assert_eq!(
                rollback.metadata.trigger.as_deref(),
                Some("critical_error_threshold")
            );
        }
    }

    #[test]
    fn circuit_breaker_trips_between_batches() {
        let mut store = seeded_store(&[("acct-1", LegacyBalances::new(5, 0, 0))]);

        // Batch size 2: the first batch fails one of two targets (25% of
        // the 4-account run), so the trip happens before the second batch
        // ever runs.
        let engine = MigrationEngine::new(MigrationConfig {
            batch_size: 2,
            ..test_config(TargetSelector::Ids(vec![
                "acct-1".to_string(),
                "ghost-1".to_string(),
                "ghost-2".to_string(),
                "ghost-3".to_string(),
            ]))
        });

        let mut stats = RunStats::default();
        let result = engine.run(&mut store, &mut stats);
        assert!(matches!(
            result,
            Err(EngineError::CriticalErrorThresholdExceeded { failed: 1, .. })
        ));
        // Only the first batch was processed.
        assert_eq!(stats.successful + stats.failed, 2);
    }
}
