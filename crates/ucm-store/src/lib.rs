use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::path::Path;
use thiserror::Error;
use ucm_core::{Account, Category, Direction, LegacyBalances, TransactionRecord};

pub const LEDGER_SCHEMA_VERSION: i64 = 1;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("timestamp parse error: {0}")]
    Timestamp(String),
    #[error("unsupported schema version {found}, max supported {supported}")]
    UnsupportedSchemaVersion { found: i64, supported: i64 },
}

/// How a run selects its target account set. Selection order is stable
/// (`created_at, account_id`) so repeated dry runs report identically.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetSelector {
    Ids(Vec<String>),
    NotMigrated,
    Migrated,
    MigratedSince(DateTime<Utc>),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SpendSummary {
    pub total: i64,
    pub records: i64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LedgerTotals {
    pub total_accounts: i64,
    pub migrated_accounts: i64,
    pub pending_accounts: i64,
    pub unified_total: i64,
    pub migration_records: i64,
    pub rollback_records: i64,
}

pub struct LedgerStore {
    conn: Connection,
}

/// Write handle scoped to one open SQLite transaction. All writes made
/// through it commit together or not at all.
pub struct LedgerTxn<'a> {
    conn: &'a Connection,
}

impl LedgerStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        let store = Self { conn };
        store.migrate()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn };
        store.migrate()?;
        Ok(store)
    }

    pub fn schema_version(&self) -> Result<i64, StoreError> {
        Ok(self
            .conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))?)
    }

    pub fn migrate(&self) -> Result<(), StoreError> {
        let current = self.schema_version()?;
        if current > LEDGER_SCHEMA_VERSION {
            return Err(StoreError::UnsupportedSchemaVersion {
                found: current,
                supported: LEDGER_SCHEMA_VERSION,
            });
        }

        if current < 1 {
            let sql = include_str!("../migrations/0001_ledger_schema.sql");
            self.conn.execute_batch(sql)?;
            self.conn
                .execute("PRAGMA user_version = 1", [])
                .map(|_| ())?;
        }

        Ok(())
    }

    /// Runs `f` inside one SQLite transaction. The transaction commits on
    /// `Ok` and rolls back entirely on `Err`, so a failing per-account
    /// unit of work leaves no partial writes behind.
    pub fn with_txn<T, E, F>(&mut self, f: F) -> Result<T, E>
    where
        E: From<StoreError>,
        F: FnOnce(&LedgerTxn<'_>) -> Result<T, E>,
    {
        let txn = self
            .conn
            .transaction()
            .map_err(|err| E::from(StoreError::from(err)))?;
        let value = {
            let view = LedgerTxn { conn: &txn };
            f(&view)?
        };
        txn.commit().map_err(|err| E::from(StoreError::from(err)))?;
        Ok(value)
    }

    pub fn put_account(&self, account: &Account) -> Result<(), StoreError> {
        self.conn.execute(
            "
            INSERT OR REPLACE INTO accounts (
                account_id,
                legacy_low,
                legacy_mid,
                legacy_high,
                unified_balance,
                migration_completed,
                created_at,
                updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ",
            params![
                account.id,
                account.legacy.low,
                account.legacy.mid,
                account.legacy.high,
                account.unified_balance,
                account.migration_completed as i64,
                fmt_timestamp(&account.created_at),
                fmt_timestamp(&account.updated_at),
            ],
        )?;
        Ok(())
    }

    pub fn account(&self, account_id: &str) -> Result<Option<Account>, StoreError> {
        query_account(&self.conn, account_id)
    }

    pub fn accounts(&self) -> Result<Vec<Account>, StoreError> {
        let mut statement = self.conn.prepare(
            "
            SELECT account_id, legacy_low, legacy_mid, legacy_high,
                   unified_balance, migration_completed, created_at, updated_at
            FROM accounts
            ORDER BY created_at ASC, account_id ASC
            ",
        )?;

        let rows = statement.query_map([], read_account_row)?;
        let mut accounts = Vec::new();
        for row in rows {
            accounts.push(row?);
        }
        Ok(accounts)
    }

    pub fn account_count(&self) -> Result<i64, StoreError> {
        let count = self
            .conn
            .query_row("SELECT COUNT(*) FROM accounts", [], |row| row.get(0))?;
        Ok(count)
    }

    pub fn target_account_ids(&self, selector: &TargetSelector) -> Result<Vec<String>, StoreError> {
        let sql = match selector {
            // Explicit ids keep operator-supplied order; missing accounts
            // surface later as per-unit NotFound failures.
            TargetSelector::Ids(ids) => return Ok(ids.clone()),
            TargetSelector::NotMigrated => {
                "
                SELECT account_id FROM accounts
                WHERE migration_completed = 0
                ORDER BY created_at ASC, account_id ASC
                "
            }
            TargetSelector::Migrated => {
                "
                SELECT account_id FROM accounts
                WHERE migration_completed = 1
                ORDER BY created_at ASC, account_id ASC
                "
            }
            TargetSelector::MigratedSince(_) => {
                "
                SELECT a.account_id FROM accounts a
                WHERE a.migration_completed = 1 AND EXISTS (
                    SELECT 1 FROM ledger_records r
                    WHERE r.account_id = a.account_id
                      AND r.category = 'migration'
                      AND r.created_at >= ?1
                )
                ORDER BY a.created_at ASC, a.account_id ASC
                "
            }
        };

        let mut statement = self.conn.prepare(sql)?;
        let ids: Vec<String> = match selector {
            TargetSelector::MigratedSince(since) => statement
                .query_map([fmt_timestamp(since)], |row| row.get(0))?
                .collect::<Result<_, _>>()?,
            _ => statement
                .query_map([], |row| row.get(0))?
                .collect::<Result<_, _>>()?,
        };
        Ok(ids)
    }

    pub fn record(&self, record_id: &str) -> Result<Option<TransactionRecord>, StoreError> {
        let record = self
            .conn
            .query_row(
                &format!("{RECORD_SELECT} WHERE record_id = ?1"),
                [record_id],
                read_record_row,
            )
            .optional()?;
        Ok(record)
    }

    pub fn records_for_account(
        &self,
        account_id: &str,
    ) -> Result<Vec<TransactionRecord>, StoreError> {
        let mut statement = self.conn.prepare(&format!(
            "{RECORD_SELECT} WHERE account_id = ?1 ORDER BY created_at ASC, record_id ASC"
        ))?;

        let rows = statement.query_map([account_id], read_record_row)?;
        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    }

    pub fn recent_records(
        &self,
        category: &Category,
        limit: usize,
    ) -> Result<Vec<TransactionRecord>, StoreError> {
        let mut statement = self.conn.prepare(&format!(
            "{RECORD_SELECT} WHERE category = ?1 ORDER BY created_at DESC, record_id DESC LIMIT ?2"
        ))?;

        let rows =
            statement.query_map(params![category.as_str(), limit as i64], read_record_row)?;
        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    }

    pub fn record_count_since(
        &self,
        category: &Category,
        since: DateTime<Utc>,
    ) -> Result<i64, StoreError> {
        let count = self.conn.query_row(
            "SELECT COUNT(*) FROM ledger_records WHERE category = ?1 AND created_at >= ?2",
            params![category.as_str(), fmt_timestamp(&since)],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    pub fn record_count_for_account(&self, account_id: &str) -> Result<i64, StoreError> {
        let count = self.conn.query_row(
            "SELECT COUNT(*) FROM ledger_records WHERE account_id = ?1",
            [account_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    pub fn latest_migration_record(
        &self,
        account_id: &str,
        reason: &str,
    ) -> Result<Option<TransactionRecord>, StoreError> {
        query_latest_migration_record(&self.conn, account_id, reason)
    }

    pub fn spend_since(
        &self,
        account_id: &str,
        after: DateTime<Utc>,
        exclude_source: &str,
    ) -> Result<SpendSummary, StoreError> {
        query_spend_since(&self.conn, account_id, after, exclude_source)
    }

    pub fn orphaned_balance_count(&self) -> Result<i64, StoreError> {
        let count = self.conn.query_row(
            "SELECT COUNT(*) FROM accounts WHERE migration_completed = 0 AND unified_balance > 0",
            [],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    pub fn totals(&self) -> Result<LedgerTotals, StoreError> {
        let (total_accounts, migrated_accounts, unified_total) = self.conn.query_row(
            "
            SELECT COUNT(*),
                   COALESCE(SUM(migration_completed), 0),
                   COALESCE(SUM(unified_balance), 0)
            FROM accounts
            ",
            [],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                ))
            },
        )?;

        let migration_records = self.category_count(Category::Migration.as_str())?;
        let rollback_records = self.category_count(Category::MigrationRollback.as_str())?;

        Ok(LedgerTotals {
            total_accounts,
            migrated_accounts,
            pending_accounts: total_accounts - migrated_accounts,
            unified_total,
            migration_records,
            rollback_records,
        })
    }

    fn category_count(&self, category: &str) -> Result<i64, StoreError> {
        let count = self.conn.query_row(
            "SELECT COUNT(*) FROM ledger_records WHERE category = ?1",
            [category],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    pub fn table_exists(&self, table_name: &str) -> Result<bool, StoreError> {
        let exists = self
            .conn
            .query_row(
                "
                SELECT 1
                FROM sqlite_master
                WHERE type='table' AND name = ?1
                LIMIT 1
                ",
                [table_name],
                |_| Ok(()),
            )
            .optional()?;
        Ok(exists.is_some())
    }
}

impl LedgerTxn<'_> {
    pub fn account(&self, account_id: &str) -> Result<Option<Account>, StoreError> {
        query_account(self.conn, account_id)
    }

    pub fn update_account(&self, account: &Account) -> Result<(), StoreError> {
        self.conn.execute(
            "
            UPDATE accounts SET
                legacy_low = ?2,
                legacy_mid = ?3,
                legacy_high = ?4,
                unified_balance = ?5,
                migration_completed = ?6,
                updated_at = ?7
            WHERE account_id = ?1
            ",
            params![
                account.id,
                account.legacy.low,
                account.legacy.mid,
                account.legacy.high,
                account.unified_balance,
                account.migration_completed as i64,
                fmt_timestamp(&account.updated_at),
            ],
        )?;
        Ok(())
    }

    pub fn insert_record(&self, record: &TransactionRecord) -> Result<(), StoreError> {
        let metadata_json = serde_json::to_string(&record.metadata)
            .map_err(|err| StoreError::Serialization(err.to_string()))?;

        self.conn.execute(
            "
            INSERT INTO ledger_records (
                record_id,
                account_id,
                direction,
                unified_amount,
                reason,
                category,
                source,
                created_at,
                metadata_json,
                superseded_by
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            ",
            params![
                record.id,
                record.account_id,
                record.direction.as_str(),
                record.unified_amount,
                record.reason,
                record.category.as_str(),
                record.source,
                fmt_timestamp(&record.created_at),
                metadata_json,
                record.superseded_by,
            ],
        )?;
        Ok(())
    }

    pub fn mark_superseded(&self, record_id: &str, superseded_by: &str) -> Result<(), StoreError> {
        self.conn.execute(
            "UPDATE ledger_records SET superseded_by = ?2 WHERE record_id = ?1",
            params![record_id, superseded_by],
        )?;
        Ok(())
    }

    // Retained for the legacy audit-trimming path; the default rollback
    // flow marks records superseded instead of deleting them.
    pub fn delete_record(&self, record_id: &str) -> Result<(), StoreError> {
        self.conn.execute(
            "DELETE FROM ledger_records WHERE record_id = ?1",
            [record_id],
        )?;
        Ok(())
    }

    pub fn latest_migration_record(
        &self,
        account_id: &str,
        reason: &str,
    ) -> Result<Option<TransactionRecord>, StoreError> {
        query_latest_migration_record(self.conn, account_id, reason)
    }

    pub fn spend_since(
        &self,
        account_id: &str,
        after: DateTime<Utc>,
        exclude_source: &str,
    ) -> Result<SpendSummary, StoreError> {
        query_spend_since(self.conn, account_id, after, exclude_source)
    }
}

// Timestamps are compared lexicographically in SQL, so every stored or
// bound value uses the same fixed-width fractional precision.
fn fmt_timestamp(timestamp: &DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Micros, true)
}

const RECORD_SELECT: &str = "
    SELECT record_id, account_id, direction, unified_amount, reason,
           category, source, created_at, metadata_json, superseded_by
    FROM ledger_records
";

fn query_account(conn: &Connection, account_id: &str) -> Result<Option<Account>, StoreError> {
    let account = conn
        .query_row(
            "
            SELECT account_id, legacy_low, legacy_mid, legacy_high,
                   unified_balance, migration_completed, created_at, updated_at
            FROM accounts
            WHERE account_id = ?1
            ",
            [account_id],
            read_account_row,
        )
        .optional()?;
    Ok(account)
}

fn query_latest_migration_record(
    conn: &Connection,
    account_id: &str,
    reason: &str,
) -> Result<Option<TransactionRecord>, StoreError> {
    let record = conn
        .query_row(
            &format!(
                "{RECORD_SELECT}
                WHERE account_id = ?1 AND category = ?2 AND reason = ?3
                ORDER BY created_at DESC, record_id DESC
                LIMIT 1"
            ),
            params![account_id, Category::Migration.as_str(), reason],
            read_record_row,
        )
        .optional()?;
    Ok(record)
}

fn query_spend_since(
    conn: &Connection,
    account_id: &str,
    after: DateTime<Utc>,
    exclude_source: &str,
) -> Result<SpendSummary, StoreError> {
    let summary = conn.query_row(
        "
        SELECT COALESCE(SUM(unified_amount), 0), COUNT(*)
        FROM ledger_records
        WHERE account_id = ?1
          AND direction = 'debit'
          AND created_at > ?2
          AND source <> ?3
        ",
        params![account_id, fmt_timestamp(&after), exclude_source],
        |row| {
            Ok(SpendSummary {
                total: row.get(0)?,
                records: row.get(1)?,
            })
        },
    )?;
    Ok(summary)
}

fn read_account_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Account> {
    let created_at = parse_row_timestamp(row.get::<_, String>(6)?, 6)?;
    let updated_at = parse_row_timestamp(row.get::<_, String>(7)?, 7)?;

    Ok(Account {
        id: row.get(0)?,
        legacy: LegacyBalances {
            low: row.get(1)?,
            mid: row.get(2)?,
            high: row.get(3)?,
        },
        unified_balance: row.get(4)?,
        migration_completed: row.get::<_, i64>(5)? != 0,
        created_at,
        updated_at,
    })
}

fn read_record_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<TransactionRecord> {
    let direction_raw: String = row.get(2)?;
    let direction: Direction = direction_raw.parse().map_err(|message: String| {
        rusqlite::Error::FromSqlConversionFailure(
            2,
            rusqlite::types::Type::Text,
            Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, message)),
        )
    })?;

    let category_raw: String = row.get(5)?;
    let category: Category = category_raw
        .parse()
        .unwrap_or(Category::Other(category_raw));

    let created_at = parse_row_timestamp(row.get::<_, String>(7)?, 7)?;

    let metadata_json: String = row.get(8)?;
    let metadata = serde_json::from_str(&metadata_json).map_err(|err| {
        rusqlite::Error::FromSqlConversionFailure(8, rusqlite::types::Type::Text, Box::new(err))
    })?;

    Ok(TransactionRecord {
        id: row.get(0)?,
        account_id: row.get(1)?,
        direction,
        unified_amount: row.get(3)?,
        reason: row.get(4)?,
        category,
        source: row.get(6)?,
        created_at,
        metadata,
        superseded_by: row.get(9)?,
    })
}

fn parse_row_timestamp(value: String, column: usize) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&value)
        .map(|timestamp| timestamp.with_timezone(&Utc))
        .map_err(|err| {
            rusqlite::Error::FromSqlConversionFailure(
                column,
                rusqlite::types::Type::Text,
                Box::new(err),
            )
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::NamedTempFile;
    use ucm_core::{TransactionMetadata, ENGINE_SOURCE, MIGRATION_REASON};

    fn ts(hour: u32, min: u32, sec: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 8, 20, hour, min, sec)
            .single()
            .expect("valid timestamp")
    }

    fn seed_account(store: &LedgerStore, id: &str, legacy: LegacyBalances, at: DateTime<Utc>) {
        store
            .put_account(&Account::new(id, legacy, at))
            .expect("seed account");
    }

    fn migration_record(account_id: &str, amount: i64, at: DateTime<Utc>) -> TransactionRecord {
        let mut record = TransactionRecord::new(
            account_id,
            Direction::Credit,
            amount,
            MIGRATION_REASON,
            Category::Migration,
            ENGINE_SOURCE,
            TransactionMetadata::default(),
        );
        record.created_at = at;
        record
    }

    #[test]
    fn migration_creates_ledger_tables() {
        let store = LedgerStore::open_in_memory().expect("open store");

        for table in ["accounts", "ledger_records"] {
            assert!(store.table_exists(table).expect("table check"));
        }
        assert_eq!(
            store.schema_version().expect("schema version"),
            LEDGER_SCHEMA_VERSION
        );
    }

    #[test]
    fn account_roundtrip_preserves_balances_and_flags() {
        let file = NamedTempFile::new().expect("temp db");
        let store = LedgerStore::open(file.path()).expect("open store");

        let mut account = Account::new("acct-1", LegacyBalances::new(3, 2, 1), ts(9, 0, 0));
        account.unified_balance = 1_230;
        account.migration_completed = true;
        store.put_account(&account).expect("put account");

        let loaded = store
            .account("acct-1")
            .expect("load account")
            .expect("account present");
        assert_eq!(loaded, account);
        assert_eq!(store.account_count().expect("count"), 1);
        assert!(store.account("missing").expect("query missing").is_none());
    }

    #[test]
    fn record_roundtrip_preserves_metadata_and_supersession() {
        let store = LedgerStore::open_in_memory().expect("open store");
        seed_account(&store, "acct-1", LegacyBalances::new(5, 0, 0), ts(9, 0, 0));

        let mut record = migration_record("acct-1", 50, ts(9, 1, 0));
        record.metadata = TransactionMetadata::for_migration(&LegacyBalances::new(5, 0, 0));
        let record_id = record.id.clone();

        let mut store = store;
        store
            .with_txn::<_, StoreError, _>(|txn| txn.insert_record(&record))
            .expect("insert record");

        let loaded = store
            .record(&record_id)
            .expect("load record")
            .expect("record present");
        assert_eq!(loaded.metadata.legacy_low, Some(5));
        assert_eq!(loaded.category, Category::Migration);
        assert!(loaded.superseded_by.is_none());

        store
            .with_txn::<_, StoreError, _>(|txn| txn.mark_superseded(&record_id, "rb-1"))
            .expect("mark superseded");
        let superseded = store
            .record(&record_id)
            .expect("reload record")
            .expect("record present");
        assert_eq!(superseded.superseded_by.as_deref(), Some("rb-1"));
    }

    #[test]
    fn failed_transaction_leaves_no_partial_writes() {
        let mut store = LedgerStore::open_in_memory().expect("open store");
        seed_account(&store, "acct-1", LegacyBalances::new(5, 0, 0), ts(9, 0, 0));

        let record = migration_record("acct-1", 50, ts(9, 1, 0));
        let record_id = record.id.clone();

        let result = store.with_txn::<(), StoreError, _>(|txn| {
            txn.insert_record(&record)?;
            let mut account = txn.account("acct-1")?.expect("account present");
            account.unified_balance = 50;
            txn.update_account(&account)?;
            Err(StoreError::Serialization("injected failure".to_string()))
        });
        assert!(result.is_err());

        assert!(store.record(&record_id).expect("query record").is_none());
        let account = store
            .account("acct-1")
            .expect("load account")
            .expect("account present");
        assert_eq!(account.unified_balance, 0);
    }

    #[test]
    fn target_selectors_return_stable_ordering() {
        let mut store = LedgerStore::open_in_memory().expect("open store");
        seed_account(&store, "acct-b", LegacyBalances::new(1, 0, 0), ts(9, 0, 1));
        seed_account(&store, "acct-a", LegacyBalances::new(1, 0, 0), ts(9, 0, 0));
        seed_account(&store, "acct-c", LegacyBalances::new(1, 0, 0), ts(9, 0, 2));

        // acct-a migrated at 10:00, acct-c migrated at 11:00.
        for (id, at) in [("acct-a", ts(10, 0, 0)), ("acct-c", ts(11, 0, 0))] {
            let mut account = store.account(id).expect("load").expect("present");
            account.migration_completed = true;
            account.unified_balance = 10;
            store.put_account(&account).expect("update");
            let record = migration_record(id, 10, at);
            store
                .with_txn::<_, StoreError, _>(|txn| txn.insert_record(&record))
                .expect("insert migration record");
        }

        assert_eq!(
            store
                .target_account_ids(&TargetSelector::NotMigrated)
                .expect("not migrated"),
            vec!["acct-b".to_string()]
        );
        assert_eq!(
            store
                .target_account_ids(&TargetSelector::Migrated)
                .expect("migrated"),
            vec!["acct-a".to_string(), "acct-c".to_string()]
        );
        assert_eq!(
            store
                .target_account_ids(&TargetSelector::MigratedSince(ts(10, 30, 0)))
                .expect("migrated since"),
            vec!["acct-c".to_string()]
        );
        assert_eq!(
            store
                .target_account_ids(&TargetSelector::Ids(vec![
                    "z".to_string(),
                    "a".to_string()
                ]))
                .expect("explicit ids"),
            vec!["z".to_string(), "a".to_string()]
        );
    }

    #[test]
    fn spend_since_ignores_engine_sourced_debits() {
        let mut store = LedgerStore::open_in_memory().expect("open store");
        seed_account(&store, "acct-1", LegacyBalances::new(5, 0, 0), ts(9, 0, 0));

        let mut quest_spend = TransactionRecord::new(
            "acct-1",
            Direction::Debit,
            10,
            "quest entry fee",
            Category::Other("quest".to_string()),
            "quest_service",
            TransactionMetadata::default(),
        );
        quest_spend.created_at = ts(10, 0, 0);

        let mut engine_debit = TransactionRecord::new(
            "acct-1",
            Direction::Debit,
            50,
            ucm_core::ROLLBACK_REASON,
            Category::MigrationRollback,
            ENGINE_SOURCE,
            TransactionMetadata::default(),
        );
        engine_debit.created_at = ts(10, 5, 0);

        let mut early_spend = TransactionRecord::new(
            "acct-1",
            Direction::Debit,
            7,
            "pre-migration spend",
            Category::Other("quest".to_string()),
            "quest_service",
            TransactionMetadata::default(),
        );
        early_spend.created_at = ts(8, 0, 0);

        store
            .with_txn::<_, StoreError, _>(|txn| {
                txn.insert_record(&quest_spend)?;
                txn.insert_record(&engine_debit)?;
                txn.insert_record(&early_spend)
            })
            .expect("insert debits");

        let summary = store
            .spend_since("acct-1", ts(9, 30, 0), ENGINE_SOURCE)
            .expect("spend summary");
        assert_eq!(summary.total, 10);
        assert_eq!(summary.records, 1);
    }

    #[test]
    fn totals_aggregate_accounts_and_record_categories() {
        let mut store = LedgerStore::open_in_memory().expect("open store");
        seed_account(&store, "acct-1", LegacyBalances::new(5, 0, 0), ts(9, 0, 0));
        seed_account(&store, "acct-2", LegacyBalances::new(0, 1, 0), ts(9, 0, 1));

        let mut migrated = store.account("acct-1").expect("load").expect("present");
        migrated.migration_completed = true;
        migrated.unified_balance = 50;
        store.put_account(&migrated).expect("update");

        let record = migration_record("acct-1", 50, ts(10, 0, 0));
        store
            .with_txn::<_, StoreError, _>(|txn| txn.insert_record(&record))
            .expect("insert record");

        let totals = store.totals().expect("totals");
        assert_eq!(totals.total_accounts, 2);
        assert_eq!(totals.migrated_accounts, 1);
        assert_eq!(totals.pending_accounts, 1);
        assert_eq!(totals.unified_total, 50);
        assert_eq!(totals.migration_records, 1);
        assert_eq!(totals.rollback_records, 0);

        assert_eq!(
            store
                .record_count_since(&Category::Migration, ts(9, 59, 0))
                .expect("count since"),
            1
        );
        let recent = store
            .recent_records(&Category::Migration, 10)
            .expect("recent records");
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].account_id, "acct-1");
    }

    #[test]
    fn delete_record_removes_audit_row() {
        let mut store = LedgerStore::open_in_memory().expect("open store");
        seed_account(&store, "acct-1", LegacyBalances::new(5, 0, 0), ts(9, 0, 0));

        let record = migration_record("acct-1", 50, ts(9, 1, 0));
        let record_id = record.id.clone();
        store
            .with_txn::<_, StoreError, _>(|txn| txn.insert_record(&record))
            .expect("insert record");

        store
            .with_txn::<_, StoreError, _>(|txn| txn.delete_record(&record_id))
            .expect("delete record");

        assert!(store.record(&record_id).expect("query record").is_none());
        assert_eq!(
            store
                .record_count_for_account("acct-1")
                .expect("record count"),
            0
        );
    }

    #[test]
    fn timestamp_comparisons_hold_at_exact_second_boundaries() {
        let mut store = LedgerStore::open_in_memory().expect("open store");
        seed_account(&store, "acct-1", LegacyBalances::new(5, 0, 0), ts(9, 0, 0));

        // Whole-second and sub-second records land in one fixed-width
        // format, so the strict cutoff cannot mis-order them.
        let boundary = ts(10, 0, 0);
        let mut at_boundary = TransactionRecord::new(
            "acct-1",
            Direction::Debit,
            10,
            "quest entry fee",
            Category::Other("quest".to_string()),
            "quest_service",
            TransactionMetadata::default(),
        );
        at_boundary.created_at = boundary;

        let mut just_after = at_boundary.clone();
        just_after.id = "rec-after".to_string();
        just_after.unified_amount = 3;
        just_after.created_at = boundary + chrono::Duration::microseconds(1);

        store
            .with_txn::<_, StoreError, _>(|txn| {
                txn.insert_record(&at_boundary)?;
                txn.insert_record(&just_after)
            })
            .expect("insert debits");

        let summary = store
            .spend_since("acct-1", boundary, ENGINE_SOURCE)
            .expect("spend summary");
        assert_eq!(summary.total, 3);
        assert_eq!(summary.records, 1);

        let all = store
            .spend_since("acct-1", boundary - chrono::Duration::microseconds(1), ENGINE_SOURCE)
            .expect("spend summary");
        assert_eq!(all.total, 13);
        assert_eq!(all.records, 2);
    }
}
