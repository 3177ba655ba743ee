use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

pub const RATE_LOW: i64 = 10;
pub const RATE_MID: i64 = 100;
pub const RATE_HIGH: i64 = 1_000;
pub const LARGE_CONVERSION_THRESHOLD: i64 = 100_000;
pub const CRITICAL_ERROR_RATIO: f64 = 0.10;
pub const DEFAULT_BATCH_SIZE: usize = 50;
pub const DEFAULT_BATCH_DELAY_MS: u64 = 250;

pub const ENGINE_SOURCE: &str = "migration_engine";
pub const MIGRATION_REASON: &str = "Legacy mana conversion to unified credits";
pub const ROLLBACK_REASON: &str = "Rollback of legacy mana conversion";
pub const COMPENSATION_TRIGGER: &str = "critical_error_threshold";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Denomination {
    Low,
    Mid,
    High,
}

pub const DENOMINATIONS: [Denomination; 3] =
    [Denomination::Low, Denomination::Mid, Denomination::High];

impl Denomination {
    pub fn as_str(&self) -> &'static str {
        match self {
            Denomination::Low => "low",
            Denomination::Mid => "mid",
            Denomination::High => "high",
        }
    }

    pub fn rate(&self) -> i64 {
        match self {
            Denomination::Low => RATE_LOW,
            Denomination::Mid => RATE_MID,
            Denomination::High => RATE_HIGH,
        }
    }
}

impl fmt::Display for Denomination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct LegacyBalances {
    pub low: i64,
    pub mid: i64,
    pub high: i64,
}

impl LegacyBalances {
    pub fn new(low: i64, mid: i64, high: i64) -> Self {
        Self { low, mid, high }
    }

    pub fn get(&self, denomination: Denomination) -> i64 {
        match denomination {
            Denomination::Low => self.low,
            Denomination::Mid => self.mid,
            Denomination::High => self.high,
        }
    }

    pub fn set(&mut self, denomination: Denomination, value: i64) {
        match denomination {
            Denomination::Low => self.low = value,
            Denomination::Mid => self.mid = value,
            Denomination::High => self.high = value,
        }
    }
}

/// Pure, total conversion of a legacy tri-balance into unified credits.
/// Never fails; oversized results are a validator concern, not a
/// conversion concern.
pub fn convert(legacy: &LegacyBalances) -> i64 {
    legacy.low * RATE_LOW + legacy.mid * RATE_MID + legacy.high * RATE_HIGH
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Account {
    pub id: String,
    pub legacy: LegacyBalances,
    pub unified_balance: i64,
    pub migration_completed: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Account {
    pub fn new(id: impl Into<String>, legacy: LegacyBalances, now: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            legacy,
            unified_balance: 0,
            migration_completed: false,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Credit,
    Debit,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Credit => "credit",
            Direction::Debit => "debit",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Direction {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input {
            "credit" => Ok(Direction::Credit),
            "debit" => Ok(Direction::Debit),
            other => Err(format!("unknown direction: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Category {
    Migration,
    MigrationRollback,
    AdminAdjustment,
    Other(String),
}

impl Category {
    pub fn as_str(&self) -> &str {
        match self {
            Category::Migration => "migration",
            Category::MigrationRollback => "migration_rollback",
            Category::AdminAdjustment => "admin_adjustment",
            Category::Other(value) => value,
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input {
            "migration" => Ok(Category::Migration),
            "migration_rollback" => Ok(Category::MigrationRollback),
            "admin_adjustment" => Ok(Category::AdminAdjustment),
            other => Ok(Category::Other(other.to_string())),
        }
    }
}

/// Structured payload carried by every ledger record. Field names are a
/// reconciliation contract with downstream tooling; `emergency_mode` and
/// `had_spent_mana` in particular are read back after emergency rollbacks.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TransactionMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub legacy_low: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub legacy_mid: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub legacy_high: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_low: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_mid: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_high: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_transaction_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amount_reverted: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub emergency_mode: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub had_spent_mana: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spend_waived: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger: Option<String>,
    #[serde(default, flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl TransactionMetadata {
    pub fn for_migration(legacy: &LegacyBalances) -> Self {
        Self {
            legacy_low: Some(legacy.low),
            legacy_mid: Some(legacy.mid),
            legacy_high: Some(legacy.high),
            rate_low: Some(RATE_LOW),
            rate_mid: Some(RATE_MID),
            rate_high: Some(RATE_HIGH),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TransactionRecord {
    pub id: String,
    pub account_id: String,
    pub direction: Direction,
    pub unified_amount: i64,
    pub reason: String,
    pub category: Category,
    pub source: String,
    pub created_at: DateTime<Utc>,
    pub metadata: TransactionMetadata,
    pub superseded_by: Option<String>,
}

impl TransactionRecord {
    pub fn new(
        account_id: impl Into<String>,
        direction: Direction,
        unified_amount: i64,
        reason: impl Into<String>,
        category: Category,
        source: impl Into<String>,
        metadata: TransactionMetadata,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            account_id: account_id.into(),
            direction,
            unified_amount,
            reason: reason.into(),
            category,
            source: source.into(),
            created_at: Utc::now(),
            metadata,
            superseded_by: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum IssueSeverity {
    Warning,
    Error,
}

/// Closed set of integrity defects the validator can detect. Each
/// error-severity variant has exactly one repair; `LargeConversion` is
/// advisory and has none.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntegrityIssue {
    NegativeBalance {
        denomination: Denomination,
        value: i64,
    },
    InconsistentMigration {
        expected: i64,
    },
    OrphanedBalance {
        unified_balance: i64,
    },
    LargeConversion {
        amount: i64,
    },
}

impl IntegrityIssue {
    pub fn kind(&self) -> &'static str {
        match self {
            IntegrityIssue::NegativeBalance { .. } => "negative_balance",
            IntegrityIssue::InconsistentMigration { .. } => "inconsistent_migration",
            IntegrityIssue::OrphanedBalance { .. } => "orphaned_balance",
            IntegrityIssue::LargeConversion { .. } => "large_conversion",
        }
    }

    pub fn severity(&self) -> IssueSeverity {
        match self {
            IntegrityIssue::LargeConversion { .. } => IssueSeverity::Warning,
            _ => IssueSeverity::Error,
        }
    }

    pub fn describe(&self) -> String {
        match self {
            IntegrityIssue::NegativeBalance { denomination, value } => {
                format!("negative {denomination} balance: {value}")
            }
            IntegrityIssue::InconsistentMigration { expected } => format!(
                "marked migrated with zero unified balance, expected {expected}"
            ),
            IntegrityIssue::OrphanedBalance { unified_balance } => format!(
                "unified balance {unified_balance} on an unmigrated account"
            ),
            IntegrityIssue::LargeConversion { amount } => {
                format!("conversion result {amount} exceeds {LARGE_CONVERSION_THRESHOLD}")
            }
        }
    }
}
