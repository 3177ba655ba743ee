use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::Serialize;
use ucm_core::{Category, TransactionRecord};
use ucm_store::{LedgerStore, LedgerTotals};

use crate::{validator, EngineError};

pub const RECENT_RECORD_LIMIT: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecordSummary {
    pub record_id: String,
    pub account_id: String,
    pub unified_amount: i64,
    pub created_at: DateTime<Utc>,
    pub superseded: bool,
}

impl From<&TransactionRecord> for RecordSummary {
    fn from(record: &TransactionRecord) -> Self {
        Self {
            record_id: record.id.clone(),
            account_id: record.account_id.clone(),
            unified_amount: record.unified_amount,
            created_at: record.created_at,
            superseded: record.superseded_by.is_some(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReportSnapshot {
    pub generated_at: DateTime<Utc>,
    pub totals: LedgerTotals,
    pub issue_counts: BTreeMap<String, usize>,
    pub recent_migrations: Vec<RecordSummary>,
    pub recent_rollbacks: Vec<RecordSummary>,
}

pub fn snapshot(store: &LedgerStore) -> Result<ReportSnapshot, EngineError> {
    let totals = store.totals()?;
    let validation = validator::validate(store, None)?;
    let issue_counts = validation
        .counts_by_kind()
        .into_iter()
        .map(|(kind, count)| (kind.to_string(), count))
        .collect();

    let recent_migrations = store
        .recent_records(&Category::Migration, RECENT_RECORD_LIMIT)?
        .iter()
        .map(RecordSummary::from)
        .collect();
    let recent_rollbacks = store
        .recent_records(&Category::MigrationRollback, RECENT_RECORD_LIMIT)?
        .iter()
        .map(RecordSummary::from)
        .collect();

    Ok(ReportSnapshot {
        generated_at: Utc::now(),
        totals,
        issue_counts,
        recent_migrations,
        recent_rollbacks,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportFormat {
    Json,
    Csv,
    Html,
}

impl FromStr for ReportFormat {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_lowercase().as_str() {
            "json" => Ok(ReportFormat::Json),
            "csv" => Ok(ReportFormat::Csv),
            "html" => Ok(ReportFormat::Html),
            other => Err(format!("unknown report format: {other}")),
        }
    }
}

pub fn render(snapshot: &ReportSnapshot, format: ReportFormat) -> Result<String, EngineError> {
    match format {
        ReportFormat::Json => serde_json::to_string_pretty(snapshot)
            .map_err(|err| ucm_store::StoreError::Serialization(err.to_string()).into()),
        ReportFormat::Csv => Ok(render_csv(snapshot)),
        ReportFormat::Html => Ok(render_html(snapshot)),
    }
}

fn metric_rows(snapshot: &ReportSnapshot) -> Vec<(String, String)> {
    let mut rows = vec![
        ("generated_at".to_string(), snapshot.generated_at.to_rfc3339()),
        (
            "total_accounts".to_string(),
            snapshot.totals.total_accounts.to_string(),
        ),
        (
            "migrated_accounts".to_string(),
            snapshot.totals.migrated_accounts.to_string(),
        ),
        (
            "pending_accounts".to_string(),
            snapshot.totals.pending_accounts.to_string(),
        ),
        (
            "unified_total".to_string(),
            snapshot.totals.unified_total.to_string(),
        ),
        (
            "migration_records".to_string(),
            snapshot.totals.migration_records.to_string(),
        ),
        (
            "rollback_records".to_string(),
            snapshot.totals.rollback_records.to_string(),
        ),
    ];
    for (kind, count) in &snapshot.issue_counts {
        rows.push((format!("issues_{kind}"), count.to_string()));
    }
    rows
}

fn render_csv(snapshot: &ReportSnapshot) -> String {
    let mut out = String::from("metric,value\n");
    for (metric, value) in metric_rows(snapshot) {
        let _ = writeln!(out, "{metric},{value}");
    }
    out
}

// Account and record ids are operator-supplied text and must not be
// able to break the exported markup.
fn escape_html(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

fn render_html(snapshot: &ReportSnapshot) -> String {
    let mut out = String::from(
        "<!DOCTYPE html>\n<html>\n<head><title>Unified credit migration report</title></head>\n\
         <body>\n<h1>Unified credit migration report</h1>\n<table>\n\
         <tr><th>Metric</th><th>Value</th></tr>\n",
    );
    for (metric, value) in metric_rows(snapshot) {
        let _ = writeln!(out, "<tr><td>{metric}</td><td>{value}</td></tr>");
    }
    out.push_str("</table>\n");

    for (title, records) in [
        ("Recent migrations", &snapshot.recent_migrations),
        ("Recent rollbacks", &snapshot.recent_rollbacks),
    ] {
        let _ = writeln!(out, "<h2>{title}</h2>\n<ul>");
        for record in records {
            let _ = writeln!(
                out,
                "<li>{} &rarr; {} ({})</li>",
                escape_html(&record.account_id),
                record.unified_amount,
                escape_html(&record.record_id),
            );
        }
        out.push_str("</ul>\n");
    }

    out.push_str("</body>\n</html>\n");
    out
}

/// Change between two snapshots of the same ledger, as shown by the
/// polling monitor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MonitorDelta {
    pub migrated_accounts: i64,
    pub pending_accounts: i64,
    pub unified_total: i64,
    pub new_migration_records: i64,
    pub new_rollback_records: i64,
}

impl MonitorDelta {
    pub fn is_quiet(&self) -> bool {
        *self == Self::default()
    }
}

pub fn delta(previous: &ReportSnapshot, next: &ReportSnapshot) -> MonitorDelta {
    MonitorDelta {
        migrated_accounts: next.totals.migrated_accounts - previous.totals.migrated_accounts,
        pending_accounts: next.totals.pending_accounts - previous.totals.pending_accounts,
        unified_total: next.totals.unified_total - previous.totals.unified_total,
        new_migration_records: next.totals.migration_records - previous.totals.migration_records,
        new_rollback_records: next.totals.rollback_records - previous.totals.rollback_records,
    }
}
