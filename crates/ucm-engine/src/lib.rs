use serde::Serialize;
use thiserror::Error;
use ucm_store::StoreError;

pub mod migrate;
pub mod report;
pub mod rollback;
pub mod validator;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("account not found: {account_id}")]
    NotFound { account_id: String },
    #[error("pre-run validation failed with {error_count} integrity errors")]
    Validation { error_count: usize },
    #[error("rollback not eligible: {reason}")]
    Eligibility { reason: String },
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error(
        "critical error threshold exceeded: {failed} of {total} accounts failed, \
         {rolled_back} compensating rollbacks applied"
    )]
    CriticalErrorThresholdExceeded {
        failed: usize,
        total: usize,
        rolled_back: usize,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunError {
    pub account_id: String,
    pub message: String,
}

/// Caller-owned accumulator for one migration or rollback run. The
/// orchestrators mutate it through `&mut`; nothing is kept in module
/// state, so independent runs can coexist in one process.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunStats {
    pub total_accounts: usize,
    pub successful: usize,
    pub failed: usize,
    pub skipped: usize,
    pub rolled_back: usize,
    pub total_converted: i64,
    pub migrated_ids: Vec<String>,
    pub errors: Vec<RunError>,
}

impl RunStats {
    pub fn failure_ratio(&self) -> f64 {
        if self.total_accounts == 0 {
            return 0.0;
        }
        self.failed as f64 / self.total_accounts as f64
    }

    pub fn record_failure(&mut self, account_id: &str, error: &EngineError) {
        self.failed += 1;
        self.errors.push(RunError {
            account_id: account_id.to_string(),
            message: error.to_string(),
        });
    }
}
