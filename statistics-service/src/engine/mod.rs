//! Reconciliation of absolute meter readings into cumulative statistics.

pub mod audit;
pub mod backfill;
pub mod baseline;
pub mod orchestrator;
pub mod repair;
pub mod scheduler;

pub use audit::{
    reset_series, resolve_series_id, validate_monotonic, MonotonicReport, MonotonicViolation,
};
pub use orchestrator::{
    CyclePhase, DeviceMemory, EngineSettings, ImportOptions, ImportResult, ImportedTip, Reconciler,
};
pub use scheduler::{run_cycle, run_polling, CycleSummary};

use statistics_client::domain::SeriesId;

use crate::store::StoreError;

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum ReconcileError {
    #[error("metering source authentication failed: {0}")]
    AuthFailure(String),
    #[error("fetching readings for meter {meter_id} failed: {reason}")]
    TransientFetchFailure { meter_id: String, reason: String },
    #[error(transparent)]
    StoreUnavailable(#[from] StoreError),
    #[error("a reconciliation for meter {0} is already running")]
    InFlight(String),
    #[error("deleting {0} requires the series id as confirmation")]
    ConfirmationRequired(SeriesId),
}

impl ReconcileError {
    /// Metric label value.
    pub fn kind(&self) -> &'static str {
        match self {
            ReconcileError::AuthFailure(_) => "auth",
            ReconcileError::TransientFetchFailure { .. } => "fetch",
            ReconcileError::StoreUnavailable(_) => "store",
            ReconcileError::InFlight(_) => "in_flight",
            ReconcileError::ConfirmationRequired(_) => "confirmation",
        }
    }
}
