pub mod config;
pub mod engine;
pub mod metrics_server;
pub mod observability;
pub mod sources;
pub mod store;
pub mod transform;

pub use engine::{ImportOptions, ImportResult, ReconcileError, Reconciler};
