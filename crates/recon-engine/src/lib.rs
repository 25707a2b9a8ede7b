//! Reconciliation of the delivery output table against upstream facts.
//!
//! A request scope is turned into expected rows by [`builder`], diffed and written by
//! [`apply`] inside one transaction opened by [`Reconciler`], and retried on lock
//! contention by [`RetryPolicy`].

pub mod apply;
pub mod builder;
pub mod config;
pub mod error;
pub mod orchestrator;
pub mod retry;

pub use apply::{apply_expected_state, plan_changes, ApplyOutcome, ChangePlan};
pub use builder::{build_expected_state, resolve_expected_state, BuildReport, ExpectedState};
pub use config::EngineConfig;
pub use error::ReconcileError;
pub use orchestrator::{ReconcileReport, Reconciler};
pub use retry::{Attempt, RetryPolicy};
