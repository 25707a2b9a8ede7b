use crate::apply::{apply_expected_state, ApplyOutcome};
use crate::builder::{build_expected_state, BuildReport};
use crate::config::EngineConfig;
use crate::retry::Attempt;
use crate::ReconcileError;
use chrono::{DateTime, Utc};
use recon_core::{ProcessingRequest, ReconcileScope};
use recon_storage::ReconStore;
use std::time::Duration;
use tracing::{error, info};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    pub scope: ReconcileScope,
    pub attempts: u32,
    pub build: BuildReport,
    pub outcome: ApplyOutcome,
}

impl ReconcileReport {
    pub fn deleted(&self) -> usize {
        self.outcome.deleted.len()
    }

    pub fn inserted(&self) -> usize {
        self.outcome.inserted.len()
    }
}

#[derive(Clone)]
pub struct Reconciler {
    store: ReconStore,
    config: EngineConfig,
}

impl Reconciler {
    pub fn new(store: ReconStore, config: EngineConfig) -> Self {
        Self { store, config }
    }

    pub fn store(&self) -> &ReconStore {
        &self.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn reconcile_request(
        &self,
        request: &ProcessingRequest,
    ) -> Result<ReconcileReport, ReconcileError> {
        let scope = request.scope()?;
        self.reconcile(&scope)
    }

    pub fn reconcile(&self, scope: &ReconcileScope) -> Result<ReconcileReport, ReconcileError> {
        self.reconcile_with_clock(scope, Utc::now)
    }

    /// Same as [`Reconciler::reconcile`] with every attempt stamped `now`.
    pub fn reconcile_at(
        &self,
        scope: &ReconcileScope,
        now: DateTime<Utc>,
    ) -> Result<ReconcileReport, ReconcileError> {
        self.reconcile_with_clock(scope, || now)
    }

    fn reconcile_with_clock<C>(
        &self,
        scope: &ReconcileScope,
        clock: C,
    ) -> Result<ReconcileReport, ReconcileError>
    where
        C: Fn() -> DateTime<Utc>,
    {
        let policy = self.config.retry_policy();
        info!(
            event = "reconcile_start",
            scope = %scope,
            deletion_policy = ?scope.deletion_policy(),
            max_attempts = policy.max_attempts()
        );

        let result = policy.run(|attempt| {
            let (build, outcome) = self.attempt_once(scope, clock(), attempt)?;
            Ok(ReconcileReport {
                scope: scope.clone(),
                attempts: attempt.number,
                build,
                outcome,
            })
        });

        match &result {
            Ok(report) => info!(
                event = "reconcile_committed",
                scope = %scope,
                attempts = report.attempts,
                deleted = report.deleted(),
                inserted = report.inserted()
            ),
            Err(err) => error!(event = "reconcile_failed", scope = %scope, error = %err),
        }
        result
    }

    // Expected state is rebuilt inside every attempt so a retry never reuses rows computed
    // before another writer committed.
    fn attempt_once(
        &self,
        scope: &ReconcileScope,
        now: DateTime<Utc>,
        attempt: Attempt,
    ) -> Result<(BuildReport, ApplyOutcome), ReconcileError> {
        let lock_timeout = self.lock_timeout_for(attempt);
        self.store.in_transaction(lock_timeout, |tx| {
            let state = build_expected_state(tx, scope)?;
            let outcome = apply_expected_state(tx, &state, scope.deletion_policy(), now)?;
            Ok((state.report, outcome))
        })
    }

    fn lock_timeout_for(&self, attempt: Attempt) -> Duration {
        let lock_timeout = self.config.lock_timeout();
        match attempt.remaining {
            Some(remaining) => lock_timeout.min(remaining),
            None => lock_timeout,
        }
    }
}
