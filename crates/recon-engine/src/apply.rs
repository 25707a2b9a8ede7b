use crate::builder::ExpectedState;
use chrono::{DateTime, Utc};
use recon_core::{DeletionPolicy, ExpectedRow, OutputKey, OutputRow};
use recon_storage::{
    delete_output_rows, insert_output_rows, lock_output_partitions, soft_delete_output_rows,
    StorageError,
};
use rusqlite::Connection;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// Writes needed to bring the locked rows in line with the expected rows.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ChangePlan {
    pub soft_delete: Vec<OutputKey>,
    /// Rows physically removed so that the matching `insert` entry can take their key.
    pub replace: Vec<OutputKey>,
    pub insert: Vec<ExpectedRow>,
}

impl ChangePlan {
    pub fn is_empty(&self) -> bool {
        self.soft_delete.is_empty() && self.replace.is_empty() && self.insert.is_empty()
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct ApplyOutcome {
    pub deleted: Vec<OutputRow>,
    pub inserted: Vec<OutputRow>,
}

pub fn plan_changes(
    expected: &[ExpectedRow],
    locked: &[OutputRow],
    policy: DeletionPolicy,
) -> ChangePlan {
    let current = locked
        .iter()
        .map(|row| (row.key(), row))
        .collect::<BTreeMap<_, _>>();
    let mut plan = ChangePlan::default();

    for row in expected {
        match current.get(&row.key()) {
            Some(existing) if existing.matches_expected(row) => {}
            Some(_) => {
                plan.replace.push(row.key());
                plan.insert.push(row.clone());
            }
            None => plan.insert.push(row.clone()),
        }
    }

    if policy.performs_deletions() {
        let expected_keys = expected.iter().map(ExpectedRow::key).collect::<BTreeSet<_>>();
        plan.soft_delete = current
            .iter()
            .filter(|(key, row)| !row.is_deleted && !expected_keys.contains(*key))
            .map(|(key, _)| key.clone())
            .collect();
    }

    plan
}

/// Locks the affected partitions, diffs them against `state` and writes the difference.
/// Must run inside the caller's transaction.
pub fn apply_expected_state(
    conn: &Connection,
    state: &ExpectedState,
    policy: DeletionPolicy,
    now: DateTime<Utc>,
) -> Result<ApplyOutcome, StorageError> {
    let locked = lock_output_partitions(conn, &state.affected)?;
    let plan = plan_changes(&state.rows, &locked, policy);
    debug!(
        event = "apply_planned",
        scope = %state.scope,
        locked = locked.len(),
        soft_delete = plan.soft_delete.len(),
        replace = plan.replace.len(),
        insert = plan.insert.len()
    );
    if plan.is_empty() {
        return Ok(ApplyOutcome::default());
    }

    let deleted = soft_delete_output_rows(conn, &plan.soft_delete, now)?;
    delete_output_rows(conn, &plan.replace)?;
    let inserted = plan
        .insert
        .into_iter()
        .map(|row| row.into_output(now))
        .collect::<Vec<_>>();
    insert_output_rows(conn, &inserted)?;

    Ok(ApplyOutcome { deleted, inserted })
}
