use crate::ReconcileError;
use chrono::NaiveDate;
use recon_core::{
    AlignmentConflict, ConflictKind, ContractError, CreativeKey, DeletionPolicy, ExpectedRow,
    OutputKey, ReconcileScope,
};
use recon_storage::{load_batch_candidates, load_conflicts, load_partition_candidates, SourceCandidate};
use rusqlite::Connection;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{info, warn};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BuildReport {
    pub candidates: usize,
    pub facts: usize,
    pub rows: usize,
    pub excluded_by_conflict: usize,
    pub aggregated_ambiguous: usize,
    /// Facts that reach more than one partition with no cross-partition conflict in place.
    pub ambiguous_partition_facts: usize,
    /// Facts that reach several creatives of one partition with no within-partition conflict.
    pub ambiguous_creative_facts: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpectedState {
    pub scope: ReconcileScope,
    /// Sorted by output key.
    pub rows: Vec<ExpectedRow>,
    pub affected: BTreeSet<String>,
    pub report: BuildReport,
}

impl ExpectedState {
    pub fn deletion_policy(&self) -> DeletionPolicy {
        self.scope.deletion_policy()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Resolution {
    Exclude,
    Aggregate,
    Keep,
}

// Cross-partition conflicts win over within-partition ones.
fn resolve(conflicts: &[AlignmentConflict], partition_key: &str, date: NaiveDate) -> Resolution {
    let mut within = false;
    for conflict in conflicts
        .iter()
        .filter(|conflict| conflict.covers(partition_key, date))
    {
        match conflict.kind {
            ConflictKind::CrossPartition => return Resolution::Exclude,
            ConflictKind::WithinPartition => within = true,
        }
    }
    if within {
        Resolution::Aggregate
    } else {
        Resolution::Keep
    }
}

#[derive(Debug)]
struct Accumulator {
    fact_ids: BTreeSet<i64>,
    impressions: i64,
    clicks: i64,
    provider: String,
    time_zone: String,
}

impl Accumulator {
    fn new(candidate: &SourceCandidate) -> Self {
        Self {
            fact_ids: BTreeSet::new(),
            impressions: 0,
            clicks: 0,
            provider: candidate.batch.provider.clone(),
            time_zone: candidate.batch.time_zone.clone(),
        }
    }

    fn add(&mut self, candidate: &SourceCandidate) {
        if self.fact_ids.insert(candidate.fact.fact_id) {
            self.impressions = self.impressions.saturating_add(candidate.fact.impressions);
            self.clicks = self.clicks.saturating_add(candidate.fact.clicks);
        }
        if candidate.batch.provider > self.provider {
            self.provider = candidate.batch.provider.clone();
        }
        if candidate.batch.time_zone > self.time_zone {
            self.time_zone = candidate.batch.time_zone.clone();
        }
    }
}

fn in_scope(scope: &ReconcileScope, partition_key: &str) -> bool {
    match scope {
        ReconcileScope::Partition {
            partition_key: requested,
        } => requested == partition_key,
        ReconcileScope::Batch { .. } => true,
    }
}

/// Computes the rows that should exist for `scope` from already loaded candidates.
///
/// Candidates of a partition-scoped request may include mappings into other partitions;
/// those only feed ambiguity detection and never produce rows.
pub fn resolve_expected_state(
    scope: &ReconcileScope,
    candidates: &[SourceCandidate],
    conflicts: &[AlignmentConflict],
) -> Result<ExpectedState, ContractError> {
    let mut report = BuildReport {
        candidates: candidates.len(),
        ..BuildReport::default()
    };
    let mut groups: BTreeMap<OutputKey, Accumulator> = BTreeMap::new();
    let mut reach: BTreeMap<i64, BTreeMap<&str, BTreeSet<&str>>> = BTreeMap::new();

    for candidate in candidates {
        let partition_key = candidate.mapping.partition_key.as_str();
        let date = candidate.fact.date;
        let resolution = resolve(conflicts, partition_key, date);

        if resolution != Resolution::Exclude {
            reach
                .entry(candidate.fact.fact_id)
                .or_default()
                .entry(partition_key)
                .or_default()
                .insert(candidate.mapping.creative_key.as_str());
        }

        if !in_scope(scope, partition_key) {
            continue;
        }

        let creative_key = match resolution {
            Resolution::Exclude => {
                report.excluded_by_conflict += 1;
                continue;
            }
            Resolution::Aggregate => {
                report.aggregated_ambiguous += 1;
                CreativeKey::Ambiguous
            }
            Resolution::Keep => CreativeKey::creative(candidate.mapping.creative_key.clone())?,
        };

        groups
            .entry(OutputKey::new(partition_key, date, creative_key))
            .or_insert_with(|| Accumulator::new(candidate))
            .add(candidate);
    }

    report.facts = candidates
        .iter()
        .map(|candidate| candidate.fact.fact_id)
        .collect::<BTreeSet<_>>()
        .len();
    detect_ambiguity(scope, candidates, conflicts, &reach, &mut report);

    let rows = groups
        .into_iter()
        .map(|(key, acc)| ExpectedRow {
            date: key.date,
            partition_key: key.partition_key,
            creative_key: key.creative_key,
            impressions: acc.impressions,
            clicks: acc.clicks,
            provider: acc.provider,
            time_zone: acc.time_zone,
        })
        .collect::<Vec<_>>();
    report.rows = rows.len();

    let affected = match scope {
        ReconcileScope::Partition { partition_key } => BTreeSet::from([partition_key.clone()]),
        ReconcileScope::Batch { .. } => rows.iter().map(|row| row.partition_key.clone()).collect(),
    };

    Ok(ExpectedState {
        scope: scope.clone(),
        rows,
        affected,
        report,
    })
}

fn detect_ambiguity(
    scope: &ReconcileScope,
    candidates: &[SourceCandidate],
    conflicts: &[AlignmentConflict],
    reach: &BTreeMap<i64, BTreeMap<&str, BTreeSet<&str>>>,
    report: &mut BuildReport,
) {
    let dates = candidates
        .iter()
        .map(|candidate| (candidate.fact.fact_id, candidate.fact.date))
        .collect::<BTreeMap<_, _>>();

    for (fact_id, partitions) in reach {
        let Some(date) = dates.get(fact_id).copied() else {
            continue;
        };

        if partitions.len() > 1 {
            report.ambiguous_partition_facts += 1;
            warn!(
                event = "mapping_ambiguity",
                kind = ConflictKind::CrossPartition.as_str(),
                scope = %scope,
                fact_id = *fact_id,
                date = %date,
                partitions = ?partitions.keys().collect::<Vec<_>>()
            );
        }

        for (partition_key, creatives) in partitions {
            if creatives.len() < 2
                || !in_scope(scope, partition_key)
                || resolve(conflicts, partition_key, date) == Resolution::Aggregate
            {
                continue;
            }
            report.ambiguous_creative_facts += 1;
            warn!(
                event = "mapping_ambiguity",
                kind = ConflictKind::WithinPartition.as_str(),
                scope = %scope,
                fact_id = *fact_id,
                date = %date,
                partition_key = *partition_key,
                creatives = ?creatives
            );
        }
    }
}

pub fn build_expected_state(
    conn: &Connection,
    scope: &ReconcileScope,
) -> Result<ExpectedState, ReconcileError> {
    let candidates = match scope {
        ReconcileScope::Partition { partition_key } => load_partition_candidates(conn, partition_key)?,
        ReconcileScope::Batch { import_batch_id } => load_batch_candidates(conn, import_batch_id)?,
    };
    let partitions = candidates
        .iter()
        .map(|candidate| candidate.mapping.partition_key.clone())
        .collect::<BTreeSet<_>>();
    let conflicts = load_conflicts(conn, &partitions)?;

    let state = resolve_expected_state(scope, &candidates, &conflicts)?;
    info!(
        event = "expected_state_built",
        scope = %scope,
        candidates = state.report.candidates,
        facts = state.report.facts,
        rows = state.report.rows,
        affected = state.affected.len(),
        excluded = state.report.excluded_by_conflict,
        aggregated = state.report.aggregated_ambiguous
    );
    Ok(state)
}
