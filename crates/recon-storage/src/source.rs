use crate::{conversion_error, date_column, placeholders, StorageError};
use recon_core::{AlignmentConflict, ConflictKind, ImportBatch, RawFact, VendorMapping};
use rusqlite::{params_from_iter, Connection, Row};
use std::collections::BTreeSet;

/// One raw fact joined to a live mapping whose date range contains the fact's date,
/// together with the metadata of the batch that delivered it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceCandidate {
    pub fact: RawFact,
    pub mapping: VendorMapping,
    pub batch: ImportBatch,
}

const CANDIDATE_COLUMNS: &str = "
    f.fact_id,
    f.import_batch_id,
    f.vendor_placement_id,
    f.date,
    f.impressions,
    f.clicks,
    m.mapping_id,
    m.partition_key,
    m.creative_key,
    m.date_start,
    m.date_end,
    m.is_deleted,
    b.provider,
    b.time_zone
";

const CANDIDATE_JOINS: &str = "
    FROM raw_facts f
    JOIN vendor_mappings m
        ON m.vendor_placement_id = f.vendor_placement_id
        AND f.date BETWEEN m.date_start AND m.date_end
        AND m.is_deleted = 0
    JOIN import_batches b ON b.import_batch_id = f.import_batch_id
";

// Facts reaching the partition are loaded with every live mapping they match, including
// mappings into other partitions, so the builder can see cross-partition ambiguity.
pub fn load_partition_candidates(
    conn: &Connection,
    partition_key: &str,
) -> Result<Vec<SourceCandidate>, StorageError> {
    let sql = format!(
        "
        SELECT {CANDIDATE_COLUMNS}
        {CANDIDATE_JOINS}
        WHERE f.fact_id IN (
            SELECT rf.fact_id
            FROM raw_facts rf
            JOIN vendor_mappings rm
                ON rm.vendor_placement_id = rf.vendor_placement_id
                AND rf.date BETWEEN rm.date_start AND rm.date_end
            WHERE rm.partition_key = ?1 AND rm.is_deleted = 0
        )
        ORDER BY f.date DESC, f.fact_id ASC, m.mapping_id ASC
        "
    );
    let mut statement = conn.prepare(&sql)?;
    let rows = statement.query_map([partition_key], candidate_from_row)?;

    let mut candidates = Vec::new();
    for row in rows {
        candidates.push(row?);
    }
    Ok(candidates)
}

pub fn load_batch_candidates(
    conn: &Connection,
    import_batch_id: &str,
) -> Result<Vec<SourceCandidate>, StorageError> {
    let sql = format!(
        "
        SELECT {CANDIDATE_COLUMNS}
        {CANDIDATE_JOINS}
        WHERE f.import_batch_id = ?1
        ORDER BY f.date DESC, f.fact_id ASC, m.mapping_id ASC
        "
    );
    let mut statement = conn.prepare(&sql)?;
    let rows = statement.query_map([import_batch_id], candidate_from_row)?;

    let mut candidates = Vec::new();
    for row in rows {
        candidates.push(row?);
    }
    Ok(candidates)
}

pub fn load_conflicts(
    conn: &Connection,
    partition_keys: &BTreeSet<String>,
) -> Result<Vec<AlignmentConflict>, StorageError> {
    if partition_keys.is_empty() {
        return Ok(Vec::new());
    }

    let sql = format!(
        "
        SELECT conflict_id, partition_key, date_start, date_end, kind
        FROM alignment_conflicts
        WHERE partition_key IN ({})
        ORDER BY partition_key ASC, date_start ASC, conflict_id ASC
        ",
        placeholders(partition_keys.len())
    );
    let mut statement = conn.prepare(&sql)?;
    let rows = statement.query_map(params_from_iter(partition_keys.iter()), |row| {
        let kind_raw: String = row.get(4)?;
        let kind = kind_raw
            .parse::<ConflictKind>()
            .map_err(|err| conversion_error(4, err))?;
        Ok(AlignmentConflict {
            conflict_id: row.get(0)?,
            partition_key: row.get(1)?,
            date_start: date_column(row, 2)?,
            date_end: date_column(row, 3)?,
            kind,
        })
    })?;

    let mut conflicts = Vec::new();
    for row in rows {
        conflicts.push(row?);
    }
    Ok(conflicts)
}

fn candidate_from_row(row: &Row<'_>) -> rusqlite::Result<SourceCandidate> {
    let import_batch_id: String = row.get(1)?;
    let vendor_placement_id: String = row.get(2)?;

    Ok(SourceCandidate {
        fact: RawFact {
            fact_id: row.get(0)?,
            import_batch_id: import_batch_id.clone(),
            vendor_placement_id: vendor_placement_id.clone(),
            date: date_column(row, 3)?,
            impressions: row.get(4)?,
            clicks: row.get(5)?,
        },
        mapping: VendorMapping {
            mapping_id: row.get(6)?,
            vendor_placement_id,
            partition_key: row.get(7)?,
            creative_key: row.get(8)?,
            date_start: date_column(row, 9)?,
            date_end: date_column(row, 10)?,
            is_deleted: row.get(11)?,
        },
        batch: ImportBatch {
            import_batch_id,
            provider: row.get(12)?,
            time_zone: row.get(13)?,
        },
    })
}
