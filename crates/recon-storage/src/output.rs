use crate::{conversion_error, date_column, format_date, parse_timestamp, placeholders, StorageError};
use chrono::{DateTime, Utc};
use recon_core::{CreativeKey, OutputKey, OutputRow};
use rusqlite::{params, params_from_iter, Connection, Row};
use std::collections::BTreeSet;

// Keeps each IN (...) list well under SQLite's bound parameter limit.
const LOCK_CHUNK_SIZE: usize = 500;

const OUTPUT_COLUMNS: &str =
    "date, partition_key, creative_key, impressions, clicks, provider, time_zone, updated_at, is_deleted";

/// Locks every output row of the given partitions and returns those rows, sorted by key.
/// Partition keys are visited in ascending order.
///
/// The self-assignment is the SQLite counterpart of `SELECT ... FOR UPDATE`: it needs the
/// database write lock even when no row matches, so outside an immediate transaction a
/// competing writer makes it fail with [`StorageError::LockTimeout`] once the connection's
/// busy timeout has elapsed.
pub fn lock_output_partitions(
    conn: &Connection,
    partition_keys: &BTreeSet<String>,
) -> Result<Vec<OutputRow>, StorageError> {
    let keys = partition_keys.iter().collect::<Vec<_>>();
    let mut locked = Vec::new();

    for chunk in keys.chunks(LOCK_CHUNK_SIZE) {
        let sql = format!(
            "
            UPDATE delivery_by_partition_creative_day
            SET is_deleted = is_deleted
            WHERE partition_key IN ({})
            RETURNING {OUTPUT_COLUMNS}
            ",
            placeholders(chunk.len())
        );
        let mut statement = conn.prepare(&sql)?;
        let rows = statement.query_map(params_from_iter(chunk.iter()), output_row_from_row)?;
        for row in rows {
            locked.push(row?);
        }
    }

    locked.sort_by_key(OutputRow::key);
    Ok(locked)
}

/// Marks live rows as deleted and returns the rows that transitioned.
pub fn soft_delete_output_rows(
    conn: &Connection,
    keys: &[OutputKey],
    now: DateTime<Utc>,
) -> Result<Vec<OutputRow>, StorageError> {
    let mut statement = conn.prepare(&format!(
        "
        UPDATE delivery_by_partition_creative_day
        SET is_deleted = 1, updated_at = ?1
        WHERE partition_key = ?2
            AND date = ?3
            AND creative_key IS ?4
            AND is_deleted = 0
        RETURNING {OUTPUT_COLUMNS}
        "
    ))?;

    let updated_at = now.to_rfc3339();
    let mut deleted = Vec::new();
    for key in keys {
        let rows = statement.query_map(
            params![
                updated_at,
                key.partition_key,
                format_date(key.date),
                key.creative_key.as_column(),
            ],
            output_row_from_row,
        )?;
        for row in rows {
            deleted.push(row?);
        }
    }
    Ok(deleted)
}

pub fn delete_output_rows(conn: &Connection, keys: &[OutputKey]) -> Result<usize, StorageError> {
    let mut statement = conn.prepare(
        "
        DELETE FROM delivery_by_partition_creative_day
        WHERE partition_key = ?1
            AND date = ?2
            AND creative_key IS ?3
        ",
    )?;

    let mut removed = 0;
    for key in keys {
        removed += statement.execute(params![
            key.partition_key,
            format_date(key.date),
            key.creative_key.as_column(),
        ])?;
    }
    Ok(removed)
}

pub fn insert_output_rows(conn: &Connection, rows: &[OutputRow]) -> Result<(), StorageError> {
    let mut statement = conn.prepare(&format!(
        "
        INSERT INTO delivery_by_partition_creative_day ({OUTPUT_COLUMNS})
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
        "
    ))?;

    for row in rows {
        statement.execute(params![
            format_date(row.date),
            row.partition_key,
            row.creative_key.as_column(),
            row.impressions,
            row.clicks,
            row.provider,
            row.time_zone,
            row.updated_at.to_rfc3339(),
            row.is_deleted,
        ])?;
    }
    Ok(())
}

pub(crate) fn output_rows_for_partition(
    conn: &Connection,
    partition_key: &str,
    live_only: bool,
) -> Result<Vec<OutputRow>, StorageError> {
    let filter = if live_only { "AND is_deleted = 0" } else { "" };
    let mut statement = conn.prepare(&format!(
        "
        SELECT {OUTPUT_COLUMNS}
        FROM delivery_by_partition_creative_day
        WHERE partition_key = ?1 {filter}
        "
    ))?;
    let rows = statement.query_map([partition_key], output_row_from_row)?;

    let mut output = Vec::new();
    for row in rows {
        output.push(row?);
    }
    output.sort_by_key(OutputRow::key);
    Ok(output)
}

fn output_row_from_row(row: &Row<'_>) -> rusqlite::Result<OutputRow> {
    let creative_key =
        CreativeKey::from_column(row.get(2)?).map_err(|err| conversion_error(2, err))?;
    let updated_at: String = row.get(7)?;
    let updated_at = parse_timestamp(&updated_at).map_err(|err| conversion_error(7, err))?;

    Ok(OutputRow {
        date: date_column(row, 0)?,
        partition_key: row.get(1)?,
        creative_key,
        impressions: row.get(3)?,
        clicks: row.get(4)?,
        provider: row.get(5)?,
        time_zone: row.get(6)?,
        updated_at,
        is_deleted: row.get(8)?,
    })
}
