pub mod output;
pub mod source;

pub use output::{
    delete_output_rows, insert_output_rows, lock_output_partitions, soft_delete_output_rows,
};
pub use source::{load_batch_candidates, load_conflicts, load_partition_candidates, SourceCandidate};

use chrono::{DateTime, NaiveDate, Utc};
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use recon_core::{
    AlignmentConflict, ConflictKind, ContractError, ImportBatch, OutputRow, RawFact,
    VendorMapping,
};
use rusqlite::{params, OptionalExtension, Transaction, TransactionBehavior};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const RECON_SCHEMA_VERSION: i64 = 1;
pub const OUTPUT_TABLE: &str = "delivery_by_partition_creative_day";

const DATE_FORMAT: &str = "%Y-%m-%d";
const DEFAULT_POOL_SIZE: u32 = 4;
const DEFAULT_CONNECTION_TIMEOUT_MS: u64 = 5_000;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("lock acquisition timed out: {0}")]
    LockTimeout(String),
    #[error("sqlite error: {0}")]
    Sqlite(#[source] rusqlite::Error),
    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),
    #[error("contract error: {0}")]
    Contract(#[from] ContractError),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("timestamp parse error: {0}")]
    Timestamp(String),
    #[error("unsupported schema version {found}, max supported {supported}")]
    UnsupportedSchemaVersion { found: i64, supported: i64 },
}

impl StorageError {
    pub fn is_lock_timeout(&self) -> bool {
        matches!(self, StorageError::LockTimeout(_))
    }
}

// SQLITE_BUSY and SQLITE_LOCKED are how a competing writer surfaces once the busy
// timeout has elapsed, so both classify as lock contention.
impl From<rusqlite::Error> for StorageError {
    fn from(err: rusqlite::Error) -> Self {
        if is_lock_contention(&err) {
            StorageError::LockTimeout(err.to_string())
        } else {
            StorageError::Sqlite(err)
        }
    }
}

fn is_lock_contention(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(failure, _)
            if matches!(
                failure.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            )
    )
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JournalMode {
    #[default]
    Wal,
    Delete,
}

impl JournalMode {
    pub fn pragma_value(self) -> &'static str {
        match self {
            JournalMode::Wal => "wal",
            JournalMode::Delete => "delete",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub path: PathBuf,
    pub pool_size: u32,
    pub connection_timeout_ms: u64,
    pub journal_mode: JournalMode,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("recon.db"),
            pool_size: DEFAULT_POOL_SIZE,
            connection_timeout_ms: DEFAULT_CONNECTION_TIMEOUT_MS,
            journal_mode: JournalMode::default(),
        }
    }
}

impl StoreConfig {
    pub fn at(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            ..Self::default()
        }
    }
}

pub type StoreConnection = PooledConnection<SqliteConnectionManager>;

#[derive(Clone)]
pub struct ReconStore {
    pool: Pool<SqliteConnectionManager>,
    busy_timeout: Duration,
}

impl ReconStore {
    pub fn open(config: &StoreConfig) -> Result<Self, StorageError> {
        let journal_mode = config.journal_mode;
        let busy_timeout = Duration::from_millis(config.connection_timeout_ms);
        let manager = SqliteConnectionManager::file(&config.path).with_init(move |conn| {
            conn.execute_batch("PRAGMA foreign_keys = ON;")?;
            conn.pragma_update_and_check(None, "journal_mode", journal_mode.pragma_value(), |row| {
                row.get::<_, String>(0)
            })?;
            conn.busy_timeout(busy_timeout)
        });
        let pool = Pool::builder()
            .max_size(config.pool_size)
            .connection_timeout(Duration::from_millis(config.connection_timeout_ms))
            .build(manager)?;
        let store = Self { pool, busy_timeout };
        store.migrate()?;
        Ok(store)
    }

    // Every in-memory connection is its own database, so the pool is pinned to one.
    pub fn open_in_memory() -> Result<Self, StorageError> {
        let manager = SqliteConnectionManager::memory()
            .with_init(|conn| conn.execute_batch("PRAGMA foreign_keys = ON;"));
        let pool = Pool::builder()
            .max_size(1)
            .max_lifetime(None)
            .idle_timeout(None)
            .build(manager)?;
        let store = Self {
            pool,
            busy_timeout: Duration::from_millis(DEFAULT_CONNECTION_TIMEOUT_MS),
        };
        store.migrate()?;
        Ok(store)
    }

    /// Checks out a pooled connection with the configured busy timeout. A previous
    /// `in_transaction` may have left a shorter lock timeout on the same connection.
    pub fn connection(&self) -> Result<StoreConnection, StorageError> {
        let conn = self.pool.get()?;
        conn.busy_timeout(self.busy_timeout)?;
        Ok(conn)
    }

    pub fn pool_size(&self) -> u32 {
        self.pool.max_size()
    }

    /// Runs `work` inside one immediate transaction. The database write lock is taken
    /// on `BEGIN`, waiting at most `lock_timeout` for a competing writer. The transaction
    /// commits only when `work` succeeds; any error rolls it back when it is dropped.
    pub fn in_transaction<T, E, F>(&self, lock_timeout: Duration, work: F) -> Result<T, E>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T, E>,
        E: From<StorageError>,
    {
        let mut conn = self.connection()?;
        conn.busy_timeout(lock_timeout).map_err(StorageError::from)?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(StorageError::from)?;
        let value = work(&tx)?;
        tx.commit().map_err(StorageError::from)?;
        Ok(value)
    }

    pub fn schema_version(&self) -> Result<i64, StorageError> {
        let conn = self.connection()?;
        Ok(conn.query_row("PRAGMA user_version", [], |row| row.get(0))?)
    }

    pub fn migrate(&self) -> Result<(), StorageError> {
        let conn = self.connection()?;
        let current: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
        if current > RECON_SCHEMA_VERSION {
            return Err(StorageError::UnsupportedSchemaVersion {
                found: current,
                supported: RECON_SCHEMA_VERSION,
            });
        }

        if current < 1 {
            let sql = include_str!("../migrations/0001_reconcile_schema.sql");
            conn.execute_batch(sql)?;
            conn.execute("PRAGMA user_version = 1", []).map(|_| ())?;
        }

        Ok(())
    }

    pub fn table_exists(&self, table_name: &str) -> Result<bool, StorageError> {
        let conn = self.connection()?;
        let exists = conn
            .query_row(
                "
                SELECT 1
                FROM sqlite_master
                WHERE type='table' AND name = ?1
                LIMIT 1
                ",
                [table_name],
                |_| Ok(()),
            )
            .optional()?;
        Ok(exists.is_some())
    }

    pub fn upsert_import_batch(&self, batch: &ImportBatch) -> Result<(), StorageError> {
        let conn = self.connection()?;
        conn.execute(
            "
            INSERT INTO import_batches (import_batch_id, provider, time_zone)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(import_batch_id) DO UPDATE SET
                provider=excluded.provider,
                time_zone=excluded.time_zone
            ",
            params![batch.import_batch_id, batch.provider, batch.time_zone],
        )?;
        Ok(())
    }

    pub fn insert_raw_fact(
        &self,
        import_batch_id: &str,
        vendor_placement_id: &str,
        date: NaiveDate,
        impressions: i64,
        clicks: i64,
    ) -> Result<RawFact, StorageError> {
        let conn = self.connection()?;
        conn.execute(
            "
            INSERT INTO raw_facts (import_batch_id, vendor_placement_id, date, impressions, clicks)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ",
            params![
                import_batch_id,
                vendor_placement_id,
                format_date(date),
                impressions,
                clicks,
            ],
        )?;

        Ok(RawFact {
            fact_id: conn.last_insert_rowid(),
            import_batch_id: import_batch_id.to_string(),
            vendor_placement_id: vendor_placement_id.to_string(),
            date,
            impressions,
            clicks,
        })
    }

    pub fn insert_vendor_mapping(
        &self,
        vendor_placement_id: &str,
        partition_key: &str,
        creative_key: &str,
        date_start: NaiveDate,
        date_end: NaiveDate,
    ) -> Result<VendorMapping, StorageError> {
        recon_core::rows::validate_date_range(date_start, date_end)?;
        if creative_key.trim().is_empty() {
            return Err(ContractError::EmptyCreativeKey.into());
        }

        let conn = self.connection()?;
        conn.execute(
            "
            INSERT INTO vendor_mappings (
                vendor_placement_id,
                partition_key,
                creative_key,
                date_start,
                date_end,
                is_deleted
            ) VALUES (?1, ?2, ?3, ?4, ?5, 0)
            ",
            params![
                vendor_placement_id,
                partition_key,
                creative_key,
                format_date(date_start),
                format_date(date_end),
            ],
        )?;

        Ok(VendorMapping {
            mapping_id: conn.last_insert_rowid(),
            vendor_placement_id: vendor_placement_id.to_string(),
            partition_key: partition_key.to_string(),
            creative_key: creative_key.to_string(),
            date_start,
            date_end,
            is_deleted: false,
        })
    }

    pub fn set_vendor_mapping_deleted(
        &self,
        mapping_id: i64,
        is_deleted: bool,
    ) -> Result<bool, StorageError> {
        let conn = self.connection()?;
        let changes = conn.execute(
            "UPDATE vendor_mappings SET is_deleted = ?2 WHERE mapping_id = ?1",
            params![mapping_id, is_deleted],
        )?;
        Ok(changes > 0)
    }

    pub fn insert_alignment_conflict(
        &self,
        partition_key: &str,
        date_start: NaiveDate,
        date_end: NaiveDate,
        kind: ConflictKind,
    ) -> Result<AlignmentConflict, StorageError> {
        recon_core::rows::validate_date_range(date_start, date_end)?;

        let conn = self.connection()?;
        conn.execute(
            "
            INSERT INTO alignment_conflicts (partition_key, date_start, date_end, kind)
            VALUES (?1, ?2, ?3, ?4)
            ",
            params![
                partition_key,
                format_date(date_start),
                format_date(date_end),
                kind.as_str(),
            ],
        )?;

        Ok(AlignmentConflict {
            conflict_id: conn.last_insert_rowid(),
            partition_key: partition_key.to_string(),
            date_start,
            date_end,
            kind,
        })
    }

    pub fn remove_alignment_conflict(&self, conflict_id: i64) -> Result<bool, StorageError> {
        let conn = self.connection()?;
        let changes = conn.execute(
            "DELETE FROM alignment_conflicts WHERE conflict_id = ?1",
            [conflict_id],
        )?;
        Ok(changes > 0)
    }

    pub fn insert_output_row(&self, row: &OutputRow) -> Result<(), StorageError> {
        let conn = self.connection()?;
        insert_output_rows(&conn, std::slice::from_ref(row))
    }

    pub fn output_rows(&self, partition_key: &str) -> Result<Vec<OutputRow>, StorageError> {
        let conn = self.connection()?;
        output::output_rows_for_partition(&conn, partition_key, false)
    }

    pub fn live_output_rows(&self, partition_key: &str) -> Result<Vec<OutputRow>, StorageError> {
        let conn = self.connection()?;
        output::output_rows_for_partition(&conn, partition_key, true)
    }

    pub fn output_row_count(&self) -> Result<i64, StorageError> {
        let conn = self.connection()?;
        Ok(conn.query_row(
            "SELECT COUNT(*) FROM delivery_by_partition_creative_day",
            [],
            |row| row.get(0),
        )?)
    }
}

pub(crate) fn format_date(date: NaiveDate) -> String {
    date.format(DATE_FORMAT).to_string()
}

pub(crate) fn parse_date(value: &str) -> Result<NaiveDate, StorageError> {
    NaiveDate::parse_from_str(value, DATE_FORMAT)
        .map_err(|err| StorageError::Timestamp(format!("{value}: {err}")))
}

pub(crate) fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, StorageError> {
    DateTime::parse_from_rfc3339(value)
        .map(|timestamp| timestamp.with_timezone(&Utc))
        .map_err(|err| StorageError::Timestamp(err.to_string()))
}

pub(crate) fn conversion_error(
    index: usize,
    err: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(index, rusqlite::types::Type::Text, Box::new(err))
}

pub(crate) fn date_column(row: &rusqlite::Row<'_>, index: usize) -> rusqlite::Result<NaiveDate> {
    let raw: String = row.get(index)?;
    parse_date(&raw).map_err(|err| conversion_error(index, err))
}

pub(crate) fn placeholders(count: usize) -> String {
    vec!["?"; count].join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use recon_core::CreativeKey;
    use tempfile::TempDir;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2018, 5, d).expect("valid date")
    }

    #[test]
    fn migration_creates_reconcile_tables() {
        let store = ReconStore::open_in_memory().expect("open db");

        for table in [
            "import_batches",
            "raw_facts",
            "vendor_mappings",
            "alignment_conflicts",
            OUTPUT_TABLE,
        ] {
            assert!(store.table_exists(table).expect("table check"));
        }

        assert_eq!(
            store.schema_version().expect("schema version"),
            RECON_SCHEMA_VERSION
        );
    }

    #[test]
    fn reopening_file_store_keeps_schema_and_rows() {
        let dir = TempDir::new().expect("temp dir");
        let config = StoreConfig::at(dir.path().join("recon.db"));

        {
            let store = ReconStore::open(&config).expect("open");
            store
                .upsert_import_batch(&ImportBatch {
                    import_batch_id: "imp-1".to_string(),
                    provider: "dcm".to_string(),
                    time_zone: "UTC".to_string(),
                })
                .expect("batch");
            store
                .insert_raw_fact("imp-1", "v-1", day(1), 10, 1)
                .expect("fact");
        }

        let store = ReconStore::open(&config).expect("reopen");
        assert_eq!(store.schema_version().expect("version"), RECON_SCHEMA_VERSION);
        assert_eq!(store.pool_size(), config.pool_size);
        let conn = store.connection().expect("conn");
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM raw_facts", [], |row| row.get(0))
            .expect("count");
        assert_eq!(count, 1);
    }

    #[test]
    fn newer_schema_version_is_rejected() {
        let dir = TempDir::new().expect("temp dir");
        let config = StoreConfig::at(dir.path().join("recon.db"));
        {
            let store = ReconStore::open(&config).expect("open");
            let conn = store.connection().expect("conn");
            conn.execute("PRAGMA user_version = 99", []).expect("bump");
        }

        let err = ReconStore::open(&config).err().expect("must reject");
        assert!(matches!(
            err,
            StorageError::UnsupportedSchemaVersion { found: 99, .. }
        ));
    }

    #[test]
    fn raw_facts_require_known_import_batch() {
        let store = ReconStore::open_in_memory().expect("open db");
        let err = store
            .insert_raw_fact("missing", "v-1", day(1), 1, 0)
            .expect_err("foreign key must fail");
        assert!(matches!(err, StorageError::Sqlite(_)));
    }

    #[test]
    fn mapping_writers_validate_inputs() {
        let store = ReconStore::open_in_memory().expect("open db");
        assert!(matches!(
            store.insert_vendor_mapping("v-1", "P1", "c-1", day(3), day(1)),
            Err(StorageError::Contract(ContractError::InvalidDateRange { .. }))
        ));
        assert!(matches!(
            store.insert_vendor_mapping("v-1", "P1", " ", day(1), day(3)),
            Err(StorageError::Contract(ContractError::EmptyCreativeKey))
        ));

        let mapping = store
            .insert_vendor_mapping("v-1", "P1", "c-1", day(1), day(3))
            .expect("mapping");
        assert!(store
            .set_vendor_mapping_deleted(mapping.mapping_id, true)
            .expect("soft delete mapping"));
        assert!(!store.set_vendor_mapping_deleted(9_999, true).expect("missing"));
    }

    #[test]
    fn output_key_uniqueness_treats_null_creatives_as_equal() {
        let store = ReconStore::open_in_memory().expect("open db");
        let updated_at = Utc::now();
        let row = OutputRow {
            date: day(1),
            partition_key: "P1".to_string(),
            creative_key: CreativeKey::Ambiguous,
            impressions: 5,
            clicks: 0,
            provider: "dcm".to_string(),
            time_zone: "UTC".to_string(),
            updated_at,
            is_deleted: false,
        };
        store.insert_output_row(&row).expect("first null row");
        let err = store
            .insert_output_row(&row)
            .expect_err("second null row must violate uniqueness");
        assert!(matches!(err, StorageError::Sqlite(_)));

        let rows = store.output_rows("P1").expect("rows");
        assert_eq!(rows.len(), 1);
        assert!(rows[0].creative_key.is_ambiguous());
    }

    #[test]
    fn short_lock_timeout_does_not_leak_to_later_writers() {
        let dir = TempDir::new().expect("temp dir");
        let path = dir.path().join("recon.db");
        let config = StoreConfig {
            pool_size: 1,
            ..StoreConfig::at(&path)
        };
        let store = ReconStore::open(&config).expect("open");
        store
            .in_transaction(Duration::from_millis(1), |_| Ok::<_, StorageError>(()))
            .expect("short transaction");

        let holder = rusqlite::Connection::open(&path).expect("holder");
        holder.execute_batch("BEGIN IMMEDIATE;").expect("hold write lock");
        let release = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(300));
            holder.execute_batch("COMMIT;").expect("release");
        });

        store
            .upsert_import_batch(&ImportBatch {
                import_batch_id: "imp-1".to_string(),
                provider: "dcm".to_string(),
                time_zone: "UTC".to_string(),
            })
            .expect("writer waits out the holder");
        release.join().expect("holder thread");
    }

    #[test]
    fn sqlite_errors_keep_their_source() {
        let store = ReconStore::open_in_memory().expect("open db");
        let err = store
            .insert_raw_fact("missing", "v-1", day(1), 1, 0)
            .expect_err("foreign key must fail");
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn transaction_rolls_back_when_work_fails() {
        let store = ReconStore::open_in_memory().expect("open db");
        store
            .upsert_import_batch(&ImportBatch {
                import_batch_id: "imp-1".to_string(),
                provider: "dcm".to_string(),
                time_zone: "UTC".to_string(),
            })
            .expect("batch");

        let result: Result<(), StorageError> =
            store.in_transaction(Duration::from_millis(100), |tx| {
                tx.execute(
                    "INSERT INTO raw_facts (import_batch_id, vendor_placement_id, date, impressions, clicks) VALUES ('imp-1', 'v-1', '2018-05-01', 1, 1)",
                    [],
                )?;
                Err(StorageError::Serialization("abort".to_string()))
            });
        assert!(result.is_err());

        let conn = store.connection().expect("conn");
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM raw_facts", [], |row| row.get(0))
            .expect("count");
        assert_eq!(count, 0);
    }
}
