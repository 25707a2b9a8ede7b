use crate::config::BatchFailurePolicy;
use recon_core::{StreamEvent, StreamRecord};
use recon_engine::{ReconcileReport, Reconciler};
use tracing::{error, info};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordFailure {
    /// 1-based position of the record in the event.
    pub position: usize,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchReport {
    pub total: usize,
    pub committed: usize,
    pub deleted: usize,
    pub inserted: usize,
    pub failures: Vec<RecordFailure>,
    pub policy: BatchFailurePolicy,
}

impl BatchReport {
    fn new(total: usize, policy: BatchFailurePolicy) -> Self {
        Self {
            total,
            committed: 0,
            deleted: 0,
            inserted: 0,
            failures: Vec::new(),
            policy,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn status_line(&self) -> String {
        match (self.failures.first(), self.policy) {
            (None, _) => format!("Successfully processed {} records.", self.total),
            (Some(failure), BatchFailurePolicy::Halt) => format!(
                "Failed processing record {} of {}: {}",
                failure.position, self.total, failure.error
            ),
            (Some(_), BatchFailurePolicy::Continue) => format!(
                "Processed {} records with {} failures.",
                self.total,
                self.failures.len()
            ),
        }
    }
}

pub fn process_event(
    reconciler: &Reconciler,
    event: &StreamEvent,
    policy: BatchFailurePolicy,
) -> BatchReport {
    let total = event.records.len();
    let mut report = BatchReport::new(total, policy);

    for (index, record) in event.records.iter().enumerate() {
        let position = index + 1;
        match process_record(reconciler, record, position, total) {
            Ok(outcome) => {
                report.committed += 1;
                report.deleted += outcome.deleted();
                report.inserted += outcome.inserted();
            }
            Err(err) => {
                error!(
                    event = "record_failed",
                    position,
                    total,
                    policy = %policy,
                    error = %err
                );
                report.failures.push(RecordFailure {
                    position,
                    error: err,
                });
                if policy == BatchFailurePolicy::Halt {
                    break;
                }
            }
        }
    }

    info!(
        event = "batch_complete",
        total,
        committed = report.committed,
        failed = report.failures.len(),
        deleted = report.deleted,
        inserted = report.inserted
    );
    report
}

fn process_record(
    reconciler: &Reconciler,
    record: &StreamRecord,
    position: usize,
    total: usize,
) -> Result<ReconcileReport, String> {
    let request = record.decode_request().map_err(|err| err.to_string())?;
    info!(
        event = "record_decoded",
        position,
        total,
        processing_id_type = %request.processing_id_type,
        processing_id = %request.processing_id,
        sequence_number = record.kinesis.sequence_number.as_deref().unwrap_or("")
    );
    reconciler
        .reconcile_request(&request)
        .map_err(|err| err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use recon_core::ImportBatch;
    use recon_engine::EngineConfig;
    use recon_storage::ReconStore;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2018, 5, d).expect("valid date")
    }

    fn seeded_reconciler() -> (ReconStore, Reconciler) {
        let store = ReconStore::open_in_memory().expect("open db");
        store
            .upsert_import_batch(&ImportBatch {
                import_batch_id: "imp-1".to_string(),
                provider: "dcm".to_string(),
                time_zone: "UTC".to_string(),
            })
            .expect("batch");
        store
            .insert_raw_fact("imp-1", "v-1", day(1), 100, 1)
            .expect("fact P1");
        store
            .insert_raw_fact("imp-1", "v-2", day(1), 50, 0)
            .expect("fact P2");
        store
            .insert_vendor_mapping("v-1", "P1", "c-1", day(1), day(31))
            .expect("mapping P1");
        store
            .insert_vendor_mapping("v-2", "P2", "c-2", day(1), day(31))
            .expect("mapping P2");
        let reconciler = Reconciler::new(store.clone(), EngineConfig::default());
        (store, reconciler)
    }

    fn event(payloads: &[&str]) -> StreamEvent {
        StreamEvent {
            records: payloads
                .iter()
                .map(|payload| StreamRecord::from_payload(payload))
                .collect(),
        }
    }

    const P1: &str = r#"{"processing_id_type":"li_code","processing_id":"LI-P1"}"#;
    const P2: &str = r#"{"processing_id_type":"li_code","processing_id":"LI-P2"}"#;
    const BAD: &str = r#"{"processing_id_type":"campaign","processing_id":"x"}"#;

    #[test]
    fn all_records_succeed() {
        let (store, reconciler) = seeded_reconciler();
        let report = process_event(&reconciler, &event(&[P1, P2]), BatchFailurePolicy::Halt);

        assert!(report.succeeded());
        assert_eq!(report.status_line(), "Successfully processed 2 records.");
        assert_eq!(report.committed, 2);
        assert_eq!(report.inserted, 2);
        assert_eq!(store.output_row_count().expect("count"), 2);
    }

    #[test]
    fn empty_event_reports_zero_records() {
        let (_, reconciler) = seeded_reconciler();
        let report = process_event(&reconciler, &event(&[]), BatchFailurePolicy::Halt);
        assert_eq!(report.status_line(), "Successfully processed 0 records.");
    }

    #[test]
    fn halt_stops_at_first_failure_and_keeps_earlier_commits() {
        let (store, reconciler) = seeded_reconciler();
        let report = process_event(&reconciler, &event(&[P1, BAD, P2]), BatchFailurePolicy::Halt);

        assert!(!report.succeeded());
        assert_eq!(report.committed, 1);
        assert_eq!(report.failures.len(), 1);
        assert!(report
            .status_line()
            .starts_with("Failed processing record 2 of 3: unknown processing_id_type"));
        assert_eq!(store.live_output_rows("P1").expect("P1").len(), 1);
        assert!(store.live_output_rows("P2").expect("P2").is_empty());
    }

    #[test]
    fn continue_processes_remaining_records() {
        let (store, reconciler) = seeded_reconciler();
        let mut broken = event(&[P1, BAD, P2]);
        broken.records.push(StreamRecord {
            kinesis: recon_core::KinesisData {
                data: "not base64!".to_string(),
                sequence_number: Some("49590338271490256608559692538361571095921575989136588898".to_string()),
            },
        });

        let report = process_event(&reconciler, &broken, BatchFailurePolicy::Continue);
        assert_eq!(report.committed, 2);
        assert_eq!(
            report
                .failures
                .iter()
                .map(|failure| failure.position)
                .collect::<Vec<_>>(),
            vec![2, 4]
        );
        assert_eq!(report.status_line(), "Processed 4 records with 2 failures.");
        assert_eq!(store.live_output_rows("P2").expect("P2").len(), 1);
    }
}
