pub mod request;
pub mod rows;

pub use request::{
    DeletionPolicy, KinesisData, ProcessingIdType, ProcessingRequest, ReconcileScope,
    StreamEvent, StreamRecord, LI_CODE_PREFIX_LEN,
};
pub use rows::{
    AlignmentConflict, ConflictKind, CreativeKey, ExpectedRow, ImportBatch, OutputKey, OutputRow,
    RawFact, VendorMapping,
};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ContractError {
    #[error("malformed request payload: {0}")]
    MalformedPayload(String),
    #[error("unknown processing_id_type: {0}")]
    UnknownProcessingIdType(String),
    #[error("invalid processing_id {processing_id:?}: {reason}")]
    InvalidProcessingId {
        processing_id: String,
        reason: String,
    },
    #[error("invalid stream record: {0}")]
    InvalidStreamRecord(String),
    #[error("creative key must be non-empty")]
    EmptyCreativeKey,
    #[error("unknown conflict kind: {0}")]
    UnknownConflictKind(String),
    #[error("invalid date range: {start} is after {end}")]
    InvalidDateRange {
        start: chrono::NaiveDate,
        end: chrono::NaiveDate,
    },
}
