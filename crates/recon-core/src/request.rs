use crate::ContractError;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// Line item codes carry a fixed three character prefix in front of the flight id.
pub const LI_CODE_PREFIX_LEN: usize = 3;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingIdType {
    LiCode,
    ImportId,
}

impl ProcessingIdType {
    pub fn as_str(self) -> &'static str {
        match self {
            ProcessingIdType::LiCode => "li_code",
            ProcessingIdType::ImportId => "import_id",
        }
    }
}

impl fmt::Display for ProcessingIdType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProcessingIdType {
    type Err = ContractError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim() {
            "li_code" => Ok(ProcessingIdType::LiCode),
            "import_id" => Ok(ProcessingIdType::ImportId),
            other => Err(ContractError::UnknownProcessingIdType(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeletionPolicy {
    SoftDeleteMissing,
    PreserveMissing,
}

impl DeletionPolicy {
    pub fn performs_deletions(self) -> bool {
        matches!(self, DeletionPolicy::SoftDeleteMissing)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReconcileScope {
    Partition { partition_key: String },
    Batch { import_batch_id: String },
}

impl ReconcileScope {
    pub fn partition(partition_key: impl Into<String>) -> Self {
        Self::Partition {
            partition_key: partition_key.into(),
        }
    }

    pub fn batch(import_batch_id: impl Into<String>) -> Self {
        Self::Batch {
            import_batch_id: import_batch_id.into(),
        }
    }

    // A single partition's extent is fully known, so missing rows can be soft-deleted.
    // A batch only proves presence for the partitions it touched.
    pub fn deletion_policy(&self) -> DeletionPolicy {
        match self {
            ReconcileScope::Partition { .. } => DeletionPolicy::SoftDeleteMissing,
            ReconcileScope::Batch { .. } => DeletionPolicy::PreserveMissing,
        }
    }
}

impl fmt::Display for ReconcileScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReconcileScope::Partition { partition_key } => write!(f, "partition:{partition_key}"),
            ReconcileScope::Batch { import_batch_id } => write!(f, "batch:{import_batch_id}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessingRequest {
    pub processing_id_type: String,
    pub processing_id: String,
}

impl ProcessingRequest {
    pub fn new(processing_id_type: ProcessingIdType, processing_id: impl Into<String>) -> Self {
        Self {
            processing_id_type: processing_id_type.as_str().to_string(),
            processing_id: processing_id.into(),
        }
    }

    pub fn parse_json(raw: &str) -> Result<Self, ContractError> {
        let request = serde_json::from_str::<Self>(raw)
            .map_err(|err| ContractError::MalformedPayload(err.to_string()))?;
        request.scope()?;
        Ok(request)
    }

    pub fn id_type(&self) -> Result<ProcessingIdType, ContractError> {
        self.processing_id_type.parse()
    }

    pub fn scope(&self) -> Result<ReconcileScope, ContractError> {
        let processing_id = self.processing_id.trim();
        if processing_id.is_empty() {
            return Err(ContractError::InvalidProcessingId {
                processing_id: self.processing_id.clone(),
                reason: "processing_id must be non-empty".to_string(),
            });
        }

        match self.id_type()? {
            ProcessingIdType::LiCode => {
                let partition_key = processing_id
                    .char_indices()
                    .nth(LI_CODE_PREFIX_LEN)
                    .map(|(offset, _)| &processing_id[offset..])
                    .ok_or_else(|| ContractError::InvalidProcessingId {
                        processing_id: self.processing_id.clone(),
                        reason: format!(
                            "li_code must be longer than its {LI_CODE_PREFIX_LEN} character prefix"
                        ),
                    })?;
                Ok(ReconcileScope::partition(partition_key))
            }
            ProcessingIdType::ImportId => Ok(ReconcileScope::batch(processing_id)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamEvent {
    #[serde(rename = "Records", default)]
    pub records: Vec<StreamRecord>,
}

impl StreamEvent {
    pub fn parse_json(raw: &str) -> Result<Self, ContractError> {
        serde_json::from_str(raw).map_err(|err| ContractError::InvalidStreamRecord(err.to_string()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamRecord {
    pub kinesis: KinesisData,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KinesisData {
    pub data: String,
    #[serde(default, rename = "sequenceNumber")]
    pub sequence_number: Option<String>,
}

impl StreamRecord {
    pub fn from_payload(payload: &str) -> Self {
        Self {
            kinesis: KinesisData {
                data: STANDARD.encode(payload.as_bytes()),
                sequence_number: None,
            },
        }
    }

    pub fn decode_payload(&self) -> Result<String, ContractError> {
        let bytes = STANDARD
            .decode(self.kinesis.data.trim())
            .map_err(|err| ContractError::InvalidStreamRecord(format!("base64: {err}")))?;
        String::from_utf8(bytes)
            .map_err(|err| ContractError::InvalidStreamRecord(format!("utf-8: {err}")))
    }

    pub fn decode_request(&self) -> Result<ProcessingRequest, ContractError> {
        ProcessingRequest::parse_json(&self.decode_payload()?)
    }
}
