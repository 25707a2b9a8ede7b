use recon_core::ContractError;
use recon_storage::StorageError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("contract error: {0}")]
    Contract(#[from] ContractError),
    #[error("lock timeout persisted after {attempts} attempts: {source}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: StorageError,
    },
    #[error("deadline exceeded after {attempts} attempts")]
    DeadlineExceeded { attempts: u32 },
}

impl ReconcileError {
    pub fn is_lock_timeout(&self) -> bool {
        matches!(self, ReconcileError::Storage(err) if err.is_lock_timeout())
    }

    pub(crate) fn exhausted(self, attempts: u32) -> Self {
        match self {
            ReconcileError::Storage(source) => ReconcileError::RetriesExhausted { attempts, source },
            other => other,
        }
    }
}
