use thiserror::Error;

use cashier_chainio::ClientError;
use cashier_db::DbError;

pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Malformed caller input: bad amount literal, invalid destination,
    /// amount below the minimum-plus-fee floor, destination is one of our
    /// own addresses.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The request is well-formed but the ledger state forbids it: a
    /// pending payout already exists, a unique amount could not be
    /// reserved, the backend balance does not cover the admission.
    #[error("state conflict: {0}")]
    Conflict(String),

    /// The chain backend failed outside a rejection path.
    #[error("chain backend: {0}")]
    Backend(#[from] ClientError),

    /// The storage substrate failed inside an atomic scope.
    #[error("storage: {0}")]
    Storage(#[from] DbError),

    /// A sanity check tripped; the books cannot be trusted until an
    /// operator looks.
    #[error("accounting fault: {0}")]
    Fault(String),

    /// Short-circuit reply of an adapter whose fatal latch is set.
    #[error("adapter faulted: {0}")]
    Faulted(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InputValidation,
    StateConflict,
    AdapterTransient,
    StorageFatal,
    ProgrammerError,
    Faulted,
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::InvalidInput(_) => ErrorKind::InputValidation,
            EngineError::Conflict(_) => ErrorKind::StateConflict,
            EngineError::Backend(_) => ErrorKind::AdapterTransient,
            EngineError::Storage(_) => ErrorKind::StorageFatal,
            EngineError::Fault(_) => ErrorKind::ProgrammerError,
            EngineError::Faulted(_) => ErrorKind::Faulted,
        }
    }

    /// Whether this failure must stick the adapter's fatal latch.
    pub fn is_latching(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::AdapterTransient | ErrorKind::StorageFatal | ErrorKind::ProgrammerError
        )
    }
}
