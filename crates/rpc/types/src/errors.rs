//! Mapping of internal failures onto JSON-RPC error objects.

use jsonrpsee_types::{ErrorObject, ErrorObjectOwned};
use thiserror::Error;

use cashier_db::DbError;
use cashier_engines::{EngineError, ErrorKind};
use cashier_primitives::UserIdError;

pub const ERR_INPUT_VALIDATION: i32 = -32090;
pub const ERR_UNKNOWN_COIN: i32 = -32091;
pub const ERR_STATE_CONFLICT: i32 = -32092;
pub const ERR_ADAPTER_FAULTED: i32 = -32093;
pub const ERR_INTERNAL: i32 = -32099;

#[derive(Debug, Error)]
pub enum RpcServerError {
    #[error("{0}")]
    User(#[from] UserIdError),

    #[error("unknown coin `{0}`")]
    UnknownCoin(String),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("storage: {0}")]
    Db(#[from] DbError),
}

impl RpcServerError {
    pub fn code(&self) -> i32 {
        match self {
            RpcServerError::User(_) => ERR_INPUT_VALIDATION,
            RpcServerError::UnknownCoin(_) => ERR_UNKNOWN_COIN,
            RpcServerError::Engine(e) => match e.kind() {
                ErrorKind::InputValidation => ERR_INPUT_VALIDATION,
                ErrorKind::StateConflict => ERR_STATE_CONFLICT,
                ErrorKind::Faulted => ERR_ADAPTER_FAULTED,
                ErrorKind::AdapterTransient
                | ErrorKind::StorageFatal
                | ErrorKind::ProgrammerError => ERR_INTERNAL,
            },
            RpcServerError::Db(_) => ERR_INTERNAL,
        }
    }
}

impl From<RpcServerError> for ErrorObjectOwned {
    fn from(err: RpcServerError) -> Self {
        ErrorObject::owned(err.code(), err.to_string(), None::<()>)
    }
}
