use thiserror::Error;

use cashier_chainio::ClientError;
use cashier_config::ConfigError;
use cashier_db::DbError;

#[derive(Debug, Error)]
pub enum InitError {
    #[error("config: {0}")]
    Config(#[from] ConfigError),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("database: {0}")]
    Db(#[from] DbError),

    #[error("chain client: {0}")]
    Client(#[from] ClientError),

    #[error("coin `{0}`: backend options do not match coin type")]
    BackendMismatch(String),
}
