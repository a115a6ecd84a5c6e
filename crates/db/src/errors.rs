use thiserror::Error;

pub type DbResult<T> = Result<T, DbError>;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// A stored value failed to decode (e.g. a non-numeric amount column).
    #[error("corrupt {0} entry: {1}")]
    CorruptEntry(&'static str, String),

    #[error("{0}")]
    Other(String),
}
