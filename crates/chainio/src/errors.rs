use thiserror::Error;

pub type ClientResult<T> = Result<T, ClientError>;

#[derive(Debug, Clone, Error)]
pub enum ClientError {
    /// The request never produced a daemon-level reply (connection refused,
    /// timeout, malformed HTTP body).
    #[error("transport: {0}")]
    Transport(String),

    /// The daemon replied with an error object.  This is the variant the
    /// engines treat as a chain-side rejection where the submission paths
    /// allow one.
    #[error("rpc error {code}: {message}")]
    Rpc { code: i64, message: String },

    /// The reply parsed as JSON but not as what the method promises.
    #[error("malformed response: {0}")]
    Decode(String),

    #[error("signer: {0}")]
    Signer(String),
}

impl ClientError {
    /// Whether the daemon itself refused the request, as opposed to the
    /// request never reaching it or the reply being unintelligible.
    pub fn is_rejection(&self) -> bool {
        matches!(self, ClientError::Rpc { .. })
    }
}
