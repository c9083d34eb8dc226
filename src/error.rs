use thiserror::Error;

#[derive(Error, Debug)]
pub enum VigilError {
    #[error("not the leader, current leader is {0:?}")]
    NotLeader(Option<String>),

    #[error("invalid tier {0:?}: only AMBER and RED reports are stored")]
    InvalidTier(String),

    #[error("malformed report: {0}")]
    MalformedInput(String),

    #[error("storage failed: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("snapshot transfer failed: {0}")]
    Snapshot(String),

    #[error("invalid replica address {0:?}")]
    InvalidAddress(String),

    #[error("gRPC error: {0}")]
    Grpc(#[from] tonic::Status),

    #[error("transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    #[error("RPC deadline expired")]
    DeadlineExpired,

    #[error("internal error: {0}")]
    Internal(String),
}

impl VigilError {
    /// Client errors are surfaced as-is and never retried; everything else
    /// (transport, storage, leadership churn) is retriable at the client.
    pub fn is_retriable(&self) -> bool {
        !matches!(
            self,
            VigilError::InvalidTier(_) | VigilError::MalformedInput(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, VigilError>;
