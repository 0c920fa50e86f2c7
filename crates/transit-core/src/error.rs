use thiserror::Error;

/// Errors produced by the shared data model: malformed history rows,
/// unparsable enum strings, invalid interface identifiers.
#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid transfer state: {0}")]
    InvalidState(String),

    #[error("invalid interface identifier: {0}")]
    InvalidInterface(String),

    #[error("invalid WAN sub-type: {0}")]
    InvalidWanSubType(String),

    #[error("malformed record blob: {0}")]
    MalformedRecord(#[from] serde_json::Error),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
