use thiserror::Error;

#[derive(Debug, Error, Clone)]
pub enum LogError {
    #[error("log integrity violated at index {0}")]
    IntegrityViolation(u64),

    #[error("no entry at index {0}")]
    NotFound(u64),

    #[error("io error: {0}")]
    Io(String),

    #[error("serialization error: {0}")]
    Serde(String),

    #[error("replication range {from}..{to} exceeds local tail {tail}")]
    RangeOutOfBounds { from: u64, to: u64, tail: u64 },

    #[error("chain continuity broken: remote entry {index} does not follow local tail")]
    ChainMismatch { index: u64 },

    #[error("signature invalid for entry {index} from {author}")]
    InvalidSignature { index: u64, author: String },
}

impl From<std::io::Error> for LogError {
    fn from(e: std::io::Error) -> Self {
        LogError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for LogError {
    fn from(e: serde_json::Error) -> Self {
        LogError::Serde(e.to_string())
    }
}
