use thiserror::Error;

#[derive(Debug, Error)]
pub enum MptError {
    #[error("Invalid input for {field}: {reason}")]
    InvalidInput { field: String, reason: String },

    #[error("Insufficient data: {0}")]
    InsufficientData(String),

    #[error("Date error: {0}")]
    DateError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl From<serde_json::Error> for MptError {
    fn from(e: serde_json::Error) -> Self {
        MptError::SerializationError(e.to_string())
    }
}

#[cfg(feature = "returns")]
impl From<csv::Error> for MptError {
    fn from(e: csv::Error) -> Self {
        MptError::ParseError(e.to_string())
    }
}
