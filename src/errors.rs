/// Error taxonomy for the rate pipeline.
/// Transient upstream and decode failures are reported and the stage keeps
/// running; only cancellation terminates a stage.
#[derive(Debug, thiserror::Error)]
pub enum RateError {
    #[error("poll {url}: {reason}")]
    Poll { url: String, reason: String },

    #[error("decode error: {0}")]
    Decode(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("serialize error: {0}")]
    Serialize(String),

    #[error("shutting down")]
    Cancelled,

    #[error("config error: {0}")]
    Config(String),
}

impl From<serde_json::Error> for RateError {
    fn from(e: serde_json::Error) -> Self {
        RateError::Decode(e.to_string())
    }
}

impl From<sqlx::Error> for RateError {
    fn from(e: sqlx::Error) -> Self {
        RateError::Storage(e.to_string())
    }
}

impl From<std::num::ParseFloatError> for RateError {
    fn from(e: std::num::ParseFloatError) -> Self {
        RateError::Decode(format!("bad numeric: {e}"))
    }
}

impl From<std::num::ParseIntError> for RateError {
    fn from(e: std::num::ParseIntError) -> Self {
        RateError::Decode(format!("bad numeric: {e}"))
    }
}

pub type RateResult<T> = Result<T, RateError>;
