use shared::error::ErrorCode;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PresenceError {
    #[error("presence lookup was cancelled")]
    Cancelled,
    #[error("invalid presence server url '{0}'")]
    InvalidServerUrl(String),
    #[error("presence request failed with status {status}: {message}")]
    Fetch {
        status: u16,
        code: Option<ErrorCode>,
        message: String,
    },
}
