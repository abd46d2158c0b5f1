//! Error types for chat-sentinel

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("No credential available, sign in first")]
    AuthMissing,

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Backend returned {status}: {message}")]
    Backend { status: u16, message: String },

    #[error("Invalid conversation key: {0:?}")]
    InvalidConversationKey(String),

    #[error("No active conversation")]
    NoActiveConversation,

    #[error("Analysis already pending for {pending}, cancel it before starting {requested}")]
    AnalysisBusy { pending: String, requested: String },

    #[error("Config error: {0}")]
    Config(String),
}

impl Error {
    /// True when the caller should send the user to the sign-in flow
    pub fn is_auth(&self) -> bool {
        matches!(self, Error::AuthMissing)
            || matches!(self, Error::Backend { status: 401 | 403, .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;
