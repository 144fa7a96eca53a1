/// Core error type for the relay bot.
///
/// Adapter crates map their specific errors (sqlx, reqwest, teloxide) into this type so the
/// router can classify failures consistently (silent vs user-facing).
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("control service error: {0}")]
    Control(String),

    #[error("malformed control response: {0}")]
    MalformedResponse(String),

    #[error("invalid api key: {0}")]
    InvalidKey(String),

    #[error("messaging error: {0}")]
    Messaging(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("external error: {0}")]
    External(String),
}

pub type Result<T> = std::result::Result<T, Error>;
