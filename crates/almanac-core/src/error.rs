use thiserror::Error;

#[derive(Debug, Error)]
pub enum AlmanacError {
    /// A required configuration document (API key, OAuth client secret) is absent.
    #[error("missing data: {0}")]
    MissingData(String),
    #[error("database error: {0}")]
    Database(String),
    #[error("config error: {0}")]
    Config(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("http error ({status}): {body}")]
    Http { status: u16, body: String },
    #[error("integration error: {0}")]
    Integration(String),
}

impl From<serde_json::Error> for AlmanacError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, AlmanacError>;
