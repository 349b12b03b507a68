use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] diesel::result::Error),

    #[error("connection error: {0}")]
    Connection(#[from] diesel::ConnectionError),

    #[error("migration error: {0}")]
    Migration(String),

    #[error("invalid data: {0}")]
    InvalidData(String),
}

impl From<StoreError> for chanlease_sdk::Error {
    fn from(e: StoreError) -> Self {
        chanlease_sdk::Error::Store(e.to_string())
    }
}
